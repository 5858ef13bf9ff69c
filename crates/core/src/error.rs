/// Result alias that carries the custom [`BeatVizError`] type.
pub type Result<T> = std::result::Result<T, BeatVizError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatVizError {
    /// The capture device could not be opened, or failed mid-session.
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),
    /// Capture ended before a single full buffer was recorded.
    #[error("audio capture stopped before a full buffer was recorded")]
    CaptureStopped,
    /// The tempo estimator could not produce a value.
    #[error("tempo estimation failed: {0}")]
    EstimationFailed(String),
    /// A beats-per-minute value that is not strictly positive and finite.
    #[error("invalid tempo {0} bpm, expected a positive value")]
    InvalidTempo(f64),
    /// A scheduler was configured without any transient effect to pick from.
    #[error("effect pool has no transient candidates")]
    EmptyEffectPool,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Free-form message for failures that do not deserve their own variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl BeatVizError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns `true` for failures of the live tempo pipeline. These degrade
    /// to the configured default tempo instead of aborting.
    pub fn falls_back_to_default_tempo(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_)
                | Self::CaptureStopped
                | Self::EstimationFailed(_)
                | Self::InvalidTempo(_)
        )
    }
}

impl From<&str> for BeatVizError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatVizError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
