use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::{BeatVizError, Result};

use super::{CaptureSession, FrameSink, InputBackend};

/// Captures from a system input device through `cpal`.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    /// Uses the host's default input device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the first input device whose name matches.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    fn find_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host
                .default_input_device()
                .ok_or_else(|| unavailable("no default input device")),
            Some(wanted) => host
                .input_devices()
                .map_err(unavailable)?
                .find(|device| device.name().map(|name| &name == wanted).unwrap_or(false))
                .ok_or_else(|| unavailable(format!("input device `{wanted}` not found"))),
        }
    }
}

impl InputBackend for CpalInput {
    fn open(&self, sink: FrameSink) -> Result<Box<dyn CaptureSession>> {
        let device = self.find_device()?;
        let supported = device.default_input_config().map_err(unavailable)?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let channels = usize::from(config.channels.max(1));
        let sample_rate = config.sample_rate.0;
        sink.prepare(sample_rate)?;

        let error_sink = sink.clone();
        let on_error = move |err: cpal::StreamError| error_sink.fail(err.to_string());

        // Only the first channel is kept.
        let stream = match sample_format {
            cpal::SampleFormat::F32 => {
                let mut mono = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        mono.clear();
                        mono.extend(data.iter().step_by(channels).copied());
                        sink.push(&mono);
                    },
                    on_error,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let mut mono = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        mono.clear();
                        mono.extend(
                            data.iter()
                                .step_by(channels)
                                .map(|sample| *sample as f32 / i16::MAX as f32),
                        );
                        sink.push(&mono);
                    },
                    on_error,
                    None,
                )
            }
            other => {
                return Err(unavailable(format!(
                    "unsupported input sample format {other:?}"
                )))
            }
        }
        .map_err(unavailable)?;

        stream.play().map_err(unavailable)?;
        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate,
            channels,
            "opened audio input"
        );

        Ok(Box::new(CpalSession {
            stream: Some(stream),
            sample_rate,
        }))
    }
}

struct CpalSession {
    stream: Option<cpal::Stream>,
    sample_rate: u32,
}

impl CaptureSession for CpalSession {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.pause().map_err(unavailable)?;
        }
        Ok(())
    }
}

fn unavailable(err: impl ToString) -> BeatVizError {
    BeatVizError::DeviceUnavailable(err.to_string())
}
