//! Effect handles and the sets the scheduler swaps between.
//!
//! Effects are opaque to the core: an [`EffectHandle`] names a filter that the
//! renderer knows how to draw. Sets are immutable; the scheduler only ever
//! replaces which set a container shows.

mod sweep;

use std::{fmt, sync::Arc};

use crate::{BeatVizError, CompositionMode, Result};

pub use sweep::{LiveEffect, ParamSweep, TimeUniform, TriangleSweep};

/// Shared reference to a visual effect.
///
/// Clones refer to the same effect. Two handles are equal only if they come
/// from the same [`EffectHandle::new`] call.
#[derive(Clone)]
pub struct EffectHandle(Arc<str>);

impl EffectHandle {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl PartialEq for EffectHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EffectHandle {}

impl std::hash::Hash for EffectHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8).hash(state);
    }
}

impl fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EffectHandle({})", self.0)
    }
}

/// Ordered, immutable list of effects. Order is compositing order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EffectSet(Arc<[EffectHandle]>);

impl EffectSet {
    pub fn new(effects: impl IntoIterator<Item = EffectHandle>) -> Self {
        Self(effects.into_iter().collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn effects(&self) -> &[EffectHandle] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, effect: &EffectHandle) -> bool {
        self.0.contains(effect)
    }

    /// Builds the set shown while `transient` is active.
    pub fn compose(base: &EffectSet, transient: &EffectSet, mode: CompositionMode) -> EffectSet {
        match mode {
            CompositionMode::Append => {
                EffectSet::new(base.effects().iter().chain(transient.effects()).cloned())
            }
            CompositionMode::Replace => transient.clone(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(EffectHandle::name).collect()
    }
}

impl fmt::Debug for EffectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FromIterator<EffectHandle> for EffectSet {
    fn from_iter<I: IntoIterator<Item = EffectHandle>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// A permanent base set plus the transient sets a beat can pick from.
#[derive(Debug, Clone)]
pub struct EffectPool {
    base: EffectSet,
    candidates: Vec<EffectSet>,
}

impl EffectPool {
    /// Fails with [`BeatVizError::EmptyEffectPool`] when `candidates` is empty,
    /// and with [`BeatVizError::InvalidConfig`] when one of them is.
    pub fn new(base: EffectSet, candidates: Vec<EffectSet>) -> Result<Self> {
        if candidates.is_empty() {
            return Err(BeatVizError::EmptyEffectPool);
        }
        if candidates.iter().any(EffectSet::is_empty) {
            return Err(BeatVizError::InvalidConfig(
                "transient effect sets must contain at least one effect".to_string(),
            ));
        }
        Ok(Self { base, candidates })
    }

    pub fn base(&self) -> &EffectSet {
        &self.base
    }

    pub fn candidates(&self) -> &[EffectSet] {
        &self.candidates
    }

    pub fn candidate(&self, index: usize) -> Option<&EffectSet> {
        self.candidates.get(index)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
