use crate::{EffectHandle, SpriteHandle};

/// A renderer property the core can set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyTarget {
    /// Rotation in radians, wrapped to `[0, 2π)`.
    Rotation(SpriteHandle),
    PositionX(SpriteHandle),
    PositionY(SpriteHandle),
    Width(SpriteHandle),
    Height(SpriteHandle),
    /// Numeric parameter or uniform of an effect.
    EffectParam {
        effect: EffectHandle,
        param: &'static str,
    },
}

/// Concrete value routed to a render or scene parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterUpdate {
    pub target: PropertyTarget,
    pub value: f64,
}

impl ParameterUpdate {
    pub fn new(target: PropertyTarget, value: f64) -> Self {
        Self { target, value }
    }

    pub fn effect_param(effect: &EffectHandle, param: &'static str, value: f64) -> Self {
        Self::new(
            PropertyTarget::EffectParam {
                effect: effect.clone(),
                param,
            },
            value,
        )
    }
}

/// Updates collected during one frame, flushed to the renderer in one call.
#[derive(Debug, Default, Clone)]
pub struct MappingMatrix {
    updates: Vec<ParameterUpdate>,
}

impl MappingMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.updates.clear();
    }

    pub fn updates(&self) -> &[ParameterUpdate] {
        &self.updates
    }

    pub fn push(&mut self, update: ParameterUpdate) {
        self.updates.push(update);
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
