//! The effect chain.
//!
//! Effects transform an interleaved `i16` block and return the span holding the result. Every
//! effect here works in place, but the `Span -> Span` shape lets an effect relocate its output
//! the way the mixer and resampler do.
//!
//! Front ends describe the chain as a list of `EffectSpec`s, e.g.
//! `[{"name": "equalizer", "gains": [0, 0, 3, 0, 0, 0, 0, 0, 0, 0]}]`.

pub mod bass_boost;
pub mod biquad;
pub mod equalizer;
pub mod noise_sharpening;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::arena::{SampleArena, Span};
use crate::error::Result;

pub use bass_boost::BassBoost;
pub use equalizer::Equalizer;
pub use noise_sharpening::NoiseSharpening;

pub trait Effect: Send {
    fn name(&self) -> &'static str;

    /// Whether applying the effect would change anything. Ineffective effects are skipped.
    fn is_effective(&self) -> bool;

    fn apply(
        &mut self,
        arena: &mut SampleArena,
        channel_count: u16,
        sample_rate: u32,
        span: Span,
    ) -> Result<Span>;

    /// Forget filter history (e.g. after a seek).
    fn reset(&mut self) {}
}

/// Serializable description of one effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum EffectSpec {
    NoiseSharpening {
        #[serde(rename = "effectSize", alias = "effect_size")]
        effect_size: f64,
    },
    BassBoost {
        #[serde(rename = "effectSize", alias = "effect_size")]
        effect_size: f64,
    },
    Equalizer {
        gains: [f64; equalizer::BAND_COUNT],
    },
}

impl EffectSpec {
    pub fn build(&self) -> Box<dyn Effect> {
        match self {
            Self::NoiseSharpening { effect_size } => Box::new(NoiseSharpening::new(*effect_size)),
            Self::BassBoost { effect_size } => Box::new(BassBoost::new(*effect_size)),
            Self::Equalizer { gains } => Box::new(Equalizer::new(*gains)),
        }
    }
}

/// Effects applied in registration order.
#[derive(Default)]
pub struct Effects {
    effects: Vec<Box<dyn Effect>>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &[EffectSpec]) -> Self {
        Self {
            effects: specs.iter().map(EffectSpec::build).collect(),
        }
    }

    pub fn push(&mut self, effect: Box<dyn Effect>) {
        self.effects.push(effect);
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn apply(
        &mut self,
        arena: &mut SampleArena,
        channel_count: u16,
        sample_rate: u32,
        mut span: Span,
    ) -> Result<Span> {
        for effect in self.effects.iter_mut().filter(|e| e.is_effective()) {
            trace!(effect = effect.name(), bytes = span.byte_length, "applying effect");
            span = effect.apply(arena, channel_count, sample_rate, span)?;
        }
        Ok(span)
    }

    pub fn reset(&mut self) {
        self.effects.iter_mut().for_each(|e| e.reset());
    }
}
