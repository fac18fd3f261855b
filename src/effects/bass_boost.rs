use crate::arena::{SampleArena, Span};
use crate::effects::Effect;
use crate::effects::biquad::{Biquad, BiquadCoefficients};
use crate::error::Result;

const SHELF_FREQUENCY: f64 = 100.0;
const MAX_BOOST_DB: f64 = 12.0;

/// Low-shelf boost; effect size 0..=1 maps linearly onto 0..=12 dB.
pub struct BassBoost {
    effect_size: f64,
    filter: Biquad,
    configured_for: Option<u32>,
}

impl BassBoost {
    pub fn new(effect_size: f64) -> Self {
        Self {
            effect_size: effect_size.clamp(0.0, 1.0),
            filter: Biquad::new(BiquadCoefficients::IDENTITY),
            configured_for: None,
        }
    }

    pub fn gain_db(&self) -> f64 {
        self.effect_size * MAX_BOOST_DB
    }
}

impl Effect for BassBoost {
    fn name(&self) -> &'static str {
        "bass-boost"
    }

    fn is_effective(&self) -> bool {
        self.effect_size > 0.0
    }

    fn apply(
        &mut self,
        arena: &mut SampleArena,
        channel_count: u16,
        sample_rate: u32,
        span: Span,
    ) -> Result<Span> {
        let channels = channel_count.max(1) as usize;
        if self.configured_for != Some(sample_rate) {
            self.filter.set_coefficients(BiquadCoefficients::low_shelf(
                SHELF_FREQUENCY,
                self.gain_db(),
                sample_rate,
            ));
            self.configured_for = Some(sample_rate);
        }
        self.filter.ensure_channels(channels);

        for frame in arena.samples_mut(span)?.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let value = self.filter.process(ch, *sample as f64);
                *sample = value.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            }
        }
        self.filter.flush_denormals();
        Ok(span)
    }

    fn reset(&mut self) {
        self.filter.reset();
    }
}
