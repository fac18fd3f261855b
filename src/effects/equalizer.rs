use crate::arena::{SampleArena, Span};
use crate::effects::Effect;
use crate::effects::biquad::{Biquad, BiquadCoefficients};
use crate::error::Result;

pub const BAND_COUNT: usize = 10;
pub const MAX_GAIN_DB: f64 = 12.0;
pub const MIN_GAIN_DB: f64 = -12.0;

const PEAKING_Q: f64 = 2.0 * std::f64::consts::SQRT_2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BandType {
    LowShelf,
    Peaking,
    HighShelf,
}

const BANDS: [(f64, BandType); BAND_COUNT] = [
    (70.0, BandType::LowShelf),
    (180.0, BandType::Peaking),
    (320.0, BandType::Peaking),
    (600.0, BandType::Peaking),
    (1_000.0, BandType::Peaking),
    (3_000.0, BandType::Peaking),
    (6_000.0, BandType::Peaking),
    (12_000.0, BandType::Peaking),
    (14_000.0, BandType::Peaking),
    (16_000.0, BandType::HighShelf),
];

/// Ten-band graphic equalizer: a cascade of one biquad per band.
pub struct Equalizer {
    gains: [f64; BAND_COUNT],
    filters: Vec<Biquad>,
    configured_for: Option<u32>,
}

impl Equalizer {
    /// Gains in dB, lowest band first; clamped to +-12 dB.
    pub fn new(gains: [f64; BAND_COUNT]) -> Self {
        Self {
            gains: gains.map(|g| g.clamp(MIN_GAIN_DB, MAX_GAIN_DB)),
            filters: vec![Biquad::new(BiquadCoefficients::IDENTITY); BAND_COUNT],
            configured_for: None,
        }
    }

    pub fn gains(&self) -> &[f64; BAND_COUNT] {
        &self.gains
    }

    fn configure(&mut self, sample_rate: u32) {
        if self.configured_for == Some(sample_rate) {
            return;
        }
        for ((filter, (frequency, band)), gain) in
            self.filters.iter_mut().zip(BANDS).zip(self.gains)
        {
            filter.set_coefficients(match band {
                BandType::LowShelf => BiquadCoefficients::low_shelf(frequency, gain, sample_rate),
                BandType::HighShelf => {
                    BiquadCoefficients::high_shelf(frequency, gain, sample_rate)
                }
                BandType::Peaking => {
                    BiquadCoefficients::peaking(frequency, gain, PEAKING_Q, sample_rate)
                }
            });
        }
        self.configured_for = Some(sample_rate);
    }
}

impl Effect for Equalizer {
    fn name(&self) -> &'static str {
        "equalizer"
    }

    fn is_effective(&self) -> bool {
        self.gains.iter().any(|g| *g != 0.0)
    }

    fn apply(
        &mut self,
        arena: &mut SampleArena,
        channel_count: u16,
        sample_rate: u32,
        span: Span,
    ) -> Result<Span> {
        let channels = channel_count.max(1) as usize;
        self.configure(sample_rate);
        for filter in &mut self.filters {
            filter.ensure_channels(channels);
        }

        for frame in arena.samples_mut(span)?.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let mut value = *sample as f64 / 32768.0;
                for filter in &mut self.filters {
                    value = filter.process(ch, value);
                }
                *sample = (value * 32768.0).clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            }
        }

        for filter in &mut self.filters {
            filter.flush_denormals();
        }
        Ok(span)
    }

    fn reset(&mut self) {
        self.filters.iter_mut().for_each(Biquad::reset);
    }
}
