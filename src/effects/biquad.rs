//! RBJ "Audio EQ Cookbook" biquads with per-channel state.

use std::f64::consts::PI;

/// Normalized (a0 == 1) direct form I coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoefficients {
    pub const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    fn shelf_terms(frequency: f64, gain_db: f64, sample_rate: u32) -> (f64, f64, f64) {
        let a = 10f64.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * clamp_frequency(frequency, sample_rate) / sample_rate as f64;
        // Shelf slope S = 1.
        let alpha = 0.5 * w0.sin() * std::f64::consts::SQRT_2;
        (a, w0.cos(), 2.0 * a.sqrt() * alpha)
    }

    pub fn low_shelf(frequency: f64, gain_db: f64, sample_rate: u32) -> Self {
        let (a, k, k2) = Self::shelf_terms(frequency, gain_db, sample_rate);
        Self::normalized(
            a * ((a + 1.0) - (a - 1.0) * k + k2),
            2.0 * a * ((a - 1.0) - (a + 1.0) * k),
            a * ((a + 1.0) - (a - 1.0) * k - k2),
            (a + 1.0) + (a - 1.0) * k + k2,
            -2.0 * ((a - 1.0) + (a + 1.0) * k),
            (a + 1.0) + (a - 1.0) * k - k2,
        )
    }

    pub fn high_shelf(frequency: f64, gain_db: f64, sample_rate: u32) -> Self {
        let (a, k, k2) = Self::shelf_terms(frequency, gain_db, sample_rate);
        Self::normalized(
            a * ((a + 1.0) + (a - 1.0) * k + k2),
            -2.0 * a * ((a - 1.0) + (a + 1.0) * k),
            a * ((a + 1.0) + (a - 1.0) * k - k2),
            (a + 1.0) - (a - 1.0) * k + k2,
            2.0 * ((a - 1.0) - (a + 1.0) * k),
            (a + 1.0) - (a - 1.0) * k - k2,
        )
    }

    pub fn peaking(frequency: f64, gain_db: f64, q: f64, sample_rate: u32) -> Self {
        let a = 10f64.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * clamp_frequency(frequency, sample_rate) / sample_rate as f64;
        let alpha = w0.sin() / (2.0 * q);
        let k = w0.cos();
        Self::normalized(
            1.0 + alpha * a,
            -2.0 * k,
            1.0 - alpha * a,
            1.0 + alpha / a,
            -2.0 * k,
            1.0 - alpha / a,
        )
    }
}

// Keep the center frequency below Nyquist; bands above it would go unstable at low rates.
fn clamp_frequency(frequency: f64, sample_rate: u32) -> f64 {
    frequency.min(sample_rate as f64 * 0.45)
}

/// One biquad section with independent history per channel.
#[derive(Debug, Clone)]
pub struct Biquad {
    coefficients: BiquadCoefficients,
    // x1, x2, y1, y2 per channel
    state: Vec<[f64; 4]>,
}

impl Biquad {
    pub fn new(coefficients: BiquadCoefficients) -> Self {
        Self {
            coefficients,
            state: Vec::new(),
        }
    }

    pub fn set_coefficients(&mut self, coefficients: BiquadCoefficients) {
        self.coefficients = coefficients;
    }

    pub fn reset(&mut self) {
        self.state.iter_mut().for_each(|s| *s = [0.0; 4]);
    }

    /// Resize the per-channel history, clearing it when the layout changes.
    pub fn ensure_channels(&mut self, channel_count: usize) {
        if self.state.len() != channel_count {
            self.state = vec![[0.0; 4]; channel_count];
        }
    }

    #[inline]
    pub fn process(&mut self, channel: usize, input: f64) -> f64 {
        let c = self.coefficients;
        let s = &mut self.state[channel];
        let output = c.b0 * input + c.b1 * s[0] + c.b2 * s[1] - c.a1 * s[2] - c.a2 * s[3];
        s[1] = s[0];
        s[0] = input;
        s[3] = s[2];
        s[2] = output;
        output
    }

    /// Flush denormals left in the history after a block.
    pub fn flush_denormals(&mut self) {
        for value in self.state.iter_mut().flatten() {
            if value.abs() < f64::from(f32::MIN_POSITIVE) {
                *value = 0.0;
            }
        }
    }
}
