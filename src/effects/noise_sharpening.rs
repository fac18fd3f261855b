use crate::arena::{SampleArena, Span};
use crate::effects::Effect;
use crate::error::Result;

pub const MAX_EFFECT_SIZE: f64 = 2.0;

/// First-difference emphasis: `y[i] = x[i] + size * (x[i] - x[i - 1])`.
///
/// Frames are walked back to front so every difference uses the unprocessed predecessor. The
/// first frame of each block is left as is.
pub struct NoiseSharpening {
    effect_size: f64,
}

impl NoiseSharpening {
    pub fn new(effect_size: f64) -> Self {
        Self {
            effect_size: effect_size.clamp(0.0, MAX_EFFECT_SIZE),
        }
    }
}

impl Effect for NoiseSharpening {
    fn name(&self) -> &'static str {
        "noise-sharpening"
    }

    fn is_effective(&self) -> bool {
        self.effect_size > 0.0
    }

    fn apply(
        &mut self,
        arena: &mut SampleArena,
        channel_count: u16,
        _sample_rate: u32,
        span: Span,
    ) -> Result<Span> {
        let channels = channel_count.max(1) as usize;
        let samples = arena.samples_mut(span)?;

        for i in (channels..samples.len()).rev() {
            let sample = samples[i] as f64;
            let previous = samples[i - channels] as f64;
            let value = sample + self.effect_size * (sample - previous);
            samples[i] = value.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        }
        Ok(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emphasizes_differences_per_channel() -> Result<()> {
        let mut arena = SampleArena::new();
        let span = Span::new(arena.alloc(8), 8);
        // Two stereo frames.
        arena.samples_mut(span)?.copy_from_slice(&[100, 0, 200, 10]);

        NoiseSharpening::new(0.5).apply(&mut arena, 2, 44_100, span)?;
        assert_eq!(arena.samples(span)?, &[100, 0, 250, 15]);
        Ok(())
    }

    #[test]
    fn output_is_clipped() -> Result<()> {
        let mut arena = SampleArena::new();
        let span = Span::new(arena.alloc(4), 4);
        arena.samples_mut(span)?.copy_from_slice(&[-30_000, 30_000]);

        NoiseSharpening::new(2.0).apply(&mut arena, 1, 44_100, span)?;
        assert_eq!(arena.samples(span)?, &[-30_000, i16::MAX]);
        Ok(())
    }
}
