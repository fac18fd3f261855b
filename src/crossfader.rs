//! Equal-power fade-in at the start of a track and fade-out at its end.
//!
//! Volume follows `sqrt(t / d)` (in) and `sqrt(1 - t / d)` (out) and is stepped once every
//! `EFFECT_BLOCK_FRAMES` frames.

use crate::arena::{SampleArena, Span};
use crate::error::Result;

/// Longest fade accepted by `set_duration`, in seconds.
pub const MAX_DURATION: f64 = 5.0;

const EFFECT_BLOCK_FRAMES: usize = 128;

/// Where a block sits within its track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPosition {
    /// Track time of the block's first frame, in seconds.
    pub current_time: f64,
    /// Total track duration, in seconds.
    pub track_duration: f64,
}

#[derive(Debug, Clone)]
pub struct Crossfader {
    duration: f64,
    fade_in_enabled: bool,
    fade_out_enabled: bool,
}

impl Default for Crossfader {
    fn default() -> Self {
        Self {
            duration: 0.0,
            fade_in_enabled: false,
            fade_out_enabled: true,
        }
    }
}

impl Crossfader {
    pub fn new(duration: f64) -> Self {
        let mut crossfader = Self::default();
        crossfader.set_duration(duration);
        crossfader
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: f64) {
        self.duration = duration.clamp(0.0, MAX_DURATION);
    }

    pub fn set_fade_in_enabled(&mut self, enabled: bool) {
        self.fade_in_enabled = enabled;
    }

    pub fn set_fade_out_enabled(&mut self, enabled: bool) {
        self.fade_out_enabled = enabled;
    }

    /// Apply whichever fades overlap the block at `position`, in place.
    pub fn apply(
        &self,
        arena: &mut SampleArena,
        span: Span,
        channel_count: u16,
        sample_rate: u32,
        position: TrackPosition,
    ) -> Result<()> {
        if self.duration <= 0.0 {
            return Ok(());
        }
        let samples = arena.samples_mut(span)?;
        let channels = channel_count.max(1) as usize;
        if self.fade_in_enabled {
            self.fade_in(samples, channels, sample_rate, position);
        }
        if self.fade_out_enabled {
            self.fade_out(samples, channels, sample_rate, position);
        }
        Ok(())
    }

    fn fade_in(&self, samples: &mut [i16], channels: usize, rate: u32, at: TrackPosition) {
        if at.current_time > self.duration {
            return;
        }
        let rate = rate as f64;
        let fade_frames = ((self.duration - at.current_time) * rate) as usize;
        let frames = (samples.len() / channels).min(fade_frames);

        let mut volume = 0.0;
        for (i, frame) in samples.chunks_exact_mut(channels).take(frames).enumerate() {
            if i % EFFECT_BLOCK_FRAMES == 0 {
                let t = at.current_time + i as f64 / rate;
                volume = (t / self.duration).clamp(0.0, 1.0).sqrt();
            }
            scale(frame, volume);
        }
    }

    fn fade_out(&self, samples: &mut [i16], channels: usize, rate: u32, at: TrackPosition) {
        let rate = rate as f64;
        let frame_count = samples.len() / channels;
        let fade_start = at.track_duration - self.duration;
        if at.current_time + frame_count as f64 / rate < fade_start {
            return;
        }

        let volume_at = |frame: usize| {
            let t = (at.current_time + frame as f64 / rate - fade_start).max(0.0);
            (1.0 - t / self.duration).clamp(0.0, 1.0).sqrt()
        };
        let start_frame = ((fade_start - at.current_time).max(0.0) * rate) as usize;
        let mut volume = volume_at(start_frame);
        for (i, frame) in samples
            .chunks_exact_mut(channels)
            .enumerate()
            .skip(start_frame)
        {
            if i % EFFECT_BLOCK_FRAMES == 0 {
                volume = volume_at(i);
            }
            scale(frame, volume);
        }
    }
}

fn scale(frame: &mut [i16], volume: f64) {
    for sample in frame {
        *sample = (*sample as f64 * volume) as i16;
    }
}
