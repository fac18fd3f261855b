//! EBU R128 metering on top of `ebur128`, plus the measurements carried over from a
//! restored snapshot.
//!
//! `ebur128` cannot be seeded with past gating blocks, so a restored meter keeps the snapshot's
//! integrated loudness and peak aside and blends them with what it measures afterwards. The
//! carried loudness is weighted by its duration (capped so carried plus live never exceeds the
//! history window) in the energy domain.

use ebur128::{EbuR128, Mode};

use crate::error::{Error, Result};
use crate::loudness::state::SerializedState;

#[derive(Debug, Clone, Copy)]
struct Carried {
    integrated: f64,
    sample_peak: f64,
    frames: u64,
}

#[derive(Debug)]
pub struct LoudnessMeter {
    inner: EbuR128,
    channel_count: u32,
    sample_rate: u32,
    max_history_ms: u32,
    live_frames: u64,
    carried: Option<Carried>,
}

impl LoudnessMeter {
    pub fn new(channel_count: u32, sample_rate: u32, max_history_ms: u32) -> Result<Self> {
        let mut inner = EbuR128::new(
            channel_count,
            sample_rate,
            Mode::M | Mode::I | Mode::SAMPLE_PEAK,
        )
        .map_err(|err| {
            Error::analyzer(format!(
                "ebur128 init failed ({err:?}) for {channel_count} channels at {sample_rate} Hz"
            ))
        })?;
        inner.set_max_history(max_history_ms)?;

        Ok(Self {
            inner,
            channel_count,
            sample_rate,
            max_history_ms,
            live_frames: 0,
            carried: None,
        })
    }

    pub fn restore(state: &SerializedState) -> Result<Self> {
        let mut meter = Self::new(state.channel_count, state.sample_rate, state.max_history_ms)?;
        meter.carried = Some(Carried {
            integrated: state.integrated_loudness,
            sample_peak: state.sample_peak,
            frames: state.frames_added as u64,
        });
        Ok(meter)
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn max_history_ms(&self) -> u32 {
        self.max_history_ms
    }

    /// Feed interleaved frames.
    pub fn add_frames(&mut self, samples: &[i16]) -> Result<()> {
        self.inner.add_frames_i16(samples)?;
        self.live_frames += (samples.len() / self.channel_count.max(1) as usize) as u64;
        Ok(())
    }

    /// Loudness of the last 400 ms, in LUFS.
    pub fn momentary(&self) -> Result<f64> {
        Ok(self.inner.loudness_momentary()?)
    }

    /// Integrated loudness in LUFS, including any carried-over measurement.
    pub fn integrated(&self) -> Result<f64> {
        let live = self.inner.loudness_global()?;
        let Some(carried) = self.carried else {
            return Ok(live);
        };

        let rate = self.sample_rate as f64;
        let live_seconds = self.live_frames as f64 / rate;
        let window_seconds = self.max_history_ms as f64 / 1000.0;
        let carried_seconds =
            (carried.frames as f64 / rate).min((window_seconds - live_seconds).max(0.0));

        let carried_energy = energy(carried.integrated) * carried_seconds;
        let live_energy = energy(live) * live_seconds;
        let total_seconds = carried_seconds + live_seconds;
        if total_seconds <= 0.0 {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(lufs((carried_energy + live_energy) / total_seconds))
    }

    /// Linear sample peak across all channels.
    pub fn sample_peak(&self) -> Result<f64> {
        let mut peak = self.carried.map_or(0.0, |c| c.sample_peak);
        for channel in 0..self.channel_count {
            peak = peak.max(self.inner.sample_peak(channel)?);
        }
        Ok(peak)
    }

    pub fn export(&self, frames_added: u64) -> Result<SerializedState> {
        Ok(SerializedState {
            max_history_ms: self.max_history_ms,
            sample_rate: self.sample_rate,
            channel_count: self.channel_count,
            frames_added: u32::try_from(frames_added).unwrap_or(u32::MAX),
            sample_peak: self.sample_peak()?,
            integrated_loudness: self.integrated()?,
        })
    }
}

fn energy(loudness: f64) -> f64 {
    if loudness.is_finite() {
        10f64.powf((loudness + 0.691) / 10.0)
    } else {
        0.0
    }
}

fn lufs(energy: f64) -> f64 {
    if energy > 0.0 {
        -0.691 + 10.0 * energy.log10()
    } else {
        f64::NEG_INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_round_trips_through_lufs() {
        assert!((lufs(energy(-23.0)) + 23.0).abs() < 1e-9);
        assert_eq!(lufs(energy(f64::NEG_INFINITY)), f64::NEG_INFINITY);
    }

    #[test]
    fn restored_meter_reports_carried_values_before_new_audio() -> Result<()> {
        let meter = LoudnessMeter::restore(&SerializedState {
            max_history_ms: 30_000,
            sample_rate: 48_000,
            channel_count: 2,
            frames_added: 48_000 * 10,
            sample_peak: 0.7,
            integrated_loudness: -20.0,
        })?;

        assert!((meter.integrated()? + 20.0).abs() < 1e-9);
        assert_eq!(meter.sample_peak()?, 0.7);
        Ok(())
    }

    #[test]
    fn invalid_layouts_are_analyzer_errors() {
        let err = LoudnessMeter::new(0, 48_000, 30_000).unwrap_err();
        assert!(matches!(err, Error::Analyzer(_)));
    }
}
