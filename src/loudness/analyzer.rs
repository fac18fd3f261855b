use tracing::trace;

use crate::arena::{SampleArena, ScratchBuffer, Span};
use crate::error::{Error, Result};
use crate::loudness::meter::LoudnessMeter;
use crate::loudness::state::{SERIALIZED_STATE_SIZE, SerializedState};

pub const DEFAULT_MAX_HISTORY_MS: u32 = 30_000;

/// Momentary loudness at or below this is treated as silence (LUFS).
pub const SILENCE_THRESHOLD: f64 = -65.0;

/// Normalization target (LUFS).
pub const REFERENCE_LOUDNESS: f64 = -18.0;

/// Largest boost normalization will apply (dB).
pub const MAX_GAIN_OFFSET: f64 = 12.0;

const MOMENTARY_WINDOW_MS: u32 = 400;
const OVERLAP_MS: u32 = 100;

/// Integrated loudness is trusted once this many seconds have been measured.
const ENOUGH_DATA_SECONDS: u64 = 3;

const NOT_INITIALIZED: &str = "not initialized";

/// Per-block result of loudness normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoudnessInfo {
    pub is_entirely_silent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoudnessOpts {
    pub normalization_enabled: bool,
    pub silence_trimming_enabled: bool,
    pub max_history_ms: u32,
}

impl Default for LoudnessOpts {
    fn default() -> Self {
        Self {
            normalization_enabled: false,
            silence_trimming_enabled: false,
            max_history_ms: DEFAULT_MAX_HISTORY_MS,
        }
    }
}

/// EBU R128 loudness measurement, normalization and silence classification.
///
/// Lifecycle: created uninitialized, then `initialize` or `initialize_from_serialized_state`,
/// then `destroy`. Everything else requires the initialized state.
pub struct LoudnessAnalyzer {
    opts: LoudnessOpts,
    meter: Option<LoudnessMeter>,
    channel_count: u16,
    sample_rate: u32,
    frames_added: u64,
    momentary_loudness_avg: f64,
    // Negative when no gain has been applied yet.
    previously_applied_gain: f64,
    serialized: ScratchBuffer,
    destroyed: bool,
}

impl Default for LoudnessAnalyzer {
    fn default() -> Self {
        Self::new(LoudnessOpts::default())
    }
}

impl LoudnessAnalyzer {
    pub fn new(opts: LoudnessOpts) -> Self {
        Self {
            opts,
            meter: None,
            channel_count: 0,
            sample_rate: 0,
            frames_added: 0,
            momentary_loudness_avg: f64::NAN,
            previously_applied_gain: -1.0,
            serialized: ScratchBuffer::new(),
            destroyed: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.meter.is_some()
    }

    pub fn initialize(&mut self, channel_count: u16, sample_rate: u32) -> Result<()> {
        self.check_initializable()?;
        self.meter = Some(LoudnessMeter::new(
            channel_count as u32,
            sample_rate,
            self.opts.max_history_ms,
        )?);
        self.channel_count = channel_count;
        self.sample_rate = sample_rate;
        self.frames_added = 0;
        self.momentary_loudness_avg = f64::NAN;
        self.previously_applied_gain = -1.0;
        Ok(())
    }

    /// Resume from a snapshot produced by `serialize`.
    ///
    /// The momentary average starts at the snapshot's integrated loudness and the ramp starts
    /// from the gain that loudness implies, so a resumed track does not jump in volume.
    pub fn initialize_from_serialized_state(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_initializable()?;
        let state = SerializedState::from_bytes(bytes)?;
        let channel_count = u16::try_from(state.channel_count).map_err(|_| {
            Error::analyzer(format!(
                "serialized loudness state has {} channels",
                state.channel_count
            ))
        })?;

        self.meter = Some(LoudnessMeter::restore(&state)?);
        self.opts.max_history_ms = state.max_history_ms;
        self.channel_count = channel_count;
        self.sample_rate = state.sample_rate;
        self.frames_added = state.frames_added as u64;
        self.momentary_loudness_avg = state.integrated_loudness;
        self.previously_applied_gain = normalization_gain(state.integrated_loudness, state.sample_peak);
        Ok(())
    }

    fn check_initializable(&self) -> Result<()> {
        if self.destroyed {
            return Err(Error::programmer("destroyed"));
        }
        if self.meter.is_some() {
            return Err(Error::programmer("already initialized"));
        }
        Ok(())
    }

    pub fn set_loudness_normalization_enabled(&mut self, enabled: bool) {
        self.opts.normalization_enabled = enabled;
    }

    pub fn set_silence_trimming_enabled(&mut self, enabled: bool) {
        self.opts.silence_trimming_enabled = enabled;
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_added(&self) -> u64 {
        self.frames_added
    }

    pub fn previously_applied_gain(&self) -> Option<f64> {
        (self.previously_applied_gain >= 0.0).then_some(self.previously_applied_gain)
    }

    fn have_enough_loudness_data(&self) -> bool {
        self.frames_added >= self.sample_rate as u64 * ENOUGH_DATA_SECONDS
    }

    /// Whether a full history window's worth of audio has been measured.
    pub fn is_history_state_filled(&self) -> bool {
        if self.sample_rate == 0 {
            return false;
        }
        let measured_ms = self.frames_added as f64 / self.sample_rate as f64 * 1000.0;
        measured_ms >= (self.opts.max_history_ms + MOMENTARY_WINDOW_MS - OVERLAP_MS) as f64
    }

    fn momentary_window_frames(&self) -> usize {
        (MOMENTARY_WINDOW_MS as u64 * self.sample_rate as u64 / 1000) as usize
    }

    /// Measure `frames` frames of `span` without modifying them.
    pub fn add_frames(&mut self, arena: &SampleArena, span: Span, frames: usize) -> Result<()> {
        let channels = self.channel_count as usize;
        let meter = self
            .meter
            .as_mut()
            .ok_or_else(|| Error::programmer(NOT_INITIALIZED))?;
        let samples = arena.samples(span)?;
        let samples = samples.get(..frames * channels).ok_or_else(|| {
            Error::programmer(format!(
                "{frames} frames requested from a span of {} samples",
                samples.len()
            ))
        })?;

        meter.add_frames(samples).map_err(|err| {
            Error::analyzer(format!("{err} (handle {:?}, {frames} frames)", span.handle))
        })?;
        self.frames_added += frames as u64;
        Ok(())
    }

    /// Measure the block and, depending on the enabled features, classify it as silent and/or
    /// scale it towards the reference loudness in place.
    pub fn apply_loudness_normalization(
        &mut self,
        arena: &mut SampleArena,
        span: Span,
        frames: usize,
    ) -> Result<LoudnessInfo> {
        if self.meter.is_none() {
            return Err(Error::programmer(NOT_INITIALIZED));
        }
        let mut info = LoudnessInfo::default();
        let LoudnessOpts {
            normalization_enabled,
            silence_trimming_enabled,
            ..
        } = self.opts;
        if !normalization_enabled && !silence_trimming_enabled {
            return Ok(info);
        }

        let channels = self.channel_count as usize;
        let window = self.momentary_window_frames().max(1);
        let mut momentary_values = Vec::new();
        {
            let samples = arena.samples(span)?;
            let samples = samples.get(..frames * channels).ok_or_else(|| {
                Error::programmer(format!(
                    "{frames} frames requested from a span of {} samples",
                    samples.len()
                ))
            })?;

            for chunk in samples.chunks(window * channels) {
                let Some(meter) = self.meter.as_mut() else {
                    return Err(Error::programmer(NOT_INITIALIZED));
                };
                meter.add_frames(chunk).map_err(|err| {
                    Error::analyzer(format!(
                        "{err} (handle {:?}, {} frames)",
                        span.handle,
                        chunk.len() / channels
                    ))
                })?;
                self.frames_added += (chunk.len() / channels) as u64;

                if silence_trimming_enabled && self.frames_added >= window as u64 {
                    let momentary = meter.momentary()?;
                    self.momentary_loudness_avg = if self.momentary_loudness_avg.is_finite() {
                        self.momentary_loudness_avg * 0.3 + momentary * 0.7
                    } else {
                        momentary
                    };
                    momentary_values.push(momentary);
                }
            }
        }

        if silence_trimming_enabled && self.frames_added > window as u64 {
            info.is_entirely_silent = momentary_values.iter().all(|m| *m <= SILENCE_THRESHOLD);
        }

        if normalization_enabled {
            let Some(meter) = self.meter.as_ref() else {
                return Err(Error::programmer(NOT_INITIALIZED));
            };
            let integrated = meter.integrated()?;
            let sample_peak = meter.sample_peak()?;
            let loudness = if self.have_enough_loudness_data() {
                integrated
            } else {
                self.momentary_loudness_avg
            };

            if loudness > SILENCE_THRESHOLD {
                let gain = normalization_gain(loudness, sample_peak);
                let samples = arena.samples_mut(span)?;
                apply_gain_ramp(
                    &mut samples[..frames * channels],
                    channels,
                    self.previously_applied_gain,
                    gain,
                );
                trace!(loudness, sample_peak, gain, "normalized block");
                self.previously_applied_gain = gain;
            }
        }

        Ok(info)
    }

    /// Snapshot the measurement state (see `state` for the byte layout).
    pub fn serialize(&mut self, arena: &mut SampleArena) -> Result<Vec<u8>> {
        let meter = self
            .meter
            .as_ref()
            .ok_or_else(|| Error::programmer(NOT_INITIALIZED))?;
        let state = meter.export(self.frames_added)?;

        let handle = self.serialized.get(arena, SERIALIZED_STATE_SIZE)?;
        let span = Span::new(handle, SERIALIZED_STATE_SIZE);
        arena.bytes_mut(span)?.copy_from_slice(&state.to_bytes());
        Ok(arena.bytes(span)?.to_vec())
    }

    /// Release the meter and the serialization buffer.
    pub fn destroy(&mut self, arena: &mut SampleArena) -> Result<()> {
        if self.meter.take().is_none() {
            return Err(Error::programmer(NOT_INITIALIZED));
        }
        self.destroyed = true;
        self.serialized.release(arena)
    }
}

/// `min(1 / peak, 10^(offset / 20))` with the offset towards the reference capped.
fn normalization_gain(loudness: f64, sample_peak: f64) -> f64 {
    let gain_offset = (REFERENCE_LOUDNESS - loudness).min(MAX_GAIN_OFFSET);
    (1.0 / sample_peak).min(10f64.powf(gain_offset / 20.0))
}

/// Scale frames by a gain moving linearly from `from` to `to` across the block.
///
/// A negative `from` means there is nothing to ramp from; `to` is applied flat.
fn apply_gain_ramp(samples: &mut [i16], channels: usize, from: f64, to: f64) {
    let frames = samples.len() / channels.max(1);
    let from = if from < 0.0 { to } else { from };
    let step = if frames > 0 {
        (to - from) / frames as f64
    } else {
        0.0
    };

    for (i, frame) in samples.chunks_exact_mut(channels.max(1)).enumerate() {
        let gain = from + step * (i + 1) as f64;
        for sample in frame {
            *sample = (*sample as f64 * gain)
                .round()
                .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        }
    }
}
