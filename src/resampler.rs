//! Streaming sample-rate conversion for interleaved `i16` blocks.
//!
//! Responsibilities:
//! - Deinterleave `i16` into planar `f32` for rubato
//! - Feed fixed-size chunks through a sinc resampler, carrying leftovers between calls
//! - Emit exactly as many frames per call as the cumulative input warrants, so that
//!   consecutive output blocks stay contiguous in time
//! - Drain everything still buffered when the stream ends
//!
//! Notes:
//! - The sinc filter's own delay is trimmed, and output starts with `latency_frames()` of
//!   silence: one chunk's worth of destination frames plus the filter delay. A block is then
//!   never short while its input waits for a full chunk. `finish` emits that many extra frames
//!   at the end, so no input is lost.

use std::collections::VecDeque;

use anyhow::{Context, anyhow};
use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use tracing::{debug, trace};

use crate::arena::{SampleArena, ScratchBuffer, Span};
use crate::error::{Error, Result};

/// Source frames fed to rubato per `process()` call.
const CHUNK_FRAMES: usize = 256;

/// Zero chunks pushed through the filter at most while draining.
const MAX_DRAIN_CHUNKS: usize = 16;

fn build_sinc(
    channel_count: usize,
    source_rate: u32,
    destination_rate: u32,
) -> Result<SincFixedIn<f32>> {
    let inner = SincFixedIn::<f32>::new(
        destination_rate as f64 / source_rate as f64,
        2.0,
        SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        },
        CHUNK_FRAMES,
        channel_count,
    )
    .map_err(|e| anyhow!(e))
    .context("failed to init resampler")?;
    Ok(inner)
}

pub struct Resampler {
    channel_count: usize,
    source_rate: u32,
    destination_rate: u32,
    inner: SincFixedIn<f32>,

    // Planar source samples not yet handed to rubato.
    pending_input: Vec<Vec<f32>>,

    // Planar resampled samples not yet emitted.
    pending_output: Vec<VecDeque<f32>>,

    lead_in: usize,
    delay_to_skip: usize,
    frames_in: u64,
    frames_out: u64,
    finished: bool,
    output: ScratchBuffer,
}

impl Resampler {
    pub fn new(channel_count: u16, source_rate: u32, destination_rate: u32) -> Result<Self> {
        if channel_count == 0 || source_rate == 0 || destination_rate == 0 {
            return Err(Error::unsupported(format!(
                "cannot resample {channel_count} channels from {source_rate} Hz to {destination_rate} Hz"
            )));
        }

        let channels = channel_count as usize;
        let inner = build_sinc(channels, source_rate, destination_rate)?;
        let delay = inner.output_delay();
        let lead_in = (CHUNK_FRAMES as u64 * destination_rate as u64).div_ceil(source_rate as u64)
            as usize
            + delay
            + 2;

        let mut resampler = Self {
            channel_count: channels,
            source_rate,
            destination_rate,
            inner,
            pending_input: vec![Vec::new(); channels],
            pending_output: vec![VecDeque::new(); channels],
            lead_in,
            delay_to_skip: 0,
            frames_in: 0,
            frames_out: 0,
            finished: false,
            output: ScratchBuffer::new(),
        };
        resampler.clear_stream();
        Ok(resampler)
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn destination_rate(&self) -> u32 {
        self.destination_rate
    }

    /// Destination frames of silence that precede the first resampled frame.
    pub fn latency_frames(&self) -> usize {
        self.lead_in
    }

    /// Whether input has been fed since the last `finish` or `reset`.
    pub fn has_tail(&self) -> bool {
        !self.finished && self.frames_in > 0
    }

    /// Total destination frames owed for everything fed so far.
    fn frames_owed(&self) -> u64 {
        (self.frames_in as u128 * self.destination_rate as u128 / self.source_rate as u128) as u64
    }

    /// Resample one interleaved block. The result lives in the resampler's own buffer.
    pub fn resample(&mut self, arena: &mut SampleArena, span: Span) -> Result<Span> {
        if self.finished {
            return Err(Error::programmer("resampler fed after finish"));
        }
        self.push_input(arena, span)?;
        self.run_chunks()?;

        let out_frames = (self.frames_owed() - self.frames_out) as usize;
        self.emit(arena, out_frames)
    }

    /// Resample the stream's last block (if any) and drain everything the filter still holds.
    ///
    /// Emits the remaining owed frames plus `latency_frames()`, so the stream's total output is
    /// its owed length plus the lead-in.
    pub fn finish(&mut self, arena: &mut SampleArena, span: Option<Span>) -> Result<Span> {
        if self.finished {
            return Err(Error::programmer("resampler finished twice"));
        }
        if let Some(span) = span {
            self.push_input(arena, span)?;
        }
        self.run_chunks()?;

        let out_frames = (self.frames_owed() + self.lead_in as u64 - self.frames_out) as usize;
        if !self.pending_input[0].is_empty() {
            let resampled = self
                .inner
                .process_partial(Some(self.pending_input.as_slice()), None)
                .map_err(|e| anyhow!(e))
                .context("resampler drain failed")?;
            self.pending_input.iter_mut().for_each(Vec::clear);
            self.queue_output(resampled);
        }
        for _ in 0..MAX_DRAIN_CHUNKS {
            if self.pending_output[0].len() >= out_frames {
                break;
            }
            let resampled = self
                .inner
                .process_partial(None::<&[Vec<f32>]>, None)
                .map_err(|e| anyhow!(e))
                .context("resampler drain failed")?;
            self.queue_output(resampled);
        }

        debug!(
            frames_in = self.frames_in,
            frames_out = self.frames_out + out_frames as u64,
            "resampler drained"
        );
        self.finished = true;
        self.emit(arena, out_frames)
    }

    /// Forget the stream so far, e.g. after a seek. The next block starts a new lead-in.
    pub fn reset(&mut self) -> Result<()> {
        self.inner = build_sinc(self.channel_count, self.source_rate, self.destination_rate)?;
        self.clear_stream();
        Ok(())
    }

    fn clear_stream(&mut self) {
        self.pending_input.iter_mut().for_each(Vec::clear);
        for queue in &mut self.pending_output {
            queue.clear();
            queue.resize(self.lead_in, 0.0);
        }
        self.delay_to_skip = self.inner.output_delay();
        self.frames_in = 0;
        self.frames_out = 0;
        self.finished = false;
    }

    fn push_input(&mut self, arena: &SampleArena, span: Span) -> Result<()> {
        let channels = self.channel_count;
        let samples = arena.samples(span)?;
        let frames = samples.len() / channels;
        for (ch, planar) in self.pending_input.iter_mut().enumerate() {
            planar.extend(
                samples
                    .iter()
                    .skip(ch)
                    .step_by(channels)
                    .map(|s| *s as f32 / 32768.0),
            );
        }
        self.frames_in += frames as u64;
        Ok(())
    }

    /// Push every full input chunk through rubato.
    fn run_chunks(&mut self) -> Result<()> {
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending_input[0].len() < needed {
                return Ok(());
            }

            let resampled = {
                let chunk: Vec<&[f32]> = self
                    .pending_input
                    .iter()
                    .map(|planar| &planar[..needed])
                    .collect();
                self.inner
                    .process(&chunk, None)
                    .map_err(|e| anyhow!(e))
                    .context("resampler process failed")?
            };
            for planar in &mut self.pending_input {
                planar.drain(..needed);
            }
            self.queue_output(resampled);
        }
    }

    fn queue_output(&mut self, resampled: Vec<Vec<f32>>) {
        let produced = resampled.first().map_or(0, Vec::len);
        let skip = self.delay_to_skip.min(produced);
        self.delay_to_skip -= skip;
        for (queue, planar) in self.pending_output.iter_mut().zip(resampled) {
            queue.extend(planar.into_iter().skip(skip));
        }
    }

    /// Write `out_frames` interleaved frames into the output buffer.
    fn emit(&mut self, arena: &mut SampleArena, out_frames: usize) -> Result<Span> {
        let channels = self.channel_count;
        let available = self.pending_output[0].len();
        // Only reachable if rubato produced fewer frames than its ratio promises.
        let deficit = out_frames.saturating_sub(available);
        trace!(out_frames, available, deficit, "resampled block");

        let byte_length = out_frames * channels * std::mem::size_of::<i16>();
        let handle = self.output.get(arena, byte_length)?;
        let out_span = Span::new(handle, byte_length);
        let output = arena.samples_mut(out_span)?;

        let emitted = out_frames - deficit;
        for frame in output[..emitted * channels].chunks_exact_mut(channels) {
            for (sample, planar) in frame.iter_mut().zip(self.pending_output.iter_mut()) {
                let value = planar.pop_front().unwrap_or(0.0);
                *sample = (value * 32768.0)
                    .round()
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
        }
        output[emitted * channels..].fill(0);

        self.frames_out += out_frames as u64;
        Ok(out_span)
    }

    pub fn destroy(&mut self, arena: &mut SampleArena) -> Result<()> {
        self.pending_input.iter_mut().for_each(Vec::clear);
        self.pending_output.iter_mut().for_each(VecDeque::clear);
        self.output.release(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::BufferHandle;

    fn block(
        arena: &mut SampleArena,
        handle: &mut Option<BufferHandle>,
        samples: &[i16],
    ) -> Span {
        let byte_length = samples.len() * 2;
        let h = match *handle {
            Some(h) => {
                arena.ensure_capacity(h, byte_length).unwrap();
                h
            }
            None => {
                let h = arena.alloc(byte_length);
                *handle = Some(h);
                h
            }
        };
        let span = Span::new(h, byte_length);
        arena.samples_mut(span).unwrap().copy_from_slice(samples);
        span
    }

    #[test]
    fn emits_exactly_the_owed_frame_count() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut input = None;
        let mut resampler = Resampler::new(1, 44_100, 48_000)?;

        for _ in 0..3 {
            let span = block(&mut arena, &mut input, &[0; 8820]);
            let out = resampler.resample(&mut arena, span)?;
            assert_eq!(out.frame_len(1), 9600);
        }
        Ok(())
    }

    #[test]
    fn odd_block_sizes_stay_contiguous() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut input = None;
        let mut resampler = Resampler::new(2, 48_000, 44_100)?;

        let mut total_in = 0u64;
        let mut total_out = 0u64;
        for frames in [1000usize, 333, 4096, 7, 2500] {
            let span = block(&mut arena, &mut input, &vec![0; frames * 2]);
            total_in += frames as u64;
            total_out += resampler.resample(&mut arena, span)?.frame_len(2) as u64;
            assert_eq!(total_out, total_in * 44_100 / 48_000);
        }
        Ok(())
    }

    #[test]
    fn constant_signal_survives_after_warmup() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut input = None;
        let mut resampler = Resampler::new(1, 44_100, 48_000)?;

        let mut last = Vec::new();
        for _ in 0..4 {
            let span = block(&mut arena, &mut input, &[10_000; 8820]);
            let out = resampler.resample(&mut arena, span)?;
            last = arena.samples(out)?.to_vec();
        }

        let tail = last[last.len() - 1];
        assert!((tail as i32 - 10_000).abs() < 200, "tail sample {tail}");
        Ok(())
    }

    #[test]
    fn small_blocks_are_not_padded_with_silence() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut input = None;
        let mut resampler = Resampler::new(1, 44_100, 48_000)?;

        // Barely more than one rubato chunk.
        let mut output = Vec::new();
        for _ in 0..40 {
            let span = block(&mut arena, &mut input, &[10_000; 300]);
            let out = resampler.resample(&mut arena, span)?;
            output.extend_from_slice(arena.samples(out)?);
        }

        assert_eq!(output.len(), 40 * 300 * 48_000 / 44_100);
        let settled = &output[resampler.latency_frames() + 300..];
        assert!(
            settled.iter().all(|s| (*s as i32 - 10_000).abs() < 200),
            "gap in settled output"
        );
        Ok(())
    }

    #[test]
    fn finish_drains_the_whole_stream() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut input = None;
        let mut resampler = Resampler::new(1, 44_100, 48_000)?;
        let latency = resampler.latency_frames();
        assert!(!resampler.has_tail());

        let mut output = Vec::new();
        for _ in 0..2 {
            let span = block(&mut arena, &mut input, &[10_000; 4410]);
            let out = resampler.resample(&mut arena, span)?;
            output.extend_from_slice(arena.samples(out)?);
        }
        assert!(resampler.has_tail());
        let span = block(&mut arena, &mut input, &[10_000; 1000]);
        let out = resampler.finish(&mut arena, Some(span))?;
        output.extend_from_slice(arena.samples(out)?);

        let owed = 9_820 * 48_000 / 44_100;
        assert_eq!(output.len(), owed + latency);
        assert!(output[..latency - 200].iter().all(|s| *s == 0));
        // The last input frames made it out.
        let near_end = output[output.len() - 200];
        assert!((near_end as i32 - 10_000).abs() < 300, "near end {near_end}");

        assert!(!resampler.has_tail());
        assert!(resampler.resample(&mut arena, span).unwrap_err().is_programmer_error());
        Ok(())
    }

    #[test]
    fn reset_starts_a_fresh_stream() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut input = None;
        let mut resampler = Resampler::new(1, 44_100, 48_000)?;

        let span = block(&mut arena, &mut input, &[10_000; 4410]);
        resampler.resample(&mut arena, span)?;
        resampler.finish(&mut arena, None)?;
        resampler.reset()?;
        assert!(!resampler.has_tail());

        let span = block(&mut arena, &mut input, &[0; 4410]);
        let out = resampler.resample(&mut arena, span)?;
        assert_eq!(out.frame_len(1), 4800);
        assert!(arena.samples(out)?.iter().all(|s| *s == 0));
        Ok(())
    }

    #[test]
    fn destroy_frees_the_output_buffer() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut input = None;
        let mut resampler = Resampler::new(1, 8_000, 16_000)?;
        let span = block(&mut arena, &mut input, &[0; 100]);
        resampler.resample(&mut arena, span)?;
        assert_eq!(arena.live_allocations(), 2);

        resampler.destroy(&mut arena)?;
        assert_eq!(arena.live_allocations(), 1);
        Ok(())
    }
}
