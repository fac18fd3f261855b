//! The per-track decode loop.
//!
//! One call to `decode_from_file_view_at_offset` produces at most one filled buffer: it reads
//! from the `FileView` (the only `.await`), hands bytes to the decoder, and runs every stage
//! synchronously inside the decoder's flush callback:
//!
//! loudness measurement -> loudness normalization -> effects -> crossfade -> channel mix ->
//! resample -> fingerprint tap -> `f32` channel data (padded to a render quantum)
//!
//! Once the decoder has nothing left, the resampler's tail is appended to the final buffer, or
//! emitted as a buffer of its own when the last block was already handed out.
//!
//! The buffer is then held until the caller consumes or drops it. Decoding again while one is
//! pending is a caller bug.

use std::cell::Cell;

use tokio::io::{AsyncRead, AsyncSeek};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::arena::{SampleArena, Span};
use crate::channel_mixer::ChannelMixer;
use crate::crossfader::{Crossfader, TrackPosition};
use crate::decoder::Decoder;
use crate::effects::Effects;
use crate::error::{Error, Result};
use crate::file_view::{FileView, ReadStatus};
use crate::fingerprinter::{Fingerprint, Fingerprinter};
use crate::loudness::{LoudnessAnalyzer, LoudnessInfo};
use crate::metadata::TrackMetadata;
use crate::resampler::Resampler;
use crate::seeker::{self, SeekPoint};

/// Frames per render quantum; short buffers are zero-padded to a multiple of this.
pub const RENDER_QUANTUM_FRAMES: usize = 128;

/// Planar `f32` samples, one `Vec` per destination channel.
pub type ChannelData = Vec<Vec<f32>>;

/// Where the converted samples of a decode step go.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OutputSpec {
    /// Run every stage but keep no samples (e.g. pure analysis passes).
    #[default]
    Discard,
    /// Allocate fresh channel buffers.
    Allocate,
    /// Write into caller-provided buffers, resizing each channel to the block length.
    Reuse(ChannelData),
}

/// The one buffer a decode step produces.
#[derive(Debug, Clone, PartialEq)]
pub struct FilledBufferDescriptor {
    /// Frames per channel, padding included.
    pub length: usize,
    /// Track time of the first frame, in seconds.
    pub start_time: f64,
    /// Track time one past the last frame, in seconds.
    pub end_time: f64,
    pub channel_data: Option<ChannelData>,
    pub loudness_info: LoudnessInfo,
}

/// Result of one decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStep {
    /// The read was cancelled before the decoder saw any bytes. Retrying from the same offset
    /// is safe.
    Cancelled,
    /// Compressed bytes consumed. The next step starts at `file_position + n`.
    Advanced(u64),
}

pub struct PipelineOpts {
    pub source_sample_rate: u32,
    pub source_channel_count: u16,
    pub destination_sample_rate: u32,
    pub destination_channel_count: u16,
    pub decoder: Box<dyn Decoder>,
    pub channel_mixer: Option<ChannelMixer>,
    pub effects: Effects,
    pub resampler: Option<Resampler>,
    pub fingerprinter: Option<Box<dyn Fingerprinter>>,
    /// Measurement only; never modifies samples.
    pub loudness_analyzer: Option<LoudnessAnalyzer>,
    /// Applies normalization gain and classifies silence.
    pub loudness_normalizer: Option<LoudnessAnalyzer>,
    pub crossfader: Option<Crossfader>,
    /// Track duration in seconds.
    pub duration: f64,
    /// Seconds of audio per filled buffer.
    pub buffer_time: f64,
}

impl PipelineOpts {
    /// Options for converting a decoder's output to `destination_*`, with a mixer and resampler
    /// added when the formats differ and nothing else configured.
    pub fn for_decoder(
        decoder: Box<dyn Decoder>,
        destination_sample_rate: u32,
        destination_channel_count: u16,
        duration: f64,
        buffer_time: f64,
    ) -> Result<Self> {
        let source_sample_rate = decoder.sample_rate();
        let source_channel_count = decoder.channel_count();
        let channel_mixer = (source_channel_count != destination_channel_count)
            .then(|| ChannelMixer::new(destination_channel_count));
        let resampler = if source_sample_rate != destination_sample_rate {
            Some(Resampler::new(
                destination_channel_count,
                source_sample_rate,
                destination_sample_rate,
            )?)
        } else {
            None
        };

        Ok(Self {
            source_sample_rate,
            source_channel_count,
            destination_sample_rate,
            destination_channel_count,
            decoder,
            channel_mixer,
            effects: Effects::new(),
            resampler,
            fingerprinter: None,
            loudness_analyzer: None,
            loudness_normalizer: None,
            crossfader: None,
            duration,
            buffer_time,
        })
    }
}

/// Everything the flush callback touches, split from the decoder and arena so the three can be
/// borrowed at once.
struct Stages {
    source_sample_rate: u32,
    source_channel_count: u16,
    destination_sample_rate: u32,
    destination_channel_count: u16,
    channel_mixer: Option<ChannelMixer>,
    effects: Effects,
    resampler: Option<Resampler>,
    fingerprinter: Option<Box<dyn Fingerprinter>>,
    loudness_analyzer: Option<LoudnessAnalyzer>,
    loudness_normalizer: Option<LoudnessAnalyzer>,
    crossfader: Option<Crossfader>,
    duration: f64,
    buffer_audio_frame_count: usize,
    // Interleaved destination samples of the step in progress.
    block: Vec<i16>,
    block_loudness: LoudnessInfo,
    filled: Option<FilledBufferDescriptor>,
}

pub struct AudioProcessingPipeline {
    arena: SampleArena,
    decoder: Box<dyn Decoder>,
    buffer_time: f64,
    stages: Stages,
    destroyed: bool,
}

impl AudioProcessingPipeline {
    /// Build a pipeline. Loudness analyzers that are not initialized yet are initialized for the
    /// source format.
    pub fn new(opts: PipelineOpts) -> Result<Self> {
        let PipelineOpts {
            source_sample_rate,
            source_channel_count,
            destination_sample_rate,
            destination_channel_count,
            mut decoder,
            channel_mixer,
            effects,
            resampler,
            fingerprinter,
            mut loudness_analyzer,
            mut loudness_normalizer,
            crossfader,
            duration,
            buffer_time,
        } = opts;

        if source_sample_rate == 0 || destination_sample_rate == 0 {
            return Err(Error::unsupported("sample rates must be non-zero"));
        }
        if source_channel_count == 0 || destination_channel_count == 0 {
            return Err(Error::unsupported("channel counts must be non-zero"));
        }
        if !(buffer_time.is_finite() && buffer_time > 0.0) {
            return Err(Error::programmer(format!("invalid buffer time {buffer_time}")));
        }

        for analyzer in [&mut loudness_analyzer, &mut loudness_normalizer]
            .into_iter()
            .flatten()
        {
            if !analyzer.is_initialized() {
                analyzer.initialize(source_channel_count, source_sample_rate)?;
            } else if analyzer.sample_rate() != source_sample_rate
                || analyzer.channel_count() != source_channel_count
            {
                return Err(Error::analyzer(format!(
                    "loudness state is for {} channels at {} Hz, track is {} channels at {} Hz",
                    analyzer.channel_count(),
                    analyzer.sample_rate(),
                    source_channel_count,
                    source_sample_rate
                )));
            }
        }

        decoder.set_target_buffer_length((buffer_time * source_sample_rate as f64) as usize);

        Ok(Self {
            arena: SampleArena::new(),
            decoder,
            buffer_time,
            stages: Stages {
                source_sample_rate,
                source_channel_count,
                destination_sample_rate,
                destination_channel_count,
                channel_mixer,
                effects,
                resampler,
                fingerprinter,
                loudness_analyzer,
                loudness_normalizer,
                crossfader,
                duration,
                buffer_audio_frame_count: (buffer_time * destination_sample_rate as f64) as usize,
                block: Vec::new(),
                block_loudness: LoudnessInfo::default(),
                filled: None,
            },
            destroyed: false,
        })
    }

    pub fn buffer_time(&self) -> f64 {
        self.buffer_time
    }

    /// Destination frames per full buffer.
    pub fn buffer_audio_frame_count(&self) -> usize {
        self.stages.buffer_audio_frame_count
    }

    /// Destination frames of resampler lead-in at the start of the output, 0 without one.
    pub fn output_latency_frames(&self) -> usize {
        self.stages
            .resampler
            .as_ref()
            .map_or(0, Resampler::latency_frames)
    }

    pub fn set_buffer_time(&mut self, buffer_time: f64) -> Result<()> {
        if !(buffer_time.is_finite() && buffer_time > 0.0) {
            return Err(Error::programmer(format!("invalid buffer time {buffer_time}")));
        }
        self.buffer_time = buffer_time;
        self.stages.buffer_audio_frame_count =
            (buffer_time * self.stages.destination_sample_rate as f64) as usize;
        let source_frames = (buffer_time * self.stages.source_sample_rate as f64) as usize;
        self.decoder.set_target_buffer_length(source_frames);
        Ok(())
    }

    pub fn has_filled_buffer(&self) -> bool {
        self.stages.filled.is_some()
    }

    /// Take the pending buffer.
    pub fn consume_filled_buffer(&mut self) -> Result<FilledBufferDescriptor> {
        self.stages
            .filled
            .take()
            .ok_or_else(|| Error::programmer("buffer has not been filled"))
    }

    pub fn drop_filled_buffer(&mut self) {
        self.stages.filled = None;
    }

    pub fn crossfader_mut(&mut self) -> Option<&mut Crossfader> {
        self.stages.crossfader.as_mut()
    }

    pub fn loudness_normalizer_mut(&mut self) -> Option<&mut LoudnessAnalyzer> {
        self.stages.loudness_normalizer.as_mut()
    }

    /// Snapshot of the measurement-only analyzer, if one is configured.
    pub fn serialize_loudness_state(&mut self) -> Result<Option<Vec<u8>>> {
        match self.stages.loudness_analyzer.as_mut() {
            Some(analyzer) => Ok(Some(analyzer.serialize(&mut self.arena)?)),
            None => Ok(None),
        }
    }

    /// Finish the fingerprinter, if one is configured.
    pub fn calculate_fingerprint(&mut self) -> Result<Option<Fingerprint>> {
        self.stages
            .fingerprinter
            .as_mut()
            .map(|f| f.calculate_fingerprint())
            .transpose()
    }

    /// Move the decode position to `time` (clamped to the track).
    ///
    /// Drops any pending buffer and restarts every stateful stage. The next decode step must
    /// start at the returned `offset`; its first buffer begins at the returned `time`.
    pub fn seek(&mut self, metadata: &TrackMetadata, time: f64) -> Result<SeekPoint> {
        if self.destroyed {
            return Err(Error::programmer("pipeline destroyed"));
        }
        if metadata.sample_rate != self.stages.source_sample_rate
            || metadata.channel_count != self.stages.source_channel_count
        {
            return Err(Error::programmer(format!(
                "seek metadata is {} channels at {} Hz, pipeline decodes {} channels at {} Hz",
                metadata.channel_count,
                metadata.sample_rate,
                self.stages.source_channel_count,
                self.stages.source_sample_rate
            )));
        }

        let point = seeker::seek(metadata, time)?;
        self.stages.filled = None;
        self.decoder.apply_seek(&point)?;
        if let Some(resampler) = self.stages.resampler.as_mut() {
            resampler.reset()?;
        }
        self.stages.effects.reset();
        if let Some(crossfader) = self.stages.crossfader.as_mut() {
            // Resuming mid-track is not a track start.
            crossfader.set_fade_in_enabled(false);
            crossfader.set_fade_out_enabled(true);
        }

        debug!(
            time = point.time,
            offset = point.offset,
            audio_frame = point.audio_frame,
            "pipeline seeked"
        );
        Ok(point)
    }

    /// Decode the next buffer starting at `file_position`.
    ///
    /// Never hands the decoder bytes at or beyond `metadata.data_end`. Returns
    /// `DecodeStep::Cancelled` only when the token fired before any byte was decoded; after
    /// partial progress the consumed byte count is returned instead so the caller never
    /// re-feeds bytes the decoder already saw.
    pub async fn decode_from_file_view_at_offset<R>(
        &mut self,
        file_view: &mut FileView<R>,
        file_position: u64,
        metadata: &TrackMetadata,
        cancellation_token: &CancellationToken,
        output: OutputSpec,
        padding_factor_hint: f64,
    ) -> Result<DecodeStep>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        if self.destroyed {
            return Err(Error::programmer("pipeline destroyed"));
        }
        if self.has_filled_buffer() {
            return Err(Error::programmer("previous buffer has not been consumed"));
        }

        let data_end = metadata.data_end;
        let bytes_to_read = (self.buffer_time
            * self.stages.source_sample_rate as f64
            * metadata.max_byte_size_per_audio_frame.ceil()) as u64;
        let bytes_to_read = bytes_to_read.max(1);
        let start_frame = self.decoder.current_audio_frame();
        debug!(file_position, data_end, bytes_to_read, start_frame, "decode step");

        let Self {
            arena,
            decoder,
            stages,
            ..
        } = self;
        stages.block.clear();
        stages.block_loudness = LoudnessInfo::default();
        let flushed = Cell::new(false);
        let mut on_flush = |arena: &mut SampleArena, span: Span| -> Result<()> {
            if flushed.replace(true) {
                return Err(Error::decode("decoder flushed twice in one step"));
            }
            stages.process_samples(arena, span, start_frame)
        };

        let mut total_consumed = 0u64;
        let mut ended = false;
        let mut data_remaining = data_end.saturating_sub(file_position);
        if data_remaining == 0 {
            decoder.end(arena, &mut on_flush)?;
            ended = true;
        }

        while data_remaining > 0 {
            let position = file_position + total_consumed;
            let status = file_view
                .read_block_of_size_at(
                    bytes_to_read,
                    position,
                    cancellation_token,
                    padding_factor_hint,
                )
                .await?;
            if status == ReadStatus::Cancelled {
                debug!(position, total_consumed, "decode step cancelled");
                return Ok(if total_consumed == 0 {
                    DecodeStep::Cancelled
                } else {
                    DecodeStep::Advanced(total_consumed)
                });
            }

            let block = file_view.block_at_position(position)?;
            let block = &block[..block.len().min(data_remaining as usize)];
            let consumed = decoder.decode_until_flush(arena, block, &mut on_flush)?;
            total_consumed += consumed as u64;
            data_remaining = data_end.saturating_sub(file_position + total_consumed);

            if flushed.get() {
                break;
            }
            if data_remaining > 0 && consumed > 0 {
                continue;
            }

            // Input exhausted, or the decoder cannot make progress on what is left.
            decoder.end(arena, &mut on_flush)?;
            ended = true;
            if consumed == 0 && !block.is_empty() && !flushed.get() {
                return Err(Error::decode(format!(
                    "decoder made no progress at file offset {position} and flushed nothing"
                )));
            }
            total_consumed = data_end.saturating_sub(file_position);
            break;
        }

        // Nothing decoded remains once the data is consumed and the decoder holds no frames.
        if ended || (data_remaining == 0 && decoder.pending_audio_frames() == 0) {
            stages.drain_resampler(arena)?;
        }
        let filled = flushed.get() || !stages.block.is_empty();
        if filled {
            stages.fill_buffer(output, start_frame)?;
        }

        debug!(total_consumed, filled, "decode step done");
        Ok(DecodeStep::Advanced(total_consumed))
    }

    /// Release every arena allocation held by the pipeline and its components.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(Error::programmer("pipeline destroyed twice"));
        }
        self.destroyed = true;
        self.stages.filled = None;

        let arena = &mut self.arena;
        self.decoder.destroy(arena)?;
        if let Some(mixer) = self.stages.channel_mixer.as_mut() {
            mixer.destroy(arena)?;
        }
        if let Some(resampler) = self.stages.resampler.as_mut() {
            resampler.destroy(arena)?;
        }
        for analyzer in [
            &mut self.stages.loudness_analyzer,
            &mut self.stages.loudness_normalizer,
        ]
        .into_iter()
        .flatten()
        {
            if analyzer.is_initialized() {
                analyzer.destroy(arena)?;
            }
        }

        debug!(leaked = arena.live_allocations(), "pipeline destroyed");
        Ok(())
    }
}

impl Stages {
    /// Run every stage over one decoded block and keep the destination samples.
    fn process_samples(
        &mut self,
        arena: &mut SampleArena,
        span: Span,
        start_frame: u64,
    ) -> Result<()> {
        let source_channels = self.source_channel_count;
        let frames = span.frame_len(source_channels as usize);
        trace!(frames, start_frame, "processing flushed block");

        if let Some(analyzer) = self.loudness_analyzer.as_mut() {
            analyzer.add_frames(arena, span, frames)?;
        }

        if let Some(normalizer) = self.loudness_normalizer.as_mut() {
            self.block_loudness = normalizer.apply_loudness_normalization(arena, span, frames)?;
        }

        let mut span = self.effects.apply(
            arena,
            source_channels,
            self.source_sample_rate,
            span,
        )?;

        if let Some(crossfader) = &self.crossfader {
            let position = TrackPosition {
                current_time: start_frame as f64 / self.source_sample_rate as f64,
                track_duration: self.duration,
            };
            crossfader.apply(
                arena,
                span,
                source_channels,
                self.source_sample_rate,
                position,
            )?;
        }

        if source_channels != self.destination_channel_count {
            let mixer = self.channel_mixer.as_mut().ok_or_else(|| {
                Error::programmer(format!(
                    "source has {source_channels} channels, destination {}, but no channel mixer",
                    self.destination_channel_count
                ))
            })?;
            span = mixer.mix(arena, source_channels, span)?;
        }

        if self.source_sample_rate != self.destination_sample_rate {
            let resampler = self.resampler.as_mut().ok_or_else(|| {
                Error::programmer(format!(
                    "source rate {} Hz, destination {} Hz, but no resampler",
                    self.source_sample_rate, self.destination_sample_rate
                ))
            })?;
            span = resampler.resample(arena, span)?;
        }

        self.keep_destination_samples(arena, span)
    }

    /// Append whatever the resampler still holds once the stream is over.
    fn drain_resampler(&mut self, arena: &mut SampleArena) -> Result<()> {
        let Some(resampler) = self.resampler.as_mut().filter(|r| r.has_tail()) else {
            return Ok(());
        };
        let span = resampler.finish(arena, None)?;
        trace!(
            frames = span.frame_len(self.destination_channel_count as usize),
            "resampler tail"
        );
        self.keep_destination_samples(arena, span)
    }

    fn keep_destination_samples(&mut self, arena: &SampleArena, span: Span) -> Result<()> {
        let samples = arena.samples(span)?;
        if let Some(fingerprinter) = self.fingerprinter.as_mut() {
            if fingerprinter.needs_frames() {
                fingerprinter.new_frames(samples)?;
            }
        }
        self.block.extend_from_slice(samples);
        Ok(())
    }

    /// Convert the step's samples into the filled buffer.
    fn fill_buffer(&mut self, output: OutputSpec, start_frame: u64) -> Result<()> {
        let channels = self.destination_channel_count as usize;
        let samples = &self.block;
        let final_frames = samples.len() / channels;

        let channel_data = match output {
            OutputSpec::Discard => None,
            OutputSpec::Allocate => Some(vec![Vec::new(); channels]),
            OutputSpec::Reuse(data) => {
                if data.len() < channels {
                    return Err(Error::programmer(format!(
                        "output has {} channels, destination needs {channels}",
                        data.len()
                    )));
                }
                Some(data)
            }
        };

        let mut length = final_frames;
        let channel_data = channel_data.map(|mut data| {
            if final_frames < self.buffer_audio_frame_count {
                length = final_frames.div_ceil(RENDER_QUANTUM_FRAMES) * RENDER_QUANTUM_FRAMES;
            }
            for (ch, dst) in data.iter_mut().enumerate().take(channels) {
                dst.clear();
                dst.extend(
                    samples
                        .iter()
                        .skip(ch)
                        .step_by(channels)
                        .map(|s| *s as f32 / 32768.0),
                );
                dst.resize(length, 0.0);
            }
            data
        });

        let start_time = round_nanos(start_frame as f64 / self.source_sample_rate as f64);
        let end_time =
            round_nanos(start_time + length as f64 / self.destination_sample_rate as f64);

        self.filled = Some(FilledBufferDescriptor {
            length,
            start_time,
            end_time,
            channel_data,
            loudness_info: std::mem::take(&mut self.block_loudness),
        });
        Ok(())
    }
}

fn round_nanos(seconds: f64) -> f64 {
    (seconds * 1e9).round() / 1e9
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codecs::wav::WavDecoder;
    use crate::metadata::PcmEncoding;
    use crate::sniffer::CodecName;

    fn pcm_track(channels: u16, rate: u32, frames: usize, value: i16) -> (Vec<u8>, TrackMetadata) {
        let bytes: Vec<u8> = std::iter::repeat_n(value.to_le_bytes(), frames * channels as usize)
            .flatten()
            .collect();
        let metadata = TrackMetadata {
            codec: CodecName::Wav,
            sample_rate: rate,
            channel_count: channels,
            data_start: 0,
            data_end: bytes.len() as u64,
            max_byte_size_per_audio_frame: 2.0 * channels as f64,
            duration: frames as f64 / rate as f64,
            pcm_encoding: Some(PcmEncoding::I16),
        };
        (bytes, metadata)
    }

    fn wav_pipeline(
        metadata: &TrackMetadata,
        dst_rate: u32,
        dst_channels: u16,
        buffer_time: f64,
    ) -> Result<AudioProcessingPipeline> {
        let decoder = Box::new(WavDecoder::with_encoding(
            metadata.sample_rate,
            metadata.channel_count,
            PcmEncoding::I16,
        ));
        AudioProcessingPipeline::new(PipelineOpts::for_decoder(
            decoder,
            dst_rate,
            dst_channels,
            metadata.duration,
            buffer_time,
        )?)
    }

    async fn decode_step(
        pipeline: &mut AudioProcessingPipeline,
        view: &mut FileView<Cursor<Vec<u8>>>,
        position: u64,
        metadata: &TrackMetadata,
        token: &CancellationToken,
        output: OutputSpec,
    ) -> Result<DecodeStep> {
        pipeline
            .decode_from_file_view_at_offset(view, position, metadata, token, output, 1.0)
            .await
    }

    #[tokio::test]
    async fn pending_buffer_blocks_the_next_step() -> Result<()> {
        let (bytes, metadata) = pcm_track(1, 8_000, 8_000, 1_000);
        let mut view = FileView::new(Cursor::new(bytes), metadata.data_end);
        let mut pipeline = wav_pipeline(&metadata, 8_000, 1, 0.25)?;
        let token = CancellationToken::new();

        let step = decode_step(
            &mut pipeline,
            &mut view,
            0,
            &metadata,
            &token,
            OutputSpec::Allocate,
        )
        .await?;
        assert_eq!(step, DecodeStep::Advanced(4_000));
        assert!(pipeline.has_filled_buffer());

        let err = decode_step(
            &mut pipeline,
            &mut view,
            4_000,
            &metadata,
            &token,
            OutputSpec::Allocate,
        )
        .await
        .unwrap_err();
        assert!(err.is_programmer_error());

        let buffer = pipeline.consume_filled_buffer()?;
        assert_eq!(buffer.length, 2_000);
        assert_eq!(buffer.start_time, 0.0);
        assert_eq!(buffer.end_time, 0.25);
        let data = buffer.channel_data.unwrap();
        assert!(data[0].iter().all(|s| *s == 1_000.0 / 32768.0));
        assert!(pipeline.consume_filled_buffer().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn short_tail_is_padded_to_the_render_quantum() -> Result<()> {
        // 0.25 s buffers over 0.3 s: the second buffer holds 400 frames, padded to 512.
        let (bytes, metadata) = pcm_track(2, 8_000, 2_400, -500);
        let mut view = FileView::new(Cursor::new(bytes), metadata.data_end);
        let mut pipeline = wav_pipeline(&metadata, 8_000, 2, 0.25)?;
        let token = CancellationToken::new();

        let mut position = 0;
        let mut buffers = Vec::new();
        loop {
            let step = decode_step(
                &mut pipeline,
                &mut view,
                position,
                &metadata,
                &token,
                OutputSpec::Allocate,
            )
            .await?;
            let DecodeStep::Advanced(consumed) = step else {
                unreachable!("token never fires");
            };
            position += consumed;
            if !pipeline.has_filled_buffer() {
                break;
            }
            buffers.push(pipeline.consume_filled_buffer()?);
        }

        assert_eq!(buffers.len(), 2);
        let tail = &buffers[1];
        assert_eq!(tail.length, 512);
        assert_eq!(tail.start_time, 0.25);
        assert!((tail.end_time - 0.314).abs() < 1e-12);
        let data = tail.channel_data.as_ref().unwrap();
        for channel in data {
            assert_eq!(channel.len(), 512);
            assert!(channel[..400].iter().all(|s| *s == -500.0 / 32768.0));
            assert!(channel[400..].iter().all(|s| *s == 0.0));
        }
        Ok(())
    }

    #[tokio::test]
    async fn discard_keeps_no_samples_and_no_padding() -> Result<()> {
        let (bytes, metadata) = pcm_track(1, 8_000, 1_000, 10);
        let mut view = FileView::new(Cursor::new(bytes), metadata.data_end);
        let mut pipeline = wav_pipeline(&metadata, 8_000, 1, 0.25)?;
        let token = CancellationToken::new();

        decode_step(&mut pipeline, &mut view, 0, &metadata, &token, OutputSpec::Discard).await?;
        let buffer = pipeline.consume_filled_buffer()?;
        assert_eq!(buffer.length, 1_000);
        assert!(buffer.channel_data.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn reuse_writes_into_caller_buffers() -> Result<()> {
        let (bytes, metadata) = pcm_track(1, 8_000, 2_000, 16_384);
        let mut view = FileView::new(Cursor::new(bytes), metadata.data_end);
        let mut pipeline = wav_pipeline(&metadata, 8_000, 1, 0.25)?;
        let token = CancellationToken::new();

        let reused = vec![Vec::with_capacity(2_000)];
        decode_step(
            &mut pipeline,
            &mut view,
            0,
            &metadata,
            &token,
            OutputSpec::Reuse(reused),
        )
        .await?;
        let data = pipeline.consume_filled_buffer()?.channel_data.unwrap();
        assert_eq!(data[0].len(), 2_000);
        assert_eq!(data[0][0], 0.5);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_read_changes_nothing() -> Result<()> {
        let (bytes, metadata) = pcm_track(1, 8_000, 4_000, 7);
        let mut view = FileView::new(Cursor::new(bytes), metadata.data_end);
        let mut pipeline = wav_pipeline(&metadata, 8_000, 1, 0.25)?;

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let step = decode_step(
            &mut pipeline,
            &mut view,
            0,
            &metadata,
            &cancelled,
            OutputSpec::Allocate,
        )
        .await?;
        assert_eq!(step, DecodeStep::Cancelled);
        assert!(!pipeline.has_filled_buffer());

        let token = CancellationToken::new();
        let step = decode_step(
            &mut pipeline,
            &mut view,
            0,
            &metadata,
            &token,
            OutputSpec::Allocate,
        )
        .await?;
        assert_eq!(step, DecodeStep::Advanced(4_000));
        assert_eq!(pipeline.consume_filled_buffer()?.start_time, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn destroy_frees_every_allocation() -> Result<()> {
        let (bytes, metadata) = pcm_track(1, 8_000, 2_000, 100);
        let mut view = FileView::new(Cursor::new(bytes), metadata.data_end);
        let mut pipeline = wav_pipeline(&metadata, 16_000, 2, 0.25)?;
        let token = CancellationToken::new();

        decode_step(&mut pipeline, &mut view, 0, &metadata, &token, OutputSpec::Allocate).await?;
        assert!(pipeline.arena.live_allocations() > 0);

        pipeline.destroy()?;
        assert_eq!(pipeline.arena.live_allocations(), 0);
        assert!(pipeline.destroy().unwrap_err().is_programmer_error());
        Ok(())
    }

    #[tokio::test]
    async fn resampled_track_ends_with_the_filter_tail() -> Result<()> {
        let (bytes, metadata) = pcm_track(1, 8_000, 4_000, 8_000);
        let mut view = FileView::new(Cursor::new(bytes), metadata.data_end);
        let mut pipeline = wav_pipeline(&metadata, 16_000, 1, 0.25)?;
        let latency = pipeline.output_latency_frames();
        assert!(latency > 0);
        let token = CancellationToken::new();

        let mut position = 0;
        let mut buffers = Vec::new();
        loop {
            let DecodeStep::Advanced(consumed) = decode_step(
                &mut pipeline,
                &mut view,
                position,
                &metadata,
                &token,
                OutputSpec::Allocate,
            )
            .await?
            else {
                unreachable!("token never fires");
            };
            position += consumed;
            if !pipeline.has_filled_buffer() {
                break;
            }
            buffers.push(pipeline.consume_filled_buffer()?);
        }

        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].length, 4_000);
        let last = &buffers[1];
        assert_eq!(last.length, 4_000 + latency);
        let data = &last.channel_data.as_ref().unwrap()[0];
        let near_end = data[data.len() - 400];
        assert!((near_end - 8_000.0 / 32768.0).abs() < 0.01, "near end {near_end}");
        Ok(())
    }

    #[tokio::test]
    async fn seek_restarts_decoding_at_the_requested_time() -> Result<()> {
        let bytes: Vec<u8> = (0..8_000i16).flat_map(|s| s.to_le_bytes()).collect();
        let metadata = TrackMetadata {
            codec: CodecName::Wav,
            sample_rate: 8_000,
            channel_count: 1,
            data_start: 0,
            data_end: bytes.len() as u64,
            max_byte_size_per_audio_frame: 2.0,
            duration: 1.0,
            pcm_encoding: Some(PcmEncoding::I16),
        };
        let mut view = FileView::new(Cursor::new(bytes), metadata.data_end);
        let mut pipeline = wav_pipeline(&metadata, 8_000, 1, 0.25)?;
        let token = CancellationToken::new();

        decode_step(&mut pipeline, &mut view, 0, &metadata, &token, OutputSpec::Allocate).await?;
        assert!(pipeline.has_filled_buffer());

        let point = pipeline.seek(&metadata, 0.5)?;
        assert!(!pipeline.has_filled_buffer());
        assert_eq!(point.offset, 8_000);

        let step = decode_step(
            &mut pipeline,
            &mut view,
            point.offset,
            &metadata,
            &token,
            OutputSpec::Allocate,
        )
        .await?;
        assert_eq!(step, DecodeStep::Advanced(4_000));
        let buffer = pipeline.consume_filled_buffer()?;
        assert_eq!(buffer.start_time, 0.5);
        assert_eq!(buffer.end_time, 0.75);
        let data = &buffer.channel_data.unwrap()[0];
        assert_eq!(data[0], 4_000.0 / 32768.0);
        assert_eq!(data[1_999], 5_999.0 / 32768.0);

        let other = TrackMetadata {
            sample_rate: 44_100,
            ..metadata.clone()
        };
        assert!(pipeline.seek(&other, 0.5).unwrap_err().is_programmer_error());
        Ok(())
    }

    #[test]
    fn buffer_time_must_be_positive_and_finite() -> Result<()> {
        let (_, metadata) = pcm_track(1, 8_000, 100, 0);
        let mut pipeline = wav_pipeline(&metadata, 8_000, 1, 0.25)?;
        for invalid in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = pipeline.set_buffer_time(invalid).unwrap_err();
            assert!(err.is_programmer_error());
        }
        assert_eq!(pipeline.buffer_time(), 0.25);

        pipeline.set_buffer_time(0.5)?;
        assert_eq!(pipeline.buffer_audio_frame_count(), 4_000);
        Ok(())
    }

    #[test]
    fn timestamps_round_to_nanoseconds() {
        assert_eq!(round_nanos(1.0 / 3.0), 0.333_333_333);
        assert_eq!(round_nanos(0.1 + 0.2), 0.3);
    }
}
