//! Codec-specific decoders and metadata probes.
//!
//! Every decoder here shares the same block discipline: decoded PCM accumulates in a
//! `BlockAssembler` until a full target-length block is available, which is then copied into the
//! decoder's own arena buffer and flushed.

pub mod mp3;
pub mod wav;

use crate::arena::{SampleArena, ScratchBuffer, Span};
use crate::decoder::{Decoder, FlushCallback};
use crate::error::{Error, Result};
use crate::metadata::TrackMetadata;
use crate::sniffer::{CodecName, ensure_supported};

/// Probe a track's metadata from its leading bytes (and, when available, its last bytes).
pub fn probe_metadata(
    codec: CodecName,
    head: &[u8],
    tail: Option<&[u8]>,
    file_len: u64,
) -> Result<TrackMetadata> {
    match ensure_supported(codec)? {
        CodecName::Wav => wav::probe_metadata(head, file_len),
        CodecName::Mp3 => mp3::probe_metadata(head, tail, file_len),
        other => Err(Error::CodecNotSupported(other.to_string())),
    }
}

/// Build a decoder for a probed track.
pub fn make_decoder(metadata: &TrackMetadata) -> Result<Box<dyn Decoder>> {
    match ensure_supported(metadata.codec)? {
        CodecName::Wav => Ok(Box::new(wav::WavDecoder::new(metadata)?)),
        CodecName::Mp3 => Ok(Box::new(mp3::Mp3Decoder::new(metadata)?)),
        other => Err(Error::CodecNotSupported(other.to_string())),
    }
}

/// Accumulates interleaved PCM and hands it out in target-length blocks.
pub(crate) struct BlockAssembler {
    channel_count: usize,
    target_frames: usize,
    pending: Vec<i16>,
    output: ScratchBuffer,
    current_frame: u64,
    frames_to_skip: u64,
}

impl BlockAssembler {
    pub(crate) fn new(channel_count: usize) -> Self {
        Self {
            channel_count: channel_count.max(1),
            target_frames: 0,
            pending: Vec::new(),
            output: ScratchBuffer::new(),
            current_frame: 0,
            frames_to_skip: 0,
        }
    }

    /// Drop pending PCM and continue at `current_frame`, discarding the next `frames_to_skip`
    /// pushed frames.
    pub(crate) fn restart_at(&mut self, current_frame: u64, frames_to_skip: u64) {
        self.pending.clear();
        self.current_frame = current_frame;
        self.frames_to_skip = frames_to_skip;
    }

    pub(crate) fn set_target_frames(&mut self, frames: usize) {
        self.target_frames = frames;
    }

    pub(crate) fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub(crate) fn pending_frames(&self) -> usize {
        self.pending.len() / self.channel_count
    }

    /// Frames still missing before a full block is available.
    pub(crate) fn frames_needed(&self) -> usize {
        self.target_frames.saturating_sub(self.pending_frames())
    }

    pub(crate) fn is_full(&self) -> bool {
        self.target_frames > 0 && self.pending_frames() >= self.target_frames
    }

    pub(crate) fn push(&mut self, interleaved: &[i16]) {
        let frames = (interleaved.len() / self.channel_count) as u64;
        let skipped = self.frames_to_skip.min(frames);
        self.frames_to_skip -= skipped;
        self.pending
            .extend_from_slice(&interleaved[skipped as usize * self.channel_count..]);
    }

    /// Flush one block if a full one is pending (or, with `allow_partial`, whatever is left).
    ///
    /// Returns whether a flush happened.
    pub(crate) fn flush(
        &mut self,
        arena: &mut SampleArena,
        on_flush: &mut FlushCallback<'_>,
        allow_partial: bool,
    ) -> Result<bool> {
        let pending_frames = self.pending_frames();
        let frames = if self.is_full() {
            self.target_frames
        } else if allow_partial {
            pending_frames
        } else {
            0
        };
        if frames == 0 {
            return Ok(false);
        }

        let samples = frames * self.channel_count;
        let byte_length = samples * std::mem::size_of::<i16>();
        let handle = self.output.get(arena, byte_length)?;
        let span = Span::new(handle, byte_length);
        arena
            .samples_mut(span)?
            .copy_from_slice(&self.pending[..samples]);
        self.pending.drain(..samples);
        self.current_frame += frames as u64;

        on_flush(arena, span)?;
        Ok(true)
    }

    pub(crate) fn release(&mut self, arena: &mut SampleArena) -> Result<()> {
        self.pending.clear();
        self.output.release(arena)
    }
}
