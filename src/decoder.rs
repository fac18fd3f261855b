//! The codec-agnostic decoder contract.
//!
//! A decoder is fed raw compressed bytes (whatever the current file read produced) and reports
//! how many of them it consumed. Whenever it has a complete block of PCM ready it "flushes":
//! it writes interleaved `i16` samples into its own arena buffer and invokes the flush callback
//! with a `Span` over them. The callback runs synchronously; the decoder must not touch the
//! flushed buffer again until the callback returns.
//!
//! Implementations live in `codecs`.

use crate::arena::{SampleArena, Span};
use crate::error::Result;
use crate::seeker::SeekPoint;

/// Callback invoked with each completed PCM block.
pub type FlushCallback<'a> = dyn FnMut(&mut SampleArena, Span) -> Result<()> + 'a;

pub trait Decoder {
    fn sample_rate(&self) -> u32;

    fn channel_count(&self) -> u16;

    /// Frames per flushed block. The last block of a stream may be shorter.
    fn set_target_buffer_length(&mut self, audio_frames: usize);

    /// Absolute index of the next audio frame this decoder will flush.
    ///
    /// Monotonic; used to derive buffer timestamps.
    fn current_audio_frame(&self) -> u64;

    /// Decoded frames held back until a full block is available.
    fn pending_audio_frames(&self) -> usize;

    /// Consume bytes from `input`, flushing at most one block.
    ///
    /// Returns the number of bytes consumed. Bytes that do not yet form a complete codec
    /// unit are left unconsumed so the caller can re-offer them with more data appended.
    fn decode_until_flush(
        &mut self,
        arena: &mut SampleArena,
        input: &[u8],
        on_flush: &mut FlushCallback<'_>,
    ) -> Result<usize>;

    /// Signal end of input and flush whatever PCM is still pending.
    fn end(&mut self, arena: &mut SampleArena, on_flush: &mut FlushCallback<'_>) -> Result<()>;

    /// Forget all decoding state and continue from `seek`: the next bytes offered start at
    /// `seek.offset` and the next flushed frame is `seek.audio_frame`.
    fn apply_seek(&mut self, seek: &SeekPoint) -> Result<()>;

    /// Release arena allocations owned by the decoder.
    fn destroy(&mut self, arena: &mut SampleArena) -> Result<()>;
}
