//! Channel count conversion for interleaved `i16` PCM.
//!
//! Policy:
//! - same count: the input span is returned untouched
//! - 1 -> N: the mono sample is duplicated into every output channel
//! - N -> 1: equal-weight average across channels
//! - anything else is `Error::Unsupported`

use crate::arena::{SampleArena, ScratchBuffer, Span};
use crate::error::{Error, Result};

/// Converts blocks to a fixed destination channel count.
pub struct ChannelMixer {
    destination_channel_count: u16,
    output: ScratchBuffer,
}

impl ChannelMixer {
    pub fn new(destination_channel_count: u16) -> Self {
        Self {
            destination_channel_count,
            output: ScratchBuffer::new(),
        }
    }

    pub fn destination_channel_count(&self) -> u16 {
        self.destination_channel_count
    }

    /// Byte length of the mixed output for `byte_length` bytes of `input_channel_count` input.
    pub fn output_byte_length(&self, byte_length: usize, input_channel_count: u16) -> usize {
        let frames = byte_length / std::mem::size_of::<i16>() / input_channel_count.max(1) as usize;
        frames * self.destination_channel_count as usize * std::mem::size_of::<i16>()
    }

    /// Mix `span` (interleaved, `input_channel_count` channels) to the destination layout.
    ///
    /// The returned span is either `span` itself or lives in the mixer's own buffer.
    pub fn mix(
        &mut self,
        arena: &mut SampleArena,
        input_channel_count: u16,
        span: Span,
    ) -> Result<Span> {
        let output_channels = self.destination_channel_count as usize;
        let input_channels = input_channel_count as usize;
        if input_channels == output_channels {
            return Ok(span);
        }
        if input_channels == 0 || (input_channels != 1 && output_channels != 1) {
            return Err(Error::unsupported(format!(
                "cannot mix {input_channels} channels into {output_channels}"
            )));
        }

        let byte_length = self.output_byte_length(span.byte_length, input_channel_count);
        let handle = self.output.get(arena, byte_length)?;
        let (mixed, ()) = arena.transform(span, handle, byte_length, |input, output| {
            if input_channels == 1 {
                for (frame, sample) in output.chunks_exact_mut(output_channels).zip(input) {
                    frame.fill(*sample);
                }
            } else {
                for (out, frame) in output.iter_mut().zip(input.chunks_exact(input_channels)) {
                    let sum: i32 = frame.iter().map(|s| *s as i32).sum();
                    *out = (sum / input_channels as i32) as i16;
                }
            }
        })?;
        Ok(mixed)
    }

    pub fn destroy(&mut self, arena: &mut SampleArena) -> Result<()> {
        self.output.release(arena)
    }
}
