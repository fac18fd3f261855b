//! RIFF/WAVE PCM: header probing via `hound` and an incremental sample decoder.
//!
//! The header is parsed once from the file's leading bytes. After that the data chunk is plain
//! interleaved samples, so "decoding" is a format conversion to `i16` done on whole frames only.

use std::io::Cursor;

use hound::{SampleFormat, WavReader};

use crate::arena::SampleArena;
use crate::codecs::BlockAssembler;
use crate::decoder::{Decoder, FlushCallback};
use crate::error::{Error, Result};
use crate::metadata::{PcmEncoding, TrackMetadata};
use crate::seeker::SeekPoint;
use crate::sniffer::CodecName;

fn encoding_from_spec(format: SampleFormat, bits_per_sample: u16) -> Result<PcmEncoding> {
    match (format, bits_per_sample) {
        (SampleFormat::Int, 8) => Ok(PcmEncoding::U8),
        (SampleFormat::Int, 16) => Ok(PcmEncoding::I16),
        (SampleFormat::Int, 24) => Ok(PcmEncoding::I24),
        (SampleFormat::Int, 32) => Ok(PcmEncoding::I32),
        (SampleFormat::Float, 32) => Ok(PcmEncoding::F32),
        (format, bits) => Err(Error::CodecNotSupported(format!(
            "wav {format:?} with {bits} bits per sample"
        ))),
    }
}

/// Parse the RIFF header in `head` and locate the data chunk.
pub fn probe_metadata(head: &[u8], file_len: u64) -> Result<TrackMetadata> {
    let reader = WavReader::new(Cursor::new(head))?;
    let spec = reader.spec();
    let frames = reader.duration() as u64;
    let encoding = encoding_from_spec(spec.sample_format, spec.bits_per_sample)?;

    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(Error::decode(
            "wav header declares zero channels or sample rate",
        ));
    }

    // hound stops right after the data chunk header.
    let data_start = reader.into_inner().position();
    let block_align = encoding.bytes() as u64 * spec.channels as u64;
    let data_end = data_start
        .saturating_add(frames.saturating_mul(block_align))
        .min(file_len);

    Ok(TrackMetadata {
        codec: CodecName::Wav,
        sample_rate: spec.sample_rate,
        channel_count: spec.channels,
        data_start,
        data_end,
        max_byte_size_per_audio_frame: block_align as f64,
        duration: data_end.saturating_sub(data_start) as f64
            / block_align as f64
            / spec.sample_rate as f64,
        pcm_encoding: Some(encoding),
    })
}

/// Incremental PCM decoder.
pub struct WavDecoder {
    sample_rate: u32,
    channel_count: u16,
    encoding: PcmEncoding,
    assembler: BlockAssembler,
    scratch: Vec<i16>,
}

impl WavDecoder {
    pub fn new(metadata: &TrackMetadata) -> Result<Self> {
        let encoding = metadata
            .pcm_encoding
            .ok_or_else(|| Error::decode("wav metadata is missing the pcm encoding"))?;
        Ok(Self::with_encoding(
            metadata.sample_rate,
            metadata.channel_count,
            encoding,
        ))
    }

    /// A decoder for headerless PCM in the given encoding.
    pub fn with_encoding(sample_rate: u32, channel_count: u16, encoding: PcmEncoding) -> Self {
        Self {
            sample_rate,
            channel_count,
            encoding,
            assembler: BlockAssembler::new(channel_count as usize),
            scratch: Vec::new(),
        }
    }

    fn block_align(&self) -> usize {
        self.encoding.bytes() * self.channel_count.max(1) as usize
    }
}

impl Decoder for WavDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.channel_count
    }

    fn set_target_buffer_length(&mut self, audio_frames: usize) {
        self.assembler.set_target_frames(audio_frames);
    }

    fn current_audio_frame(&self) -> u64 {
        self.assembler.current_frame()
    }

    fn pending_audio_frames(&self) -> usize {
        self.assembler.pending_frames()
    }

    fn decode_until_flush(
        &mut self,
        arena: &mut SampleArena,
        input: &[u8],
        on_flush: &mut FlushCallback<'_>,
    ) -> Result<usize> {
        // Leftovers from an earlier step may already fill a block.
        if self.assembler.is_full() {
            self.assembler.flush(arena, on_flush, false)?;
            return Ok(0);
        }

        let block_align = self.block_align();
        let frames = (input.len() / block_align).min(self.assembler.frames_needed());
        let consumed = frames * block_align;

        let encoding = self.encoding;
        self.scratch.clear();
        self.scratch.extend(
            input[..consumed]
                .chunks_exact(encoding.bytes())
                .map(|raw| encoding.to_i16(raw)),
        );
        self.assembler.push(&self.scratch);

        self.assembler.flush(arena, on_flush, false)?;
        Ok(consumed)
    }

    fn end(&mut self, arena: &mut SampleArena, on_flush: &mut FlushCallback<'_>) -> Result<()> {
        self.assembler.flush(arena, on_flush, true)?;
        Ok(())
    }

    fn apply_seek(&mut self, seek: &SeekPoint) -> Result<()> {
        self.assembler
            .restart_at(seek.audio_frame, seek.frames_to_skip);
        Ok(())
    }

    fn destroy(&mut self, arena: &mut SampleArena) -> Result<()> {
        self.assembler.release(arena)
    }
}

#[cfg(test)]
mod tests {
    use hound::{WavSpec, WavWriter};

    use super::*;
    use crate::arena::Span;

    fn wav_bytes(channels: u16, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn probe_locates_data_chunk() -> Result<()> {
        let bytes = wav_bytes(2, 48_000, &[0; 96]);
        let metadata = probe_metadata(&bytes, bytes.len() as u64)?;

        assert_eq!(metadata.codec, CodecName::Wav);
        assert_eq!(metadata.sample_rate, 48_000);
        assert_eq!(metadata.channel_count, 2);
        assert_eq!(metadata.data_end, bytes.len() as u64);
        assert_eq!(metadata.data_len(), 96 * 2);
        assert_eq!(metadata.max_byte_size_per_audio_frame, 4.0);
        assert_eq!(metadata.pcm_encoding, Some(PcmEncoding::I16));
        Ok(())
    }

    #[test]
    fn decodes_whole_frames_and_flushes_target_blocks() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut decoder = WavDecoder::with_encoding(8_000, 1, PcmEncoding::I16);
        decoder.set_target_buffer_length(4);

        let input: Vec<u8> = [1i16, 2, 3, 4, 5]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut flushed = Vec::new();
        let mut on_flush = |arena: &mut SampleArena, span: Span| -> Result<()> {
            flushed.push(arena.samples(span)?.to_vec());
            Ok(())
        };

        // The odd trailing byte is never consumed.
        let consumed = decoder.decode_until_flush(&mut arena, &input[..9], &mut on_flush)?;
        assert_eq!(consumed, 8);
        assert_eq!(decoder.current_audio_frame(), 4);

        let consumed = decoder.decode_until_flush(&mut arena, &input[8..], &mut on_flush)?;
        assert_eq!(consumed, 2);
        decoder.end(&mut arena, &mut on_flush)?;

        assert_eq!(flushed, vec![vec![1, 2, 3, 4], vec![5]]);
        decoder.destroy(&mut arena)?;
        assert_eq!(arena.live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn seek_drops_held_frames_and_moves_the_frame_counter() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut decoder = WavDecoder::with_encoding(8_000, 1, PcmEncoding::I16);
        decoder.set_target_buffer_length(4);

        let input: Vec<u8> = [1i16, 2, 3, 4, 5, 6]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut flushed = Vec::new();
        let mut on_flush = |arena: &mut SampleArena, span: Span| -> Result<()> {
            flushed.push(arena.samples(span)?.to_vec());
            Ok(())
        };

        decoder.decode_until_flush(&mut arena, &input[..4], &mut on_flush)?;
        assert_eq!(decoder.pending_audio_frames(), 2);

        decoder.apply_seek(&SeekPoint {
            time: 1.0,
            offset: 44 + 16_000,
            codec_frame: 8_000,
            audio_frame: 8_000,
            frames_to_skip: 0,
        })?;
        assert_eq!(decoder.pending_audio_frames(), 0);
        assert_eq!(decoder.current_audio_frame(), 8_000);

        decoder.decode_until_flush(&mut arena, &input[4..], &mut on_flush)?;
        assert_eq!(flushed, vec![vec![3, 4, 5, 6]]);
        assert_eq!(decoder.current_audio_frame(), 8_004);
        decoder.destroy(&mut arena)?;
        Ok(())
    }

    #[test]
    fn float_samples_are_scaled_and_clipped() {
        assert_eq!(PcmEncoding::F32.to_i16(&0.5f32.to_le_bytes()), 16_384);
        assert_eq!(PcmEncoding::F32.to_i16(&2.0f32.to_le_bytes()), i16::MAX);
        assert_eq!(PcmEncoding::U8.to_i16(&[128]), 0);
    }
}
