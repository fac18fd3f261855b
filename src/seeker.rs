//! Mapping a track time to the file offset and frame position decoding resumes from.
//!
//! PCM seeks are exact. MP3 seeks assume frames of average size and start a few frames early,
//! so the bit reservoir of the target frame is rebuilt before its samples are kept.

use serde::Serialize;
use tracing::debug;

use crate::codecs::mp3;
use crate::error::{Error, Result};
use crate::metadata::TrackMetadata;
use crate::sniffer::CodecName;

/// Layer III frames decoded ahead of the target to refill the bit reservoir.
const MP3_RESERVOIR_FRAMES: u64 = 9;

/// Where to resume decoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeekPoint {
    /// Track time of the first frame decoded after the seek, in seconds.
    pub time: f64,
    /// Absolute file offset to resume reading at.
    pub offset: u64,
    /// Index of the codec frame at `offset` (audio frame for PCM, Layer III frame for MP3).
    pub codec_frame: u64,
    /// Audio frame index of `time`. The decoder's next flushed frame.
    pub audio_frame: u64,
    /// Decoded audio frames to drop before `audio_frame`.
    pub frames_to_skip: u64,
}

/// Resolve `time` (clamped to the track) to a seek point.
pub fn seek(metadata: &TrackMetadata, time: f64) -> Result<SeekPoint> {
    if !time.is_finite() {
        return Err(Error::programmer(format!("cannot seek to {time}")));
    }
    let time = time.clamp(0.0, metadata.duration.max(0.0));

    let point = match metadata.codec {
        CodecName::Wav => seek_pcm(metadata, time)?,
        CodecName::Mp3 => seek_mp3(metadata, time),
        other => return Err(Error::CodecNotSupported(other.to_string())),
    };
    debug!(
        time,
        resolved = point.time,
        offset = point.offset,
        frames_to_skip = point.frames_to_skip,
        "resolved seek"
    );
    Ok(point)
}

fn seek_pcm(metadata: &TrackMetadata, time: f64) -> Result<SeekPoint> {
    let encoding = metadata
        .pcm_encoding
        .ok_or_else(|| Error::decode("wav metadata is missing the pcm encoding"))?;
    let block_align = (encoding.bytes() * metadata.channel_count.max(1) as usize) as u64;
    let total_frames = metadata.data_len() / block_align;
    let frame = ((time * metadata.sample_rate as f64) as u64).min(total_frames);

    Ok(SeekPoint {
        time: frame as f64 / metadata.sample_rate as f64,
        offset: metadata.data_start + frame * block_align,
        codec_frame: frame,
        audio_frame: frame,
        frames_to_skip: 0,
    })
}

fn seek_mp3(metadata: &TrackMetadata, time: f64) -> SeekPoint {
    let samples_per_frame = mp3::samples_per_frame_at(metadata.sample_rate) as u64;
    let frames = (metadata.duration * metadata.sample_rate as f64 / samples_per_frame as f64)
        .round() as u64;

    let frame = if frames == 0 || metadata.duration <= 0.0 {
        0
    } else {
        ((time / metadata.duration * frames as f64) as u64).min(frames)
    };
    let target = frame.saturating_sub(MP3_RESERVOIR_FRAMES);

    let average_frame_size = if frames == 0 {
        0.0
    } else {
        metadata.data_len() as f64 / frames as f64
    };
    let offset = metadata.data_start + (target as f64 * average_frame_size) as u64;

    SeekPoint {
        time: (frame * samples_per_frame) as f64 / metadata.sample_rate as f64,
        offset: offset.clamp(metadata.data_start, metadata.data_end),
        codec_frame: target,
        audio_frame: frame * samples_per_frame,
        frames_to_skip: (frame - target) * samples_per_frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PcmEncoding;

    fn wav_metadata() -> TrackMetadata {
        TrackMetadata {
            codec: CodecName::Wav,
            sample_rate: 8_000,
            channel_count: 2,
            data_start: 44,
            data_end: 44 + 8_000 * 4 * 2,
            max_byte_size_per_audio_frame: 4.0,
            duration: 2.0,
            pcm_encoding: Some(PcmEncoding::I16),
        }
    }

    #[test]
    fn pcm_seeks_land_on_whole_frames() -> Result<()> {
        let point = seek(&wav_metadata(), 0.50001)?;
        assert_eq!(point.audio_frame, 4_000);
        assert_eq!(point.offset, 44 + 4_000 * 4);
        assert_eq!(point.time, 0.5);
        assert_eq!(point.frames_to_skip, 0);
        Ok(())
    }

    #[test]
    fn times_are_clamped_to_the_track() -> Result<()> {
        let metadata = wav_metadata();
        assert_eq!(seek(&metadata, -3.0)?.offset, metadata.data_start);
        assert_eq!(seek(&metadata, 60.0)?.offset, metadata.data_end);
        assert!(seek(&metadata, f64::NAN).unwrap_err().is_programmer_error());
        Ok(())
    }

    #[test]
    fn mp3_seeks_start_early_to_refill_the_reservoir() -> Result<()> {
        // 128 kbit/s at 44.1 kHz: 417.96 bytes per 1152-sample frame, 100 frames.
        let metadata = TrackMetadata {
            codec: CodecName::Mp3,
            sample_rate: 44_100,
            channel_count: 2,
            data_start: 100,
            data_end: 100 + 41_796,
            max_byte_size_per_audio_frame: 1.0,
            duration: 100.0 * 1152.0 / 44_100.0,
            pcm_encoding: None,
        };

        let point = seek(&metadata, metadata.duration / 2.0)?;
        assert_eq!(point.codec_frame, 41);
        assert_eq!(point.audio_frame, 50 * 1152);
        assert_eq!(point.frames_to_skip, 9 * 1152);
        assert_eq!(point.offset, 100 + (41.0 * 417.96) as u64);
        assert!((point.time - 50.0 * 1152.0 / 44_100.0).abs() < 1e-12);

        let start = seek(&metadata, 0.01)?;
        assert_eq!(start.codec_frame, 0);
        assert_eq!(start.offset, 100);
        Ok(())
    }
}
