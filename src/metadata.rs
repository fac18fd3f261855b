use serde::{Deserialize, Serialize};

use crate::sniffer::CodecName;

/// What a decode loop needs to know about a track before it starts reading.
///
/// Produced by the codec-specific probes in `codecs` from the file's leading bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub codec: CodecName,
    pub sample_rate: u32,
    pub channel_count: u16,

    /// Absolute file offset of the first compressed audio byte.
    pub data_start: u64,

    /// Absolute file offset one past the last compressed audio byte.
    ///
    /// Decode loops never hand bytes at or beyond this offset to a decoder.
    pub data_end: u64,

    /// Upper bound on compressed bytes per audio frame, used to size file reads.
    pub max_byte_size_per_audio_frame: f64,

    /// Duration in seconds, when known.
    pub duration: f64,

    /// Sample layout of uncompressed (PCM) tracks; `None` for compressed codecs.
    #[serde(default)]
    pub pcm_encoding: Option<PcmEncoding>,
}

/// How one interleaved PCM sample is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcmEncoding {
    U8,
    I16,
    I24,
    I32,
    F32,
}

impl PcmEncoding {
    /// Bytes per sample.
    pub fn bytes(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::I24 => 3,
            Self::I32 | Self::F32 => 4,
        }
    }

    /// Convert one little-endian sample to `i16`, keeping the most significant bits.
    pub fn to_i16(self, raw: &[u8]) -> i16 {
        match self {
            Self::U8 => ((raw[0] as i16) - 128) << 8,
            Self::I16 => i16::from_le_bytes([raw[0], raw[1]]),
            Self::I24 => i16::from_le_bytes([raw[1], raw[2]]),
            Self::I32 => i16::from_le_bytes([raw[2], raw[3]]),
            Self::F32 => {
                let value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                (value * 32768.0)
                    .round()
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16
            }
        }
    }
}

impl TrackMetadata {
    /// Length of the decode region in bytes.
    pub fn data_len(&self) -> u64 {
        self.data_end.saturating_sub(self.data_start)
    }
}
