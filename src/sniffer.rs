//! Content sniffing: decide which codec a file holds by looking at its first bytes.
//!
//! We scan the sniff window for the first recognizable signature. Extension-based detection is
//! only a fallback for files whose leading bytes are inconclusive.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How many leading bytes of a file are inspected.
pub const SNIFF_LENGTH: usize = 8192;

const RIFF: u32 = 0x5249_4646;
const WAVE: u32 = 0x5741_5645;
const ID3: u32 = 0x49_4433;
const OGGS: u32 = 0x4f67_6753;
const WEBM: u32 = 0x1a45_dfa3;
const AAC_1: u32 = 0xfff1;
const AAC_2: u32 = 0xfff9;

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_MPEGLAYER3: u16 = 0x0055;

/// Codec families we can recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecName {
    Mp3,
    Wav,
    Aac,
    Webm,
    Ogg,
    Unknown,
}

impl CodecName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecName::Mp3 => "mp3",
            CodecName::Wav => "wav",
            CodecName::Aac => "aac",
            CodecName::Webm => "webm",
            CodecName::Ogg => "ogg",
            CodecName::Unknown => "unknown",
        }
    }

    /// Whether this crate ships a decoder for the codec.
    pub fn is_decodable(&self) -> bool {
        matches!(self, CodecName::Mp3 | CodecName::Wav)
    }
}

impl fmt::Display for CodecName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a codec from the leading bytes of a file.
///
/// Returns `None` when nothing in the sniff window looks like a known signature.
pub fn codec_name_from_contents(buffer: &[u8]) -> Option<CodecName> {
    let length = buffer.len().min(SNIFF_LENGTH);
    if length < 4 {
        return None;
    }

    for i in 0..length - 4 {
        let value = read_u32_be(buffer, i);

        if value == RIFF && i + 12 < length && read_u32_be(buffer, i + 8) == WAVE {
            return Some(refine_wav(buffer, i));
        } else if value >> 16 == AAC_1 || value >> 16 == AAC_2 {
            return Some(CodecName::Aac);
        } else if value == WEBM {
            return Some(CodecName::Webm);
        } else if value == OGGS {
            return Some(CodecName::Ogg);
        } else if value >> 8 == ID3 || probably_mp3_header(value) {
            return Some(CodecName::Mp3);
        }
    }

    None
}

/// Classify a codec from a file name's extension.
pub fn codec_name_from_file_name(path: impl AsRef<Path>) -> Option<CodecName> {
    let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp3" | "mpeg" | "mpga" => Some(CodecName::Mp3),
        "wav" | "wave" => Some(CodecName::Wav),
        "aac" | "m4a" | "mp4" => Some(CodecName::Aac),
        "webm" | "weba" => Some(CodecName::Webm),
        "ogg" | "oga" | "opus" => Some(CodecName::Ogg),
        _ => None,
    }
}

/// Sniff contents first, then fall back to the file name.
pub fn codec_name(buffer: &[u8], path: Option<&Path>) -> CodecName {
    codec_name_from_contents(buffer)
        .or_else(|| path.and_then(codec_name_from_file_name))
        .unwrap_or(CodecName::Unknown)
}

/// Fail fast with `CodecNotSupported` unless a decoder exists for `codec`.
pub fn ensure_supported(codec: CodecName) -> Result<CodecName> {
    if codec.is_decodable() {
        Ok(codec)
    } else {
        Err(Error::CodecNotSupported(codec.to_string()))
    }
}

/// A RIFF/WAVE container may wrap MP3 frames; look at the format tag to tell.
fn refine_wav(buffer: &[u8], riff_index: usize) -> CodecName {
    let fmt_index = riff_index + 20;
    if fmt_index + 2 > buffer.len() {
        return CodecName::Wav;
    }

    match u16::from_le_bytes([buffer[fmt_index], buffer[fmt_index + 1]]) {
        WAVE_FORMAT_MPEGLAYER3 => CodecName::Mp3,
        WAVE_FORMAT_PCM | WAVE_FORMAT_IEEE_FLOAT => CodecName::Wav,
        _ => CodecName::Unknown,
    }
}

fn probably_mp3_header(header: u32) -> bool {
    // 11 sync bits, layer III, valid bitrate index, valid sample rate index.
    (header & 0xffe0_0000) == 0xffe0_0000
        && (header & (3 << 17)) == (1 << 17)
        && (header & (0xf << 12)) != (0xf << 12)
        && (header & (3 << 10)) != (3 << 10)
}

fn read_u32_be(buffer: &[u8], i: usize) -> u32 {
    u32::from_be_bytes([buffer[i], buffer[i + 1], buffer[i + 2], buffer[i + 3]])
}
