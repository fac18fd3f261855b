//! MPEG-1/2/2.5 Layer III.
//!
//! Frame sync and sizing are done here so the decoder only ever hands whole frames to
//! Symphonia and can report exactly how many input bytes it consumed. Symphonia does the
//! actual synthesis, including the bit reservoir that spans frames.

use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{
    CODEC_TYPE_MP3, CodecParameters, Decoder as SymphoniaDecoder, DecoderOptions,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;
use tracing::{debug, trace};

use crate::arena::SampleArena;
use crate::codecs::BlockAssembler;
use crate::decoder::{Decoder, FlushCallback};
use crate::error::{Error, Result};
use crate::metadata::TrackMetadata;
use crate::seeker::SeekPoint;
use crate::sniffer::CodecName;

const HEADER_LEN: usize = 4;
const ID3V1_LEN: usize = 128;

const MPEG1_BITRATES: [u32; 15] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const MPEG2_BITRATES: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

impl MpegVersion {
    fn bitrates(self) -> &'static [u32; 15] {
        match self {
            Self::Mpeg1 => &MPEG1_BITRATES,
            Self::Mpeg2 | Self::Mpeg25 => &MPEG2_BITRATES,
        }
    }

    fn samples_per_frame(self) -> usize {
        match self {
            Self::Mpeg1 => 1152,
            Self::Mpeg2 | Self::Mpeg25 => 576,
        }
    }

    /// Bytes per frame per (kbit/s / kHz).
    fn length_coefficient(self) -> u32 {
        match self {
            Self::Mpeg1 => 144,
            Self::Mpeg2 | Self::Mpeg25 => 72,
        }
    }
}

/// Audio frames per Layer III frame for streams at `sample_rate`.
pub(crate) fn samples_per_frame_at(sample_rate: u32) -> usize {
    match sample_rate {
        32_000 | 44_100 | 48_000 => MpegVersion::Mpeg1.samples_per_frame(),
        _ => MpegVersion::Mpeg2.samples_per_frame(),
    }
}

/// A parsed Layer III frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    version: MpegVersion,
    bitrate_kbps: u32,
    sample_rate: u32,
    channel_count: u16,
    has_crc: bool,
    frame_length: usize,
}

impl FrameHeader {
    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let header = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if header & 0xffe0_0000 != 0xffe0_0000 {
            return None;
        }

        let version = match (header >> 19) & 0b11 {
            0b00 => MpegVersion::Mpeg25,
            0b10 => MpegVersion::Mpeg2,
            0b11 => MpegVersion::Mpeg1,
            _ => return None,
        };
        // Layer III only.
        if (header >> 17) & 0b11 != 0b01 {
            return None;
        }

        let bitrate_index = ((header >> 12) & 0xf) as usize;
        // 0 is free format, 15 is invalid.
        if bitrate_index == 0 || bitrate_index == 15 {
            return None;
        }
        let bitrate_kbps = version.bitrates()[bitrate_index];

        let base_rate = match (header >> 10) & 0b11 {
            0 => 44_100,
            1 => 48_000,
            2 => 32_000,
            _ => return None,
        };
        let sample_rate = match version {
            MpegVersion::Mpeg1 => base_rate,
            MpegVersion::Mpeg2 => base_rate / 2,
            MpegVersion::Mpeg25 => base_rate / 4,
        };

        let padding = ((header >> 9) & 1) as usize;
        let channel_count = if (header >> 6) & 0b11 == 0b11 { 1 } else { 2 };
        let frame_length = (version.length_coefficient() * bitrate_kbps * 1000 / sample_rate)
            as usize
            + padding;

        Some(Self {
            version,
            bitrate_kbps,
            sample_rate,
            channel_count,
            has_crc: (header >> 16) & 1 == 0,
            frame_length,
        })
    }

    fn samples_per_frame(&self) -> usize {
        self.version.samples_per_frame()
    }

    /// Offset of a Xing/Info tag inside the frame, past the side information.
    fn xing_offset(&self) -> usize {
        let side_info = match (self.version, self.channel_count) {
            (MpegVersion::Mpeg1, 1) => 17,
            (MpegVersion::Mpeg1, _) => 32,
            (_, 1) => 9,
            _ => 17,
        };
        HEADER_LEN + if self.has_crc { 2 } else { 0 } + side_info
    }
}

/// The frame count from a Xing/Info/VBRI tag, if `frame` carries one.
///
/// The outer `Option` says whether the frame is a tag frame at all.
fn vbr_tag_frames(frame: &[u8], header: &FrameHeader) -> Option<Option<u32>> {
    let read_u32 = |at: usize| {
        frame
            .get(at..at + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    };

    let xing = header.xing_offset();
    match frame.get(xing..xing + 4) {
        Some(b"Xing") | Some(b"Info") => {
            let flags = read_u32(xing + 4)?;
            let frames = if flags & 1 != 0 {
                read_u32(xing + 8)
            } else {
                None
            };
            return Some(frames);
        }
        _ => {}
    }

    const VBRI_OFFSET: usize = HEADER_LEN + 32;
    if frame.get(VBRI_OFFSET..VBRI_OFFSET + 4) == Some(b"VBRI") {
        return Some(read_u32(VBRI_OFFSET + 14));
    }
    None
}

/// Length of a leading ID3v2 tag (0 when absent).
pub(crate) fn id3v2_len(head: &[u8]) -> u64 {
    if head.len() < 10 || &head[..3] != b"ID3" {
        return 0;
    }
    let size = head[6..10]
        .iter()
        .fold(0u64, |acc, b| (acc << 7) | (*b & 0x7f) as u64);
    let footer = if head[5] & 0x10 != 0 { 10 } else { 0 };
    10 + size + footer
}

/// Start of the `data` chunk payload when MP3 frames are wrapped in RIFF/WAVE.
fn riff_data_offset(head: &[u8]) -> Option<u64> {
    if head.len() < 12 || &head[..4] != b"RIFF" || &head[8..12] != b"WAVE" {
        return None;
    }
    let mut at = 12;
    while at + 8 <= head.len() {
        let id = &head[at..at + 4];
        let size = u32::from_le_bytes([head[at + 4], head[at + 5], head[at + 6], head[at + 7]]);
        if id == b"data" {
            return Some((at + 8) as u64);
        }
        // Chunks are word aligned.
        at += 8 + size as usize + (size as usize & 1);
    }
    None
}

/// Find the first frame header whose successor (when visible) is also a valid header.
fn find_first_frame(head: &[u8], from: usize) -> Option<(usize, FrameHeader)> {
    (from..head.len().saturating_sub(HEADER_LEN - 1)).find_map(|at| {
        let header = FrameHeader::parse(&head[at..])?;
        let next = at + header.frame_length;
        if next + HEADER_LEN <= head.len() {
            let following = FrameHeader::parse(&head[next..])?;
            if following.sample_rate != header.sample_rate {
                return None;
            }
        }
        Some((at, header))
    })
}

/// Locate the first audio frame in `head` and derive the track's metadata.
///
/// `tail` is the last bytes of the file, used to exclude a trailing ID3v1 tag.
pub fn probe_metadata(head: &[u8], tail: Option<&[u8]>, file_len: u64) -> Result<TrackMetadata> {
    let skip = riff_data_offset(head).unwrap_or_else(|| id3v2_len(head));
    let skip = usize::try_from(skip).unwrap_or(usize::MAX);
    if skip >= head.len() {
        return Err(Error::decode(format!(
            "mp3 tag of {skip} bytes does not fit in the {} probed bytes",
            head.len()
        )));
    }

    let (first, header) = find_first_frame(head, skip)
        .ok_or_else(|| Error::decode("no mpeg layer iii frame found"))?;
    let data_start = first as u64;

    let mut data_end = file_len;
    if let Some(tail) = tail {
        if tail.len() >= ID3V1_LEN && tail[tail.len() - ID3V1_LEN..].starts_with(b"TAG") {
            data_end = data_end.saturating_sub(ID3V1_LEN as u64);
        }
    }

    let samples_per_frame = header.samples_per_frame() as f64;
    let max_bitrate = *header.version.bitrates().iter().max().unwrap_or(&320);
    let max_frame_bytes =
        (header.version.length_coefficient() * max_bitrate * 1000 / header.sample_rate) + 1;

    let frame_end = (first + header.frame_length).min(head.len());
    let duration = match vbr_tag_frames(&head[first..frame_end], &header) {
        Some(Some(frames)) => frames as f64 * samples_per_frame / header.sample_rate as f64,
        _ => {
            data_end.saturating_sub(data_start) as f64 * 8.0
                / (header.bitrate_kbps as f64 * 1000.0)
        }
    };

    debug!(
        data_start,
        data_end,
        sample_rate = header.sample_rate,
        channels = header.channel_count,
        duration,
        "probed mp3"
    );

    Ok(TrackMetadata {
        codec: CodecName::Mp3,
        sample_rate: header.sample_rate,
        channel_count: header.channel_count,
        data_start,
        data_end,
        max_byte_size_per_audio_frame: max_frame_bytes as f64 / samples_per_frame,
        duration,
        pcm_encoding: None,
    })
}

/// Incremental MP3 decoder: frame sync here, synthesis in Symphonia.
pub struct Mp3Decoder {
    sample_rate: u32,
    channel_count: u16,
    inner: Box<dyn SymphoniaDecoder>,
    sample_buf: Option<SampleBuffer<i16>>,
    assembler: BlockAssembler,
    frames_seen: u64,
    packet_ts: u64,
    remix: Vec<i16>,
    // Set after a seek: the next frame must be confirmed by the header that follows it.
    resync: bool,
}

impl Mp3Decoder {
    pub fn new(metadata: &TrackMetadata) -> Result<Self> {
        let channels = match metadata.channel_count {
            1 => Channels::FRONT_LEFT,
            2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
            n => {
                return Err(Error::decode(format!(
                    "mp3 cannot carry {n} channels"
                )));
            }
        };

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_MP3)
            .with_sample_rate(metadata.sample_rate)
            .with_channels(channels);

        let inner = symphonia::default::get_codecs().make(&params, &DecoderOptions::default())?;

        Ok(Self {
            sample_rate: metadata.sample_rate,
            channel_count: metadata.channel_count,
            inner,
            sample_buf: None,
            assembler: BlockAssembler::new(metadata.channel_count as usize),
            frames_seen: 0,
            packet_ts: 0,
            remix: Vec::new(),
            resync: false,
        })
    }

    /// Decode one complete frame into the assembler.
    ///
    /// Error policy follows Symphonia's model: a corrupt frame (or a reservoir underrun at
    /// a seek point) is skipped, anything else is fatal.
    fn decode_frame(&mut self, frame: &[u8], header: &FrameHeader) -> Result<()> {
        let first = self.frames_seen == 0;
        self.frames_seen += 1;
        if first && vbr_tag_frames(frame, header).is_some() {
            trace!("skipping vbr tag frame");
            return Ok(());
        }

        let duration = header.samples_per_frame() as u64;
        let packet = Packet::new_from_slice(0, self.packet_ts, duration, frame);
        self.packet_ts += duration;

        let decoded = match self.inner.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(err)) => {
                trace!(err, "skipping corrupt mp3 frame");
                return Ok(());
            }
            Err(SymphoniaError::IoError(err)) => {
                trace!(%err, "skipping truncated mp3 frame");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let spec = *decoded.spec();
        let capacity = decoded.capacity() as u64;
        let needs_new_buffer = self
            .sample_buf
            .as_ref()
            .is_none_or(|buf| buf.capacity() < decoded.capacity() * spec.channels.count());
        if needs_new_buffer {
            self.sample_buf = Some(SampleBuffer::<i16>::new(capacity, spec));
        }
        let Some(buf) = self.sample_buf.as_mut() else {
            return Ok(());
        };
        buf.copy_interleaved_ref(decoded);

        let decoded_channels = spec.channels.count();
        if decoded_channels == self.channel_count as usize {
            self.assembler.push(buf.samples());
            return Ok(());
        }

        // Joint-stereo streams can switch to mono frames (and back); match the probed layout.
        self.remix.clear();
        match (decoded_channels, self.channel_count) {
            (1, 2) => self
                .remix
                .extend(buf.samples().iter().flat_map(|s| [*s, *s])),
            (2, 1) => self.remix.extend(
                buf.samples()
                    .chunks_exact(2)
                    .map(|lr| ((lr[0] as i32 + lr[1] as i32) / 2) as i16),
            ),
            (from, to) => {
                return Err(Error::decode(format!(
                    "mp3 frame has {from} channels, stream has {to}"
                )));
            }
        }
        self.assembler.push(&self.remix);
        Ok(())
    }
}

impl Decoder for Mp3Decoder {
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
        if self.assembler.is_full() {
            self.assembler.flush(arena, on_flush, false)?;
            return Ok(0);
        }

        let mut at = 0;
        while !self.assembler.is_full() && at + HEADER_LEN <= input.len() {
            let header = match FrameHeader::parse(&input[at..]) {
                Some(header) if header.sample_rate == self.sample_rate => header,
                _ => {
                    // Not a frame boundary: junk between frames or an embedded tag.
                    at += 1;
                    continue;
                }
            };

            let end = at + header.frame_length;
            if end > input.len() {
                break;
            }
            if self.resync {
                if end + HEADER_LEN > input.len() {
                    break;
                }
                match FrameHeader::parse(&input[end..]) {
                    Some(next) if next.sample_rate == self.sample_rate => self.resync = false,
                    _ => {
                        at += 1;
                        continue;
                    }
                }
            }
            self.decode_frame(&input[at..end], &header)?;
            at = end;
        }

        self.assembler.flush(arena, on_flush, false)?;
        Ok(at)
    }

    fn end(&mut self, arena: &mut SampleArena, on_flush: &mut FlushCallback<'_>) -> Result<()> {
        self.assembler.flush(arena, on_flush, true)?;
        Ok(())
    }

    fn apply_seek(&mut self, seek: &SeekPoint) -> Result<()> {
        self.inner.reset();
        self.assembler
            .restart_at(seek.audio_frame, seek.frames_to_skip);
        // Only the stream's first frame can be a VBR tag.
        self.frames_seen = seek.codec_frame;
        self.packet_ts = seek.codec_frame * samples_per_frame_at(self.sample_rate) as u64;
        self.resync = seek.codec_frame > 0;
        debug!(
            offset = seek.offset,
            codec_frame = seek.codec_frame,
            frames_to_skip = seek.frames_to_skip,
            "mp3 decoder seeked"
        );
        Ok(())
    }

    fn destroy(&mut self, arena: &mut SampleArena) -> Result<()> {
        self.sample_buf = None;
        self.assembler.release(arena)
    }
}
