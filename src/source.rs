//! Opening a track: sniff the codec, probe its metadata, build a decoder.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncSeek};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codecs::{self, mp3};
use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::file_view::{FileView, ReadStatus};
use crate::metadata::TrackMetadata;
use crate::pipeline::PipelineOpts;
use crate::sniffer::{self, CodecName, SNIFF_LENGTH};

/// Trailing bytes inspected for tags that are not audio.
const TAIL_LENGTH: u64 = 128;

/// A probed track, ready to be decoded from `file_view`.
pub struct Track<R = tokio::fs::File> {
    pub path: Option<PathBuf>,
    pub metadata: TrackMetadata,
    pub file_view: FileView<R>,
}

/// Open and probe a file on disk. `Ok(None)` means the token fired first.
pub async fn open_track(
    path: impl AsRef<Path>,
    cancellation_token: &CancellationToken,
) -> Result<Option<Track>> {
    Track::open(path, cancellation_token).await
}

impl Track {
    pub async fn open(
        path: impl AsRef<Path>,
        cancellation_token: &CancellationToken,
    ) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file_view = FileView::open(path).await?;
        Track::probe(file_view, Some(path), cancellation_token).await
    }
}

impl<R> Track<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    /// Probe an already-open source. `path` is only used as a naming hint when sniffing is
    /// inconclusive.
    pub async fn probe(
        mut file_view: FileView<R>,
        path: Option<&Path>,
        cancellation_token: &CancellationToken,
    ) -> Result<Option<Self>> {
        let Some(mut head) =
            read_copy(&mut file_view, 0, SNIFF_LENGTH as u64, cancellation_token).await?
        else {
            return Ok(None);
        };

        let codec = sniffer::ensure_supported(sniffer::codec_name(&head, path))?;

        // A large ID3v2 tag (cover art) can push the first frame past the sniff window.
        if codec == CodecName::Mp3 {
            let tag_len = mp3::id3v2_len(&head);
            if tag_len + 4 >= head.len() as u64 && (head.len() as u64) < file_view.len() {
                let size = tag_len + SNIFF_LENGTH as u64;
                match read_copy(&mut file_view, 0, size, cancellation_token).await? {
                    Some(bytes) => head = bytes,
                    None => return Ok(None),
                }
            }
        }

        let file_len = file_view.len();
        let tail_start = file_len.saturating_sub(TAIL_LENGTH);
        let Some(tail) =
            read_copy(&mut file_view, tail_start, TAIL_LENGTH, cancellation_token).await?
        else {
            return Ok(None);
        };

        let metadata = codecs::probe_metadata(codec, &head, Some(&tail), file_len)?;
        if metadata.data_start >= metadata.data_end {
            return Err(Error::decode(format!(
                "{codec} track has no audio data ({} bytes)",
                file_len
            )));
        }
        debug!(
            codec = %codec,
            sample_rate = metadata.sample_rate,
            channels = metadata.channel_count,
            duration = metadata.duration,
            "opened track"
        );

        Ok(Some(Self {
            path: path.map(Path::to_path_buf),
            metadata,
            file_view,
        }))
    }

    pub fn decoder(&self) -> Result<Box<dyn Decoder>> {
        codecs::make_decoder(&self.metadata)
    }

    /// Pipeline options converting this track to the destination format, with nothing but the
    /// required mixer and resampler configured.
    pub fn pipeline_opts(
        &self,
        destination_sample_rate: u32,
        destination_channel_count: u16,
        buffer_time: f64,
    ) -> Result<PipelineOpts> {
        PipelineOpts::for_decoder(
            self.decoder()?,
            destination_sample_rate,
            destination_channel_count,
            self.metadata.duration,
            buffer_time,
        )
    }
}

async fn read_copy<R>(
    file_view: &mut FileView<R>,
    position: u64,
    size: u64,
    cancellation_token: &CancellationToken,
) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    match file_view
        .read_block_of_size_at(size, position, cancellation_token, 1.0)
        .await?
    {
        ReadStatus::Cancelled => Ok(None),
        ReadStatus::Ready => {
            let block = file_view.block_at_position(position)?;
            Ok(Some(block[..block.len().min(size as usize)].to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use hound::{SampleFormat, WavSpec, WavWriter};

    use super::*;

    fn wav_bytes(frames: usize) -> Vec<u8> {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames * 2 {
                writer.write_sample(i as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn probes_a_wav_source() -> Result<()> {
        let bytes = wav_bytes(22_050);
        let len = bytes.len() as u64;
        let view = FileView::new(Cursor::new(bytes), len);

        let track = Track::probe(view, None, &CancellationToken::new())
            .await?
            .unwrap();
        assert_eq!(track.metadata.codec, CodecName::Wav);
        assert_eq!(track.metadata.data_end, len);
        assert!((track.metadata.duration - 1.0).abs() < 1e-9);

        let decoder = track.decoder()?;
        assert_eq!(decoder.sample_rate(), 22_050);
        assert_eq!(decoder.channel_count(), 2);

        let opts = track.pipeline_opts(48_000, 1, 0.1)?;
        assert!(opts.channel_mixer.is_some());
        assert!(opts.resampler.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_codecs_fail_fast() {
        let mut bytes = b"OggS".to_vec();
        bytes.resize(256, 0);
        let view = FileView::new(Cursor::new(bytes), 256);

        let err = Track::probe(view, None, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::CodecNotSupported(ref c) if c == "ogg"));
    }

    #[tokio::test]
    async fn unrecognized_contents_fall_back_to_the_file_name() {
        let bytes = vec![0u8; 64];
        let view = FileView::new(Cursor::new(bytes), 64);

        let err = Track::probe(view, Some(Path::new("clip.webm")), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::CodecNotSupported(ref c) if c == "webm"));
    }

    #[tokio::test]
    async fn cancelled_probe_returns_none() -> Result<()> {
        let bytes = wav_bytes(100);
        let len = bytes.len() as u64;
        let token = CancellationToken::new();
        token.cancel();

        let track = Track::probe(FileView::new(Cursor::new(bytes), len), None, &token).await?;
        assert!(track.is_none());
        Ok(())
    }
}
