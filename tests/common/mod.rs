#![allow(dead_code)]

use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use trackpipe::source::Track;
use trackpipe::{AudioProcessingPipeline, DecodeStep, FilledBufferDescriptor, OutputSpec};

/// Write a 16-bit PCM WAV fixture into `dir`.
pub fn write_wav(
    dir: &TempDir,
    name: &str,
    channels: u16,
    sample_rate: u32,
    samples: &[i16],
) -> anyhow::Result<PathBuf> {
    let path = dir.path().join(name);
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&path, spec)?;
    for sample in samples {
        writer.write_sample(*sample)?;
    }
    writer.finalize()?;
    Ok(path)
}

/// Interleaved sine, the same on every channel.
pub fn sine(channels: u16, sample_rate: u32, seconds: f64, amplitude: f64) -> Vec<i16> {
    let frames = (seconds * sample_rate as f64) as usize;
    (0..frames)
        .flat_map(|i| {
            let t = i as f64 / sample_rate as f64;
            let value = (2.0 * std::f64::consts::PI * 997.0 * t).sin() * amplitude * 32767.0;
            std::iter::repeat_n(value as i16, channels as usize)
        })
        .collect()
}

pub async fn open(path: &Path) -> anyhow::Result<Track> {
    Track::open(path, &CancellationToken::new())
        .await?
        .ok_or_else(|| anyhow::anyhow!("open cancelled"))
}

/// Decode a whole track, collecting every buffer.
pub async fn decode_all(
    pipeline: &mut AudioProcessingPipeline,
    track: &mut Track,
    output: OutputSpec,
) -> anyhow::Result<Vec<FilledBufferDescriptor>> {
    let token = CancellationToken::new();
    let mut position = track.metadata.data_start;
    let mut buffers = Vec::new();
    loop {
        let step = pipeline
            .decode_from_file_view_at_offset(
                &mut track.file_view,
                position,
                &track.metadata,
                &token,
                output.clone(),
                1.0,
            )
            .await?;
        let DecodeStep::Advanced(consumed) = step else {
            anyhow::bail!("unexpected cancellation");
        };
        position += consumed;
        if !pipeline.has_filled_buffer() {
            return Ok(buffers);
        }
        buffers.push(pipeline.consume_filled_buffer()?);
    }
}
