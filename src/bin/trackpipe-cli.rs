use anyhow::{Context, Result, bail};
use clap::Parser;
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use trackpipe::crossfader::Crossfader;
use trackpipe::effects::{EffectSpec, Effects};
use trackpipe::fingerprinter::ChromaprintFingerprinter;
use trackpipe::logging;
use trackpipe::loudness::{LoudnessAnalyzer, LoudnessOpts};
use trackpipe::{AudioProcessingPipeline, DecodeStep, OutputSpec, open_track};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let params = Params::parse();
    logging::init_with_default(match params.verbose {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    });

    let summary = run(&params).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "trackpipe")]
#[command(about = "Decode, process and analyze an audio track")]
struct Params {
    /// Track to decode (mp3 or wav).
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Write the processed audio as a 32-bit float WAV file.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    #[arg(short = 'r', long = "sample-rate", default_value_t = 48_000)]
    pub sample_rate: u32,

    #[arg(short = 'c', long = "channels", default_value_t = 2)]
    pub channels: u16,

    /// Seconds of audio per processed buffer.
    #[arg(short = 'b', long = "buffer-time", default_value_t = 0.2)]
    pub buffer_time: f64,

    /// Start decoding this many seconds into the track.
    #[arg(short = 's', long = "start")]
    pub start: Option<f64>,

    /// JSON file with a list of effects, e.g. `[{"name": "bass-boost", "effectSize": 0.5}]`.
    #[arg(short = 'e', long = "effects")]
    pub effects: Option<PathBuf>,

    #[arg(long = "normalize", default_value_t = false)]
    pub normalize: bool,

    /// Leave buffers classified as silent out of the output file.
    #[arg(long = "trim-silence", default_value_t = false)]
    pub trim_silence: bool,

    /// Crossfade duration in seconds (fade-out at the end of the track).
    #[arg(long = "crossfade", default_value_t = 0.0)]
    pub crossfade: f64,

    #[arg(long = "fade-in", default_value_t = false)]
    pub fade_in: bool,

    /// Resume loudness measurement from a state file written by `--loudness-state-out`.
    #[arg(long = "loudness-state-in")]
    pub loudness_state_in: Option<PathBuf>,

    #[arg(long = "loudness-state-out")]
    pub loudness_state_out: Option<PathBuf>,

    #[arg(long = "fingerprint", default_value_t = false)]
    pub fingerprint: bool,

    /// Raise the default log level (repeatable). `TRACKPIPE_LOG` takes precedence.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    codec: String,
    source_sample_rate: u32,
    source_channels: u16,
    duration: f64,
    buffers: usize,
    silent_buffers: usize,
    frames_written: u64,
    start_time: f64,
    end_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
}

async fn run(params: &Params) -> Result<Summary> {
    let token = CancellationToken::new();
    let Some(mut track) = open_track(&params.input, &token).await? else {
        bail!("opening {} was cancelled", params.input.display());
    };
    let metadata = track.metadata.clone();

    let mut opts = track.pipeline_opts(params.sample_rate, params.channels, params.buffer_time)?;
    if let Some(path) = &params.effects {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read effects from {}", path.display()))?;
        let specs: Vec<EffectSpec> =
            serde_json::from_str(&json).context("failed to parse effects")?;
        opts.effects = Effects::from_specs(&specs);
    }

    let saved_state = params
        .loudness_state_in
        .as_ref()
        .map(|path| {
            std::fs::read(path)
                .with_context(|| format!("failed to read loudness state {}", path.display()))
        })
        .transpose()?;

    if params.loudness_state_out.is_some() || saved_state.is_some() {
        let mut analyzer = LoudnessAnalyzer::default();
        if let Some(state) = &saved_state {
            analyzer.initialize_from_serialized_state(state)?;
        }
        opts.loudness_analyzer = Some(analyzer);
    }

    if params.normalize || params.trim_silence {
        let mut normalizer = LoudnessAnalyzer::new(LoudnessOpts {
            normalization_enabled: params.normalize,
            silence_trimming_enabled: params.trim_silence,
            ..LoudnessOpts::default()
        });
        if let Some(state) = &saved_state {
            normalizer.initialize_from_serialized_state(state)?;
        }
        opts.loudness_normalizer = Some(normalizer);
    }

    if params.crossfade > 0.0 {
        let mut crossfader = Crossfader::new(params.crossfade);
        crossfader.set_fade_in_enabled(params.fade_in);
        opts.crossfader = Some(crossfader);
    }

    if params.fingerprint {
        opts.fingerprinter = Some(Box::new(ChromaprintFingerprinter::new(
            params.sample_rate,
            params.channels,
        )?));
    }

    let mut writer = match &params.output {
        Some(path) => {
            let spec = WavSpec {
                channels: params.channels,
                sample_rate: params.sample_rate,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            };
            let file = BufWriter::new(File::create(path)?);
            Some(WavWriter::new(file, spec).context("failed to create output wav")?)
        }
        None => None,
    };
    let output_spec = if writer.is_some() {
        OutputSpec::Allocate
    } else {
        OutputSpec::Discard
    };

    let mut pipeline = AudioProcessingPipeline::new(opts)?;
    let mut summary = Summary {
        codec: metadata.codec.to_string(),
        source_sample_rate: metadata.sample_rate,
        source_channels: metadata.channel_count,
        duration: metadata.duration,
        ..Summary::default()
    };

    let mut position = metadata.data_start;
    if let Some(start) = params.start {
        let point = pipeline.seek(&metadata, start)?;
        summary.start_time = point.time;
        position = point.offset;
    }
    loop {
        let step = pipeline
            .decode_from_file_view_at_offset(
                &mut track.file_view,
                position,
                &metadata,
                &token,
                output_spec.clone(),
                1.0,
            )
            .await?;
        let DecodeStep::Advanced(consumed) = step else {
            bail!("decoding was cancelled at file offset {position}");
        };
        position += consumed;

        if !pipeline.has_filled_buffer() {
            break;
        }
        let buffer = pipeline.consume_filled_buffer()?;
        summary.buffers += 1;
        summary.end_time = buffer.end_time;
        if buffer.loudness_info.is_entirely_silent {
            summary.silent_buffers += 1;
            if params.trim_silence {
                continue;
            }
        }

        if let (Some(writer), Some(channels)) = (writer.as_mut(), buffer.channel_data.as_ref()) {
            for i in 0..buffer.length {
                for channel in channels {
                    writer.write_sample(channel[i])?;
                }
            }
            summary.frames_written += buffer.length as u64;
        }
    }

    if let Some(writer) = writer {
        writer.finalize().context("failed to finalize output wav")?;
    }

    if let Some(path) = &params.loudness_state_out {
        if let Some(state) = pipeline.serialize_loudness_state()? {
            std::fs::write(path, state)
                .with_context(|| format!("failed to write loudness state {}", path.display()))?;
        }
    }

    if params.fingerprint {
        summary.fingerprint = pipeline
            .calculate_fingerprint()?
            .map(|fingerprint| fingerprint.to_base64());
    }

    pipeline.destroy()?;
    Ok(summary)
}
