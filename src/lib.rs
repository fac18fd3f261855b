//! `trackpipe`: incremental audio decoding and processing for playback.
//!
//! This crate provides:
//! - Codec sniffing, metadata probing and incremental WAV/MP3 decoders
//! - Channel mixing, resampling, an effect chain and crossfades
//! - EBU R128 loudness measurement, normalization and silence detection
//! - A per-track pipeline that turns file bytes into fixed-length `f32` buffers
//!
//! The pipeline never holds more than one buffer of output and suspends only on file reads,
//! which makes it suitable for feeding an audio callback from a background task.

// High-level API (most consumers should start here).
pub mod pipeline;
pub mod source;

// Shared memory and I/O.
pub mod arena;
pub mod file_view;

// Decoding.
pub mod codecs;
pub mod decoder;
pub mod metadata;
pub mod seeker;
pub mod sniffer;

// Processing stages.
pub mod channel_mixer;
pub mod crossfader;
pub mod effects;
pub mod fingerprinter;
pub mod loudness;
pub mod resampler;

pub mod error;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

pub use error::{Error, Result};
pub use pipeline::{
    AudioProcessingPipeline, ChannelData, DecodeStep, FilledBufferDescriptor, OutputSpec,
    PipelineOpts,
};
pub use seeker::SeekPoint;
pub use source::{Track, open_track};
