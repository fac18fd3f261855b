//! Acoustic fingerprinting tap.
//!
//! The pipeline offers every output block to its fingerprinter for as long as it asks for more.
//! `ChromaprintFingerprinter` feeds `rusty-chromaprint`, which resamples to 11025 Hz mono
//! internally, and stops asking after two minutes of audio.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rusty_chromaprint::{Configuration, Fingerprinter as Chromaprint};

use crate::error::{Error, Result};

/// Rate chromaprint analyses at.
pub const FINGERPRINT_SAMPLE_RATE: u32 = 11_025;

/// Audio considered for one fingerprint, in seconds.
pub const FINGERPRINT_DURATION: u32 = 120;

/// Minimum audio before a fingerprint can be calculated, in seconds.
pub const MIN_FINGERPRINT_DURATION: u32 = 7;

pub trait Fingerprinter {
    /// Whether more frames would change the result.
    fn needs_frames(&self) -> bool;

    /// Feed interleaved frames in the pipeline's destination format.
    fn new_frames(&mut self, samples: &[i16]) -> Result<()>;

    /// Finish the analysis. Further frames are refused afterwards.
    fn calculate_fingerprint(&mut self) -> Result<Fingerprint>;
}

/// A calculated fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub raw: Vec<u32>,
    /// Seconds of audio the fingerprint covers.
    pub duration: u32,
}

impl Fingerprint {
    /// URL-safe base64 of the little-endian raw fingerprint.
    pub fn to_base64(&self) -> String {
        let bytes: Vec<u8> = self.raw.iter().flat_map(|v| v.to_le_bytes()).collect();
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

pub struct ChromaprintFingerprinter {
    inner: Chromaprint,
    sample_rate: u32,
    channel_count: u16,
    frames_processed: u64,
    finished: bool,
}

impl ChromaprintFingerprinter {
    pub fn new(sample_rate: u32, channel_count: u16) -> Result<Self> {
        let config = Configuration::preset_test2();
        let mut inner = Chromaprint::new(&config);
        inner
            .start(sample_rate, channel_count as u32)
            .map_err(|err| {
                Error::unsupported(format!(
                    "fingerprinting {channel_count} channels at {sample_rate} Hz: {err}"
                ))
            })?;

        Ok(Self {
            inner,
            sample_rate,
            channel_count,
            frames_processed: 0,
            finished: false,
        })
    }

    fn frames_needed_total(&self) -> u64 {
        self.sample_rate as u64 * FINGERPRINT_DURATION as u64
    }

    pub fn can_calculate(&self) -> bool {
        self.frames_processed > self.sample_rate as u64 * MIN_FINGERPRINT_DURATION as u64
    }
}

impl Fingerprinter for ChromaprintFingerprinter {
    fn needs_frames(&self) -> bool {
        !self.finished && self.frames_processed < self.frames_needed_total()
    }

    fn new_frames(&mut self, samples: &[i16]) -> Result<()> {
        if self.finished {
            return Err(Error::programmer("fingerprint already calculated"));
        }
        let channels = self.channel_count.max(1) as usize;
        let remaining = self
            .frames_needed_total()
            .saturating_sub(self.frames_processed) as usize;
        let frames = (samples.len() / channels).min(remaining);
        if frames == 0 {
            return Ok(());
        }

        self.inner.consume(&samples[..frames * channels]);
        self.frames_processed += frames as u64;
        Ok(())
    }

    fn calculate_fingerprint(&mut self) -> Result<Fingerprint> {
        if self.finished {
            return Err(Error::programmer("fingerprint already calculated"));
        }
        if !self.can_calculate() {
            return Err(Error::msg(format!(
                "not enough samples to calculate fingerprint ({} frames at {} Hz)",
                self.frames_processed, self.sample_rate
            )));
        }

        self.finished = true;
        self.inner.finish();
        let raw = self.inner.fingerprint().to_vec();
        if raw.is_empty() {
            return Err(Error::msg("chromaprint produced an empty fingerprint"));
        }
        Ok(Fingerprint {
            raw,
            duration: (self.frames_processed / self.sample_rate as u64) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(seconds: u32, rate: u32) -> Vec<i16> {
        (0..seconds * rate)
            .map(|i| {
                let t = i as f64 / rate as f64;
                let f = 220.0 + 110.0 * (t * 0.5).floor();
                ((2.0 * std::f64::consts::PI * f * t).sin() * 12_000.0) as i16
            })
            .collect()
    }

    #[test]
    fn refuses_to_calculate_from_too_little_audio() -> Result<()> {
        let mut fingerprinter = ChromaprintFingerprinter::new(FINGERPRINT_SAMPLE_RATE, 1)?;
        fingerprinter.new_frames(&tone(2, FINGERPRINT_SAMPLE_RATE))?;
        assert!(!fingerprinter.can_calculate());
        assert!(fingerprinter.calculate_fingerprint().is_err());
        Ok(())
    }

    #[test]
    fn stops_asking_after_the_fingerprint_window() -> Result<()> {
        let rate = FINGERPRINT_SAMPLE_RATE;
        let mut fingerprinter = ChromaprintFingerprinter::new(rate, 1)?;
        let second = vec![0i16; rate as usize];
        for _ in 0..FINGERPRINT_DURATION - 1 {
            fingerprinter.new_frames(&second)?;
        }
        assert!(fingerprinter.needs_frames());

        fingerprinter.new_frames(&second)?;
        assert!(!fingerprinter.needs_frames());
        fingerprinter.new_frames(&second)?;
        assert_eq!(
            fingerprinter.frames_processed,
            rate as u64 * FINGERPRINT_DURATION as u64
        );
        Ok(())
    }

    #[test]
    fn fingerprints_a_tone_sequence() -> Result<()> {
        let mut fingerprinter = ChromaprintFingerprinter::new(FINGERPRINT_SAMPLE_RATE, 1)?;
        fingerprinter.new_frames(&tone(10, FINGERPRINT_SAMPLE_RATE))?;

        let fingerprint = fingerprinter.calculate_fingerprint()?;
        assert!(!fingerprinter.needs_frames());
        assert!(fingerprinter.calculate_fingerprint().is_err());
        assert_eq!(fingerprint.duration, 10);
        assert!(!fingerprint.raw.is_empty());
        assert_eq!(
            fingerprint.to_base64().len(),
            (fingerprint.raw.len() * 4 * 4).div_ceil(3)
        );
        Ok(())
    }
}
