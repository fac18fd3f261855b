//! The persisted loudness snapshot.
//!
//! Layout (little-endian, 40 bytes):
//!
//! | bytes  | field                    |
//! |--------|--------------------------|
//! | 0..4   | `max_history_ms` (u32)   |
//! | 4..8   | `sample_rate` (u32)      |
//! | 8..12  | `channel_count` (u32)    |
//! | 12..16 | `frames_added` (u32)     |
//! | 16..24 | reserved, zero           |
//! | 24..32 | `sample_peak` (f64)      |
//! | 32..40 | `integrated_loudness` (f64) |

use crate::error::{Error, Result};

pub const SERIALIZED_STATE_SIZE: usize = 40;

const MAX_HISTORY_MS: usize = 0;
const SAMPLE_RATE: usize = 4;
const CHANNEL_COUNT: usize = 8;
const FRAMES_ADDED: usize = 12;
const SAMPLE_PEAK: usize = 24;
const INTEGRATED_LOUDNESS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SerializedState {
    pub max_history_ms: u32,
    pub sample_rate: u32,
    pub channel_count: u32,
    pub frames_added: u32,
    /// Linear sample peak (1.0 == full scale).
    pub sample_peak: f64,
    /// Integrated loudness in LUFS; `-inf` when nothing passed the gate.
    pub integrated_loudness: f64,
}

impl SerializedState {
    pub fn to_bytes(&self) -> [u8; SERIALIZED_STATE_SIZE] {
        let mut bytes = [0u8; SERIALIZED_STATE_SIZE];
        put(&mut bytes, MAX_HISTORY_MS, &self.max_history_ms.to_le_bytes());
        put(&mut bytes, SAMPLE_RATE, &self.sample_rate.to_le_bytes());
        put(&mut bytes, CHANNEL_COUNT, &self.channel_count.to_le_bytes());
        put(&mut bytes, FRAMES_ADDED, &self.frames_added.to_le_bytes());
        put(&mut bytes, SAMPLE_PEAK, &self.sample_peak.to_le_bytes());
        put(
            &mut bytes,
            INTEGRATED_LOUDNESS,
            &self.integrated_loudness.to_le_bytes(),
        );
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SERIALIZED_STATE_SIZE {
            return Err(Error::analyzer(format!(
                "serialized loudness state is {} bytes, expected {SERIALIZED_STATE_SIZE}",
                bytes.len()
            )));
        }

        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let f64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            f64::from_le_bytes(raw)
        };

        let state = Self {
            max_history_ms: u32_at(MAX_HISTORY_MS),
            sample_rate: u32_at(SAMPLE_RATE),
            channel_count: u32_at(CHANNEL_COUNT),
            frames_added: u32_at(FRAMES_ADDED),
            sample_peak: f64_at(SAMPLE_PEAK),
            integrated_loudness: f64_at(INTEGRATED_LOUDNESS),
        };
        if state.sample_rate == 0 || state.channel_count == 0 {
            return Err(Error::analyzer(format!(
                "serialized loudness state has {} Hz and {} channels",
                state.sample_rate, state.channel_count
            )));
        }
        Ok(state)
    }
}

fn put(bytes: &mut [u8], at: usize, value: &[u8]) {
    bytes[at..at + value.len()].copy_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_land_at_fixed_offsets() {
        let state = SerializedState {
            max_history_ms: 30_000,
            sample_rate: 48_000,
            channel_count: 2,
            frames_added: 123_456,
            sample_peak: 0.5,
            integrated_loudness: -23.0,
        };
        let bytes = state.to_bytes();

        assert_eq!(&bytes[0..4], &30_000u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &48_000u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &123_456u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &[0u8; 8]);
        assert_eq!(&bytes[24..32], &0.5f64.to_le_bytes());
        assert_eq!(&bytes[32..40], &(-23.0f64).to_le_bytes());
        assert_eq!(SerializedState::from_bytes(&bytes).unwrap(), state);
    }

    #[test]
    fn short_or_empty_states_are_rejected() {
        assert!(SerializedState::from_bytes(&[0u8; 16]).is_err());
        assert!(SerializedState::from_bytes(&[0u8; SERIALIZED_STATE_SIZE]).is_err());
    }
}
