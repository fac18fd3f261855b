//! EBU R128 loudness: measurement, normalization, silence detection and persistence.

pub mod analyzer;
pub mod meter;
pub mod state;

pub use analyzer::{LoudnessAnalyzer, LoudnessInfo, LoudnessOpts};
pub use meter::LoudnessMeter;
pub use state::{SERIALIZED_STATE_SIZE, SerializedState};
