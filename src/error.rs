use std::error::Error as StdError;

use thiserror::Error;

/// trackpipe's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// trackpipe's crate-wide error type.
///
/// The variants mirror how callers are expected to react:
/// - `Decode` / `Analyzer` are fatal for the current decode step and are never retried internally.
/// - `CodecNotSupported` is raised before a pipeline is ever built.
/// - `Programmer` means the caller broke a usage contract (e.g. decoding while a buffer is
///   still pending) and should fail loudly.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("loudness analyzer error: {0}")]
    Analyzer(String),

    #[error("codec not supported: {0}")]
    CodecNotSupported(String),

    #[error("programmer error: {0}")]
    Programmer(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub(crate) fn analyzer(message: impl Into<String>) -> Self {
        Self::Analyzer(message.into())
    }

    pub(crate) fn programmer(message: impl Into<String>) -> Self {
        Self::Programmer(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Whether this error signals a caller bug rather than a runtime condition.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, Self::Programmer(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<hound::Error> for Error {
    fn from(err: hound::Error) -> Self {
        Self::Decode(format!("wav: {err}"))
    }
}

impl From<symphonia::core::errors::Error> for Error {
    fn from(err: symphonia::core::errors::Error) -> Self {
        Self::Decode(format!("symphonia: {err}"))
    }
}

impl From<ebur128::Error> for Error {
    fn from(err: ebur128::Error) -> Self {
        Self::Analyzer(format!("ebur128: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_errors_keep_their_context_chain() {
        let err: Error = anyhow::anyhow!("root cause").context("outer").into();
        assert_eq!(err.to_string(), "outer: root cause");
    }

    #[test]
    fn programmer_errors_are_flagged() {
        assert!(Error::programmer("buffer pending").is_programmer_error());
        assert!(!Error::decode("bad frame").is_programmer_error());
    }
}
