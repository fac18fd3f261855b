//! Buffered, cancellable random-access reads over a file.
//!
//! `FileView` keeps exactly one cached block in memory. Callers ask for "at least `size` bytes
//! starting at `position`"; if the cached block already covers that window the call returns
//! immediately, otherwise the old block is dropped and a new one is read.
//!
//! The read is the only suspension point of a decode step, so it is raced against the caller's
//! `CancellationToken`, and a token that has already fired is reported even when the window is
//! cached. A cancelled read leaves the view with no cached block (never a half-filled one); a
//! cache hit under a fired token keeps its block.

use std::io::{ErrorKind, SeekFrom};
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// How many times a read that failed with a transient error is retried.
const MAX_READ_ATTEMPTS: usize = 5;

/// Outcome of `FileView::read_block_of_size_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The requested window is cached and addressable.
    Ready,
    /// The cancellation token fired before the read finished.
    Cancelled,
}

/// A single-block cache over a seekable async byte source.
pub struct FileView<R> {
    source: R,
    file_len: u64,
    buffer: Option<Vec<u8>>,
    start: u64,
    end: u64,
}

impl FileView<tokio::fs::File> {
    /// Open a file on disk.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let file_len = file.metadata().await?.len();
        Ok(Self::new(file, file_len))
    }
}

impl<R> FileView<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    /// Wrap an already-open source of `file_len` bytes.
    pub fn new(source: R, file_len: u64) -> Self {
        Self {
            source,
            file_len,
            buffer: None,
            start: 0,
            end: 0,
        }
    }

    /// Total length of the backing file in bytes.
    pub fn len(&self) -> u64 {
        self.file_len
    }

    pub fn is_empty(&self) -> bool {
        self.file_len == 0
    }

    /// Absolute file offset of the first cached byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Absolute file offset one past the last cached byte.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The whole cached block.
    pub fn block(&self) -> Result<&[u8]> {
        self.buffer
            .as_deref()
            .ok_or_else(|| Error::programmer("no block available"))
    }

    /// The cached block starting `offset` bytes after `start()`.
    pub fn block_at_offset(&self, offset: usize) -> Result<&[u8]> {
        let block = self.block()?;
        block.get(offset..).ok_or_else(|| {
            Error::programmer(format!(
                "offset {offset} is outside the cached block of {} bytes",
                block.len()
            ))
        })
    }

    /// The cached block starting at absolute file offset `position`.
    pub fn block_at_position(&self, position: u64) -> Result<&[u8]> {
        if position < self.start {
            return Err(Error::programmer(format!(
                "position {position} precedes cached block start {}",
                self.start
            )));
        }
        self.block_at_offset((position - self.start) as usize)
    }

    /// Ensure at least `size` bytes starting at `position` are cached (clamped to the file).
    ///
    /// `padding_factor_hint` (values <= 1 mean "no padding") lets callers over-read so that
    /// subsequent sequential requests hit the cache.
    pub async fn read_block_of_size_at(
        &mut self,
        size: u64,
        position: u64,
        cancellation_token: &CancellationToken,
        padding_factor_hint: f64,
    ) -> Result<ReadStatus> {
        if cancellation_token.is_cancelled() {
            return Ok(ReadStatus::Cancelled);
        }

        let padding_factor = if padding_factor_hint.is_finite() && padding_factor_hint > 1.0 {
            padding_factor_hint
        } else {
            1.0
        };

        if self.file_len == 0 {
            self.buffer = Some(Vec::new());
            self.start = 0;
            self.end = 0;
            return Ok(ReadStatus::Ready);
        }

        let start = position.min(self.file_len - 1);
        let end = start.saturating_add(size).min(self.file_len);

        if self.buffer.is_some() && self.start <= start && end <= self.end {
            return Ok(ReadStatus::Ready);
        }

        let padded_size = (size as f64 * padding_factor).ceil() as u64;
        let end = start.saturating_add(padded_size).min(self.file_len);

        // Drop the old block first: if this future is cancelled or dropped midway, the view
        // must not claim to cover a window it no longer holds.
        self.buffer = None;
        self.start = 0;
        self.end = 0;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => return Ok(ReadStatus::Cancelled),
                result = read_range(&mut self.source, start, end) => result,
            };

            match result {
                Ok(bytes) => {
                    trace!(start, end = start + bytes.len() as u64, "file view block read");
                    self.start = start;
                    self.end = start + bytes.len() as u64;
                    self.buffer = Some(bytes);
                    return Ok(ReadStatus::Ready);
                }
                Err(err) if is_retryable(&err) && attempt < MAX_READ_ATTEMPTS => {
                    warn!(attempt, error = %err, "retrying file view read");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

async fn read_range<R>(source: &mut R, start: u64, end: u64) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    source.seek(SeekFrom::Start(start)).await?;

    let len = end.saturating_sub(start);
    let mut bytes = Vec::with_capacity(len as usize);
    source.take(len).read_to_end(&mut bytes).await?;
    Ok(bytes)
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock)
}
