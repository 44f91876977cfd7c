//! Source readers: the live producers feeding a time-shift window.
//!
//! An [`InputBuffer`] wraps a single open network or file handle (or a
//! chunk store filled elsewhere) and hands out bytes with a bounded wait.
//! Zero-byte reads are routine on live sources, so reads report a
//! [`ReadOutcome`] instead of overloading the byte count.

mod archive;
mod direct;
mod source;

use std::io::SeekFrom;
use std::time::Duration;

use async_trait::async_trait;

pub use self::archive::ArchiveBuffer;
pub use self::direct::DirectBuffer;
pub use self::source::{HttpSourceOpener, SourceHandle, SourceLocation, SourceOpener};
use crate::playlist::PlaylistError;

/// Result of a single bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` bytes were copied into the caller's buffer
    Data(usize),
    /// No data arrived before the timeout; the source may recover
    Stalled,
    /// The source has no more data
    Eof,
    /// The read failed and the source should be restarted
    Error(ReadErrorKind),
}

impl ReadOutcome {
    /// Bytes delivered by this read, zero for every non-data outcome.
    pub fn bytes(&self) -> usize {
        match self {
            ReadOutcome::Data(n) => *n,
            _ => 0,
        }
    }

    /// Whether the consumer should stop reading from this source.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReadOutcome::Eof | ReadOutcome::Error(_))
    }
}

/// Reason attached to [`ReadOutcome::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorKind {
    /// Transport-level I/O failure
    Io,
    /// The read was aborted through `abort_read`
    Aborted,
    /// The producer feeding this buffer failed
    Producer,
}

/// Errors raised while opening or repositioning a source.
#[derive(Debug, thiserror::Error)]
pub enum InputBufferError {
    /// URL cannot be parsed or uses an unsupported scheme
    #[error("Invalid source URL {url}: {reason}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// The transport could not open the source
    #[error("Cannot open {url}: {reason}")]
    Open {
        /// URL that failed
        url: String,
        /// Transport error text
        reason: String,
    },

    /// No bytes arrived within the channel reload timeout
    #[error("No input within {timeout_ms}ms")]
    NoInput {
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The operation does not apply to this kind of source
    #[error("{operation} is not supported by this source")]
    Unsupported {
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Repositioning the source failed
    #[error("Seek failed: {reason}")]
    Seek {
        /// Failure description
        reason: String,
    },

    /// The segmented playlist behind the source is unusable
    #[error(transparent)]
    Playlist(#[from] PlaylistError),
}

/// Player-facing byte source with bounded-wait reads.
///
/// Methods take `&self` so one task can read while another switches the
/// stream or aborts the read.
#[async_trait]
pub trait InputBuffer: Send + Sync {
    /// Total length in bytes, `None` when unknown (live sources).
    fn length(&self) -> Option<u64>;

    /// Current absolute read position, `None` when not tracked.
    fn position(&self) -> Option<u64>;

    /// Reads into `buf`, waiting at most `timeout` for data.
    async fn read(&self, buf: &mut [u8], timeout: Duration) -> ReadOutcome;

    /// Repositions the source with POSIX whence semantics.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::Unsupported` - If the source cannot seek
    /// - `InputBufferError::Seek` - If the transport rejected the new position
    async fn seek(&self, pos: SeekFrom) -> Result<u64, InputBufferError>;

    /// Re-points the source at a new URL, keeping the object alive.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::Open` - If the new URL cannot be opened
    /// - `InputBufferError::Unsupported` - If the source is not URL-backed
    async fn switch_stream(&self, url: &str) -> Result<(), InputBufferError>;

    /// Makes in-flight and future reads return `Error(Aborted)`.
    fn abort_read(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_outcome_bytes() {
        assert_eq!(ReadOutcome::Data(42).bytes(), 42);
        assert_eq!(ReadOutcome::Stalled.bytes(), 0);
        assert_eq!(ReadOutcome::Eof.bytes(), 0);
    }

    #[test]
    fn test_read_outcome_terminal() {
        assert!(!ReadOutcome::Data(1).is_terminal());
        assert!(!ReadOutcome::Stalled.is_terminal());
        assert!(ReadOutcome::Eof.is_terminal());
        assert!(ReadOutcome::Error(ReadErrorKind::Io).is_terminal());
    }

    #[test]
    fn test_error_messages_name_the_url() {
        let error = InputBufferError::Open {
            url: "http://example.invalid/live".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(error.to_string().contains("http://example.invalid/live"));
    }
}
