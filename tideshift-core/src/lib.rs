//! Tideshift Core - Streaming cache and time-shift buffering for IPTV playback
//!
//! This crate turns unreliable, possibly segmented (HLS) network sources into
//! bounded, seekable byte streams a player reads at its own pace: chunk
//! stores, source readers, the time-shift composer, the playlist pipeline and
//! the teardown queue.

pub mod action_queue;
pub mod cache;
pub mod config;
pub mod input;
pub mod player;
pub mod playlist;
pub mod timeshift;
pub mod tracing_setup;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

// Re-export main types for convenient access
pub use action_queue::{ActionError, ActionQueue, ActionQueueError, ActionStatus};
pub use cache::{
    CacheBuffer, CacheBufferError, FileCacheBuffer, MemoryCacheBuffer, SimpleCyclicBuffer,
};
pub use config::TideshiftConfig;
pub use input::{
    ArchiveBuffer, DirectBuffer, HttpSourceOpener, InputBuffer, InputBufferError, ReadErrorKind,
    ReadOutcome, SourceOpener,
};
pub use player::{ChannelPlayer, LogNotifier, Notifier};
pub use playlist::{
    PlaylistBuffer, PlaylistBufferDelegate, PlaylistError, TemplateArchiveDelegate,
};
pub use timeshift::TimeshiftBuffer;

/// Core errors that can bubble up from any Tideshift subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum TideshiftError {
    #[error("Input error: {0}")]
    Input(#[from] InputBufferError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheBufferError),

    #[error("Playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("Action queue error: {0}")]
    ActionQueue(#[from] ActionQueueError),

    #[error("No alternative stream for channel {channel}")]
    NoAlternativeStream { channel: String },

    #[error("No channel is open")]
    NoOpenChannel,

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TideshiftError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TideshiftError::Input(e) => match e {
                InputBufferError::InvalidUrl { url, .. } => format!("Invalid stream address: {url}"),
                InputBufferError::Open { url, .. } => format!("Could not open stream: {url}"),
                InputBufferError::NoInput { .. } => "The stream is not sending any data".to_string(),
                InputBufferError::Playlist(_) => "The stream playlist is unusable".to_string(),
                _ => "Stream error occurred".to_string(),
            },
            TideshiftError::Cache(_) => "Time-shift cache error occurred".to_string(),
            TideshiftError::Playlist(_) => "The stream playlist is unusable".to_string(),
            TideshiftError::ActionQueue(_) => "Internal task error occurred".to_string(),
            TideshiftError::NoAlternativeStream { channel } => {
                format!("No working stream for channel {channel}")
            }
            TideshiftError::NoOpenChannel => "No channel is playing".to_string(),
            TideshiftError::Configuration { .. } => "Configuration error occurred".to_string(),
            TideshiftError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TideshiftError::Configuration { .. }
                | TideshiftError::Input(InputBufferError::InvalidUrl { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, TideshiftError>;
