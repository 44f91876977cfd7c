//! HLS playlist ingestion: parsing, segment caching and the playlist reader.
//!
//! [`Playlist`] turns playlist text into an ordered stream of segment
//! descriptions, [`PlaylistCache`] downloads and indexes those segments by
//! cumulative byte offset, and [`PlaylistBuffer`] presents the result as an
//! ordinary [`InputBuffer`](crate::input::InputBuffer).

mod buffer;
mod cache;
mod delegate;
mod parser;
mod segment;

pub use self::buffer::PlaylistBuffer;
pub use self::cache::PlaylistCache;
pub use self::delegate::{PlaylistBufferDelegate, TemplateArchiveDelegate, TimeshiftUrl};
pub use self::parser::Playlist;
pub use self::segment::{MutableSegment, Segment, SegmentInfo};

/// Longest playlist excerpt carried in an error message.
const EXCERPT_LEN: usize = 256;

/// Errors raised while fetching or parsing a playlist.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlaylistError {
    /// A mandatory tag is absent
    #[error("Playlist is missing {tag}: {excerpt:?}")]
    MissingTag {
        /// Tag that was expected
        tag: &'static str,
        /// Start of the offending payload
        excerpt: String,
    },

    /// The payload could not be parsed
    #[error("Malformed playlist near {tag} ({reason}): {excerpt:?}")]
    Malformed {
        /// Tag or element being processed
        tag: &'static str,
        /// Parser diagnostic
        reason: String,
        /// Start of the offending payload
        excerpt: String,
    },

    /// The playlist or one of its URIs is not a usable URL
    #[error("Invalid playlist URL {url}: {reason}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Downloading the playlist failed
    #[error("Cannot fetch playlist {url}: {reason}")]
    Fetch {
        /// URL that failed
        url: String,
        /// Transport error text
        reason: String,
    },
}

/// First [`EXCERPT_LEN`] characters of `payload`.
pub(crate) fn excerpt(payload: &str) -> String {
    payload.chars().take(EXCERPT_LEN).collect()
}
