//! Bounded chunk stores backing the time-shift window.
//!
//! A chunk store is an append-only byte buffer split into fixed-size chunks.
//! One producer appends with [`CacheBuffer::write`] while one consumer reads
//! and seeks inside the retained window `[begin, length)`. When the window
//! would outgrow its budget the oldest chunk is evicted and `begin` moves
//! forward; a reader left behind is moved up to the new `begin`.

mod cyclic;
mod file;
mod memory;
mod stats;
mod window;

use std::io::{self, SeekFrom};
use std::path::PathBuf;

pub use self::cyclic::SimpleCyclicBuffer;
pub use self::file::FileCacheBuffer;
pub use self::memory::MemoryCacheBuffer;
pub use self::stats::CacheStats;

/// Errors raised while creating or repositioning a chunk store.
#[derive(Debug, thiserror::Error)]
pub enum CacheBufferError {
    /// Cache directory could not be created
    #[error("Cannot create cache directory {path}: {source}")]
    CreateDirectory {
        /// Directory that was requested
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// A chunk could not be allocated
    #[error("Cannot create cache chunk in {path}: {source}")]
    CreateChunk {
        /// Directory the chunk was created in
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// Seek target is inside the window but no chunk backs it
    #[error("Cache position {position} is not backed by a retained chunk")]
    ChunkUnavailable {
        /// Clamped target position
        position: u64,
    },

    /// The store is a pass-through ring without random access
    #[error("Seeking is not supported by this cache")]
    SeekUnsupported,

    /// Chunk size or budget parameters are unusable
    #[error("Invalid cache geometry: {reason}")]
    InvalidGeometry {
        /// What was wrong with the parameters
        reason: String,
    },
}

/// Chunked, size-bounded byte store shared by one writer and one reader.
///
/// Every method takes `&self`; implementations guard their cursors and
/// chunk index with a single mutex so the writer task and the player can
/// hold the same `Arc<dyn CacheBuffer>`. None of the methods block on the
/// other side: a reader that outruns the writer gets 0 bytes, a writer that
/// cannot allocate gets a short count.
pub trait CacheBuffer: Send + Sync {
    /// Drops all chunks and resets every cursor to zero.
    ///
    /// # Errors
    ///
    /// - `CacheBufferError::CreateChunk` - If a file store cannot recreate its first chunk
    fn init(&self) -> Result<(), CacheBufferError>;

    /// Chunk granularity in bytes.
    fn unit_size(&self) -> usize;

    /// Moves the read cursor, clamping the target to `[begin, length]`.
    ///
    /// Returns the resulting absolute position.
    ///
    /// # Errors
    ///
    /// - `CacheBufferError::SeekUnsupported` - If the store is not seekable
    /// - `CacheBufferError::ChunkUnavailable` - If the target has no backing chunk
    fn seek(&self, pos: SeekFrom) -> Result<u64, CacheBufferError>;

    /// Total bytes ever written, `None` if the store does not track it.
    fn length(&self) -> Option<u64>;

    /// Absolute read position, `None` if the store does not track it.
    fn position(&self) -> Option<u64>;

    /// Absolute offset of the oldest retained byte.
    fn begin(&self) -> Option<u64>;

    /// Copies retained bytes at the read position into `buf`.
    fn read(&self, buf: &mut [u8]) -> usize;

    /// Appends `data`, returning how many bytes were accepted.
    fn write(&self, data: &[u8]) -> usize;

    /// Snapshot of the store's counters.
    fn stats(&self) -> CacheStats;
}

/// Resolves a seek request against the window bounds.
///
/// Arithmetic is done in `i128` so `SeekFrom::Current`/`End` offsets never
/// overflow before clamping.
pub(crate) fn clamp_seek_target(pos: SeekFrom, begin: u64, position: u64, length: u64) -> u64 {
    let target: i128 = match pos {
        SeekFrom::Start(offset) => offset as i128,
        SeekFrom::Current(delta) => position as i128 + delta as i128,
        SeekFrom::End(delta) => length as i128 + delta as i128,
    };
    target.clamp(begin as i128, length as i128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_seek_target_variants() {
        assert_eq!(clamp_seek_target(SeekFrom::Start(50), 10, 20, 100), 50);
        assert_eq!(clamp_seek_target(SeekFrom::Start(5), 10, 20, 100), 10);
        assert_eq!(clamp_seek_target(SeekFrom::Start(500), 10, 20, 100), 100);
        assert_eq!(clamp_seek_target(SeekFrom::Current(-5), 10, 20, 100), 15);
        assert_eq!(clamp_seek_target(SeekFrom::Current(-50), 10, 20, 100), 10);
        assert_eq!(clamp_seek_target(SeekFrom::End(-30), 10, 20, 100), 70);
        assert_eq!(clamp_seek_target(SeekFrom::End(30), 10, 20, 100), 100);
    }

    #[test]
    fn test_clamp_seek_target_extreme_offsets() {
        assert_eq!(clamp_seek_target(SeekFrom::Current(i64::MIN), 0, 10, 100), 0);
        assert_eq!(clamp_seek_target(SeekFrom::Start(u64::MAX), 0, 10, 100), 100);
    }
}
