//! Chunk arena and window bookkeeping shared by the seekable stores.
//!
//! The window owns every chunk through an arena of slots. The ordered ring
//! holds slot indices only, and the reader is described by an absolute
//! offset, so evicting a chunk can never leave a dangling reference behind.

use std::collections::VecDeque;
use std::io::{self, SeekFrom};

use tracing::{debug, warn};

use super::{CacheBufferError, CacheStats, clamp_seek_target};

/// Fixed-capacity block with an append cursor.
pub(crate) trait Chunk: Send {
    /// Bytes appended so far (the write cursor).
    fn filled(&self) -> usize;

    /// Appends as much of `data` as fits, returning the count.
    fn append(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Copies bytes starting at `offset` (which must be `< filled`).
    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<usize>;
}

/// Allocates chunks for a window and takes evicted ones back.
pub(crate) trait ChunkFactory: Send {
    type Chunk: Chunk;

    fn create(&mut self) -> io::Result<Self::Chunk>;

    /// Receives an evicted chunk; the default drops it.
    fn recycle(&mut self, chunk: Self::Chunk) {
        drop(chunk);
    }
}

/// Slot storage with a free list.
pub(crate) struct ChunkArena<C> {
    slots: Vec<Option<C>>,
    free: Vec<usize>,
}

impl<C> ChunkArena<C> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, chunk: C) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(chunk);
                slot
            }
            None => {
                self.slots.push(Some(chunk));
                self.slots.len() - 1
            }
        }
    }

    pub(crate) fn remove(&mut self, slot: usize) -> Option<C> {
        let chunk = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        Some(chunk)
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut C> {
        self.slots.get_mut(slot)?.as_mut()
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&C> {
        self.slots.get(slot)?.as_ref()
    }
}

/// Cursors, chunk ring and budget of one seekable store.
pub(crate) struct ChunkWindow<F: ChunkFactory> {
    factory: F,
    arena: ChunkArena<F::Chunk>,
    ring: VecDeque<usize>,
    unit_size: u64,
    max_chunks: usize,
    begin: u64,
    length: u64,
    position: u64,
    stats: CacheStats,
}

impl<F: ChunkFactory> ChunkWindow<F> {
    /// Creates an empty window holding at most `max_size` bytes.
    ///
    /// # Errors
    ///
    /// - `CacheBufferError::InvalidGeometry` - If the unit is zero or larger than the budget
    pub(crate) fn new(factory: F, unit_size: usize, max_size: u64) -> Result<Self, CacheBufferError> {
        if unit_size == 0 {
            return Err(CacheBufferError::InvalidGeometry {
                reason: "chunk size must be non-zero".to_string(),
            });
        }
        let max_chunks = (max_size / unit_size as u64) as usize;
        if max_chunks == 0 {
            return Err(CacheBufferError::InvalidGeometry {
                reason: format!("budget {max_size} is smaller than one {unit_size} byte chunk"),
            });
        }

        Ok(Self {
            factory,
            arena: ChunkArena::new(),
            ring: VecDeque::with_capacity(max_chunks),
            unit_size: unit_size as u64,
            max_chunks,
            begin: 0,
            length: 0,
            position: 0,
            stats: CacheStats::new(),
        })
    }

    pub(crate) fn unit_size(&self) -> usize {
        self.unit_size as usize
    }

    pub(crate) fn max_size(&self) -> u64 {
        self.max_chunks as u64 * self.unit_size
    }

    pub(crate) fn begin(&self) -> u64 {
        self.begin
    }

    pub(crate) fn length(&self) -> u64 {
        self.length
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    /// Drops every chunk and rewinds all cursors to zero.
    pub(crate) fn reset(&mut self) {
        while let Some(slot) = self.ring.pop_front() {
            if let Some(chunk) = self.arena.remove(slot) {
                self.factory.recycle(chunk);
            }
        }
        self.begin = 0;
        self.length = 0;
        self.position = 0;
        self.stats.clear_window();
    }

    /// Allocates the tail chunk ahead of the first write.
    pub(crate) fn prime(&mut self) -> io::Result<()> {
        if self.ring.is_empty() {
            self.push_chunk()?;
        }
        Ok(())
    }

    pub(crate) fn seek(&mut self, pos: SeekFrom) -> Result<u64, CacheBufferError> {
        let target = clamp_seek_target(pos, self.begin, self.position, self.length);
        if target < self.length && self.slot_for(target).is_none() {
            return Err(CacheBufferError::ChunkUnavailable { position: target });
        }
        self.position = target;
        Ok(target)
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;

        while copied < buf.len() && self.position < self.length {
            let Some((slot, offset)) = self.slot_for(self.position) else {
                break;
            };
            let Some(chunk) = self.arena.get_mut(slot) else {
                break;
            };

            let available = chunk.filled().saturating_sub(offset);
            let want = available.min(buf.len() - copied);
            if want == 0 {
                break;
            }

            match chunk.read_at(offset, &mut buf[copied..copied + want]) {
                Ok(0) => break,
                Ok(n) => {
                    copied += n;
                    self.position += n as u64;
                    if (offset + n) as u64 == self.unit_size {
                        self.release_consumed();
                    }
                }
                Err(e) => {
                    warn!("Chunk read at {} failed: {}", self.position, e);
                    break;
                }
            }
        }

        self.stats.record_read(copied);
        copied
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> usize {
        let mut written = 0;

        while written < data.len() {
            let tail_has_room = self
                .ring
                .back()
                .and_then(|slot| self.arena.get(*slot))
                .is_some_and(|chunk| (chunk.filled() as u64) < self.unit_size);

            if !tail_has_room {
                // Make room for one more chunk before allocating it
                self.trim_to_budget(self.max_chunks - 1);
                if let Err(e) = self.push_chunk() {
                    warn!("Cannot allocate cache chunk at offset {}: {}", self.length, e);
                    self.stats.record_failed_allocation();
                    break;
                }
            }

            let Some(chunk) = self.ring.back().and_then(|slot| self.arena.get_mut(*slot)) else {
                break;
            };
            match chunk.append(&data[written..]) {
                Ok(0) => break,
                Ok(n) => {
                    written += n;
                    self.length += n as u64;
                }
                Err(e) => {
                    warn!("Chunk write at {} failed: {}", self.length, e);
                    self.stats.record_failed_write();
                    break;
                }
            }
        }

        self.stats.record_write(written);
        written
    }

    /// Frees fully read head chunks once the window is at its budget, so
    /// the next write finds room without overrunning the reader.
    fn release_consumed(&mut self) {
        while self.ring.len() >= self.max_chunks && self.position >= self.begin + self.unit_size {
            if !self.evict_head() {
                break;
            }
        }
    }

    /// Evicts head chunks until at most `keep` remain.
    fn trim_to_budget(&mut self, keep: usize) {
        while self.ring.len() > keep {
            if !self.evict_head() {
                break;
            }
            if self.position < self.begin {
                debug!(
                    "Reader at {} overrun by eviction, moved to {}",
                    self.position, self.begin
                );
                self.position = self.begin;
                self.stats.record_reader_overrun();
            }
        }
    }

    fn evict_head(&mut self) -> bool {
        let Some(slot) = self.ring.pop_front() else {
            return false;
        };
        let evicted = self.arena.remove(slot);
        let evicted_bytes = evicted.as_ref().map_or(0, |c| c.filled() as u64);
        if let Some(chunk) = evicted {
            self.factory.recycle(chunk);
        }

        self.begin += self.unit_size;
        self.stats.record_chunk_evicted(evicted_bytes);
        true
    }

    fn push_chunk(&mut self) -> io::Result<()> {
        let chunk = self.factory.create()?;
        let slot = self.arena.insert(chunk);
        self.ring.push_back(slot);
        self.stats.record_chunk_created();
        Ok(())
    }

    /// Maps an absolute offset to `(slot, offset within chunk)`.
    fn slot_for(&self, absolute: u64) -> Option<(usize, usize)> {
        let relative = absolute.checked_sub(self.begin)?;
        let index = (relative / self.unit_size) as usize;
        let slot = *self.ring.get(index)?;
        Some((slot, (relative % self.unit_size) as usize))
    }
}
