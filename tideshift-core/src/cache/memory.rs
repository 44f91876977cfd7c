//! Heap-backed chunk store built from 32 KiB units.

use std::io::{self, SeekFrom};

use parking_lot::Mutex;

use super::window::{Chunk, ChunkFactory, ChunkWindow};
use super::{CacheBuffer, CacheBufferError, CacheStats};
use crate::config::MEMORY_UNIT_SIZE;

/// Time-shift store keeping `size_factor` units of 32 KiB in memory.
///
/// Evicted units are kept on a free list and reused by the next allocation,
/// so a steady live stream stops allocating once the window is full.
pub struct MemoryCacheBuffer {
    window: Mutex<ChunkWindow<MemoryUnits>>,
}

impl MemoryCacheBuffer {
    /// Creates a store whose budget is `size_factor × 32 KiB`.
    ///
    /// # Errors
    ///
    /// - `CacheBufferError::InvalidGeometry` - If `size_factor` is zero
    pub fn new(size_factor: usize) -> Result<Self, CacheBufferError> {
        let budget = size_factor as u64 * MEMORY_UNIT_SIZE as u64;
        let window = ChunkWindow::new(MemoryUnits::default(), MEMORY_UNIT_SIZE, budget)?;
        tracing::debug!("Memory cache created with {} units", size_factor);

        Ok(Self {
            window: Mutex::new(window),
        })
    }

    /// Maximum bytes retained in the window.
    pub fn max_size(&self) -> u64 {
        self.window.lock().max_size()
    }
}

impl CacheBuffer for MemoryCacheBuffer {
    fn init(&self) -> Result<(), CacheBufferError> {
        self.window.lock().reset();
        Ok(())
    }

    fn unit_size(&self) -> usize {
        MEMORY_UNIT_SIZE
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64, CacheBufferError> {
        self.window.lock().seek(pos)
    }

    fn length(&self) -> Option<u64> {
        Some(self.window.lock().length())
    }

    fn position(&self) -> Option<u64> {
        Some(self.window.lock().position())
    }

    fn begin(&self) -> Option<u64> {
        Some(self.window.lock().begin())
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        self.window.lock().read(buf)
    }

    fn write(&self, data: &[u8]) -> usize {
        self.window.lock().write(data)
    }

    fn stats(&self) -> CacheStats {
        self.window.lock().stats()
    }
}

struct MemoryUnit {
    data: Box<[u8]>,
    filled: usize,
}

impl Chunk for MemoryUnit {
    fn filled(&self) -> usize {
        self.filled
    }

    fn append(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = data.len().min(self.data.len() - self.filled);
        self.data[self.filled..self.filled + n].copy_from_slice(&data[..n]);
        self.filled += n;
        Ok(n)
    }

    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.filled.saturating_sub(offset));
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

#[derive(Default)]
struct MemoryUnits {
    spare: Vec<MemoryUnit>,
}

impl ChunkFactory for MemoryUnits {
    type Chunk = MemoryUnit;

    fn create(&mut self) -> io::Result<MemoryUnit> {
        Ok(self.spare.pop().unwrap_or_else(|| MemoryUnit {
            data: vec![0u8; MEMORY_UNIT_SIZE].into_boxed_slice(),
            filled: 0,
        }))
    }

    fn recycle(&mut self, mut chunk: MemoryUnit) {
        chunk.filled = 0;
        self.spare.push(chunk);
    }
}
