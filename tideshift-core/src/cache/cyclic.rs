//! Fixed ring of pre-allocated units for live playback without time-shift.

use std::collections::VecDeque;
use std::io::SeekFrom;

use parking_lot::Mutex;

use super::{CacheBuffer, CacheBufferError, CacheStats};

/// Pass-through ring used when the player cannot pause or rewind.
///
/// Units move between a free queue and a ready queue. The writer fills the
/// unit at the back of the ready queue, the reader drains the unit at the
/// front and hands it back to the free queue once it is both full and
/// consumed. When no free unit is left the writer gets a short count.
pub struct SimpleCyclicBuffer {
    unit_size: usize,
    ring: Mutex<Ring>,
}

struct Unit {
    data: Box<[u8]>,
    filled: usize,
    consumed: usize,
}

struct Ring {
    units: Vec<Unit>,
    free: VecDeque<usize>,
    ready: VecDeque<usize>,
    stats: CacheStats,
}

impl SimpleCyclicBuffer {
    /// Pre-allocates `unit_count` units of `unit_size` bytes.
    ///
    /// # Errors
    ///
    /// - `CacheBufferError::InvalidGeometry` - If either dimension is zero
    pub fn new(unit_size: usize, unit_count: usize) -> Result<Self, CacheBufferError> {
        if unit_size == 0 || unit_count == 0 {
            return Err(CacheBufferError::InvalidGeometry {
                reason: format!("ring of {unit_count} units of {unit_size} bytes"),
            });
        }

        let units = (0..unit_count)
            .map(|_| Unit {
                data: vec![0u8; unit_size].into_boxed_slice(),
                filled: 0,
                consumed: 0,
            })
            .collect();

        Ok(Self {
            unit_size,
            ring: Mutex::new(Ring {
                units,
                free: (0..unit_count).collect(),
                ready: VecDeque::with_capacity(unit_count),
                stats: CacheStats::new(),
            }),
        })
    }

    /// Bytes written but not yet read.
    pub fn buffered(&self) -> usize {
        let ring = self.ring.lock();
        ring.ready
            .iter()
            .map(|index| ring.units[*index].filled - ring.units[*index].consumed)
            .sum()
    }
}

impl Ring {
    fn release(&mut self, index: usize) {
        let unit = &mut self.units[index];
        unit.filled = 0;
        unit.consumed = 0;
        self.free.push_back(index);
    }
}

impl CacheBuffer for SimpleCyclicBuffer {
    fn init(&self) -> Result<(), CacheBufferError> {
        let mut ring = self.ring.lock();
        while let Some(index) = ring.ready.pop_front() {
            ring.release(index);
        }
        ring.stats.clear_window();
        Ok(())
    }

    fn unit_size(&self) -> usize {
        self.unit_size
    }

    fn seek(&self, _pos: SeekFrom) -> Result<u64, CacheBufferError> {
        Err(CacheBufferError::SeekUnsupported)
    }

    fn length(&self) -> Option<u64> {
        None
    }

    fn position(&self) -> Option<u64> {
        None
    }

    fn begin(&self) -> Option<u64> {
        None
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let mut ring = self.ring.lock();
        let mut copied = 0;

        while copied < buf.len() {
            let Some(&index) = ring.ready.front() else {
                break;
            };
            let unit = &mut ring.units[index];
            let n = (unit.filled - unit.consumed).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&unit.data[unit.consumed..unit.consumed + n]);
            unit.consumed += n;
            copied += n;

            let drained = unit.consumed == unit.filled;
            let full = unit.filled == self.unit_size;
            if drained && full {
                ring.ready.pop_front();
                ring.release(index);
                ring.stats.record_chunk_evicted(self.unit_size as u64);
            } else if drained {
                // Caught up with the writer inside its current unit
                break;
            }
        }

        ring.stats.record_read(copied);
        copied
    }

    fn write(&self, data: &[u8]) -> usize {
        let mut ring = self.ring.lock();
        let mut written = 0;

        while written < data.len() {
            let tail = ring
                .ready
                .back()
                .copied()
                .filter(|index| ring.units[*index].filled < self.unit_size);

            let index = match tail {
                Some(index) => index,
                None => match ring.free.pop_front() {
                    Some(index) => {
                        ring.ready.push_back(index);
                        ring.stats.record_chunk_created();
                        index
                    }
                    None => break,
                },
            };

            let unit = &mut ring.units[index];
            let n = (self.unit_size - unit.filled).min(data.len() - written);
            unit.data[unit.filled..unit.filled + n].copy_from_slice(&data[written..written + n]);
            unit.filled += n;
            written += n;
        }

        ring.stats.record_write(written);
        written
    }

    fn stats(&self) -> CacheStats {
        self.ring.lock().stats.clone()
    }
}
