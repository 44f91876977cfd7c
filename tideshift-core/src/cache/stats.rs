//! Statistics tracking for chunk store operations

use std::time::{Duration, Instant};

/// Counters describing how a chunk store has been used.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of chunks allocated
    pub chunks_created: u64,

    /// Total number of chunks evicted to respect the budget
    pub chunks_evicted: u64,

    /// Current number of retained chunks
    pub chunks_buffered: usize,

    /// Total bytes accepted by `write`
    pub bytes_written: u64,

    /// Total bytes returned by `read`
    pub bytes_read: u64,

    /// Bytes currently retained in the window
    pub bytes_buffered: u64,

    /// Maximum bytes that were retained at any point
    pub peak_bytes_buffered: u64,

    /// Times the reader was moved forward because its data was evicted
    pub reader_overruns: u64,

    /// Writes cut short because no chunk could be allocated
    pub failed_allocations: u64,

    /// Writes cut short by a chunk I/O error
    pub failed_writes: u64,

    /// Timestamp of the first accepted write
    pub first_write_time: Option<Instant>,

    /// Time since the first accepted write
    pub buffer_age: Duration,
}

impl CacheStats {
    /// Creates new empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculates window utilization as percentage (0-100)
    pub fn utilization_percent(&self, max_bytes: u64) -> f64 {
        if max_bytes == 0 {
            return 0.0;
        }
        (self.bytes_buffered as f64 / max_bytes as f64) * 100.0
    }

    /// Calculates the sustained write rate in bytes per second
    pub fn write_rate_bps(&self) -> f64 {
        if self.buffer_age.is_zero() {
            return 0.0;
        }
        self.bytes_written as f64 / self.buffer_age.as_secs_f64()
    }

    /// Writes that stopped early because the store itself failed.
    ///
    /// A full non-evicting store refuses bytes without counting here.
    pub fn write_failures(&self) -> u64 {
        self.failed_allocations + self.failed_writes
    }

    /// Bytes written but not (yet) read
    pub fn backlog_bytes(&self) -> u64 {
        self.bytes_written.saturating_sub(self.bytes_read)
    }

    pub(crate) fn record_write(&mut self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.bytes_written += bytes as u64;
        self.bytes_buffered += bytes as u64;
        self.peak_bytes_buffered = self.peak_bytes_buffered.max(self.bytes_buffered);

        let now = Instant::now();
        let first = *self.first_write_time.get_or_insert(now);
        self.buffer_age = now.duration_since(first);
    }

    pub(crate) fn record_read(&mut self, bytes: usize) {
        self.bytes_read += bytes as u64;
    }

    pub(crate) fn record_chunk_created(&mut self) {
        self.chunks_created += 1;
        self.chunks_buffered += 1;
    }

    pub(crate) fn record_chunk_evicted(&mut self, chunk_bytes: u64) {
        self.chunks_evicted += 1;
        self.chunks_buffered = self.chunks_buffered.saturating_sub(1);
        self.bytes_buffered = self.bytes_buffered.saturating_sub(chunk_bytes);
    }

    pub(crate) fn record_reader_overrun(&mut self) {
        self.reader_overruns += 1;
    }

    pub(crate) fn record_failed_allocation(&mut self) {
        self.failed_allocations += 1;
    }

    pub(crate) fn record_failed_write(&mut self) {
        self.failed_writes += 1;
    }

    pub(crate) fn clear_window(&mut self) {
        self.chunks_buffered = 0;
        self.bytes_buffered = 0;
    }

    /// Formats statistics as human-readable string
    pub fn format_summary(&self, max_bytes: u64) -> String {
        format!(
            "Cache Stats: {} chunks, {:.1}MB/{:.1}MB ({:.1}%), written {:.1}MB, read {:.1}MB, evicted {}, overruns {}",
            self.chunks_buffered,
            self.bytes_buffered as f64 / 1024.0 / 1024.0,
            max_bytes as f64 / 1024.0 / 1024.0,
            self.utilization_percent(max_bytes),
            self.bytes_written as f64 / 1024.0 / 1024.0,
            self.bytes_read as f64 / 1024.0 / 1024.0,
            self.chunks_evicted,
            self.reader_overruns
        )
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_cache_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats.chunks_created, 0);
        assert_eq!(stats.bytes_written, 0);
        assert!(stats.first_write_time.is_none());
    }

    #[test]
    fn test_record_write_tracks_peak() {
        let mut stats = CacheStats::new();

        stats.record_write(1024);
        stats.record_chunk_evicted(1024);
        stats.record_write(512);

        assert_eq!(stats.bytes_written, 1536);
        assert_eq!(stats.bytes_buffered, 512);
        assert_eq!(stats.peak_bytes_buffered, 1024);
        assert!(stats.first_write_time.is_some());
    }

    #[test]
    fn test_zero_write_does_not_start_clock() {
        let mut stats = CacheStats::new();
        stats.record_write(0);
        assert!(stats.first_write_time.is_none());
    }

    #[test]
    fn test_utilization_percent() {
        let mut stats = CacheStats::new();
        stats.bytes_buffered = 5000;

        assert_eq!(stats.utilization_percent(10000), 50.0);
        assert_eq!(stats.utilization_percent(0), 0.0);
    }

    #[test]
    fn test_backlog_bytes() {
        let mut stats = CacheStats::new();
        stats.record_write(100);
        stats.record_read(40);
        assert_eq!(stats.backlog_bytes(), 60);
    }

    #[test]
    fn test_buffer_age_tracking() {
        let mut stats = CacheStats::new();

        stats.record_write(1024);
        thread::sleep(Duration::from_millis(10));
        stats.record_write(1024);

        assert!(stats.buffer_age > Duration::from_millis(9));
        assert!(stats.write_rate_bps() > 0.0);
    }

    #[test]
    fn test_format_summary() {
        let mut stats = CacheStats::new();
        stats.chunks_buffered = 4;
        stats.bytes_buffered = 1024 * 1024;
        stats.chunks_evicted = 3;

        let summary = stats.format_summary(10 * 1024 * 1024);
        assert!(summary.contains("4 chunks"));
        assert!(summary.contains("1.0MB/10.0MB"));
        assert!(summary.contains("evicted 3"));
    }
}
