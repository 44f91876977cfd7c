//! Time-shift composition of a live source and a chunk store.
//!
//! A writer task copies bytes from the source into the current cache while
//! the player reads, seeks and pauses against the cache. The cache window
//! bounds how far the player can rewind.

use std::io::SeekFrom;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheBuffer, CacheBufferError};
use crate::config::{MEMORY_UNIT_SIZE, TideshiftConfig};
use crate::input::{InputBuffer, InputBufferError, ReadErrorKind, ReadOutcome};

/// Consecutive failed cache writes before the writer gives up.
const MAX_WRITE_FAILURES: u32 = 5;

/// Seekable player surface over a live source and a swappable cache.
pub struct TimeshiftBuffer {
    source: Arc<dyn InputBuffer>,
    shared: Arc<Shared>,
    writer: Mutex<CancellationToken>,
    abort: CancellationToken,
    source_read_timeout: Duration,
    poll_interval: Duration,
}

/// How the source stopped producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceEnd {
    Eof,
    Failed(ReadErrorKind),
}

struct Shared {
    cache: RwLock<Arc<dyn CacheBuffer>>,
    data_written: Notify,
    space_freed: Notify,
    bytes_written: AtomicU64,
    finished: Mutex<Option<SourceEnd>>,
}

impl Shared {
    fn cache(&self) -> Arc<dyn CacheBuffer> {
        Arc::clone(&self.cache.read())
    }

    fn finished(&self) -> Option<SourceEnd> {
        *self.finished.lock()
    }

    fn finish(&self, end: SourceEnd) {
        *self.finished.lock() = Some(end);
        self.data_written.notify_waiters();
    }
}

impl TimeshiftBuffer {
    /// Starts copying `source` into `cache` and waits for the first bytes.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::NoInput` - If nothing arrives within
    ///   `channel_reload_timeout`; the writer is stopped before returning
    pub async fn start(
        source: Arc<dyn InputBuffer>,
        cache: Arc<dyn CacheBuffer>,
        config: &TideshiftConfig,
    ) -> Result<Self, InputBufferError> {
        let buffer = Self {
            source,
            shared: Arc::new(Shared {
                cache: RwLock::new(cache),
                data_written: Notify::new(),
                space_freed: Notify::new(),
                bytes_written: AtomicU64::new(0),
                finished: Mutex::new(None),
            }),
            writer: Mutex::new(CancellationToken::new()),
            abort: CancellationToken::new(),
            source_read_timeout: config.network.source_read_timeout,
            poll_interval: config.network.poll_interval,
        };

        buffer.spawn_writer();
        buffer
            .wait_for_input(config.network.channel_reload_timeout)
            .await?;
        Ok(buffer)
    }

    fn spawn_writer(&self) {
        let cancel = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.writer.lock(), cancel.clone());
        previous.cancel();

        let writer = Writer {
            source: Arc::clone(&self.source),
            shared: Arc::clone(&self.shared),
            cancel,
            read_timeout: self.source_read_timeout,
            poll_interval: self.poll_interval,
        };
        tokio::spawn(writer.run());
    }

    async fn wait_for_input(&self, timeout: Duration) -> Result<(), InputBufferError> {
        let deadline = Instant::now() + timeout;

        loop {
            let mut written = pin!(self.shared.data_written.notified());
            written.as_mut().enable();

            if self.shared.bytes_written.load(Ordering::Acquire) > 0 {
                return Ok(());
            }
            if let Some(end) = self.shared.finished() {
                debug!("Source ended before producing data: {:?}", end);
                break;
            }
            if tokio::time::timeout_at(deadline, written).await.is_err() {
                break;
            }
        }

        self.writer.lock().cancel();
        warn!("No input within {:?}", timeout);
        Err(InputBufferError::NoInput {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// Replaces the cache; the writer switches on its next write.
    ///
    /// Returns the cache that was replaced.
    pub fn swap_cache(&self, cache: Arc<dyn CacheBuffer>) -> Arc<dyn CacheBuffer> {
        let previous = std::mem::replace(&mut *self.shared.cache.write(), cache);
        self.shared.data_written.notify_waiters();
        self.shared.space_freed.notify_one();
        info!("Time-shift cache swapped");
        previous
    }

    /// Cache currently receiving the stream.
    pub fn cache(&self) -> Arc<dyn CacheBuffer> {
        self.shared.cache()
    }

    fn read_cache(&self, buf: &mut [u8]) -> usize {
        let n = self.shared.cache().read(buf);
        if n > 0 {
            self.shared.space_freed.notify_one();
        }
        n
    }

    /// Once the source has ended, returns the bytes it wrote last or the
    /// end outcome when none are left. `None` while the source is running.
    fn drain_or_end(&self, buf: &mut [u8]) -> Option<ReadOutcome> {
        let end = self.shared.finished()?;
        // Writes made before the source ended are visible now
        match self.read_cache(buf) {
            0 => Some(match end {
                SourceEnd::Eof => ReadOutcome::Eof,
                SourceEnd::Failed(_) => ReadOutcome::Error(ReadErrorKind::Producer),
            }),
            n => Some(ReadOutcome::Data(n)),
        }
    }
}

#[async_trait]
impl InputBuffer for TimeshiftBuffer {
    fn length(&self) -> Option<u64> {
        self.shared.cache().length()
    }

    fn position(&self) -> Option<u64> {
        self.shared.cache().position()
    }

    async fn read(&self, buf: &mut [u8], timeout: Duration) -> ReadOutcome {
        if self.abort.is_cancelled() {
            return ReadOutcome::Error(ReadErrorKind::Aborted);
        }
        if buf.is_empty() {
            return ReadOutcome::Data(0);
        }

        let mut written = pin!(self.shared.data_written.notified());
        written.as_mut().enable();

        let n = self.read_cache(buf);
        if n > 0 {
            return ReadOutcome::Data(n);
        }
        if let Some(outcome) = self.drain_or_end(buf) {
            return outcome;
        }

        tokio::select! {
            _ = self.abort.cancelled() => return ReadOutcome::Error(ReadErrorKind::Aborted),
            _ = tokio::time::timeout(timeout, written) => {}
        }

        match self.read_cache(buf) {
            0 => self.drain_or_end(buf).unwrap_or(ReadOutcome::Stalled),
            n => ReadOutcome::Data(n),
        }
    }

    async fn seek(&self, pos: SeekFrom) -> Result<u64, InputBufferError> {
        self.shared.cache().seek(pos).map_err(|e| match e {
            CacheBufferError::SeekUnsupported => InputBufferError::Unsupported {
                operation: "seek without time-shift",
            },
            other => InputBufferError::Seek {
                reason: other.to_string(),
            },
        })
    }

    async fn switch_stream(&self, url: &str) -> Result<(), InputBufferError> {
        self.source.switch_stream(url).await?;
        let ended = self.shared.finished.lock().take();
        if let Some(end) = ended {
            debug!("Restarting writer after source {:?}", end);
            self.spawn_writer();
        }
        Ok(())
    }

    fn abort_read(&self) {
        self.abort.cancel();
        self.source.abort_read();
    }
}

impl Drop for TimeshiftBuffer {
    fn drop(&mut self) {
        self.writer.lock().cancel();
    }
}

/// Task copying the source into the current cache.
struct Writer {
    source: Arc<dyn InputBuffer>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    read_timeout: Duration,
    poll_interval: Duration,
}

impl Writer {
    async fn run(self) {
        let mut buf = vec![0u8; MEMORY_UNIT_SIZE];
        debug!("Time-shift writer started");

        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.source.read(&mut buf, self.read_timeout) => outcome,
            };

            match outcome {
                ReadOutcome::Data(n) => match self.store(&buf[..n]).await {
                    Stored::All => {}
                    Stored::Cancelled => break,
                    Stored::CacheFailed => {
                        warn!("Cache keeps refusing writes, stopping writer");
                        self.shared.finish(SourceEnd::Failed(ReadErrorKind::Producer));
                        break;
                    }
                },
                ReadOutcome::Stalled => trace!("Source stalled"),
                ReadOutcome::Eof => {
                    info!("Source reached end of stream");
                    self.shared.finish(SourceEnd::Eof);
                    break;
                }
                ReadOutcome::Error(kind) => {
                    warn!("Source read failed: {:?}", kind);
                    self.shared.finish(SourceEnd::Failed(kind));
                    break;
                }
            }
        }

        debug!("Time-shift writer stopped");
    }

    /// Writes all of `data`, waiting for space when the cache is full.
    ///
    /// A full cache is waited on indefinitely. A cache whose failure
    /// counters keep rising is given up on after `MAX_WRITE_FAILURES`.
    async fn store(&self, mut data: &[u8]) -> Stored {
        let mut seen_failures = None;
        let mut failed_attempts = 0;

        while !data.is_empty() {
            let cache = self.shared.cache();
            let n = cache.write(data);
            if n > 0 {
                data = &data[n..];
                failed_attempts = 0;
                self.shared
                    .bytes_written
                    .fetch_add(n as u64, Ordering::AcqRel);
                self.shared.data_written.notify_waiters();
                continue;
            }

            let failures = cache.stats().write_failures();
            if seen_failures.is_some_and(|seen| failures > seen) {
                failed_attempts += 1;
                debug!("Cache write failed ({} in a row)", failed_attempts);
                if failed_attempts >= MAX_WRITE_FAILURES {
                    return Stored::CacheFailed;
                }
            }
            seen_failures = Some(failures);

            tokio::select! {
                _ = self.cancel.cancelled() => return Stored::Cancelled,
                _ = self.shared.space_freed.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        Stored::All
    }
}

/// Result of handing one source read to the cache.
enum Stored {
    All,
    Cancelled,
    CacheFailed,
}
