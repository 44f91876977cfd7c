//! Direct source reader for live TS streams and local caches.

use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    InputBuffer, InputBufferError, ReadErrorKind, ReadOutcome, SourceHandle, SourceOpener,
};
use crate::cache::CacheBuffer;
use crate::config::NetworkConfig;

const UNKNOWN_SIZE: u64 = u64::MAX;

/// Reader that proxies either an open transport handle or a shared cache.
pub struct DirectBuffer {
    mode: Mode,
    abort: CancellationToken,
    poll_interval: Duration,
}

enum Mode {
    Network(Transport),
    Cache(Arc<dyn CacheBuffer>),
}

/// An open handle plus the bookkeeping readers need without taking its lock.
pub(super) struct Transport {
    opener: Arc<dyn SourceOpener>,
    url: parking_lot::Mutex<String>,
    handle: tokio::sync::Mutex<Box<dyn SourceHandle>>,
    position: AtomicU64,
    size: AtomicU64,
}

impl Transport {
    async fn open(opener: Arc<dyn SourceOpener>, url: &str) -> Result<Self, InputBufferError> {
        let handle = opener.open(url).await?;
        Ok(Self {
            opener,
            url: parking_lot::Mutex::new(url.to_string()),
            position: AtomicU64::new(handle.position()),
            size: AtomicU64::new(handle.size().unwrap_or(UNKNOWN_SIZE)),
            handle: tokio::sync::Mutex::new(handle),
        })
    }

    fn sync_from(&self, handle: &dyn SourceHandle) {
        self.position.store(handle.position(), Ordering::Release);
        self.size
            .store(handle.size().unwrap_or(UNKNOWN_SIZE), Ordering::Release);
    }

    pub(super) fn size(&self) -> Option<u64> {
        match self.size.load(Ordering::Acquire) {
            UNKNOWN_SIZE => None,
            size => Some(size),
        }
    }

    pub(super) fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub(super) fn url(&self) -> String {
        self.url.lock().clone()
    }

    async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut handle = self.handle.lock().await;
        let n = handle.read(buf).await?;
        self.position.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    /// Moves the handle to an absolute offset, reopening the URL at that
    /// offset when the handle itself cannot seek.
    pub(super) async fn seek_to(&self, offset: u64) -> Result<u64, InputBufferError> {
        let mut handle = self.handle.lock().await;
        match handle.seek(offset).await {
            Ok(_) => {}
            Err(e) => {
                let url = self.url();
                debug!("Seek on {} failed ({}), reopening at {}", url, e, offset);
                *handle = self.opener.open_at(&url, offset).await?;
            }
        }
        self.sync_from(handle.as_ref());
        Ok(handle.position())
    }

    async fn replace(&self, url: &str) -> Result<(), InputBufferError> {
        let fresh = self.opener.open(url).await?;
        let mut handle = self.handle.lock().await;
        *handle = fresh;
        self.sync_from(handle.as_ref());
        *self.url.lock() = url.to_string();
        Ok(())
    }
}

impl DirectBuffer {
    /// Opens `url` through `opener` and proxies reads to the handle.
    ///
    /// Malformed URLs and unsupported schemes fail here, before any
    /// background work exists.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::InvalidUrl` - If the URL is rejected
    /// - `InputBufferError::Open` - If the transport cannot open it
    pub async fn open(
        url: &str,
        opener: Arc<dyn SourceOpener>,
        config: &NetworkConfig,
    ) -> Result<Self, InputBufferError> {
        let transport = Transport::open(opener, url).await?;
        info!("Opened direct source {}", url);
        Ok(Self {
            mode: Mode::Network(transport),
            abort: CancellationToken::new(),
            poll_interval: config.poll_interval,
        })
    }

    /// Reads from a cache filled by another producer, polling every
    /// `poll_interval` until data arrives.
    pub fn with_cache(cache: Arc<dyn CacheBuffer>, config: &NetworkConfig) -> Self {
        Self {
            mode: Mode::Cache(cache),
            abort: CancellationToken::new(),
            poll_interval: config.poll_interval,
        }
    }

    pub(super) fn transport(&self) -> Option<&Transport> {
        match &self.mode {
            Mode::Network(transport) => Some(transport),
            Mode::Cache(_) => None,
        }
    }

    /// URL currently backing the reader, `None` in cache mode.
    pub fn url(&self) -> Option<String> {
        self.transport().map(Transport::url)
    }

    async fn read_network(
        &self,
        transport: &Transport,
        buf: &mut [u8],
        timeout: Duration,
    ) -> ReadOutcome {
        tokio::select! {
            _ = self.abort.cancelled() => ReadOutcome::Error(ReadErrorKind::Aborted),
            result = tokio::time::timeout(timeout, transport.read(buf)) => match result {
                Err(_) => ReadOutcome::Stalled,
                Ok(Ok(0)) => ReadOutcome::Eof,
                Ok(Ok(n)) => ReadOutcome::Data(n),
                Ok(Err(e)) => {
                    warn!("Read from {} failed: {}", transport.url(), e);
                    ReadOutcome::Error(ReadErrorKind::Io)
                }
            },
        }
    }

    async fn read_cache(
        &self,
        cache: &dyn CacheBuffer,
        buf: &mut [u8],
        timeout: Duration,
    ) -> ReadOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let n = cache.read(buf);
            if n > 0 {
                return ReadOutcome::Data(n);
            }
            if self.abort.is_cancelled() {
                return ReadOutcome::Error(ReadErrorKind::Aborted);
            }

            let now = Instant::now();
            if now >= deadline {
                return ReadOutcome::Stalled;
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.abort.cancelled() => return ReadOutcome::Error(ReadErrorKind::Aborted),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

/// Resolves a whence-relative seek against the handle's position and size.
pub(super) fn resolve_seek(
    pos: SeekFrom,
    position: u64,
    size: Option<u64>,
) -> Result<u64, InputBufferError> {
    let target = match pos {
        SeekFrom::Start(offset) => i128::from(offset),
        SeekFrom::Current(delta) => i128::from(position) + i128::from(delta),
        SeekFrom::End(delta) => {
            let size = size.ok_or(InputBufferError::Unsupported {
                operation: "seek from end of unsized source",
            })?;
            i128::from(size) + i128::from(delta)
        }
    };

    if target < 0 {
        return Err(InputBufferError::Seek {
            reason: format!("target {target} is before the start of the source"),
        });
    }
    let target = u64::try_from(target).map_err(|_| InputBufferError::Seek {
        reason: format!("target {target} is out of range"),
    })?;
    Ok(size.map_or(target, |size| target.min(size)))
}

#[async_trait]
impl InputBuffer for DirectBuffer {
    fn length(&self) -> Option<u64> {
        match &self.mode {
            Mode::Network(_) => None,
            Mode::Cache(cache) => cache.length(),
        }
    }

    fn position(&self) -> Option<u64> {
        match &self.mode {
            Mode::Network(_) => None,
            Mode::Cache(cache) => cache.position(),
        }
    }

    async fn read(&self, buf: &mut [u8], timeout: Duration) -> ReadOutcome {
        if buf.is_empty() {
            return ReadOutcome::Data(0);
        }
        if self.abort.is_cancelled() {
            return ReadOutcome::Error(ReadErrorKind::Aborted);
        }
        match &self.mode {
            Mode::Network(transport) => self.read_network(transport, buf, timeout).await,
            Mode::Cache(cache) => self.read_cache(cache.as_ref(), buf, timeout).await,
        }
    }

    async fn seek(&self, pos: SeekFrom) -> Result<u64, InputBufferError> {
        match &self.mode {
            Mode::Network(transport) => {
                let target = resolve_seek(pos, transport.position(), transport.size())?;
                transport.seek_to(target).await
            }
            Mode::Cache(cache) => cache.seek(pos).map_err(|e| InputBufferError::Seek {
                reason: e.to_string(),
            }),
        }
    }

    async fn switch_stream(&self, url: &str) -> Result<(), InputBufferError> {
        match &self.mode {
            Mode::Network(transport) => {
                transport.replace(url).await?;
                info!("Direct source switched to {}", url);
                Ok(())
            }
            Mode::Cache(_) => Err(InputBufferError::Unsupported {
                operation: "switch_stream on a cache reader",
            }),
        }
    }

    fn abort_read(&self) {
        self.abort.cancel();
    }
}

impl Drop for DirectBuffer {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}
