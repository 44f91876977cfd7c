//! Input buffer over an HLS playlist.

use std::io::SeekFrom;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::delegate::{PlaylistBufferDelegate, TimeshiftUrl};
use super::segment::MutableSegment;
use super::{Playlist, PlaylistCache};
use crate::config::TideshiftConfig;
use crate::input::{InputBuffer, InputBufferError, ReadErrorKind, ReadOutcome, SourceOpener};

/// Shortest pause between downloader iterations when nothing is pending.
const MIN_IDLE_DELAY: Duration = Duration::from_secs(1);

/// Pause before retrying a failed playlist reload.
const RELOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

const DOWNLOAD_BUFFER_SIZE: usize = 64 * 1024;

/// Reader presenting a segmented playlist as a continuous byte stream.
///
/// A background task downloads segments into a [`PlaylistCache`] while
/// reads consume them by byte offset. Seeking needs a
/// [`PlaylistBufferDelegate`] to map offsets to archive URLs; without one
/// the stream is forward-only.
pub struct PlaylistBuffer {
    opener: Arc<dyn SourceOpener>,
    delegate: Option<Arc<dyn PlaylistBufferDelegate>>,
    config: TideshiftConfig,
    session: RwLock<Arc<Session>>,
    /// Last non-zero bitrate, as `f64` bits; survives session restarts
    known_bitrate: AtomicU64,
    abort: CancellationToken,
}

/// One playlist URL with its cache and downloader.
struct Session {
    cache: Arc<PlaylistCache>,
    data_written: Arc<Notify>,
    consumed: Arc<AtomicU64>,
    base: u64,
    cancel: CancellationToken,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Session {
    /// Copies every ready byte from the current offset into `buf`.
    fn read_ready(&self, buf: &mut [u8]) -> usize {
        let mut position = self.consumed.load(Ordering::Acquire);
        let mut copied = 0;

        while copied < buf.len() {
            let Some(segment) = self.cache.segment_at(position) else {
                break;
            };
            let n = segment.read_at(position, &mut buf[copied..]);
            if n == 0 {
                break;
            }
            copied += n;
            position += n as u64;
        }

        self.consumed.store(position, Ordering::Release);
        copied
    }

    fn is_exhausted(&self) -> bool {
        self.cache
            .is_exhausted_at(self.consumed.load(Ordering::Acquire))
    }
}

impl PlaylistBuffer {
    /// Loads the playlist at `url` and starts downloading segments.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::Playlist` - If the playlist cannot be fetched or parsed
    pub async fn open(
        url: &str,
        opener: Arc<dyn SourceOpener>,
        delegate: Option<Arc<dyn PlaylistBufferDelegate>>,
        config: &TideshiftConfig,
    ) -> Result<Self, InputBufferError> {
        let session = start_session(url, 0, &opener, delegate.as_deref(), config).await?;
        Ok(Self {
            opener,
            delegate,
            config: config.clone(),
            session: RwLock::new(Arc::new(session)),
            known_bitrate: AtomicU64::new(0),
            abort: CancellationToken::new(),
        })
    }

    /// URL of the playlist currently being played.
    pub fn url(&self) -> String {
        self.session.read().cache.url().to_string()
    }

    /// Cache of the current session.
    pub fn cache(&self) -> Arc<PlaylistCache> {
        Arc::clone(&self.session.read().cache)
    }

    fn current(&self) -> Arc<Session> {
        Arc::clone(&self.session.read())
    }

    /// Bytes per second of the current session, or the last rate measured
    /// before a seek while the new session has no segment yet.
    pub fn bitrate(&self) -> f64 {
        let measured = self.current().cache.bitrate();
        if measured > 0.0 {
            self.known_bitrate
                .store(measured.to_bits(), Ordering::Release);
            return measured;
        }
        f64::from_bits(self.known_bitrate.load(Ordering::Acquire))
    }

    async fn restart(&self, url: &str, base: u64) -> Result<(), InputBufferError> {
        let fresh = start_session(
            url,
            base,
            &self.opener,
            self.delegate.as_deref(),
            &self.config,
        )
        .await?;
        let previous = std::mem::replace(&mut *self.session.write(), Arc::new(fresh));
        previous.cancel.cancel();
        Ok(())
    }
}

async fn start_session(
    url: &str,
    base: u64,
    opener: &Arc<dyn SourceOpener>,
    delegate: Option<&dyn PlaylistBufferDelegate>,
    config: &TideshiftConfig,
) -> Result<Session, InputBufferError> {
    let playlist = Playlist::load(url, Arc::clone(opener), &config.playlist).await?;
    let segment_limit = delegate.map(|d| d.segments_amount_to_cache().max(1));
    let cache = Arc::new(PlaylistCache::new(playlist, &config.playlist, segment_limit));

    let session = Session {
        cache: Arc::clone(&cache),
        data_written: Arc::new(Notify::new()),
        consumed: Arc::new(AtomicU64::new(0)),
        base,
        cancel: CancellationToken::new(),
    };

    let downloader = Downloader {
        cache,
        opener: Arc::clone(opener),
        data_written: Arc::clone(&session.data_written),
        consumed: Arc::clone(&session.consumed),
        cancel: session.cancel.clone(),
    };
    tokio::spawn(downloader.run());

    Ok(session)
}

/// Background task filling a session's cache.
struct Downloader {
    cache: Arc<PlaylistCache>,
    opener: Arc<dyn SourceOpener>,
    data_written: Arc<Notify>,
    consumed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

enum Download {
    Complete,
    Cancelled,
}

impl Downloader {
    async fn run(self) {
        debug!("Segment downloader started for {}", self.cache.url());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.cache.reload_playlist().await {
                warn!("Reloading {} failed: {}", self.cache.url(), e);
                if !self.pause(RELOAD_RETRY_DELAY).await {
                    break;
                }
                continue;
            }

            if self.cache.is_eof() {
                info!("Playlist {} fully downloaded", self.cache.url());
                self.data_written.notify_waiters();
                break;
            }

            let position = self.consumed.load(Ordering::Acquire);
            let idle = match self.cache.segment_to_fill_after(position) {
                Some(mut segment) => {
                    let half = segment.info().duration / 2;
                    match self.download(&mut segment).await {
                        Ok(Download::Complete) => {
                            self.cache.segment_ready(segment);
                            self.data_written.notify_waiters();
                        }
                        Ok(Download::Cancelled) => break,
                        Err(e) => {
                            warn!("Skipping segment {}: {}", segment.url(), e);
                            self.cache.abandon_segment(segment);
                        }
                    }
                    (!self.cache.has_pending()).then_some(half)
                }
                None => Some(self.cache.target_duration() / 2),
            };

            if let Some(delay) = idle {
                if self.cache.is_eof() {
                    continue;
                }
                if !self.pause(delay.max(MIN_IDLE_DELAY)).await {
                    break;
                }
            }
        }

        debug!("Segment downloader stopped for {}", self.cache.url());
    }

    /// Sleeps for `delay`; false when cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn download(&self, segment: &mut MutableSegment) -> Result<Download, InputBufferError> {
        let mut handle = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Download::Cancelled),
            handle = self.opener.open(segment.url()) => handle?,
        };

        let mut buf = vec![0u8; DOWNLOAD_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Download::Cancelled),
                read = handle.read(&mut buf) => read,
            };
            match read {
                Ok(0) => return Ok(Download::Complete),
                Ok(n) => segment.push(&buf[..n]),
                Err(e) => {
                    return Err(InputBufferError::Open {
                        url: segment.url().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl InputBuffer for PlaylistBuffer {
    fn length(&self) -> Option<u64> {
        let delegate = self.delegate.as_ref()?;
        let bitrate = self.bitrate();
        (bitrate > 0.0).then(|| (delegate.duration().as_secs_f64() * bitrate) as u64)
    }

    fn position(&self) -> Option<u64> {
        self.delegate.as_ref()?;
        let session = self.current();
        Some(session.base + session.consumed.load(Ordering::Acquire))
    }

    async fn read(&self, buf: &mut [u8], timeout: Duration) -> ReadOutcome {
        if self.abort.is_cancelled() {
            return ReadOutcome::Error(ReadErrorKind::Aborted);
        }
        if buf.is_empty() {
            return ReadOutcome::Data(0);
        }

        let session = self.current();
        let n = session.read_ready(buf);
        if n > 0 {
            return ReadOutcome::Data(n);
        }
        if session.is_exhausted() {
            return ReadOutcome::Eof;
        }

        let mut written = pin!(session.data_written.notified());
        written.as_mut().enable();

        // A segment may have landed before the waiter was registered
        let n = session.read_ready(buf);
        if n > 0 {
            return ReadOutcome::Data(n);
        }

        tokio::select! {
            _ = self.abort.cancelled() => return ReadOutcome::Error(ReadErrorKind::Aborted),
            _ = tokio::time::timeout(timeout, written) => {}
        }

        match session.read_ready(buf) {
            0 if session.is_exhausted() => ReadOutcome::Eof,
            0 => ReadOutcome::Stalled,
            n => ReadOutcome::Data(n),
        }
    }

    async fn seek(&self, pos: SeekFrom) -> Result<u64, InputBufferError> {
        let Some(delegate) = self.delegate.as_ref() else {
            return Err(InputBufferError::Unsupported {
                operation: "seek on a live playlist",
            });
        };

        let bitrate = self.bitrate();
        if bitrate <= 0.0 {
            return Err(InputBufferError::Seek {
                reason: "bitrate is not known yet".to_string(),
            });
        }

        let position = self.position().unwrap_or(0) as i128;
        let length = self.length().unwrap_or(0) as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => position + delta as i128,
            SeekFrom::End(delta) => length + delta as i128,
        };
        if target < 0 {
            return Err(InputBufferError::Seek {
                reason: format!("target {target} is before the start of the programme"),
            });
        }

        let requested = Duration::try_from_secs_f64(target as f64 / bitrate).map_err(|e| {
            InputBufferError::Seek {
                reason: format!("target {target} is out of range: {e}"),
            }
        })?;
        let TimeshiftUrl {
            url,
            adjusted_offset,
        } = delegate.url_for_timeshift(requested);
        let base = (adjusted_offset.as_secs_f64() * bitrate) as u64;

        info!(
            "Seeking to {:?} (archive offset {:?}) via {}",
            requested, adjusted_offset, url
        );
        self.restart(&url, base).await?;
        Ok(base)
    }

    async fn switch_stream(&self, url: &str) -> Result<(), InputBufferError> {
        self.restart(url, 0).await?;
        info!("Playlist source switched to {}", url);
        Ok(())
    }

    fn abort_read(&self) {
        self.abort.cancel();
    }
}
