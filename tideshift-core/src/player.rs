//! Channel playback with stream failover.
//!
//! A channel is a list of alternative URLs. Opening one routes each URL to
//! the matching source reader, wraps it in a time-shift buffer and keeps the
//! first candidate that produces data. Recorded programmes open through
//! [`ChannelPlayer::open_archive`] and seek in the source itself. Closed
//! channels are torn down on the action queue so the caller never waits for
//! a producer to wind down.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::action_queue::ActionQueue;
use crate::cache::{
    CacheBuffer, CacheBufferError, CacheStats, FileCacheBuffer, MemoryCacheBuffer,
    SimpleCyclicBuffer,
};
use crate::config::{CacheBackend, MEMORY_UNIT_SIZE, TideshiftConfig};
use crate::input::{
    ArchiveBuffer, DirectBuffer, InputBuffer, InputBufferError, ReadOutcome, SourceOpener,
};
use crate::playlist::{PlaylistBuffer, PlaylistBufferDelegate};
use crate::timeshift::TimeshiftBuffer;
use crate::TideshiftError;

/// Receives user-facing failure messages.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        warn!("{}", message);
    }
}

struct OpenChannel {
    name: String,
    url: String,
    buffer: ChannelBuffer,
}

enum ChannelBuffer {
    /// Live stream played through the time-shift window
    Live(TimeshiftBuffer),
    /// Recording read and sought directly from its source
    Archive(Arc<dyn InputBuffer>),
}

impl ChannelBuffer {
    fn input(&self) -> &dyn InputBuffer {
        match self {
            ChannelBuffer::Live(buffer) => buffer,
            ChannelBuffer::Archive(source) => source.as_ref(),
        }
    }

    fn timeshift(&self) -> Result<&TimeshiftBuffer, TideshiftError> {
        match self {
            ChannelBuffer::Live(buffer) => Ok(buffer),
            ChannelBuffer::Archive(_) => Err(InputBufferError::Unsupported {
                operation: "time-shift cache on an archive",
            }
            .into()),
        }
    }
}

/// Plays one channel at a time through a time-shift buffer.
pub struct ChannelPlayer {
    opener: Arc<dyn SourceOpener>,
    notifier: Arc<dyn Notifier>,
    config: TideshiftConfig,
    channel: RwLock<Option<Arc<OpenChannel>>>,
    teardown: ActionQueue,
}

impl ChannelPlayer {
    /// Creates a player and starts its teardown queue.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::ActionQueue` - If the teardown thread cannot start
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        notifier: Arc<dyn Notifier>,
        config: TideshiftConfig,
    ) -> Result<Self, TideshiftError> {
        Ok(Self {
            opener,
            notifier,
            config,
            channel: RwLock::new(None),
            teardown: ActionQueue::start("tideshift-teardown")?,
        })
    }

    /// Opens the reader matching `url`.
    ///
    /// Paths ending in `.m3u` or `.m3u8` are played as segmented playlists,
    /// everything else as a single transport stream.
    ///
    /// # Errors
    ///
    /// Any error raised by the chosen reader while opening.
    pub async fn open_source(&self, url: &str) -> Result<Arc<dyn InputBuffer>, InputBufferError> {
        if is_playlist_url(url) {
            debug!("Opening {} as playlist", url);
            let buffer =
                PlaylistBuffer::open(url, Arc::clone(&self.opener), None, &self.config).await?;
            Ok(Arc::new(buffer))
        } else {
            debug!("Opening {} as direct stream", url);
            let buffer =
                DirectBuffer::open(url, Arc::clone(&self.opener), &self.config.network).await?;
            Ok(Arc::new(buffer))
        }
    }

    /// Builds the chunk store for a new channel.
    ///
    /// # Errors
    ///
    /// - `CacheBufferError::CreateDirectory` - If the file cache directory cannot be created
    /// - `CacheBufferError::InvalidGeometry` - If the configured sizes are unusable
    pub fn create_cache(&self) -> Result<Arc<dyn CacheBuffer>, CacheBufferError> {
        let cache = &self.config.cache;
        if !cache.timeshift_enabled {
            return Ok(Arc::new(SimpleCyclicBuffer::new(
                MEMORY_UNIT_SIZE,
                cache.cyclic_unit_count(),
            )?));
        }

        match cache.backend {
            CacheBackend::Memory => Ok(Arc::new(MemoryCacheBuffer::new(
                cache.memory_size_factor(),
            )?)),
            CacheBackend::File => Ok(Arc::new(FileCacheBuffer::new(
                &cache.cache_dir,
                cache.file_chunk_size,
                cache.timeshift_buffer_size,
            )?)),
        }
    }

    /// Opens `name`, trying each URL until one produces data.
    ///
    /// Any channel already open is closed first.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::NoAlternativeStream` - If every URL failed; the
    ///   notifier has been told once
    pub async fn open_channel<S: AsRef<str>>(
        &self,
        name: &str,
        urls: &[S],
    ) -> Result<(), TideshiftError> {
        self.close_channel();

        for url in urls.iter().map(AsRef::as_ref) {
            match self.start_buffer(url).await {
                Ok(buffer) => {
                    info!("Channel {} playing from {}", name, url);
                    self.install(name, url, ChannelBuffer::Live(buffer));
                    return Ok(());
                }
                Err(e) => warn!("Channel {} failed on {}: {}", name, url, e),
            }
        }

        self.notifier
            .notify(&format!("No alternative stream for channel {name}"));
        Err(TideshiftError::NoAlternativeStream {
            channel: name.to_string(),
        })
    }

    async fn start_buffer(&self, url: &str) -> Result<TimeshiftBuffer, TideshiftError> {
        let source = self.open_source(url).await?;
        let cache = self.create_cache()?;
        Ok(TimeshiftBuffer::start(source, cache, &self.config).await?)
    }

    /// Opens a recorded programme, closing any open channel first.
    ///
    /// Playlist URLs play through a [`PlaylistBuffer`] that seeks by asking
    /// `delegate` for the archive URL of the target time; without a delegate
    /// the playlist is forward-only. Any other URL is read as one seekable
    /// recording and `delegate` is not used. Archives bypass the time-shift
    /// cache.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::Input` - If the recording cannot be opened; the
    ///   notifier has been told
    pub async fn open_archive(
        &self,
        name: &str,
        url: &str,
        delegate: Option<Arc<dyn PlaylistBufferDelegate>>,
    ) -> Result<(), TideshiftError> {
        self.close_channel();

        let opened: Result<Arc<dyn InputBuffer>, InputBufferError> = if is_playlist_url(url) {
            PlaylistBuffer::open(url, Arc::clone(&self.opener), delegate, &self.config)
                .await
                .map(|buffer| Arc::new(buffer) as Arc<dyn InputBuffer>)
        } else {
            ArchiveBuffer::open(url, Arc::clone(&self.opener), &self.config.network)
                .await
                .map(|buffer| Arc::new(buffer) as Arc<dyn InputBuffer>)
        };

        match opened {
            Ok(source) => {
                info!("Archive {} playing from {}", name, url);
                self.install(name, url, ChannelBuffer::Archive(source));
                Ok(())
            }
            Err(e) => {
                warn!("Archive {} failed on {}: {}", name, url, e);
                self.notifier
                    .notify(&format!("Recording of {name} is unavailable"));
                Err(e.into())
            }
        }
    }

    fn install(&self, name: &str, url: &str, buffer: ChannelBuffer) {
        *self.channel.write() = Some(Arc::new(OpenChannel {
            name: name.to_string(),
            url: url.to_string(),
            buffer,
        }));
    }

    /// Closes the open channel, if any.
    ///
    /// Pending reads are aborted here; the buffer itself is dropped on the
    /// teardown queue.
    pub fn close_channel(&self) {
        let Some(channel) = self.channel.write().take() else {
            return;
        };
        channel.buffer.input().abort_read();

        let name = channel.name.clone();
        let queued = self.teardown.perform_async(
            move || {
                drop(channel);
                Ok(())
            },
            move |status| debug!("Channel {} teardown: {:?}", name, status),
        );
        if let Err(e) = queued {
            warn!("Channel dropped inline: {}", e);
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.read().is_some()
    }

    /// Name of the open channel.
    pub fn channel_name(&self) -> Option<String> {
        self.channel.read().as_ref().map(|c| c.name.clone())
    }

    /// URL the open channel is playing from.
    pub fn stream_url(&self) -> Option<String> {
        self.channel.read().as_ref().map(|c| c.url.clone())
    }

    fn current(&self) -> Result<Arc<OpenChannel>, TideshiftError> {
        self.channel
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(TideshiftError::NoOpenChannel)
    }

    /// Reads from the open channel's time-shift window.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::NoOpenChannel` - If no channel is open
    pub async fn read(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<ReadOutcome, TideshiftError> {
        let channel = self.current()?;
        Ok(channel.buffer.input().read(buf, timeout).await)
    }

    /// Seeks inside the time-shift window, or inside the recording for an
    /// archive.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::NoOpenChannel` - If no channel is open
    /// - `TideshiftError::Input` - If the window cannot serve the position
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64, TideshiftError> {
        let channel = self.current()?;
        Ok(channel.buffer.input().seek(pos).await?)
    }

    /// End of the time-shift window, or the recording size for an archive.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::NoOpenChannel` - If no channel is open
    pub fn length(&self) -> Result<Option<u64>, TideshiftError> {
        Ok(self.current()?.buffer.input().length())
    }

    /// Player position in the stream.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::NoOpenChannel` - If no channel is open
    pub fn position(&self) -> Result<Option<u64>, TideshiftError> {
        Ok(self.current()?.buffer.input().position())
    }

    /// Moves the open channel onto another chunk store and returns the old one.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::NoOpenChannel` - If no channel is open
    /// - `TideshiftError::Input` - If an archive is open
    pub fn swap_cache(
        &self,
        cache: Arc<dyn CacheBuffer>,
    ) -> Result<Arc<dyn CacheBuffer>, TideshiftError> {
        Ok(self.current()?.buffer.timeshift()?.swap_cache(cache))
    }

    /// Counters of the open channel's chunk store.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::NoOpenChannel` - If no channel is open
    /// - `TideshiftError::Input` - If an archive is open
    pub fn cache_stats(&self) -> Result<CacheStats, TideshiftError> {
        Ok(self.current()?.buffer.timeshift()?.cache().stats())
    }
}

impl Drop for ChannelPlayer {
    fn drop(&mut self) {
        self.close_channel();
    }
}

/// Whether the URL path names an M3U playlist. The query is ignored.
fn is_playlist_url(url: &str) -> bool {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    };
    let path = path.to_ascii_lowercase();
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}
