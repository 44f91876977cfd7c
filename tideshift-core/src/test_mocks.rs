//! In-memory transport for exercising readers without a network.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::input::{InputBufferError, SourceHandle, SourceOpener};

/// Behaviour of a registered mock URL.
#[derive(Debug, Clone)]
enum MockSource {
    /// Serves `data`, at most `chunk_size` bytes per read
    Static { data: Bytes, chunk_size: usize },
    /// Serves `data` in `chunk_size` pieces with a delay before each
    Paced {
        data: Bytes,
        chunk_size: usize,
        interval: Duration,
    },
    /// Opens fine but never produces a byte
    Stalled,
    /// Opens fine but every read fails
    Failing,
}

/// Source opener serving registered URLs from memory.
///
/// Cloning shares the registry, so a test can keep a handle and replace a
/// URL's content (for example a live playlist) after the opener has been
/// handed to a reader.
#[derive(Debug, Clone, Default)]
pub struct MockSourceOpener {
    sources: Arc<Mutex<HashMap<String, MockSource>>>,
    opens: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockSourceOpener {
    /// Creates an opener with no registered URLs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces `url` with static content.
    pub fn add_source(&self, url: &str, data: impl Into<Bytes>) {
        self.insert(
            url,
            MockSource::Static {
                data: data.into(),
                chunk_size: usize::MAX,
            },
        );
    }

    /// Registers `url` with content delivered `chunk_size` bytes every `interval`.
    pub fn add_paced_source(
        &self,
        url: &str,
        data: impl Into<Bytes>,
        chunk_size: usize,
        interval: Duration,
    ) {
        self.insert(
            url,
            MockSource::Paced {
                data: data.into(),
                chunk_size: chunk_size.max(1),
                interval,
            },
        );
    }

    /// Registers `url` as a source whose reads never complete.
    pub fn add_stalled_source(&self, url: &str) {
        self.insert(url, MockSource::Stalled);
    }

    /// Registers `url` as a source whose reads always fail.
    pub fn add_failing_source(&self, url: &str) {
        self.insert(url, MockSource::Failing);
    }

    /// Unregisters `url`; later opens fail.
    pub fn remove_source(&self, url: &str) {
        self.sources.lock().remove(url);
    }

    /// Number of successful opens of `url`.
    pub fn open_count(&self, url: &str) -> usize {
        self.opens.lock().get(url).copied().unwrap_or(0)
    }

    fn insert(&self, url: &str, source: MockSource) {
        self.sources.lock().insert(url.to_string(), source);
    }
}

#[async_trait]
impl SourceOpener for MockSourceOpener {
    async fn open(&self, url: &str) -> Result<Box<dyn SourceHandle>, InputBufferError> {
        let source = self
            .sources
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| InputBufferError::Open {
                url: url.to_string(),
                reason: "no such mock source".to_string(),
            })?;
        *self.opens.lock().entry(url.to_string()).or_default() += 1;

        Ok(Box::new(MockHandle {
            source,
            position: 0,
        }))
    }
}

struct MockHandle {
    source: MockSource,
    position: u64,
}

impl MockHandle {
    fn copy_from(&mut self, data: &Bytes, chunk_size: usize, buf: &mut [u8]) -> usize {
        let start = (self.position as usize).min(data.len());
        let n = buf.len().min(chunk_size).min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        n
    }
}

#[async_trait]
impl SourceHandle for MockHandle {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.source.clone() {
            MockSource::Static { data, chunk_size } => Ok(self.copy_from(&data, chunk_size, buf)),
            MockSource::Paced {
                data,
                chunk_size,
                interval,
            } => {
                tokio::time::sleep(interval).await;
                Ok(self.copy_from(&data, chunk_size, buf))
            }
            MockSource::Stalled => std::future::pending().await,
            MockSource::Failing => Err(io::Error::other("mock source failure")),
        }
    }

    async fn seek(&mut self, offset: u64) -> io::Result<u64> {
        match &self.source {
            MockSource::Static { data, .. } | MockSource::Paced { data, .. } => {
                self.position = offset.min(data.len() as u64);
                Ok(self.position)
            }
            MockSource::Stalled | MockSource::Failing => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "mock source is not seekable",
            )),
        }
    }

    fn size(&self) -> Option<u64> {
        match &self.source {
            MockSource::Static { data, .. } | MockSource::Paced { data, .. } => {
                Some(data.len() as u64)
            }
            MockSource::Stalled | MockSource::Failing => None,
        }
    }

    fn position(&self) -> u64 {
        self.position
    }
}
