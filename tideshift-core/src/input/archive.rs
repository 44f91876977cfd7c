//! Seekable reader for recorded (archive) programmes.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::direct::resolve_seek;
use super::{DirectBuffer, InputBuffer, InputBufferError, ReadOutcome, SourceOpener};
use crate::config::NetworkConfig;

/// Direct reader whose length and position come from the transport itself.
///
/// Archive recordings have a known size, so seeking from the end works and
/// a seek that the open handle cannot satisfy reopens the URL at the target
/// offset.
pub struct ArchiveBuffer {
    inner: DirectBuffer,
}

impl ArchiveBuffer {
    /// Opens an archive recording.
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
        let inner = DirectBuffer::open(url, opener, config).await?;
        debug!("Archive source {} has size {:?}", url, inner.transport().and_then(|t| t.size()));
        Ok(Self { inner })
    }
}

#[async_trait]
impl InputBuffer for ArchiveBuffer {
    fn length(&self) -> Option<u64> {
        self.inner.transport().and_then(|transport| transport.size())
    }

    fn position(&self) -> Option<u64> {
        self.inner.transport().map(|transport| transport.position())
    }

    async fn read(&self, buf: &mut [u8], timeout: Duration) -> ReadOutcome {
        self.inner.read(buf, timeout).await
    }

    async fn seek(&self, pos: SeekFrom) -> Result<u64, InputBufferError> {
        let Some(transport) = self.inner.transport() else {
            return Err(InputBufferError::Unsupported {
                operation: "seek without a transport",
            });
        };
        let target = resolve_seek(pos, transport.position(), transport.size())?;
        transport.seek_to(target).await
    }

    async fn switch_stream(&self, url: &str) -> Result<(), InputBufferError> {
        self.inner.switch_stream(url).await
    }

    fn abort_read(&self) {
        self.inner.abort_read();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mocks::MockSourceOpener;

    fn recording() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 256) as u8).collect()
    }

    async fn open_recording() -> ArchiveBuffer {
        let opener = MockSourceOpener::new();
        opener.add_source("mock://archive", recording());
        let config = crate::config::TideshiftConfig::for_testing().network;
        ArchiveBuffer::open("mock://archive", Arc::new(opener), &config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_length_and_position_track_transport() {
        let archive = open_recording().await;
        assert_eq!(archive.length(), Some(1000));
        assert_eq!(archive.position(), Some(0));

        let mut buf = [0u8; 100];
        let n = archive.read(&mut buf, Duration::from_millis(100)).await.bytes();
        assert_eq!(archive.position(), Some(n as u64));
    }

    #[tokio::test]
    async fn test_seek_variants() {
        let archive = open_recording().await;
        let data = recording();

        assert_eq!(archive.seek(SeekFrom::End(-10)).await.unwrap(), 990);
        let mut buf = [0u8; 10];
        let n = archive.read(&mut buf, Duration::from_millis(100)).await.bytes();
        assert_eq!(&buf[..n], &data[990..990 + n]);

        assert_eq!(archive.seek(SeekFrom::Start(100)).await.unwrap(), 100);
        assert_eq!(archive.seek(SeekFrom::Current(50)).await.unwrap(), 150);
        let n = archive.read(&mut buf, Duration::from_millis(100)).await.bytes();
        assert_eq!(&buf[..n], &data[150..150 + n]);
    }

    #[tokio::test]
    async fn test_seek_before_start_rejected() {
        let archive = open_recording().await;
        assert!(matches!(
            archive.seek(SeekFrom::Current(-1)).await,
            Err(InputBufferError::Seek { .. })
        ));
    }
}
