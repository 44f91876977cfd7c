//! Transport seam between source readers and the network or filesystem.

use std::io::{self, SeekFrom};
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use url::Url;

use super::InputBufferError;
use crate::config::NetworkConfig;

/// An open byte stream positioned somewhere inside a remote or local resource.
#[async_trait]
pub trait SourceHandle: Send {
    /// Reads the next bytes, `Ok(0)` at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Repositions to an absolute byte offset.
    async fn seek(&mut self, offset: u64) -> io::Result<u64>;

    /// Total resource size when the transport reports one.
    fn size(&self) -> Option<u64>;

    /// Absolute offset of the next byte `read` returns.
    fn position(&self) -> u64;
}

/// Opens [`SourceHandle`]s for URLs.
#[async_trait]
pub trait SourceOpener: Send + Sync {
    /// Opens `url` positioned at its first byte.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::InvalidUrl` - If the URL cannot be parsed or its scheme is unsupported
    /// - `InputBufferError::Open` - If the transport fails to open the resource
    async fn open(&self, url: &str) -> Result<Box<dyn SourceHandle>, InputBufferError>;

    /// Opens `url` positioned at `offset`.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::Seek` - If the resource cannot be positioned at `offset`
    /// - Any error from [`SourceOpener::open`]
    async fn open_at(
        &self,
        url: &str,
        offset: u64,
    ) -> Result<Box<dyn SourceHandle>, InputBufferError> {
        let mut handle = self.open(url).await?;
        if offset > 0 {
            handle
                .seek(offset)
                .await
                .map_err(|e| InputBufferError::Seek {
                    reason: format!("{url} at {offset}: {e}"),
                })?;
        }
        Ok(handle)
    }

    /// Downloads the whole resource into memory.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::Open` - If reading the body fails part way
    /// - Any error from [`SourceOpener::open`]
    async fn fetch(&self, url: &str) -> Result<Bytes, InputBufferError> {
        let mut handle = self.open(url).await?;
        let mut body = BytesMut::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = handle
                .read(&mut buf)
                .await
                .map_err(|e| InputBufferError::Open {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            if n == 0 {
                return Ok(body.freeze());
            }
            body.extend_from_slice(&buf[..n]);
        }
    }
}

/// Where a source URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// `http://` or `https://` resource
    Http(Url),
    /// `file://` URL or bare filesystem path
    File(PathBuf),
}

impl SourceLocation {
    /// Classifies `url` without touching the network.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::InvalidUrl` - If `url` is empty, malformed or uses another scheme
    pub fn parse(url: &str) -> Result<Self, InputBufferError> {
        let invalid = |reason: String| InputBufferError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        if url.trim().is_empty() {
            return Err(invalid("empty URL".to_string()));
        }

        match Url::parse(url) {
            Ok(parsed) => match parsed.scheme() {
                "http" | "https" => Ok(SourceLocation::Http(parsed)),
                "file" => parsed
                    .to_file_path()
                    .map(SourceLocation::File)
                    .map_err(|_| invalid("file URL has no local path".to_string())),
                other => Err(invalid(format!("unsupported scheme '{other}'"))),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(SourceLocation::File(PathBuf::from(url)))
            }
            Err(e) => Err(invalid(e.to_string())),
        }
    }
}

/// Production opener: `reqwest` for HTTP(S), `tokio::fs` for local files.
#[derive(Clone)]
pub struct HttpSourceOpener {
    client: reqwest::Client,
}

impl HttpSourceOpener {
    /// Builds an HTTP client with the configured user agent.
    ///
    /// `http_timeout` bounds connecting and every single body read, so a
    /// server that stops sending fails the read instead of hanging it. Live
    /// streams never end, so there is no deadline for the whole response.
    ///
    /// # Errors
    ///
    /// - `InputBufferError::Open` - If the HTTP client cannot be initialized
    pub fn new(config: &NetworkConfig) -> Result<Self, InputBufferError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.http_timeout)
            .read_timeout(config.http_timeout)
            .build()
            .map_err(|e| InputBufferError::Open {
                url: String::new(),
                reason: format!("HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceOpener for HttpSourceOpener {
    async fn open(&self, url: &str) -> Result<Box<dyn SourceHandle>, InputBufferError> {
        self.open_at(url, 0).await
    }

    async fn open_at(
        &self,
        url: &str,
        offset: u64,
    ) -> Result<Box<dyn SourceHandle>, InputBufferError> {
        match SourceLocation::parse(url)? {
            SourceLocation::Http(parsed) => {
                let handle = HttpHandle::connect(self.client.clone(), parsed, offset).await?;
                Ok(Box::new(handle))
            }
            SourceLocation::File(path) => {
                let mut handle = FileHandle::open(&path)
                    .await
                    .map_err(|e| InputBufferError::Open {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;
                if offset > 0 {
                    handle
                        .seek(offset)
                        .await
                        .map_err(|e| InputBufferError::Seek {
                            reason: format!("{url} at {offset}: {e}"),
                        })?;
                }
                Ok(Box::new(handle))
            }
        }
    }
}

struct HttpHandle {
    client: reqwest::Client,
    url: Url,
    response: reqwest::Response,
    pending: Bytes,
    position: u64,
    size: Option<u64>,
}

impl HttpHandle {
    async fn connect(
        client: reqwest::Client,
        url: Url,
        offset: u64,
    ) -> Result<Self, InputBufferError> {
        let (response, size) = request(&client, &url, offset).await?;
        let mut handle = Self {
            client,
            url,
            response,
            pending: Bytes::new(),
            position: 0,
            size,
        };

        if offset > 0 {
            if handle.response.status() == StatusCode::PARTIAL_CONTENT {
                handle.position = offset;
            } else {
                debug!("{} ignored the range request, skipping {} bytes", handle.url, offset);
                handle
                    .skip_to(offset)
                    .await
                    .map_err(|e| InputBufferError::Seek {
                        reason: format!("{} at {}: {}", handle.url, offset, e),
                    })?;
            }
        }

        Ok(handle)
    }

    async fn next_chunk(&mut self) -> io::Result<bool> {
        match self.response.chunk().await.map_err(io::Error::other)? {
            Some(chunk) => {
                self.pending = chunk;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn skip_to(&mut self, offset: u64) -> io::Result<()> {
        while self.position < offset {
            if self.pending.is_empty() && !self.next_chunk().await? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before the requested offset",
                ));
            }
            let n = (offset - self.position).min(self.pending.len() as u64) as usize;
            self.pending.advance(n);
            self.position += n as u64;
        }
        Ok(())
    }
}

async fn request(
    client: &reqwest::Client,
    url: &Url,
    offset: u64,
) -> Result<(reqwest::Response, Option<u64>), InputBufferError> {
    let open_error = |reason: String| InputBufferError::Open {
        url: url.to_string(),
        reason,
    };

    let mut builder = client.get(url.clone());
    if offset > 0 {
        builder = builder.header(RANGE, format!("bytes={offset}-"));
    }

    let response = builder.send().await.map_err(|e| open_error(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(open_error(format!("HTTP {status}")));
    }

    let size = if status == StatusCode::PARTIAL_CONTENT {
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(content_range_total)
    } else {
        response.content_length()
    };

    Ok((response, size))
}

/// Total size from a `Content-Range: bytes a-b/total` header.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl SourceHandle for HttpHandle {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() && !self.next_chunk().await? {
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        self.position += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, offset: u64) -> io::Result<u64> {
        if offset == self.position {
            return Ok(offset);
        }
        let replacement = HttpHandle::connect(self.client.clone(), self.url.clone(), offset)
            .await
            .map_err(io::Error::other)?;
        *self = replacement;
        Ok(self.position)
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn position(&self) -> u64 {
        self.position
    }
}

struct FileHandle {
    file: File,
    position: u64,
    size: u64,
}

impl FileHandle {
    async fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file,
            position: 0,
            size,
        })
    }
}

#[async_trait]
impl SourceHandle for FileHandle {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf).await?;
        self.position += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, offset: u64) -> io::Result<u64> {
        self.position = self.file.seek(SeekFrom::Start(offset)).await?;
        Ok(self.position)
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_location_classification() {
        assert!(matches!(
            SourceLocation::parse("http://example.com/live.ts"),
            Ok(SourceLocation::Http(_))
        ));
        assert!(matches!(
            SourceLocation::parse("https://example.com/live.ts"),
            Ok(SourceLocation::Http(_))
        ));
        assert_eq!(
            SourceLocation::parse("file:///tmp/stream.ts").unwrap(),
            SourceLocation::File(PathBuf::from("/tmp/stream.ts"))
        );
        assert_eq!(
            SourceLocation::parse("/tmp/stream.ts").unwrap(),
            SourceLocation::File(PathBuf::from("/tmp/stream.ts"))
        );
    }

    #[test]
    fn test_invalid_locations_rejected() {
        for url in ["", "   ", "rtsp://camera/stream", "http://[::1"] {
            assert!(
                matches!(
                    SourceLocation::parse(url),
                    Err(InputBufferError::InvalidUrl { .. })
                ),
                "{url:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 100-199/5000"), Some(5000));
        assert_eq!(content_range_total("bytes 100-199/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }

    #[tokio::test]
    async fn test_file_source_reads_and_seeks() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("stream.ts");
        std::fs::write(&path, b"0123456789").unwrap();

        let opener = HttpSourceOpener::new(&NetworkConfig::default()).unwrap();
        let mut handle = opener.open(path.to_str().unwrap()).await.unwrap();
        assert_eq!(handle.size(), Some(10));

        let mut buf = [0u8; 4];
        assert_eq!(handle.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(handle.position(), 4);

        handle.seek(8).await.unwrap();
        assert_eq!(handle.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(handle.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_source_open_at_and_fetch() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("playlist.m3u8");
        std::fs::write(&path, b"#EXTM3U\n").unwrap();
        let url = Url::from_file_path(&path).unwrap().to_string();

        let opener = HttpSourceOpener::new(&NetworkConfig::default()).unwrap();
        let handle = opener.open_at(&url, 3).await.unwrap();
        assert_eq!(handle.position(), 3);

        let body = opener.fetch(&url).await.unwrap();
        assert_eq!(&body[..], b"#EXTM3U\n");
    }

    #[tokio::test]
    async fn test_missing_file_fails_to_open() {
        let opener = HttpSourceOpener::new(&NetworkConfig::default()).unwrap();
        let result = opener.open("/nonexistent/tideshift/stream.ts").await;
        assert!(matches!(result, Err(InputBufferError::Open { .. })));
    }

    #[tokio::test]
    async fn test_stalled_http_body_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\nhead")
                .await
                .unwrap();
            // Keep the connection open without sending the rest
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = crate::config::TideshiftConfig::for_testing().network;
        config.http_timeout = Duration::from_millis(200);
        let opener = HttpSourceOpener::new(&config).unwrap();
        let mut handle = opener.open(&format!("http://{addr}/live.ts")).await.unwrap();
        assert_eq!(handle.size(), Some(1000));

        let mut buf = [0u8; 64];
        assert_eq!(handle.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"head");

        let stalled = tokio::time::timeout(Duration::from_secs(5), handle.read(&mut buf))
            .await
            .unwrap();
        assert!(stalled.is_err());
    }
}
