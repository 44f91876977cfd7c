//! Integration tests for channel playback.
//!
//! These tests drive the public reader, time-shift and player APIs against
//! an in-memory transport: live pause and rewind, growing live playlists,
//! archive seeking through a delegate, archive channels on the player and
//! cache swapping mid-stream.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tideshift_core::cache::{CacheBuffer, FileCacheBuffer, MemoryCacheBuffer};
use tideshift_core::config::TideshiftConfig;
use tideshift_core::input::{DirectBuffer, InputBuffer, ReadOutcome};
use tideshift_core::player::{ChannelPlayer, LogNotifier};
use tideshift_core::playlist::{PlaylistBuffer, TemplateArchiveDelegate};
use tideshift_core::test_mocks::MockSourceOpener;
use tideshift_core::timeshift::TimeshiftBuffer;
use tokio::time::Instant;

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const TEST_DEADLINE: Duration = Duration::from_secs(10);

/// Shared opener and configuration for a playback scenario.
struct PlaybackFixture {
    opener: MockSourceOpener,
    config: TideshiftConfig,
}

impl PlaybackFixture {
    fn new() -> Self {
        Self {
            opener: MockSourceOpener::new(),
            config: TideshiftConfig::for_testing(),
        }
    }

    fn memory_cache(&self) -> Arc<dyn CacheBuffer> {
        Arc::new(MemoryCacheBuffer::new(self.config.cache.memory_size_factor()).unwrap())
    }

    async fn timeshift_direct(&self, url: &str) -> TimeshiftBuffer {
        let source = DirectBuffer::open(url, Arc::new(self.opener.clone()), &self.config.network)
            .await
            .unwrap();
        TimeshiftBuffer::start(Arc::new(source), self.memory_cache(), &self.config)
            .await
            .unwrap()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Reads until `Eof`, tolerating stalls until the test deadline.
async fn read_to_end(buffer: &dyn InputBuffer) -> Vec<u8> {
    let deadline = Instant::now() + TEST_DEADLINE;
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];

    while Instant::now() < deadline {
        match buffer.read(&mut buf, READ_TIMEOUT).await {
            ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
            ReadOutcome::Stalled => continue,
            ReadOutcome::Eof => return out,
            ReadOutcome::Error(kind) => panic!("read failed: {kind:?}"),
        }
    }
    panic!("stream did not end, got {} bytes", out.len());
}

/// Reads until at least `len` bytes arrived.
async fn read_at_least(buffer: &dyn InputBuffer, len: usize) -> Vec<u8> {
    let deadline = Instant::now() + TEST_DEADLINE;
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];

    while out.len() < len && Instant::now() < deadline {
        match buffer.read(&mut buf, READ_TIMEOUT).await {
            ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
            ReadOutcome::Stalled => continue,
            other => panic!("unexpected outcome {other:?} after {} bytes", out.len()),
        }
    }
    assert!(out.len() >= len, "only {} of {} bytes arrived", out.len(), len);
    out
}

#[tokio::test]
async fn test_pause_and_rewind_live_stream() {
    let fixture = PlaybackFixture::new();
    let data = pattern(10_000);
    fixture.opener.add_paced_source(
        "mock://live/ch1",
        data.clone(),
        500,
        Duration::from_millis(10),
    );

    let buffer = fixture.timeshift_direct("mock://live/ch1").await;
    let head = read_at_least(&buffer, 1).await;

    // Paused while the writer keeps filling the window
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(buffer.length(), Some(10_000));
    assert_eq!(buffer.position(), Some(head.len() as u64));

    let rest = read_to_end(&buffer).await;
    assert_eq!([head, rest].concat(), data);

    assert_eq!(buffer.seek(SeekFrom::Start(0)).await.unwrap(), 0);
    assert_eq!(read_to_end(&buffer).await, data);

    assert_eq!(buffer.seek(SeekFrom::End(-100)).await.unwrap(), 9_900);
    assert_eq!(read_to_end(&buffer).await, &data[9_900..]);
}

#[tokio::test]
async fn test_growing_live_playlist_ends_with_endlist() {
    let fixture = PlaybackFixture::new();
    let playlist = "mock://hls/live.m3u8";
    fixture.opener.add_source(
        playlist,
        "#EXTM3U
#EXT-X-TARGETDURATION:2
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:2.0,
seg0.ts
#EXTINF:2.0,
seg1.ts
",
    );
    for index in 0..3u8 {
        fixture
            .opener
            .add_source(&format!("mock://hls/seg{index}.ts"), vec![index; 400]);
    }

    let source = PlaylistBuffer::open(
        playlist,
        Arc::new(fixture.opener.clone()),
        None,
        &fixture.config,
    )
    .await
    .unwrap();
    let buffer = TimeshiftBuffer::start(Arc::new(source), fixture.memory_cache(), &fixture.config)
        .await
        .unwrap();

    let first = read_at_least(&buffer, 800).await;
    assert_eq!(first.len(), 800);

    fixture.opener.add_source(
        playlist,
        "#EXTM3U
#EXT-X-TARGETDURATION:2
#EXT-X-MEDIA-SEQUENCE:1
#EXTINF:2.0,
seg1.ts
#EXTINF:2.0,
seg2.ts
#EXT-X-ENDLIST
",
    );

    let rest = read_to_end(&buffer).await;
    assert_eq!(rest, vec![2u8; 400]);
    assert_eq!(fixture.opener.open_count("mock://hls/seg1.ts"), 1);
}

#[tokio::test]
async fn test_archive_seek_through_delegate() {
    let fixture = PlaybackFixture::new();
    fixture.opener.add_source(
        "mock://archive/0.m3u8",
        "#EXTM3U
#EXT-X-TARGETDURATION:10
#EXTINF:10.0,
a0.ts
#EXTINF:10.0,
a1.ts
#EXTINF:10.0,
a2.ts
#EXT-X-ENDLIST
",
    );
    fixture.opener.add_source(
        "mock://archive/20.m3u8",
        "#EXTM3U
#EXT-X-TARGETDURATION:10
#EXTINF:10.0,
b2.ts
#EXT-X-ENDLIST
",
    );
    for (name, value) in [("a0", 0u8), ("a1", 1), ("a2", 2), ("b2", 20)] {
        fixture
            .opener
            .add_source(&format!("mock://archive/{name}.ts"), vec![value; 1000]);
    }

    let start = Utc.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap();
    let delegate = TemplateArchiveDelegate::new(
        "mock://archive/{offset}.m3u8",
        start,
        Duration::from_secs(60),
        fixture.config.playlist.segments_to_cache,
    )
    .with_granularity(Duration::from_secs(10));

    let buffer = PlaylistBuffer::open(
        "mock://archive/0.m3u8",
        Arc::new(fixture.opener.clone()),
        Some(Arc::new(delegate)),
        &fixture.config,
    )
    .await
    .unwrap();

    let programme = read_to_end(&buffer).await;
    assert_eq!(programme.len(), 3000);
    // 3000 bytes over 30 seconds
    assert_eq!(buffer.length(), Some(6000));
    assert_eq!(buffer.position(), Some(3000));

    // 2500 bytes is 25s, served from the 20s archive entry point
    assert_eq!(buffer.seek(SeekFrom::Start(2500)).await.unwrap(), 2000);
    assert_eq!(buffer.url(), "mock://archive/20.m3u8");
    assert_eq!(buffer.position(), Some(2000));

    let shifted = read_to_end(&buffer).await;
    assert_eq!(shifted, vec![20u8; 1000]);
    assert_eq!(buffer.position(), Some(3000));
}

#[tokio::test]
async fn test_archive_channel_seeks_through_player() {
    let fixture = PlaybackFixture::new();
    fixture.opener.add_source(
        "mock://catchup/0.m3u8",
        "#EXTM3U
#EXT-X-TARGETDURATION:10
#EXTINF:10.0,
p0.ts
#EXTINF:10.0,
p1.ts
#EXT-X-ENDLIST
",
    );
    fixture.opener.add_source(
        "mock://catchup/10.m3u8",
        "#EXTM3U
#EXT-X-TARGETDURATION:10
#EXTINF:10.0,
q1.ts
#EXT-X-ENDLIST
",
    );
    for (name, value) in [("p0", 1u8), ("p1", 2), ("q1", 9)] {
        fixture
            .opener
            .add_source(&format!("mock://catchup/{name}.ts"), vec![value; 1000]);
    }

    let start = Utc.with_ymd_and_hms(2024, 5, 2, 21, 0, 0).unwrap();
    let delegate = TemplateArchiveDelegate::from_config(
        "mock://catchup/{offset}.m3u8",
        start,
        Duration::from_secs(20),
        &fixture.config.playlist,
    )
    .with_granularity(Duration::from_secs(10));

    let player = ChannelPlayer::new(
        Arc::new(fixture.opener.clone()),
        Arc::new(LogNotifier),
        fixture.config.clone(),
    )
    .unwrap();
    player
        .open_archive("Catch-up", "mock://catchup/0.m3u8", Some(Arc::new(delegate)))
        .await
        .unwrap();

    let mut buf = [0u8; 500];
    let deadline = Instant::now() + TEST_DEADLINE;
    while player.length().unwrap().is_none() && Instant::now() < deadline {
        match player.read(&mut buf, READ_TIMEOUT).await.unwrap() {
            ReadOutcome::Data(_) | ReadOutcome::Stalled => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    // 1000 bytes per 10 second segment over 20 seconds
    assert_eq!(player.length().unwrap(), Some(2000));

    assert_eq!(player.seek(SeekFrom::Start(1500)).await.unwrap(), 1000);
    assert_eq!(player.position().unwrap(), Some(1000));

    let mut rest = Vec::new();
    loop {
        match player.read(&mut buf, READ_TIMEOUT).await.unwrap() {
            ReadOutcome::Data(n) => rest.extend_from_slice(&buf[..n]),
            ReadOutcome::Stalled => assert!(Instant::now() < deadline, "archive stalled"),
            ReadOutcome::Eof => break,
            ReadOutcome::Error(kind) => panic!("read failed: {kind:?}"),
        }
    }
    assert_eq!(rest, vec![9u8; 1000]);
    assert!(player.swap_cache(fixture.memory_cache()).is_err());
    player.close_channel();
}

#[tokio::test]
async fn test_swap_cache_while_recording() {
    let fixture = PlaybackFixture::new();
    let data = pattern(10_000);
    fixture.opener.add_paced_source(
        "mock://live/ch2",
        data.clone(),
        250,
        Duration::from_millis(10),
    );
    fixture.opener.add_stalled_source("mock://live/backup");

    let player = ChannelPlayer::new(
        Arc::new(fixture.opener.clone()),
        Arc::new(LogNotifier),
        fixture.config.clone(),
    )
    .unwrap();
    player
        .open_channel("Docs", &["mock://live/ch2", "mock://live/backup"])
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let recording: Arc<dyn CacheBuffer> =
        Arc::new(FileCacheBuffer::new(dir.path(), 64 * 1024, 256 * 1024).unwrap());
    let live = player.swap_cache(Arc::clone(&recording)).unwrap();

    let mut recorded = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = Instant::now() + TEST_DEADLINE;
    while Instant::now() < deadline {
        match player.read(&mut buf, READ_TIMEOUT).await.unwrap() {
            ReadOutcome::Data(n) => recorded.extend_from_slice(&buf[..n]),
            ReadOutcome::Stalled => continue,
            ReadOutcome::Eof => break,
            ReadOutcome::Error(kind) => panic!("read failed: {kind:?}"),
        }
    }

    let live_len = live.length().unwrap() as usize;
    let mut before = vec![0u8; live_len];
    live.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(live.read(&mut before), live_len);

    assert_eq!([before, recorded].concat(), data);
    assert_eq!(recording.length(), Some((10_000 - live_len) as u64));
    player.close_channel();
}
