//! Byte-indexed cache of downloaded playlist segments.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::segment::{MutableSegment, Segment, SegmentInfo};
use super::{Playlist, PlaylistError};
use crate::config::PlaylistConfig;

/// Reload, queue, fill and index pipeline for one playlist.
///
/// Ready segments are keyed by their cumulative byte offset, so offsets are
/// contiguous from zero. Eviction only drops segments that end at or before
/// the reader's position.
pub struct PlaylistCache {
    playlist: tokio::sync::Mutex<Playlist>,
    state: Mutex<CacheState>,
    url: String,
    is_vod: bool,
    target_duration: Duration,
    size_limit: u64,
    segment_limit: Option<usize>,
}

#[derive(Default)]
struct CacheState {
    segments: BTreeMap<u64, Segment>,
    pending: VecDeque<SegmentInfo>,
    in_flight: usize,
    total_bytes: u64,
    total_duration: Duration,
    cached_bytes: u64,
    exhausted: bool,
}

impl CacheState {
    fn bytes_ahead_of(&self, position: u64) -> u64 {
        self.segments
            .range(..)
            .rev()
            .take_while(|(_, segment)| segment.end() > position)
            .map(|(_, segment)| segment.end() - segment.offset().max(position))
            .sum()
    }

    fn over_limit(&self, size_limit: u64, segment_limit: Option<usize>) -> bool {
        self.cached_bytes > size_limit
            || segment_limit.is_some_and(|limit| self.segments.len() > limit)
    }
}

impl PlaylistCache {
    /// Wraps a loaded playlist.
    ///
    /// `segment_limit` caps the number of retained segments in addition to
    /// the byte budget from `config`.
    pub fn new(playlist: Playlist, config: &PlaylistConfig, segment_limit: Option<usize>) -> Self {
        Self {
            url: playlist.url().to_string(),
            is_vod: playlist.is_vod(),
            target_duration: playlist.target_duration(),
            playlist: tokio::sync::Mutex::new(playlist),
            state: Mutex::new(CacheState::default()),
            size_limit: config.cache_size_limit,
            segment_limit,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_vod(&self) -> bool {
        self.is_vod
    }

    pub fn target_duration(&self) -> Duration {
        self.target_duration
    }

    /// Moves every segment the playlist can currently offer into the
    /// pending queue and returns how many were queued.
    ///
    /// # Errors
    ///
    /// Any error from re-fetching a live playlist.
    pub async fn reload_playlist(&self) -> Result<usize, PlaylistError> {
        let mut playlist = self.playlist.lock().await;
        let mut fresh = Vec::new();
        while let Some(info) = playlist.next_segment().await? {
            fresh.push(info);
        }

        let queued = fresh.len();
        let mut state = self.state.lock();
        state.pending.extend(fresh);
        if playlist.is_vod() {
            state.exhausted = true;
        }
        if queued > 0 {
            trace!("Queued {} segments from {}", queued, self.url);
        }
        Ok(queued)
    }

    /// Hands out the next pending segment for download.
    ///
    /// Returns `None` when nothing is pending or when the bytes already
    /// cached ahead of `position` fill the cache budget.
    pub fn segment_to_fill_after(&self, position: u64) -> Option<MutableSegment> {
        let mut state = self.state.lock();
        let ahead = state.bytes_ahead_of(position);
        if ahead >= self.size_limit {
            debug!("{} bytes cached ahead of {}, holding downloads", ahead, position);
            return None;
        }

        let info = state.pending.pop_front()?;
        state.in_flight += 1;
        Some(MutableSegment::new(info))
    }

    /// Freezes a downloaded segment and indexes it after the last one.
    ///
    /// Byte and time offsets both continue from the indexed segments, so an
    /// abandoned download leaves no gap in either.
    pub fn segment_ready(&self, segment: MutableSegment) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);

        if segment.is_empty() {
            debug!("Dropping empty segment {}", segment.url());
            return;
        }

        let offset = state.total_bytes;
        let segment = segment.freeze(offset, state.total_duration);
        state.total_bytes += segment.len() as u64;
        state.total_duration += segment.info().duration;
        state.cached_bytes += segment.len() as u64;
        state.segments.insert(offset, segment);
    }

    /// Gives up on a segment whose download failed.
    pub fn abandon_segment(&self, segment: MutableSegment) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        debug!("Abandoned segment {}", segment.url());
    }

    /// Segment covering stream offset `position`.
    ///
    /// Consumed segments at the head of the cache are evicted first while the
    /// cache is over its budget.
    pub fn segment_at(&self, position: u64) -> Option<Segment> {
        let mut state = self.state.lock();

        while state.over_limit(self.size_limit, self.segment_limit) {
            let Some(head) = state.segments.first_entry() else {
                break;
            };
            if head.get().end() > position {
                break;
            }
            let evicted = head.remove();
            state.cached_bytes -= evicted.len() as u64;
            trace!("Evicted segment at {}", evicted.offset());
        }

        state
            .segments
            .range(..=position)
            .next_back()
            .map(|(_, segment)| segment)
            .filter(|segment| segment.contains(position))
            .cloned()
    }

    /// Average stream bitrate in bytes per second, 0 before any duration is known.
    pub fn bitrate(&self) -> f64 {
        let state = self.state.lock();
        let seconds = state.total_duration.as_secs_f64();
        if seconds > 0.0 {
            state.total_bytes as f64 / seconds
        } else {
            0.0
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Whether a VOD playlist has been fully downloaded.
    pub fn is_eof(&self) -> bool {
        let state = self.state.lock();
        state.exhausted && state.pending.is_empty() && state.in_flight == 0
    }

    /// Whether `position` is at or past the last byte of a finished playlist.
    pub fn is_exhausted_at(&self, position: u64) -> bool {
        self.is_eof() && position >= self.total_bytes()
    }

    /// Bytes indexed since the cache was created.
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    /// Playback time of all indexed segments.
    pub fn total_duration(&self) -> Duration {
        self.state.lock().total_duration
    }

    /// Bytes currently retained.
    pub fn cached_bytes(&self) -> u64 {
        self.state.lock().cached_bytes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_mocks::MockSourceOpener;

    const VOD: &str = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-PLAYLIST-TYPE:VOD
#EXTINF:4.0,
a.ts
#EXTINF:4.0,
b.ts
#EXTINF:2.0,
c.ts
#EXT-X-ENDLIST
";

    async fn vod_cache(config: &PlaylistConfig, segment_limit: Option<usize>) -> PlaylistCache {
        let opener = MockSourceOpener::new();
        opener.add_source("mock://host/vod.m3u8", VOD);
        let playlist = Playlist::load("mock://host/vod.m3u8", Arc::new(opener), config)
            .await
            .unwrap();
        PlaylistCache::new(playlist, config, segment_limit)
    }

    fn fill(cache: &PlaylistCache, position: u64, size: usize) {
        let mut segment = cache.segment_to_fill_after(position).unwrap();
        segment.push(&vec![segment.info().media_index as u8; size]);
        cache.segment_ready(segment);
    }

    #[tokio::test]
    async fn test_bitrate_over_ready_segments() {
        let config = PlaylistConfig::default();
        let cache = vod_cache(&config, None).await;
        assert_eq!(cache.reload_playlist().await.unwrap(), 3);
        assert_eq!(cache.bitrate(), 0.0);

        fill(&cache, 0, 1000);
        fill(&cache, 0, 1000);
        fill(&cache, 0, 500);

        assert_eq!(cache.total_bytes(), 2500);
        assert_eq!(cache.total_duration(), Duration::from_secs(10));
        assert_eq!(cache.bitrate(), 250.0);
        assert!(cache.is_eof());
    }

    #[tokio::test]
    async fn test_segment_at_covers_every_offset() {
        let config = PlaylistConfig::default();
        let cache = vod_cache(&config, None).await;
        cache.reload_playlist().await.unwrap();
        fill(&cache, 0, 300);
        fill(&cache, 0, 200);
        fill(&cache, 0, 100);

        let mut position = 0;
        while position < cache.total_bytes() {
            let segment = cache.segment_at(position).unwrap();
            assert_eq!(segment.offset(), position);
            for inside in [segment.offset() + 1, segment.end() - 1] {
                assert!(cache.segment_at(inside).unwrap().contains(inside));
            }
            position = segment.end();
        }
        assert_eq!(position, 600);
        assert!(cache.segment_at(600).is_none());
    }

    #[tokio::test]
    async fn test_time_offsets_accumulate() {
        let config = PlaylistConfig::default();
        let cache = vod_cache(&config, None).await;
        cache.reload_playlist().await.unwrap();
        fill(&cache, 0, 100);
        fill(&cache, 0, 100);
        fill(&cache, 0, 100);

        assert_eq!(cache.segment_at(0).unwrap().time_offset(), Duration::ZERO);
        assert_eq!(cache.segment_at(100).unwrap().time_offset(), Duration::from_secs(4));
        assert_eq!(cache.segment_at(200).unwrap().time_offset(), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_abandoned_segment_leaves_no_time_gap() {
        let config = PlaylistConfig::default();
        let cache = vod_cache(&config, None).await;
        cache.reload_playlist().await.unwrap();

        let first = cache.segment_to_fill_after(0).unwrap();
        cache.abandon_segment(first);
        fill(&cache, 0, 100);
        let mut third = cache.segment_to_fill_after(0).unwrap();
        assert!(cache.segment_to_fill_after(0).is_none());
        assert!(!cache.is_eof());

        third.push(&[2u8; 50]);
        cache.segment_ready(third);
        assert!(cache.is_eof());

        let second = cache.segment_at(0).unwrap();
        assert_eq!(second.info().media_index, 1);
        assert_eq!(second.time_offset(), Duration::ZERO);
        let third = cache.segment_at(100).unwrap();
        assert_eq!(third.time_offset(), Duration::from_secs(4));
        assert_eq!(cache.total_duration(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_back_pressure_holds_downloads() {
        let config = PlaylistConfig {
            cache_size_limit: 1000,
            ..PlaylistConfig::default()
        };
        let cache = vod_cache(&config, None).await;
        cache.reload_playlist().await.unwrap();

        fill(&cache, 0, 1000);
        assert!(cache.segment_to_fill_after(0).is_none());
        assert!(cache.has_pending());

        // Reader consumed half of the first segment
        assert!(cache.segment_to_fill_after(500).is_some());
    }

    #[tokio::test]
    async fn test_eviction_only_behind_reader() {
        let config = PlaylistConfig {
            cache_size_limit: 1500,
            ..PlaylistConfig::default()
        };
        let cache = vod_cache(&config, None).await;
        cache.reload_playlist().await.unwrap();
        fill(&cache, 0, 1000);
        fill(&cache, 0, 1000);
        assert_eq!(cache.cached_bytes(), 2000);

        // Over budget but the reader is still inside the first segment
        assert_eq!(cache.segment_at(999).unwrap().offset(), 0);
        assert_eq!(cache.cached_bytes(), 2000);

        assert_eq!(cache.segment_at(1000).unwrap().offset(), 1000);
        assert_eq!(cache.cached_bytes(), 1000);
        assert!(cache.segment_at(10).is_none());
    }

    #[tokio::test]
    async fn test_segment_limit_evicts_consumed_segments() {
        let config = PlaylistConfig::default();
        let cache = vod_cache(&config, Some(1)).await;
        cache.reload_playlist().await.unwrap();
        fill(&cache, 0, 100);
        fill(&cache, 0, 100);

        assert!(cache.segment_at(150).is_some());
        assert_eq!(cache.cached_bytes(), 100);
    }

    #[tokio::test]
    async fn test_empty_segments_are_not_indexed() {
        let config = PlaylistConfig::default();
        let cache = vod_cache(&config, None).await;
        cache.reload_playlist().await.unwrap();

        let empty = cache.segment_to_fill_after(0).unwrap();
        cache.segment_ready(empty);
        fill(&cache, 0, 10);

        assert_eq!(cache.total_bytes(), 10);
        assert_eq!(cache.segment_at(0).unwrap().info().media_index, 1);
    }
}
