//! HLS playlist fetching and parsing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use m3u8_rs::{MasterPlaylist, MediaPlaylist, MediaPlaylistType};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::segment::SegmentInfo;
use super::{PlaylistError, excerpt};
use crate::config::PlaylistConfig;
use crate::input::SourceOpener;

const EXTM3U: &str = "#EXTM3U";
const STREAM_INF: &str = "#EXT-X-STREAM-INF";
const MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE";
const EXTINF: &str = "#EXTINF";

/// A media playlist resolved from a master or media playlist URL.
///
/// Segments are handed out in media-index order by [`Playlist::next_segment`],
/// which re-fetches live playlists when it runs out.
pub struct Playlist {
    url: Url,
    media_url: Url,
    opener: Arc<dyn SourceOpener>,
    is_vod: bool,
    target_duration: Duration,
    variant_bandwidth: Option<u64>,
    segments: BTreeMap<u64, SegmentInfo>,
    next_index: Option<u64>,
    last_reload: Instant,
    min_reload_interval: Duration,
}

impl Playlist {
    /// Fetches and parses the playlist at `url`, following a master playlist
    /// to its highest-bandwidth variant.
    ///
    /// # Errors
    ///
    /// - `PlaylistError::InvalidUrl` - If `url` is not a usable URL
    /// - `PlaylistError::Fetch` - If the playlist cannot be downloaded
    /// - `PlaylistError::MissingTag` - If a mandatory tag is absent
    /// - `PlaylistError::Malformed` - If the payload cannot be parsed
    pub async fn load(
        url: &str,
        opener: Arc<dyn SourceOpener>,
        config: &PlaylistConfig,
    ) -> Result<Self, PlaylistError> {
        let parsed = parse_url(url)?;
        let mut playlist = Self {
            media_url: parsed.clone(),
            url: parsed,
            opener,
            is_vod: false,
            target_duration: Duration::ZERO,
            variant_bandwidth: None,
            segments: BTreeMap::new(),
            next_index: None,
            last_reload: Instant::now(),
            min_reload_interval: config.min_reload_interval,
        };
        playlist.refresh().await?;

        info!(
            "Loaded {} playlist {} ({} segments)",
            if playlist.is_vod { "VOD" } else { "live" },
            playlist.url,
            playlist.segments.len()
        );
        Ok(playlist)
    }

    /// URL the playlist was loaded from.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Media playlist URL after variant selection.
    pub fn media_url(&self) -> &str {
        self.media_url.as_str()
    }

    pub fn is_vod(&self) -> bool {
        self.is_vod
    }

    pub fn target_duration(&self) -> Duration {
        self.target_duration
    }

    /// Bandwidth of the selected variant, `None` for a plain media playlist.
    pub fn variant_bandwidth(&self) -> Option<u64> {
        self.variant_bandwidth
    }

    /// Segments known but not yet returned by `next_segment`.
    pub fn remaining(&self) -> impl Iterator<Item = &SegmentInfo> {
        let from = self.next_index.unwrap_or(0);
        self.segments.range(from..).map(|(_, info)| info)
    }

    /// Returns the next unseen segment.
    ///
    /// A live playlist that has run out is re-fetched, at most once per
    /// `min_reload_interval`, before `None` is returned. A VOD playlist
    /// returns `None` once every segment has been handed out.
    ///
    /// # Errors
    ///
    /// Any error from re-fetching the playlist.
    pub async fn next_segment(&mut self) -> Result<Option<SegmentInfo>, PlaylistError> {
        if let Some(info) = self.take_next() {
            return Ok(Some(info));
        }
        if self.is_vod || self.last_reload.elapsed() < self.min_reload_interval {
            return Ok(None);
        }

        self.refresh().await?;
        Ok(self.take_next())
    }

    fn take_next(&mut self) -> Option<SegmentInfo> {
        let wanted = self.next_index.unwrap_or(0);
        let (&index, info) = self.segments.range(wanted..).next()?;
        if self.next_index.is_some() && index > wanted {
            warn!(
                "Playlist {} slid past segments {}..{}, skipping ahead",
                self.media_url, wanted, index
            );
        }
        let info = info.clone();
        self.next_index = Some(index + 1);
        Some(info)
    }

    async fn refresh(&mut self) -> Result<(), PlaylistError> {
        self.last_reload = Instant::now();
        let text = fetch_text(self.opener.as_ref(), &self.url).await?;

        let (media_url, media_text, media) = match parse(&text)? {
            m3u8_rs::Playlist::MediaPlaylist(media) => (self.url.clone(), text, media),
            m3u8_rs::Playlist::MasterPlaylist(master) => {
                let (variant_url, bandwidth) = best_variant(&master, &self.url, &text)?;
                if self.variant_bandwidth != Some(bandwidth) {
                    debug!("Selected {} variant {}", bandwidth, variant_url);
                    self.variant_bandwidth = Some(bandwidth);
                }
                let nested = fetch_text(self.opener.as_ref(), &variant_url).await?;
                match parse(&nested)? {
                    m3u8_rs::Playlist::MediaPlaylist(media) => (variant_url, nested, media),
                    m3u8_rs::Playlist::MasterPlaylist(_) => {
                        return Err(reject(PlaylistError::Malformed {
                            tag: STREAM_INF,
                            reason: "variant points at another master playlist".to_string(),
                            excerpt: excerpt(&nested),
                        }));
                    }
                }
            }
        };

        self.media_url = media_url;
        self.apply_media(&media_text, media)
    }

    fn apply_media(&mut self, text: &str, media: MediaPlaylist) -> Result<(), PlaylistError> {
        let is_vod = media.end_list || matches!(media.playlist_type, Some(MediaPlaylistType::Vod));
        if !is_vod && !text.contains(MEDIA_SEQUENCE) {
            return Err(reject(PlaylistError::MissingTag {
                tag: MEDIA_SEQUENCE,
                excerpt: excerpt(text),
            }));
        }

        self.is_vod = is_vod;
        self.target_duration = Duration::from_secs(media.target_duration);

        for (i, segment) in media.segments.iter().enumerate() {
            let media_index = media.media_sequence + i as u64;
            if self.segments.contains_key(&media_index) {
                continue;
            }
            let duration = Duration::try_from_secs_f32(segment.duration.max(0.0)).map_err(|e| {
                reject(PlaylistError::Malformed {
                    tag: EXTINF,
                    reason: e.to_string(),
                    excerpt: format!("{EXTINF}:{},{}", segment.duration, segment.uri),
                })
            })?;
            let url = self.media_url.join(&segment.uri).map_err(|e| {
                reject(PlaylistError::InvalidUrl {
                    url: segment.uri.clone(),
                    reason: e.to_string(),
                })
            })?;
            self.segments.insert(
                media_index,
                SegmentInfo {
                    url: url.to_string(),
                    duration,
                    media_index,
                },
            );
        }

        // Segments already handed out are not needed again
        if let Some(next) = self.next_index {
            self.segments = self.segments.split_off(&next);
        }
        Ok(())
    }
}

fn parse_url(url: &str) -> Result<Url, PlaylistError> {
    match Url::parse(url) {
        Ok(parsed) => Ok(parsed),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let path = std::path::absolute(url).map_err(|e| PlaylistError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            Url::from_file_path(&path).map_err(|_| PlaylistError::InvalidUrl {
                url: url.to_string(),
                reason: "not an absolute path".to_string(),
            })
        }
        Err(e) => Err(PlaylistError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        }),
    }
}

async fn fetch_text(opener: &dyn SourceOpener, url: &Url) -> Result<String, PlaylistError> {
    let body = opener
        .fetch(url.as_str())
        .await
        .map_err(|e| PlaylistError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn parse(text: &str) -> Result<m3u8_rs::Playlist, PlaylistError> {
    if !text.trim_start().starts_with(EXTM3U) {
        return Err(reject(PlaylistError::MissingTag {
            tag: EXTM3U,
            excerpt: excerpt(text),
        }));
    }
    m3u8_rs::parse_playlist_res(text.as_bytes()).map_err(|e| {
        reject(PlaylistError::Malformed {
            tag: EXTM3U,
            reason: e.to_string(),
            excerpt: excerpt(text),
        })
    })
}

fn best_variant(
    master: &MasterPlaylist,
    base: &Url,
    text: &str,
) -> Result<(Url, u64), PlaylistError> {
    let variant = master
        .variants
        .iter()
        .filter(|variant| !variant.is_i_frame)
        .max_by_key(|variant| variant.bandwidth)
        .ok_or_else(|| {
            reject(PlaylistError::MissingTag {
                tag: STREAM_INF,
                excerpt: excerpt(text),
            })
        })?;

    let url = base.join(&variant.uri).map_err(|e| {
        reject(PlaylistError::InvalidUrl {
            url: variant.uri.clone(),
            reason: e.to_string(),
        })
    })?;
    Ok((url, variant.bandwidth))
}

fn reject(error: PlaylistError) -> PlaylistError {
    warn!("{}", error);
    error
}
