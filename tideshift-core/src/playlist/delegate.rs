//! Archive seeking support for playlist readers.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::PlaylistConfig;

/// Playlist URL for a point inside a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeshiftUrl {
    /// Playlist starting at `adjusted_offset`
    pub url: String,
    /// Offset the archive can actually serve, at or before the requested one
    pub adjusted_offset: Duration,
}

/// Caller-supplied knowledge about an archive or VOD programme.
pub trait PlaylistBufferDelegate: Send + Sync {
    /// Number of segments to keep cached.
    fn segments_amount_to_cache(&self) -> usize;

    /// Full programme duration.
    fn duration(&self) -> Duration;

    /// Playlist URL starting as close as possible to `requested`.
    fn url_for_timeshift(&self, requested: Duration) -> TimeshiftUrl;
}

/// Delegate building archive URLs from a template.
///
/// Placeholders: `{utc}` and `{utcend}` (unix seconds of the shifted start
/// and of the programme end), `{offset}` and `{duration}` (seconds into the
/// programme and seconds remaining), and `{Y}` `{m}` `{d}` `{H}` `{M}` `{S}`
/// for the shifted start in UTC.
#[derive(Debug, Clone)]
pub struct TemplateArchiveDelegate {
    template: String,
    start: DateTime<Utc>,
    duration: Duration,
    segments_to_cache: usize,
    granularity: Duration,
}

impl TemplateArchiveDelegate {
    pub fn new(
        template: impl Into<String>,
        start: DateTime<Utc>,
        duration: Duration,
        segments_to_cache: usize,
    ) -> Self {
        Self {
            template: template.into(),
            start,
            duration,
            segments_to_cache,
            granularity: Duration::from_secs(1),
        }
    }

    /// Delegate keeping `config.segments_to_cache` segments.
    pub fn from_config(
        template: impl Into<String>,
        start: DateTime<Utc>,
        duration: Duration,
        config: &PlaylistConfig,
    ) -> Self {
        Self::new(template, start, duration, config.segments_to_cache)
    }

    /// Rounds requested offsets down to a multiple of `granularity`.
    pub fn with_granularity(mut self, granularity: Duration) -> Self {
        self.granularity = granularity.max(Duration::from_secs(1));
        self
    }

    fn render(&self, offset: Duration) -> String {
        let shifted = self.start + TimeDelta::seconds(offset.as_secs() as i64);
        let end = self.start + TimeDelta::seconds(self.duration.as_secs() as i64);
        let remaining = self.duration.saturating_sub(offset);

        [
            ("{utc}", shifted.timestamp().to_string()),
            ("{utcend}", end.timestamp().to_string()),
            ("{offset}", offset.as_secs().to_string()),
            ("{duration}", remaining.as_secs().to_string()),
            ("{Y}", shifted.format("%Y").to_string()),
            ("{m}", shifted.format("%m").to_string()),
            ("{d}", shifted.format("%d").to_string()),
            ("{H}", shifted.format("%H").to_string()),
            ("{M}", shifted.format("%M").to_string()),
            ("{S}", shifted.format("%S").to_string()),
        ]
        .iter()
        .fold(self.template.clone(), |url, (placeholder, value)| {
            url.replace(placeholder, value)
        })
    }
}

impl PlaylistBufferDelegate for TemplateArchiveDelegate {
    fn segments_amount_to_cache(&self) -> usize {
        self.segments_to_cache
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    fn url_for_timeshift(&self, requested: Duration) -> TimeshiftUrl {
        let requested = requested.min(self.duration);
        let step = self.granularity.as_secs().max(1);
        let adjusted = Duration::from_secs(requested.as_secs() / step * step);

        TimeshiftUrl {
            url: self.render(adjusted),
            adjusted_offset: adjusted,
        }
    }
}
