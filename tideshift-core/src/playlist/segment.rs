//! Downloaded media segments.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

/// A segment as listed in a media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// Absolute segment URL
    pub url: String,
    /// Server-reported duration
    pub duration: Duration,
    /// `#EXT-X-MEDIA-SEQUENCE` based index
    pub media_index: u64,
}

/// A frozen segment indexed at its cumulative byte offset in the stream.
///
/// Cloning is cheap; the payload is shared.
#[derive(Debug, Clone)]
pub struct Segment {
    info: SegmentInfo,
    data: Bytes,
    offset: u64,
    time_offset: Duration,
}

impl Segment {
    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    /// Stream offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Stream offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback time at which this segment starts.
    pub fn time_offset(&self) -> Duration {
        self.time_offset
    }

    pub fn contains(&self, position: u64) -> bool {
        self.offset <= position && position < self.end()
    }

    /// Copies bytes starting at stream offset `position` into `buf`.
    ///
    /// Returns 0 when `position` is outside the segment.
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> usize {
        if !self.contains(position) {
            return 0;
        }
        let start = (position - self.offset) as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }
}

/// A segment being downloaded.
#[derive(Debug)]
pub struct MutableSegment {
    info: SegmentInfo,
    data: BytesMut,
}

impl MutableSegment {
    pub(crate) fn new(info: SegmentInfo) -> Self {
        Self {
            info,
            data: BytesMut::new(),
        }
    }

    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    pub fn url(&self) -> &str {
        &self.info.url
    }

    /// Appends downloaded bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Indexes the payload at byte `offset` and playback time `time_offset`.
    pub(crate) fn freeze(self, offset: u64, time_offset: Duration) -> Segment {
        Segment {
            info: self.info,
            data: self.data.freeze(),
            offset,
            time_offset,
        }
    }
}
