//! Elementary-stream sample types.
//!
//! A [`Sample`] is produced once by a demuxer or transcode stream and never
//! mutated afterwards; everything downstream shares it through `Arc`.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Timestamp clock rate for all samples (MPEG 90 kHz).
pub const CLOCK_HZ: i64 = 90_000;

/// Media type of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    /// Returns the media type as a short string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Codec identifier carried as data, not as a type.
///
/// Worker capability sets and transcode specifications exchange codec names
/// as strings ("h264", "hevc", "aac", ...), so adding an encoder is a worker
/// configuration change, never a coordinator code change. The newtype keeps
/// comparisons case-insensitive at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecTag(String);

impl CodecTag {
    /// Creates a tag, normalizing to lowercase.
    #[must_use]
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_ascii_lowercase())
    }

    /// Returns the normalized tag string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CodecTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodecTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An immutable elementary-stream sample.
///
/// `sequence` is assigned by the ring buffer at append time and is strictly
/// increasing and contiguous per ring.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Presentation timestamp on the 90 kHz clock.
    pub pts: i64,
    /// Decode timestamp on the 90 kHz clock.
    pub dts: i64,
    /// Encoded payload.
    pub payload: Bytes,
    /// True for video IDR samples. Audio samples never set this.
    pub keyframe: bool,
    /// Monotonic per-ring sequence number.
    pub sequence: u64,
}

/// Sample fields supplied by a producer; the ring assigns the sequence.
#[derive(Debug, Clone)]
pub struct SampleInput {
    pub pts: i64,
    pub dts: i64,
    pub payload: Bytes,
    pub keyframe: bool,
}

impl SampleInput {
    /// Convenience constructor for a non-keyframe sample with pts == dts.
    #[must_use]
    pub fn new(pts: i64, payload: Bytes) -> Self {
        Self {
            pts,
            dts: pts,
            payload,
            keyframe: false,
        }
    }

    /// Marks the sample as a keyframe.
    #[must_use]
    pub fn keyframe(mut self) -> Self {
        self.keyframe = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_tag_normalizes_case_and_whitespace() {
        assert_eq!(CodecTag::new(" H264 "), CodecTag::new("h264"));
        assert_eq!(CodecTag::new("HEVC").as_str(), "hevc");
    }

    #[test]
    fn sample_input_builder() {
        let s = SampleInput::new(9000, Bytes::from_static(b"x")).keyframe();
        assert!(s.keyframe);
        assert_eq!(s.dts, 9000);
    }
}
