//! Variants: one (video codec, audio codec) pair within a session.
//!
//! A variant owns one video ring and one audio ring, fed by exactly one
//! producer - the origin demuxer for the source variant, or a transcode
//! job's inbound sample stream for target variants. Format packagers read
//! through independent cursors handed out as [`VariantReader`]s.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use super::ring::{ReadOutcome, RingBuffer};
use super::sample::{CodecTag, MediaType, SampleInput};

/// Identity of a variant inside its session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VariantKey {
    pub video: CodecTag,
    pub audio: CodecTag,
}

impl VariantKey {
    #[must_use]
    pub fn new(video: impl Into<CodecTag>, audio: impl Into<CodecTag>) -> Self {
        Self {
            video: video.into(),
            audio: audio.into(),
        }
    }
}

impl std::fmt::Display for VariantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.video, self.audio)
    }
}

/// Codec initialization data captured from the producer.
///
/// SPS/PPS for H.264/HEVC video, AudioSpecificConfig for AAC. Set once,
/// then immutable; packagers read it for manifest and segment headers.
#[derive(Default)]
pub struct InitData {
    video: OnceLock<Bytes>,
    audio: OnceLock<Bytes>,
}

impl InitData {
    /// Records init data for a media type. First write wins.
    pub fn set(&self, media: MediaType, data: Bytes) {
        let cell = match media {
            MediaType::Video => &self.video,
            MediaType::Audio => &self.audio,
        };
        let _ = cell.set(data);
    }

    /// Returns the captured init data, if the producer has delivered it.
    #[must_use]
    pub fn get(&self, media: MediaType) -> Option<Bytes> {
        let cell = match media {
            MediaType::Video => &self.video,
            MediaType::Audio => &self.audio,
        };
        cell.get().cloned()
    }
}

/// A (video codec, audio codec) pair within a session.
pub struct Variant {
    key: VariantKey,
    video: Arc<RingBuffer>,
    audio: Arc<RingBuffer>,
    init: InitData,
    readers: AtomicUsize,
    last_read: Mutex<Instant>,
    errored: AtomicBool,
    /// Transcode job feeding this variant, if it is a target variant.
    job_id: Mutex<Option<String>>,
}

impl Variant {
    /// Creates a variant with fresh rings of the given capacities.
    #[must_use]
    pub fn new(key: VariantKey, video_capacity: usize, audio_capacity: usize) -> Self {
        Self {
            key,
            video: Arc::new(RingBuffer::new(MediaType::Video, video_capacity)),
            audio: Arc::new(RingBuffer::new(MediaType::Audio, audio_capacity)),
            init: InitData::default(),
            readers: AtomicUsize::new(0),
            last_read: Mutex::new(Instant::now()),
            errored: AtomicBool::new(false),
            job_id: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn key(&self) -> &VariantKey {
        &self.key
    }

    #[must_use]
    pub fn video_ring(&self) -> &Arc<RingBuffer> {
        &self.video
    }

    #[must_use]
    pub fn audio_ring(&self) -> &Arc<RingBuffer> {
        &self.audio
    }

    #[must_use]
    pub fn init_data(&self) -> &InitData {
        &self.init
    }

    /// Links the transcode job feeding this target variant.
    pub fn set_job(&self, job_id: String) {
        *self.job_id.lock() = Some(job_id);
    }

    /// Job currently feeding this variant, if any.
    #[must_use]
    pub fn job(&self) -> Option<String> {
        self.job_id.lock().clone()
    }

    /// Appends a produced sample to the matching ring.
    pub fn push(&self, media: MediaType, input: SampleInput) -> u64 {
        match media {
            MediaType::Video => self.video.append(input),
            MediaType::Audio => self.audio.append(input),
        }
    }

    /// Closes both rings; readers observe end-of-stream after draining.
    pub fn close(&self) {
        self.video.close();
        self.audio.close();
    }

    /// Transitions the variant to its terminal error state and closes it.
    ///
    /// Clients must fall back to another variant or fail.
    pub fn mark_errored(&self) {
        self.errored.store(true, Ordering::SeqCst);
        self.close();
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.video.is_closed() && self.audio.is_closed()
    }

    /// Number of readers currently holding cursors into this variant.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    /// Instant of the most recent read through any reader.
    #[must_use]
    pub fn last_read_at(&self) -> Instant {
        *self.last_read.lock()
    }

    /// Opens an independent read handle starting at the current head of
    /// both rings.
    #[must_use]
    pub fn reader(self: &Arc<Self>) -> VariantReader {
        self.readers.fetch_add(1, Ordering::SeqCst);
        *self.last_read.lock() = Instant::now();
        VariantReader {
            variant: Arc::clone(self),
            video_cursor: self.video.head(),
            audio_cursor: self.audio.head(),
        }
    }

    fn touch(&self) {
        *self.last_read.lock() = Instant::now();
    }
}

/// Independent read handle into a variant's rings.
///
/// Holding a reader keeps the variant alive with respect to the idle
/// reaper; dropping it releases the cursor.
pub struct VariantReader {
    variant: Arc<Variant>,
    video_cursor: u64,
    audio_cursor: u64,
}

impl VariantReader {
    #[must_use]
    pub fn variant(&self) -> &Arc<Variant> {
        &self.variant
    }

    #[must_use]
    pub fn video_cursor(&self) -> u64 {
        self.video_cursor
    }

    #[must_use]
    pub fn audio_cursor(&self) -> u64 {
        self.audio_cursor
    }

    /// Rewinds the video cursor to the oldest retained keyframe, so a new
    /// consumer can start decoding immediately. Audio rewinds to the
    /// oldest retained sample.
    pub fn rewind_to_keyframe(&mut self) {
        let ring = self.variant.video_ring();
        if let Some(seq) = ring.oldest_keyframe() {
            self.video_cursor = seq;
        }
        if let Some(oldest) = self.variant.audio_ring().oldest() {
            self.audio_cursor = oldest;
        }
    }

    /// Non-blocking read: `None` when the next sample is not yet produced.
    pub fn try_next(&mut self, media: MediaType) -> Option<ReadOutcome> {
        let (ring, cursor) = match media {
            MediaType::Video => (self.variant.video_ring(), &mut self.video_cursor),
            MediaType::Audio => (self.variant.audio_ring(), &mut self.audio_cursor),
        };
        let outcome = ring.try_read(*cursor)?;
        match &outcome {
            ReadOutcome::Sample { next, .. } => *cursor = *next,
            ReadOutcome::Skipped { to } => *cursor = *to,
            ReadOutcome::Closed => {}
        }
        self.variant.touch();
        Some(outcome)
    }

    /// Reads the next sample for `media`, waiting for the producer when the
    /// cursor is at the head. Skips are folded into the cursor and surfaced
    /// in the outcome.
    pub async fn next(&mut self, media: MediaType) -> ReadOutcome {
        let (ring, cursor) = match media {
            MediaType::Video => (self.variant.video_ring(), &mut self.video_cursor),
            MediaType::Audio => (self.variant.audio_ring(), &mut self.audio_cursor),
        };
        let outcome = ring.read(*cursor).await;
        match &outcome {
            ReadOutcome::Sample { next, .. } => *cursor = *next,
            ReadOutcome::Skipped { to } => *cursor = *to,
            ReadOutcome::Closed => {}
        }
        self.variant.touch();
        outcome
    }
}

impl Drop for VariantReader {
    fn drop(&mut self) {
        self.variant.readers.fetch_sub(1, Ordering::SeqCst);
        self.variant.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant() -> Arc<Variant> {
        Arc::new(Variant::new(VariantKey::new("h264", "aac"), 8, 8))
    }

    #[test]
    fn reader_count_tracks_handles() {
        let v = variant();
        assert_eq!(v.reader_count(), 0);
        let r1 = v.reader();
        let r2 = v.reader();
        assert_eq!(v.reader_count(), 2);
        drop(r1);
        assert_eq!(v.reader_count(), 1);
        drop(r2);
        assert_eq!(v.reader_count(), 0);
    }

    #[test]
    fn init_data_first_write_wins() {
        let v = variant();
        v.init_data().set(MediaType::Video, Bytes::from_static(b"sps"));
        v.init_data().set(MediaType::Video, Bytes::from_static(b"other"));
        assert_eq!(
            v.init_data().get(MediaType::Video),
            Some(Bytes::from_static(b"sps"))
        );
        assert_eq!(v.init_data().get(MediaType::Audio), None);
    }

    #[test]
    fn errored_is_terminal_and_closes_rings() {
        let v = variant();
        v.mark_errored();
        assert!(v.is_errored());
        assert!(v.video_ring().is_closed());
        assert!(v.audio_ring().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reader_sees_samples_pushed_after_open() {
        let v = variant();
        let mut reader = v.reader();
        v.push(
            MediaType::Audio,
            SampleInput::new(100, Bytes::from_static(b"a")),
        );
        match reader.next(MediaType::Audio).await {
            ReadOutcome::Sample { sample, .. } => assert_eq!(sample.pts, 100),
            other => panic!("expected sample, got {:?}", other),
        }
    }
}
