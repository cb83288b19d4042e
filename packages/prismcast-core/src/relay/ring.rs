//! Fixed-capacity lossy sample ring.
//!
//! Single producer, arbitrarily many independent readers. Append never
//! blocks and never drops the newest sample; on overrun the oldest retained
//! sample is overwritten. Readers address the ring by logical cursor (the
//! next sequence number they want); a reader that falls behind the retained
//! window observes exactly one skip, to the oldest retained keyframe for
//! video or the oldest retained sample for audio.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::sample::{MediaType, Sample, SampleInput};

/// Result of a cursor read.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    /// The sample at the cursor, plus the cursor for the following read.
    Sample { sample: Arc<Sample>, next: u64 },
    /// The cursor fell below the retained window; resume reading at `to`.
    Skipped { to: u64 },
    /// The ring is closed and fully drained.
    Closed,
}

struct RingInner {
    samples: VecDeque<Arc<Sample>>,
    /// Sequence number the next append will receive.
    next_seq: u64,
    closed: bool,
}

impl RingInner {
    fn oldest_seq(&self) -> Option<u64> {
        self.samples.front().map(|s| s.sequence)
    }

    /// Oldest retained keyframe at or after `cursor`.
    fn oldest_keyframe_at_or_after(&self, cursor: u64) -> Option<u64> {
        self.samples
            .iter()
            .find(|s| s.keyframe && s.sequence >= cursor)
            .map(|s| s.sequence)
    }

    fn get(&self, seq: u64) -> Option<Arc<Sample>> {
        let oldest = self.oldest_seq()?;
        if seq < oldest || seq >= self.next_seq {
            return None;
        }
        self.samples.get((seq - oldest) as usize).cloned()
    }
}

/// Fixed-capacity lossy ring of elementary-stream samples.
pub struct RingBuffer {
    inner: Mutex<RingInner>,
    notify: Notify,
    capacity: usize,
    media: MediaType,
}

impl RingBuffer {
    /// Creates a ring for `media` retaining at most `capacity` samples.
    #[must_use]
    pub fn new(media: MediaType, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                samples: VecDeque::with_capacity(capacity),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            media,
        }
    }

    /// Media type this ring carries.
    #[must_use]
    pub fn media(&self) -> MediaType {
        self.media
    }

    /// Appends a sample, assigning and returning its sequence number.
    ///
    /// Never blocks. On overrun the oldest retained sample is dropped.
    /// Appends to a closed ring are discarded (the producer lost a race
    /// with teardown) and report the would-be sequence.
    pub fn append(&self, input: SampleInput) -> u64 {
        let seq = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            if inner.closed {
                return seq;
            }
            inner.next_seq += 1;
            if inner.samples.len() >= self.capacity {
                inner.samples.pop_front();
            }
            inner.samples.push_back(Arc::new(Sample {
                pts: input.pts,
                dts: input.dts,
                payload: input.payload,
                keyframe: input.keyframe,
                sequence: seq,
            }));
            seq
        };
        self.notify.notify_waiters();
        seq
    }

    /// Closes the ring. Readers drain retained samples, then observe
    /// [`ReadOutcome::Closed`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether the ring has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Sequence number the next append will receive.
    #[must_use]
    pub fn head(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Oldest retained sequence, if any samples are retained.
    #[must_use]
    pub fn oldest(&self) -> Option<u64> {
        self.inner.lock().oldest_seq()
    }

    /// Oldest retained keyframe sequence, if one is retained.
    #[must_use]
    pub fn oldest_keyframe(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .samples
            .iter()
            .find(|s| s.keyframe)
            .map(|s| s.sequence)
    }

    /// Non-blocking read at `cursor`. `None` means the read would wait
    /// (cursor at the head of an open ring, or a video skip with no
    /// retained keyframe yet).
    pub fn try_read(&self, cursor: u64) -> Option<ReadOutcome> {
        let inner = self.inner.lock();

        if let Some(sample) = inner.get(cursor) {
            let next = sample.sequence + 1;
            return Some(ReadOutcome::Sample { sample, next });
        }

        match inner.oldest_seq() {
            // Ring retains samples but the cursor fell below them: skip.
            Some(oldest) if cursor < oldest => match self.media {
                MediaType::Audio => Some(ReadOutcome::Skipped { to: oldest }),
                MediaType::Video => inner
                    .oldest_keyframe_at_or_after(cursor)
                    .map(|to| ReadOutcome::Skipped { to })
                    .or(if inner.closed {
                        Some(ReadOutcome::Closed)
                    } else {
                        // No retained keyframe: wait for the next one.
                        None
                    }),
            },
            // Cursor is at or above the head.
            _ => {
                if inner.closed {
                    Some(ReadOutcome::Closed)
                } else {
                    None
                }
            }
        }
    }

    /// Reads the sample at `cursor`, waiting for the producer if the cursor
    /// is at the head of an open ring.
    pub async fn read(&self, cursor: u64) -> ReadOutcome {
        loop {
            // Register for wakeup before checking, so an append between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.try_read(cursor) {
                return outcome;
            }
            notified.await;
        }
    }

    /// Copies out the retained samples in `[from, to)` sequence order.
    ///
    /// Used by packagers to assemble segments; returns fewer samples than
    /// requested if part of the range was evicted.
    #[must_use]
    pub fn range(&self, from: u64, to: u64) -> Vec<Arc<Sample>> {
        let inner = self.inner.lock();
        inner
            .samples
            .iter()
            .filter(|s| s.sequence >= from && s.sequence < to)
            .cloned()
            .collect()
    }

    /// Copies out retained samples whose pts falls in `[from_pts, to_pts)`.
    #[must_use]
    pub fn range_by_pts(&self, from_pts: i64, to_pts: i64) -> Vec<Arc<Sample>> {
        let inner = self.inner.lock();
        inner
            .samples
            .iter()
            .filter(|s| s.pts >= from_pts && s.pts < to_pts)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn input(pts: i64) -> SampleInput {
        SampleInput::new(pts, Bytes::from_static(b"payload"))
    }

    #[test]
    fn sequences_are_contiguous() {
        let ring = RingBuffer::new(MediaType::Audio, 4);
        for i in 0..4 {
            assert_eq!(ring.append(input(i * 100)), i as u64);
        }
        assert_eq!(ring.head(), 4);
        assert_eq!(ring.oldest(), Some(0));
    }

    #[test]
    fn overrun_drops_oldest_and_skips_reader_once() {
        // Capacity 4, 6 samples written: retained window is [2, 6).
        let ring = RingBuffer::new(MediaType::Audio, 4);
        for i in 0..6 {
            ring.append(input(i * 100));
        }
        match ring.try_read(0) {
            Some(ReadOutcome::Skipped { to }) => assert_eq!(to, 2),
            other => panic!("expected skip, got {:?}", other),
        }
        // After the skip the reader proceeds normally.
        match ring.try_read(2) {
            Some(ReadOutcome::Sample { sample, next }) => {
                assert_eq!(sample.sequence, 2);
                assert_eq!(next, 3);
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn exactly_capacity_then_one_more_causes_one_skip() {
        let ring = RingBuffer::new(MediaType::Audio, 4);
        for i in 0..4 {
            ring.append(input(i));
        }
        // Reader at the oldest sees no skip yet.
        assert!(matches!(
            ring.try_read(0),
            Some(ReadOutcome::Sample { .. })
        ));
        ring.append(input(4));
        match ring.try_read(0) {
            Some(ReadOutcome::Skipped { to }) => assert_eq!(to, 1),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn video_skip_lands_on_keyframe() {
        let ring = RingBuffer::new(MediaType::Video, 4);
        ring.append(input(0).keyframe()); // seq 0, evicted
        ring.append(input(1)); // seq 1, evicted
        ring.append(input(2)); // seq 2
        ring.append(input(3).keyframe()); // seq 3
        ring.append(input(4)); // seq 4
        ring.append(input(5)); // seq 5
        match ring.try_read(0) {
            Some(ReadOutcome::Skipped { to }) => assert_eq!(to, 3),
            other => panic!("expected skip to keyframe, got {:?}", other),
        }
    }

    #[test]
    fn video_skip_with_no_retained_keyframe_waits() {
        let ring = RingBuffer::new(MediaType::Video, 2);
        ring.append(input(0).keyframe()); // evicted below
        ring.append(input(1));
        ring.append(input(2));
        // Retained: seq 1, 2 - neither a keyframe.
        assert!(ring.try_read(0).is_none());
        ring.append(input(3).keyframe());
        match ring.try_read(0) {
            Some(ReadOutcome::Skipped { to }) => assert_eq!(to, 3),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reader_above_head_unblocks_on_next_append() {
        let ring = Arc::new(RingBuffer::new(MediaType::Audio, 4));
        let reader = Arc::clone(&ring);
        let handle = tokio::spawn(async move { reader.read(0).await });

        // Give the reader time to park.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        ring.append(input(0));
        let outcome = handle.await.expect("reader task");
        match outcome {
            ReadOutcome::Sample { sample, next } => {
                assert_eq!(sample.sequence, 0);
                assert_eq!(next, 1);
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_drains_then_reports_closed() {
        let ring = RingBuffer::new(MediaType::Audio, 4);
        ring.append(input(0));
        ring.append(input(1));
        ring.close();

        // Retained samples drain first.
        assert!(matches!(
            ring.read(0).await,
            ReadOutcome::Sample { .. }
        ));
        assert!(matches!(
            ring.read(1).await,
            ReadOutcome::Sample { .. }
        ));
        assert!(matches!(ring.read(2).await, ReadOutcome::Closed));
    }

    #[test]
    fn identical_cursors_observe_identical_sequences() {
        let ring = RingBuffer::new(MediaType::Audio, 8);
        for i in 0..5 {
            ring.append(input(i * 10));
        }
        let walk = |mut cursor: u64| {
            let mut seen = Vec::new();
            while let Some(ReadOutcome::Sample { sample, next }) = ring.try_read(cursor) {
                seen.push((sample.sequence, sample.pts));
                cursor = next;
            }
            seen
        };
        assert_eq!(walk(0), walk(0));
    }

    #[test]
    fn range_is_clipped_to_retention() {
        let ring = RingBuffer::new(MediaType::Audio, 4);
        for i in 0..6 {
            ring.append(input(i));
        }
        let samples = ring.range(0, 6);
        let seqs: Vec<u64> = samples.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4, 5]);
    }
}
