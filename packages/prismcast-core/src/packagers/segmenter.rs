//! Keyframe-bounded segmentation over a variant's rings.
//!
//! The segmenter incrementally walks the video ring and records segment
//! boundaries; segment payloads are assembled later from the recorded
//! sequence ranges, so any two requests for segment N mux the same samples
//! and produce byte-identical output. Media-sequence indices are strictly
//! increasing across the session lifetime (the starting floor is seeded by
//! the session on reattach).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::relay::{ReadOutcome, Sample, Variant, CLOCK_HZ};

/// A closed segment: all video samples with sequence in
/// `[first_seq, end_seq)` plus the audio covering its pts span.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    /// Media-sequence index, monotonic for the session.
    pub index: u64,
    pub first_seq: u64,
    pub end_seq: u64,
    pub first_pts: i64,
    /// Duration in 90 kHz units.
    pub duration: i64,
    /// False when the segment was force-closed without a leading keyframe.
    pub idr: bool,
}

impl SegmentRecord {
    /// Duration in (fractional) seconds, for playlist EXTINF lines.
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        self.duration as f64 / CLOCK_HZ as f64
    }
}

struct OpenSegment {
    first_seq: u64,
    first_pts: i64,
    first_dts: i64,
    last_dts: i64,
    idr: bool,
    /// First sample at or past the target boundary; the cut point if we
    /// are forced to close without a keyframe.
    forced_boundary: Option<(u64, i64, i64)>,
}

struct SegmenterState {
    records: VecDeque<SegmentRecord>,
    next_index: u64,
    cursor: u64,
    open: Option<OpenSegment>,
    finished: bool,
}

/// Incremental segment index for one variant.
pub struct Segmenter {
    variant: Arc<Variant>,
    /// Target duration in 90 kHz units.
    target: i64,
    /// Closed segments retained for serving (playlist window plus slack
    /// for clients still fetching segments that slid out).
    retain: usize,
    state: Mutex<SegmenterState>,
}

impl Segmenter {
    #[must_use]
    pub fn new(variant: Arc<Variant>, target_secs: u64, window: usize, first_index: u64) -> Self {
        Self {
            variant,
            target: target_secs as i64 * CLOCK_HZ,
            retain: window * 2 + 1,
            state: Mutex::new(SegmenterState {
                records: VecDeque::new(),
                next_index: first_index,
                cursor: 0,
                open: None,
                finished: false,
            }),
        }
    }

    #[must_use]
    pub fn variant(&self) -> &Arc<Variant> {
        &self.variant
    }

    /// Next media-sequence index; used to seed a successor segmenter.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.state.lock().next_index
    }

    /// Consumes newly available video samples and closes segments per the
    /// boundary rules. Called before serving any playlist or segment.
    pub fn advance(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        let ring = self.variant.video_ring();

        loop {
            match ring.try_read(state.cursor) {
                None => break,
                Some(ReadOutcome::Closed) => {
                    // Flush the open segment so readers can drain the tail.
                    if let Some(open) = state.open.take() {
                        let end_seq = state.cursor;
                        let duration = (open.last_dts - open.first_dts).max(0);
                        Self::push_record(
                            &mut state,
                            self.retain,
                            SegmentRecord {
                                index: 0, // patched by push_record
                                first_seq: open.first_seq,
                                end_seq,
                                first_pts: open.first_pts,
                                duration,
                                idr: open.idr,
                            },
                        );
                    }
                    state.finished = true;
                    break;
                }
                Some(ReadOutcome::Skipped { to }) => {
                    // The segmenter fell behind the ring; restart cleanly
                    // at the skip target.
                    log::warn!(
                        "[Segmenter] fell behind retention, restarting at seq {to}"
                    );
                    state.open = None;
                    state.cursor = to;
                }
                Some(ReadOutcome::Sample { sample, next }) => {
                    self.observe(&mut state, &sample);
                    state.cursor = next;
                }
            }
        }
    }

    fn observe(&self, state: &mut SegmenterState, sample: &Arc<Sample>) {
        match state.open.as_mut() {
            None => {
                // Segments start at a keyframe; leading non-keyframes are
                // not serviceable and are skipped.
                if sample.keyframe {
                    state.open = Some(OpenSegment {
                        first_seq: sample.sequence,
                        first_pts: sample.pts,
                        first_dts: sample.dts,
                        last_dts: sample.dts,
                        idr: true,
                        forced_boundary: None,
                    });
                }
            }
            Some(open) => {
                open.last_dts = sample.dts;
                let elapsed = sample.dts - open.first_dts;

                if sample.keyframe && elapsed >= self.target {
                    // Normal close: boundary at this keyframe.
                    let record = SegmentRecord {
                        index: 0,
                        first_seq: open.first_seq,
                        end_seq: sample.sequence,
                        first_pts: open.first_pts,
                        duration: elapsed,
                        idr: open.idr,
                    };
                    state.open = Some(OpenSegment {
                        first_seq: sample.sequence,
                        first_pts: sample.pts,
                        first_dts: sample.dts,
                        last_dts: sample.dts,
                        idr: true,
                        forced_boundary: None,
                    });
                    Self::push_record(state, self.retain, record);
                    return;
                }

                if open.forced_boundary.is_none() && elapsed >= self.target {
                    open.forced_boundary = Some((sample.sequence, sample.pts, sample.dts));
                }

                if elapsed >= 2 * self.target {
                    // No keyframe within tolerance: force-close at the
                    // target boundary; the successor starts non-IDR.
                    let (cut_seq, cut_pts, cut_dts) = open
                        .forced_boundary
                        .unwrap_or((sample.sequence, sample.pts, sample.dts));
                    log::warn!(
                        "[Segmenter] no keyframe within {}s, force-closing non-IDR segment",
                        2 * self.target / CLOCK_HZ
                    );
                    let record = SegmentRecord {
                        index: 0,
                        first_seq: open.first_seq,
                        end_seq: cut_seq,
                        first_pts: open.first_pts,
                        duration: cut_dts - open.first_dts,
                        idr: open.idr,
                    };
                    state.open = Some(OpenSegment {
                        first_seq: cut_seq,
                        first_pts: cut_pts,
                        first_dts: cut_dts,
                        last_dts: sample.dts,
                        idr: false,
                        forced_boundary: None,
                    });
                    Self::push_record(state, self.retain, record);
                }
            }
        }
    }

    fn push_record(state: &mut SegmenterState, retain: usize, mut record: SegmentRecord) {
        record.index = state.next_index;
        state.next_index += 1;
        state.records.push_back(record);
        while state.records.len() > retain {
            state.records.pop_front();
        }
    }

    /// The sliding playlist window: the most recent `window` records.
    #[must_use]
    pub fn window(&self, window: usize) -> Vec<SegmentRecord> {
        let state = self.state.lock();
        let skip = state.records.len().saturating_sub(window);
        state.records.iter().skip(skip).cloned().collect()
    }

    /// Looks up a closed segment by media-sequence index.
    #[must_use]
    pub fn record(&self, index: u64) -> Option<SegmentRecord> {
        self.state
            .lock()
            .records
            .iter()
            .find(|r| r.index == index)
            .cloned()
    }

    /// Whether the underlying stream has ended.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Assembles the sample set for a segment: the recorded video range
    /// plus the audio samples covering its presentation span.
    #[must_use]
    pub fn samples(&self, record: &SegmentRecord) -> (Vec<Arc<Sample>>, Vec<Arc<Sample>>) {
        let video = self
            .variant
            .video_ring()
            .range(record.first_seq, record.end_seq);
        let audio = self
            .variant
            .audio_ring()
            .range_by_pts(record.first_pts, record.first_pts + record.duration);
        (video, audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{MediaType, SampleInput, VariantKey};
    use bytes::Bytes;

    const SEC: i64 = CLOCK_HZ;

    fn variant() -> Arc<Variant> {
        Arc::new(Variant::new(VariantKey::new("h264", "aac"), 2048, 4096))
    }

    fn push_video(v: &Arc<Variant>, pts: i64, keyframe: bool) {
        let mut input = SampleInput::new(pts, Bytes::from_static(b"frame"));
        if keyframe {
            input = input.keyframe();
        }
        v.push(MediaType::Video, input);
    }

    /// 30 fps GOP pattern: keyframe every `gop` frames.
    fn feed(v: &Arc<Variant>, frames: usize, gop: usize) {
        for i in 0..frames {
            push_video(v, i as i64 * SEC / 30, i % gop == 0);
        }
    }

    #[test]
    fn segments_close_on_keyframes_past_target() {
        let v = variant();
        // 2-second GOPs, 6s target: segments close at every third keyframe.
        feed(&v, 30 * 20, 60);
        let seg = Segmenter::new(Arc::clone(&v), 6, 5, 0);
        seg.advance();
        let window = seg.window(5);
        assert!(!window.is_empty());
        for record in &window {
            assert!(record.idr);
            assert!(record.duration >= 6 * SEC);
            // Boundary lands exactly on a keyframe multiple.
            assert_eq!(record.duration % (2 * SEC), 0);
        }
    }

    #[test]
    fn indices_are_strictly_increasing() {
        let v = variant();
        feed(&v, 30 * 40, 60);
        let seg = Segmenter::new(Arc::clone(&v), 6, 5, 10);
        seg.advance();
        let window = seg.window(5);
        for pair in window.windows(2) {
            assert_eq!(pair[1].index, pair[0].index + 1);
        }
        assert!(window[0].index >= 10, "seeded floor respected");
    }

    #[test]
    fn no_keyframes_forces_non_idr_close() {
        let v = variant();
        // One keyframe, then 20 seconds without: force-close applies.
        push_video(&v, 0, true);
        for i in 1..(30 * 20) {
            push_video(&v, i as i64 * SEC / 30, false);
        }
        let seg = Segmenter::new(Arc::clone(&v), 6, 5, 0);
        seg.advance();
        let window = seg.window(5);
        assert!(!window.is_empty());
        // First segment opened on the keyframe; cut at the target boundary.
        assert!(window[0].idr);
        assert!(window[0].duration >= 6 * SEC && window[0].duration < 7 * SEC);
        // Successor opened at the forced cut, so it is non-IDR.
        if window.len() > 1 {
            assert!(!window[1].idr);
        }
    }

    #[test]
    fn same_segment_yields_identical_samples() {
        let v = variant();
        feed(&v, 30 * 20, 60);
        let seg = Segmenter::new(Arc::clone(&v), 6, 5, 0);
        seg.advance();
        let record = seg.window(5).remove(0);
        let (video_a, audio_a) = seg.samples(&record);
        let (video_b, audio_b) = seg.samples(&record);
        let seqs = |v: &[Arc<Sample>]| v.iter().map(|s| s.sequence).collect::<Vec<_>>();
        assert_eq!(seqs(&video_a), seqs(&video_b));
        assert_eq!(audio_a.len(), audio_b.len());
    }

    #[test]
    fn closed_ring_flushes_tail_segment() {
        let v = variant();
        feed(&v, 90, 30); // 3 seconds, target 6: nothing closes normally
        v.close();
        let seg = Segmenter::new(Arc::clone(&v), 6, 5, 0);
        seg.advance();
        assert!(seg.finished());
        assert_eq!(seg.window(5).len(), 1);
    }
}
