//! HLS media playlist emission.
//!
//! Sliding-window playlists over the segmenter's records. Media-sequence
//! numbering comes straight from the record indices, which the session
//! keeps strictly increasing for its lifetime.

use super::segmenter::SegmentRecord;

/// Media playlist for MPEG-TS segments. `uri_suffix` (a query string or
/// empty) is appended to each segment URI so non-default variants keep
/// their identity across segment requests.
#[must_use]
pub fn media_playlist_ts(
    records: &[SegmentRecord],
    target_secs: u64,
    uri_suffix: &str,
    ended: bool,
) -> String {
    let mut out = playlist_header(records, target_secs, 3);
    for record in records {
        push_segment(&mut out, record, "ts", uri_suffix);
    }
    if ended {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

/// Media playlist for fMP4 segments, referencing the init segment via
/// `EXT-X-MAP`.
#[must_use]
pub fn media_playlist_fmp4(
    records: &[SegmentRecord],
    target_secs: u64,
    init_uri: &str,
    uri_suffix: &str,
    ended: bool,
) -> String {
    let mut out = playlist_header(records, target_secs, 7);
    out.push_str(&format!("#EXT-X-MAP:URI=\"{init_uri}{uri_suffix}\"\n"));
    for record in records {
        push_segment(&mut out, record, "m4s", uri_suffix);
    }
    if ended {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

fn playlist_header(records: &[SegmentRecord], target_secs: u64, version: u8) -> String {
    // TARGETDURATION must cover the longest segment (force-closed segments
    // can exceed the configured target).
    let max_duration = records
        .iter()
        .map(|r| r.duration_secs().ceil() as u64)
        .max()
        .unwrap_or(target_secs)
        .max(target_secs);
    let media_sequence = records.first().map_or(0, |r| r.index);

    let mut out = String::with_capacity(256 + records.len() * 64);
    out.push_str("#EXTM3U\n");
    out.push_str(&format!("#EXT-X-VERSION:{version}\n"));
    out.push_str(&format!("#EXT-X-TARGETDURATION:{max_duration}\n"));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
    out
}

fn push_segment(out: &mut String, record: &SegmentRecord, extension: &str, uri_suffix: &str) {
    if !record.idr {
        // Non-IDR segments break decoding for joiners; mark the
        // discontinuity so players reset their decoders.
        out.push_str("#EXT-X-DISCONTINUITY\n");
    }
    out.push_str(&format!("#EXTINF:{:.3},\n", record.duration_secs()));
    out.push_str(&format!(
        "segment_{}.{}{}\n",
        record.index, extension, uri_suffix
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64, duration_secs: i64, idr: bool) -> SegmentRecord {
        SegmentRecord {
            index,
            first_seq: index * 100,
            end_seq: (index + 1) * 100,
            first_pts: 0,
            duration: duration_secs * 90_000,
            idr,
        }
    }

    #[test]
    fn ts_playlist_window_and_sequence() {
        let records = vec![record(7, 6, true), record(8, 6, true), record(9, 6, true)];
        let playlist = media_playlist_ts(&records, 6, "", false);
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:7\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:6\n"));
        assert!(playlist.contains("segment_9.ts\n"));
        assert!(!playlist.contains("ENDLIST"));
    }

    #[test]
    fn fmp4_playlist_references_init_map() {
        let records = vec![record(0, 6, true)];
        let playlist = media_playlist_fmp4(&records, 6, "init.mp4", "", true);
        assert!(playlist.contains("#EXT-X-MAP:URI=\"init.mp4\"\n"));
        assert!(playlist.contains("segment_0.m4s\n"));
        assert!(playlist.contains("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn long_forced_segment_raises_target_duration() {
        let records = vec![record(0, 6, true), record(1, 9, false)];
        let playlist = media_playlist_ts(&records, 6, "", false);
        assert!(playlist.contains("#EXT-X-TARGETDURATION:9\n"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY\n"));
    }

    #[test]
    fn uri_suffix_is_appended_to_segments() {
        let records = vec![record(0, 6, true)];
        let playlist = media_playlist_ts(&records, 6, "?video=hevc&audio=aac", false);
        assert!(playlist.contains("segment_0.ts?video=hevc&audio=aac\n"));
    }
}
