//! DASH manifest (MPD) generation.
//!
//! Advertises the same fMP4 segments the HLS-fMP4 packager serves, via a
//! periodically regenerated dynamic MPD with a `SegmentTemplate`. The
//! timeShiftBufferDepth equals the retained segment window.

use chrono::{SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::relay::{CodecTag, CLOCK_HZ};

use super::segmenter::SegmentRecord;

fn rfc_codec(codec: &CodecTag, video: bool) -> &'static str {
    match (video, codec.as_str()) {
        (true, "hevc") => "hvc1.1.6.L93.B0",
        (true, _) => "avc1.640028",
        (false, "mp3") => "mp4a.40.34",
        (false, "ac3") => "ac-3",
        (false, _) => "mp4a.40.2",
    }
}

/// Renders the MPD for the current segment window.
#[must_use]
pub fn mpd(
    records: &[SegmentRecord],
    target_secs: u64,
    video_codec: &CodecTag,
    audio_codec: &CodecTag,
) -> String {
    let retained_secs: i64 = records.iter().map(|r| r.duration).sum::<i64>() / CLOCK_HZ;
    let start_number = records.first().map_or(0, |r| r.index);
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut writer = Writer::new(Vec::new());
    let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)));

    let mut mpd = BytesStart::new("MPD");
    mpd.push_attribute(("xmlns", "urn:mpeg:dash:schema:mpd:2011"));
    mpd.push_attribute(("profiles", "urn:mpeg:dash:profile:isoff-live:2011"));
    mpd.push_attribute(("type", "dynamic"));
    mpd.push_attribute(("availabilityStartTime", now.as_str()));
    mpd.push_attribute(("publishTime", now.as_str()));
    mpd.push_attribute((
        "minimumUpdatePeriod",
        format!("PT{target_secs}S").as_str(),
    ));
    mpd.push_attribute((
        "timeShiftBufferDepth",
        format!("PT{retained_secs}S").as_str(),
    ));
    mpd.push_attribute((
        "maxSegmentDuration",
        format!("PT{target_secs}S").as_str(),
    ));
    mpd.push_attribute(("minBufferTime", "PT2S"));
    let _ = writer.write_event(Event::Start(mpd));

    let mut period = BytesStart::new("Period");
    period.push_attribute(("id", "0"));
    period.push_attribute(("start", "PT0S"));
    let _ = writer.write_event(Event::Start(period));

    write_adaptation_set(
        &mut writer,
        "video/mp4",
        rfc_codec(video_codec, true),
        "video",
        target_secs,
        start_number,
    );
    write_adaptation_set(
        &mut writer,
        "audio/mp4",
        rfc_codec(audio_codec, false),
        "audio",
        target_secs,
        start_number,
    );

    let _ = writer.write_event(Event::End(BytesEnd::new("Period")));
    let _ = writer.write_event(Event::End(BytesEnd::new("MPD")));

    String::from_utf8(writer.into_inner()).unwrap_or_default()
}

fn write_adaptation_set(
    writer: &mut Writer<Vec<u8>>,
    mime: &str,
    codecs: &str,
    id: &str,
    target_secs: u64,
    start_number: u64,
) {
    let mut set = BytesStart::new("AdaptationSet");
    set.push_attribute(("id", id));
    set.push_attribute(("mimeType", mime));
    set.push_attribute(("segmentAlignment", "true"));
    let _ = writer.write_event(Event::Start(set));

    let mut representation = BytesStart::new("Representation");
    representation.push_attribute(("id", format!("{id}-0").as_str()));
    representation.push_attribute(("codecs", codecs));
    representation.push_attribute(("bandwidth", "0"));
    let _ = writer.write_event(Event::Start(representation));

    let mut template = BytesStart::new("SegmentTemplate");
    template.push_attribute(("timescale", CLOCK_HZ.to_string().as_str()));
    template.push_attribute((
        "duration",
        (target_secs as i64 * CLOCK_HZ).to_string().as_str(),
    ));
    template.push_attribute(("initialization", "init.mp4"));
    template.push_attribute(("media", "segment_$Number$.m4s"));
    template.push_attribute(("startNumber", start_number.to_string().as_str()));
    let _ = writer.write_event(Event::Empty(template));

    let _ = writer.write_event(Event::End(BytesEnd::new("Representation")));
    let _ = writer.write_event(Event::End(BytesEnd::new("AdaptationSet")));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64, duration_secs: i64) -> SegmentRecord {
        SegmentRecord {
            index,
            first_seq: 0,
            end_seq: 1,
            first_pts: 0,
            duration: duration_secs * CLOCK_HZ,
            idr: true,
        }
    }

    #[test]
    fn mpd_is_dynamic_with_segment_template() {
        let records = vec![record(4, 6), record(5, 6), record(6, 6)];
        let xml = mpd(&records, 6, &CodecTag::new("h264"), &CodecTag::new("aac"));
        assert!(xml.contains("type=\"dynamic\""));
        assert!(xml.contains("media=\"segment_$Number$.m4s\""));
        assert!(xml.contains("startNumber=\"4\""));
        assert!(xml.contains("timeShiftBufferDepth=\"PT18S\""));
        assert!(xml.contains("avc1"));
        assert!(xml.contains("mp4a.40.2"));
    }
}
