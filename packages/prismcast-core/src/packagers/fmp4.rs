//! Fragmented MP4 packaging: init segments and moof/mdat fragments.
//!
//! The init segment is built from the variant's captured codec init data
//! (annex-B SPS/PPS, AudioSpecificConfig); fragments carry the same sample
//! ranges the TS packager uses, so HLS-fMP4 and DASH share both
//! segmentation and payload bytes.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::relay::demux::annexb_nals;
use crate::relay::{CodecTag, Sample, CLOCK_HZ};

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;
/// Fallback per-sample duration when a fragment has a single sample.
const DEFAULT_SAMPLE_DURATION: i64 = CLOCK_HZ / 25;

const ADTS_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

fn mp4_box(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((body.len() as u32 + 8).to_be_bytes()));
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    out
}

fn full_box(tag: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(4 + body.len());
    full.push(version);
    full.extend_from_slice(&flags.to_be_bytes()[1..]);
    full.extend_from_slice(body);
    mp4_box(tag, &full)
}

/// Builds the initialization segment (`ftyp` + `moov`).
///
/// `video_init` is annex-B parameter sets, `audio_init` an
/// AudioSpecificConfig. Either may be absent while the producer has not
/// yet delivered them; the corresponding track is then omitted.
#[must_use]
pub fn init_segment(
    video_init: Option<&Bytes>,
    audio_init: Option<&Bytes>,
    video_codec: &CodecTag,
) -> Bytes {
    let mut out = BytesMut::new();

    let mut ftyp_body = Vec::new();
    ftyp_body.extend_from_slice(b"isom");
    ftyp_body.extend_from_slice(&512u32.to_be_bytes());
    ftyp_body.extend_from_slice(b"isom");
    ftyp_body.extend_from_slice(b"iso6");
    ftyp_body.extend_from_slice(b"mp41");
    out.extend_from_slice(&mp4_box(b"ftyp", &ftyp_body));

    let mut moov_body = Vec::new();
    moov_body.extend_from_slice(&mvhd());
    if let Some(init) = video_init {
        moov_body.extend_from_slice(&video_trak(init, video_codec));
    }
    if let Some(init) = audio_init {
        moov_body.extend_from_slice(&audio_trak(init));
    }
    let mut mvex_body = Vec::new();
    if video_init.is_some() {
        mvex_body.extend_from_slice(&trex(VIDEO_TRACK_ID));
    }
    if audio_init.is_some() {
        mvex_body.extend_from_slice(&trex(AUDIO_TRACK_ID));
    }
    moov_body.extend_from_slice(&mp4_box(b"mvex", &mvex_body));
    out.extend_from_slice(&mp4_box(b"moov", &moov_body));

    out.freeze()
}

fn mvhd() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0; 8]); // creation/modification
    body.extend_from_slice(&(CLOCK_HZ as u32).to_be_bytes()); // timescale
    body.extend_from_slice(&0u32.to_be_bytes()); // duration: unknown (live)
    body.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
    body.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
    body.extend_from_slice(&[0; 10]); // reserved
    body.extend_from_slice(&unity_matrix());
    body.extend_from_slice(&[0; 24]); // pre_defined
    body.extend_from_slice(&(AUDIO_TRACK_ID + 1).to_be_bytes()); // next_track_ID
    full_box(b"mvhd", 0, 0, &body)
}

fn unity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}

fn tkhd(track_id: u32, width: u16, height: u16, audio: bool) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0; 8]);
    body.extend_from_slice(&track_id.to_be_bytes());
    body.extend_from_slice(&[0; 4]); // reserved
    body.extend_from_slice(&0u32.to_be_bytes()); // duration
    body.extend_from_slice(&[0; 8]); // reserved
    body.extend_from_slice(&0u16.to_be_bytes()); // layer
    body.extend_from_slice(&0u16.to_be_bytes()); // alternate_group
    body.extend_from_slice(&(if audio { 0x0100u16 } else { 0 }).to_be_bytes()); // volume
    body.extend_from_slice(&[0; 2]); // reserved
    body.extend_from_slice(&unity_matrix());
    body.extend_from_slice(&(u32::from(width) << 16).to_be_bytes());
    body.extend_from_slice(&(u32::from(height) << 16).to_be_bytes());
    full_box(b"tkhd", 0, 0x7, &body) // enabled | in_movie | in_preview
}

fn mdhd() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0; 8]);
    body.extend_from_slice(&(CLOCK_HZ as u32).to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0x55C4u16.to_be_bytes()); // language: und
    body.extend_from_slice(&[0; 2]);
    full_box(b"mdhd", 0, 0, &body)
}

fn hdlr(handler: &[u8; 4], name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0; 4]); // pre_defined
    body.extend_from_slice(handler);
    body.extend_from_slice(&[0; 12]); // reserved
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    full_box(b"hdlr", 0, 0, &body)
}

fn dinf() -> Vec<u8> {
    let url = full_box(b"url ", 0, 1, &[]); // self-contained
    let mut dref_body = Vec::new();
    dref_body.extend_from_slice(&1u32.to_be_bytes());
    dref_body.extend_from_slice(&url);
    mp4_box(b"dinf", &full_box(b"dref", 0, 0, &dref_body))
}

/// Empty fixed-size sample tables required by stbl for fragmented files.
fn empty_sample_tables() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&full_box(b"stts", 0, 0, &0u32.to_be_bytes()));
    out.extend_from_slice(&full_box(b"stsc", 0, 0, &0u32.to_be_bytes()));
    let mut stsz = Vec::new();
    stsz.extend_from_slice(&0u32.to_be_bytes()); // sample_size
    stsz.extend_from_slice(&0u32.to_be_bytes()); // sample_count
    out.extend_from_slice(&full_box(b"stsz", 0, 0, &stsz));
    out.extend_from_slice(&full_box(b"stco", 0, 0, &0u32.to_be_bytes()));
    out
}

fn video_trak(init: &Bytes, codec: &CodecTag) -> Vec<u8> {
    let sample_entry = if codec.as_str() == "hevc" {
        hvc1(init)
    } else {
        avc1(init)
    };
    let mut stsd_body = Vec::new();
    stsd_body.extend_from_slice(&1u32.to_be_bytes());
    stsd_body.extend_from_slice(&sample_entry);

    let mut stbl_body = full_box(b"stsd", 0, 0, &stsd_body);
    stbl_body.extend_from_slice(&empty_sample_tables());

    let mut minf_body = full_box(b"vmhd", 0, 1, &[0; 8]);
    minf_body.extend_from_slice(&dinf());
    minf_body.extend_from_slice(&mp4_box(b"stbl", &stbl_body));

    let mut mdia_body = mdhd();
    mdia_body.extend_from_slice(&hdlr(b"vide", "VideoHandler"));
    mdia_body.extend_from_slice(&mp4_box(b"minf", &minf_body));

    let mut trak_body = tkhd(VIDEO_TRACK_ID, 1920, 1080, false);
    trak_body.extend_from_slice(&mp4_box(b"mdia", &mdia_body));
    mp4_box(b"trak", &trak_body)
}

fn visual_sample_entry_prefix() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0; 6]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    body.extend_from_slice(&[0; 16]); // pre_defined/reserved
    body.extend_from_slice(&1920u16.to_be_bytes());
    body.extend_from_slice(&1080u16.to_be_bytes());
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // horizresolution 72dpi
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    body.extend_from_slice(&[0; 4]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    body.extend_from_slice(&[0; 32]); // compressorname
    body.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
    body.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
    body
}

fn avc1(init: &Bytes) -> Vec<u8> {
    let mut body = visual_sample_entry_prefix();
    body.extend_from_slice(&mp4_box(b"avcC", &avcc(init)));
    mp4_box(b"avc1", &body)
}

/// AVCDecoderConfigurationRecord from annex-B SPS/PPS.
fn avcc(init: &[u8]) -> Vec<u8> {
    let mut sps_units = Vec::new();
    let mut pps_units = Vec::new();
    for (nal_type, start, end) in annexb_nals(init, false) {
        match nal_type {
            7 => sps_units.push(&init[start..end]),
            8 => pps_units.push(&init[start..end]),
            _ => {}
        }
    }

    let mut out = Vec::new();
    out.push(1); // configurationVersion
    let (profile, compat, level) = sps_units
        .first()
        .filter(|sps| sps.len() >= 4)
        .map_or((0x64, 0, 0x28), |sps| (sps[1], sps[2], sps[3]));
    out.push(profile);
    out.push(compat);
    out.push(level);
    out.push(0xFF); // lengthSizeMinusOne = 3
    out.push(0xE0 | (sps_units.len() as u8 & 0x1F));
    for sps in &sps_units {
        out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        out.extend_from_slice(sps);
    }
    out.push(pps_units.len() as u8);
    for pps in &pps_units {
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(pps);
    }
    out
}

fn hvc1(init: &Bytes) -> Vec<u8> {
    let mut body = visual_sample_entry_prefix();
    body.extend_from_slice(&mp4_box(b"hvcC", &hvcc(init)));
    mp4_box(b"hvc1", &body)
}

/// Minimal HEVCDecoderConfigurationRecord carrying the parameter sets.
fn hvcc(init: &[u8]) -> Vec<u8> {
    let mut arrays: Vec<(u8, Vec<&[u8]>)> = vec![(32, vec![]), (33, vec![]), (34, vec![])];
    for (nal_type, start, end) in annexb_nals(init, true) {
        if let Some(entry) = arrays.iter_mut().find(|(t, _)| *t == nal_type) {
            entry.1.push(&init[start..end]);
        }
    }

    let mut out = Vec::new();
    out.push(1); // configurationVersion
    out.push(0x01); // profile_space/tier/profile_idc (main)
    out.extend_from_slice(&0x6000_0000u32.to_be_bytes()); // compatibility flags
    out.extend_from_slice(&[0x90, 0, 0, 0, 0, 0]); // constraint flags
    out.push(0x5D); // level_idc (3.1)
    out.extend_from_slice(&0xF000u16.to_be_bytes()); // min_spatial_segmentation
    out.push(0xFC); // parallelismType
    out.push(0xFD); // chroma_format_idc: 4:2:0
    out.push(0xF8); // bit_depth_luma - 8
    out.push(0xF8); // bit_depth_chroma - 8
    out.extend_from_slice(&0u16.to_be_bytes()); // avgFrameRate
    out.push(0x03); // lengthSizeMinusOne = 3
    let non_empty: Vec<_> = arrays.iter().filter(|(_, units)| !units.is_empty()).collect();
    out.push(non_empty.len() as u8);
    for (nal_type, units) in non_empty {
        out.push(0x80 | nal_type); // array_completeness
        out.extend_from_slice(&(units.len() as u16).to_be_bytes());
        for unit in units {
            out.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            out.extend_from_slice(unit);
        }
    }
    out
}

fn audio_trak(asc: &Bytes) -> Vec<u8> {
    let sample_rate = sample_rate_from_asc(asc).unwrap_or(48_000);
    let channels = channels_from_asc(asc).unwrap_or(2);

    let mut mp4a_body = Vec::new();
    mp4a_body.extend_from_slice(&[0; 6]);
    mp4a_body.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    mp4a_body.extend_from_slice(&[0; 8]); // reserved
    mp4a_body.extend_from_slice(&u16::from(channels).to_be_bytes());
    mp4a_body.extend_from_slice(&16u16.to_be_bytes()); // samplesize
    mp4a_body.extend_from_slice(&[0; 4]); // pre_defined/reserved
    mp4a_body.extend_from_slice(&(sample_rate << 16).to_be_bytes());
    mp4a_body.extend_from_slice(&esds(asc));
    let mp4a = mp4_box(b"mp4a", &mp4a_body);

    let mut stsd_body = Vec::new();
    stsd_body.extend_from_slice(&1u32.to_be_bytes());
    stsd_body.extend_from_slice(&mp4a);

    let mut stbl_body = full_box(b"stsd", 0, 0, &stsd_body);
    stbl_body.extend_from_slice(&empty_sample_tables());

    let mut minf_body = full_box(b"smhd", 0, 0, &[0; 4]);
    minf_body.extend_from_slice(&dinf());
    minf_body.extend_from_slice(&mp4_box(b"stbl", &stbl_body));

    let mut mdia_body = mdhd();
    mdia_body.extend_from_slice(&hdlr(b"soun", "SoundHandler"));
    mdia_body.extend_from_slice(&mp4_box(b"minf", &minf_body));

    let mut trak_body = tkhd(AUDIO_TRACK_ID, 0, 0, true);
    trak_body.extend_from_slice(&mp4_box(b"mdia", &mdia_body));
    mp4_box(b"trak", &trak_body)
}

/// ES descriptor wrapping the AudioSpecificConfig.
fn esds(asc: &[u8]) -> Vec<u8> {
    // DecoderSpecificInfo (tag 5)
    let mut dsi = vec![0x05, asc.len() as u8];
    dsi.extend_from_slice(asc);
    // DecoderConfigDescriptor (tag 4): AAC, AudioStream
    let mut dcd = vec![0x04, (13 + dsi.len()) as u8, 0x40, 0x15];
    dcd.extend_from_slice(&[0, 0, 0]); // buffer size
    dcd.extend_from_slice(&0u32.to_be_bytes()); // max bitrate
    dcd.extend_from_slice(&0u32.to_be_bytes()); // avg bitrate
    dcd.extend_from_slice(&dsi);
    // ESDescriptor (tag 3)
    let mut esd = vec![0x03, (3 + dcd.len() + 3) as u8];
    esd.extend_from_slice(&AUDIO_TRACK_ID.to_be_bytes()[2..]); // ES_ID
    esd.push(0); // flags
    esd.extend_from_slice(&dcd);
    esd.extend_from_slice(&[0x06, 0x01, 0x02]); // SLConfigDescriptor
    full_box(b"esds", 0, 0, &esd)
}

fn sample_rate_from_asc(asc: &[u8]) -> Option<u32> {
    if asc.len() < 2 {
        return None;
    }
    let sfi = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
    ADTS_SAMPLE_RATES.get(sfi as usize).copied()
}

fn channels_from_asc(asc: &[u8]) -> Option<u8> {
    if asc.len() < 2 {
        return None;
    }
    Some((asc[1] >> 3) & 0x0F)
}

fn trex(track_id: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&track_id.to_be_bytes());
    body.extend_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    full_box(b"trex", 0, 0, &body)
}

// ─────────────────────────────────────────────────────────────────────────────
// Fragments
// ─────────────────────────────────────────────────────────────────────────────

struct TrackRun {
    track_id: u32,
    base_dts: i64,
    durations: Vec<u32>,
    sizes: Vec<u32>,
    keyflags: Vec<u32>,
    ctos: Vec<i32>,
    data: Vec<u8>,
}

/// Builds one `moof`+`mdat` media fragment.
///
/// Video payloads are converted from annex-B to length-prefixed form;
/// AAC audio payloads are stripped of ADTS framing.
#[must_use]
pub fn media_fragment(
    sequence: u32,
    video: &[Arc<Sample>],
    audio: &[Arc<Sample>],
    hevc: bool,
) -> Bytes {
    let mut runs = Vec::new();
    if !video.is_empty() {
        runs.push(track_run(
            VIDEO_TRACK_ID,
            video,
            |payload| annexb_to_length_prefixed(payload, hevc),
            true,
        ));
    }
    if !audio.is_empty() {
        runs.push(track_run(AUDIO_TRACK_ID, audio, strip_adts, false));
    }

    // First pass sizes the moof; second pass patches real data offsets.
    let moof_len = build_moof(sequence, &runs, &[0; 2]).len();
    let mut offsets = [0u32; 2];
    let mut running = moof_len as u32 + 8; // + mdat header
    for (i, run) in runs.iter().enumerate() {
        offsets[i] = running;
        running += run.data.len() as u32;
    }
    let moof = build_moof(sequence, &runs, &offsets);

    let mut out = BytesMut::with_capacity(moof.len() + running as usize);
    out.extend_from_slice(&moof);
    let mdat_len: usize = runs.iter().map(|r| r.data.len()).sum();
    out.put_u32(mdat_len as u32 + 8);
    out.extend_from_slice(b"mdat");
    for run in &runs {
        out.extend_from_slice(&run.data);
    }
    out.freeze()
}

fn track_run(
    track_id: u32,
    samples: &[Arc<Sample>],
    transform: impl Fn(&[u8]) -> Vec<u8>,
    video: bool,
) -> TrackRun {
    let mut durations = Vec::with_capacity(samples.len());
    let mut sizes = Vec::with_capacity(samples.len());
    let mut keyflags = Vec::with_capacity(samples.len());
    let mut ctos = Vec::with_capacity(samples.len());
    let mut data = Vec::new();

    for (i, sample) in samples.iter().enumerate() {
        let duration = samples
            .get(i + 1)
            .map(|next| (next.dts - sample.dts).max(1) as u32)
            .unwrap_or_else(|| {
                durations
                    .last()
                    .copied()
                    .unwrap_or(DEFAULT_SAMPLE_DURATION as u32)
            });
        durations.push(duration);
        let payload = transform(&sample.payload);
        sizes.push(payload.len() as u32);
        data.extend_from_slice(&payload);
        // sample_flags: sync samples are "depends on nothing" (0x02000000),
        // others are non-sync (0x00010000).
        keyflags.push(if !video || sample.keyframe {
            0x0200_0000
        } else {
            0x0001_0000
        });
        ctos.push((sample.pts - sample.dts) as i32);
    }

    TrackRun {
        track_id,
        base_dts: samples.first().map_or(0, |s| s.dts),
        durations,
        sizes,
        keyflags,
        ctos,
        data,
    }
}

fn build_moof(sequence: u32, runs: &[TrackRun], offsets: &[u32]) -> Vec<u8> {
    let mut moof_body = full_box(b"mfhd", 0, 0, &sequence.to_be_bytes());
    for (run, offset) in runs.iter().zip(offsets) {
        moof_body.extend_from_slice(&traf(run, *offset));
    }
    mp4_box(b"moof", &moof_body)
}

fn traf(run: &TrackRun, data_offset: u32) -> Vec<u8> {
    // tfhd: default-base-is-moof
    let mut tfhd_body = Vec::new();
    tfhd_body.extend_from_slice(&run.track_id.to_be_bytes());
    let mut body = full_box(b"tfhd", 0, 0x02_0000, &tfhd_body);

    let mut tfdt_body = Vec::new();
    tfdt_body.extend_from_slice(&(run.base_dts.max(0) as u64).to_be_bytes());
    body.extend_from_slice(&full_box(b"tfdt", 1, 0, &tfdt_body));

    // trun: data-offset | duration | size | flags | cto
    let mut trun_body = Vec::new();
    trun_body.extend_from_slice(&(run.sizes.len() as u32).to_be_bytes());
    trun_body.extend_from_slice(&(data_offset as i32).to_be_bytes());
    for i in 0..run.sizes.len() {
        trun_body.extend_from_slice(&run.durations[i].to_be_bytes());
        trun_body.extend_from_slice(&run.sizes[i].to_be_bytes());
        trun_body.extend_from_slice(&run.keyflags[i].to_be_bytes());
        trun_body.extend_from_slice(&run.ctos[i].to_be_bytes());
    }
    body.extend_from_slice(&full_box(b"trun", 1, 0xF01, &trun_body));
    mp4_box(b"traf", &body)
}

/// Converts an annex-B access unit to 4-byte length-prefixed NAL units.
fn annexb_to_length_prefixed(payload: &[u8], hevc: bool) -> Vec<u8> {
    let nals = annexb_nals(payload, hevc);
    if nals.is_empty() {
        // Already length-prefixed (transcoded path) or opaque: pass through.
        return payload.to_vec();
    }
    let mut out = Vec::with_capacity(payload.len() + 16);
    for (_, start, end) in nals {
        out.extend_from_slice(&((end - start) as u32).to_be_bytes());
        out.extend_from_slice(&payload[start..end]);
    }
    out
}

/// Strips ADTS framing, leaving raw AAC. Non-ADTS payloads pass through.
fn strip_adts(payload: &[u8]) -> Vec<u8> {
    if payload.len() >= 7 && payload[0] == 0xFF && payload[1] & 0xF0 == 0xF0 {
        let protection_absent = payload[1] & 0x01 != 0;
        let header_len = if protection_absent { 7 } else { 9 };
        if payload.len() > header_len {
            return payload[header_len..].to_vec();
        }
    }
    payload.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb_init() -> Bytes {
        // 4-byte start codes around an SPS (0x67) and PPS (0x68).
        Bytes::from_static(&[
            0, 0, 0, 1, 0x67, 0x64, 0x00, 0x28, 0xAC, //
            0, 0, 0, 1, 0x68, 0xEE, 0x3C, 0x80,
        ])
    }

    fn read_box_tags(data: &[u8]) -> Vec<String> {
        let mut tags = Vec::new();
        let mut i = 0;
        while i + 8 <= data.len() {
            let len = u32::from_be_bytes(data[i..i + 4].try_into().unwrap()) as usize;
            tags.push(String::from_utf8_lossy(&data[i + 4..i + 8]).to_string());
            if len < 8 {
                break;
            }
            i += len;
        }
        tags
    }

    #[test]
    fn init_segment_layout() {
        let asc = Bytes::from_static(&[0x11, 0x90]);
        let init = init_segment(Some(&annexb_init()), Some(&asc), &CodecTag::new("h264"));
        assert_eq!(read_box_tags(&init), vec!["ftyp", "moov"]);
    }

    #[test]
    fn avcc_carries_parameter_sets() {
        let record = avcc(&annexb_init());
        assert_eq!(record[0], 1); // configurationVersion
        assert_eq!(record[1], 0x64); // profile from SPS
        assert_eq!(record[4], 0xFF); // 4-byte lengths
        assert_eq!(record[5] & 0x1F, 1); // one SPS
    }

    #[test]
    fn asc_fields_decode() {
        // AAC-LC 48kHz stereo: 0x1190
        let asc = [0x11u8, 0x90];
        assert_eq!(sample_rate_from_asc(&asc), Some(48_000));
        assert_eq!(channels_from_asc(&asc), Some(2));
    }

    #[test]
    fn fragment_layout_and_offsets() {
        let video = vec![Arc::new(Sample {
            pts: 0,
            dts: 0,
            payload: Bytes::from_static(&[0, 0, 1, 0x65, 1, 2, 3]),
            keyframe: true,
            sequence: 0,
        })];
        let frag = media_fragment(1, &video, &[], false);
        assert_eq!(read_box_tags(&frag), vec!["moof", "mdat"]);

        // mdat begins right after moof; trun's data offset points at the
        // first video byte (4-byte length + NAL).
        let moof_len = u32::from_be_bytes(frag[0..4].try_into().unwrap()) as usize;
        let mdat_payload = &frag[moof_len + 8..];
        assert_eq!(&mdat_payload[..4], &4u32.to_be_bytes()); // NAL length 4
        assert_eq!(&mdat_payload[4..8], &[0x65, 1, 2, 3]);
    }

    #[test]
    fn fragments_are_deterministic() {
        let video = vec![Arc::new(Sample {
            pts: 3000,
            dts: 0,
            payload: Bytes::from_static(&[0, 0, 1, 0x41, 9, 9]),
            keyframe: false,
            sequence: 5,
        })];
        let a = media_fragment(2, &video, &[], false);
        let b = media_fragment(2, &video, &[], false);
        assert_eq!(a, b);
    }

    #[test]
    fn adts_header_is_stripped() {
        let adts = [0xFF, 0xF1, 0x4C, 0x80, 0x00, 0x1F, 0xFC, 0xAA, 0xBB];
        assert_eq!(strip_adts(&adts), vec![0xAA, 0xBB]);
        // Raw payloads pass through.
        assert_eq!(strip_adts(&[1, 2, 3]), vec![1, 2, 3]);
    }
}
