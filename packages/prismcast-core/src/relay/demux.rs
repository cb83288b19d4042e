//! Minimal MPEG-TS demuxer for origin ingest.
//!
//! Extracts elementary video and audio samples from a transport stream:
//! packet sync, PAT/PMT table parsing, PES assembly, PTS/DTS extraction,
//! keyframe detection, and codec init data capture (SPS/PPS for H.264/HEVC,
//! AudioSpecificConfig synthesized from ADTS headers for AAC). Depth is
//! bounded to what the relay needs; tables beyond the first program and
//! streams beyond the primary A/V pair are ignored.

use bytes::{Bytes, BytesMut};

use super::sample::{CodecTag, SampleInput};

pub const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

/// Events produced while demuxing.
#[derive(Debug)]
pub enum DemuxEvent {
    /// Detected codec pair from the PMT.
    Codecs { video: CodecTag, audio: CodecTag },
    /// Captured video codec init data (annex-B SPS/PPS).
    VideoInit(Bytes),
    /// Captured audio codec init data (AudioSpecificConfig).
    AudioInit(Bytes),
    /// A complete video sample.
    Video(SampleInput),
    /// A complete audio sample.
    Audio(SampleInput),
}

/// Demux failure; the origin task treats these as transient and reconnects.
#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error("lost transport packet sync")]
    LostSync,
    #[error("malformed {0} section")]
    MalformedSection(&'static str),
}

#[derive(Default)]
struct PesAssembler {
    data: BytesMut,
    pts: i64,
    dts: i64,
    started: bool,
}

impl PesAssembler {
    /// Takes the assembled payload, returning it with its timestamps.
    fn take(&mut self) -> Option<(Bytes, i64, i64)> {
        if !self.started || self.data.is_empty() {
            self.data.clear();
            return None;
        }
        self.started = false;
        Some((self.data.split().freeze(), self.pts, self.dts))
    }
}

/// Incremental MPEG-TS to elementary-stream demuxer.
pub struct TsDemuxer {
    buf: BytesMut,
    pmt_pid: Option<u16>,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    video_codec: Option<CodecTag>,
    audio_codec: Option<CodecTag>,
    video_pes: PesAssembler,
    audio_pes: PesAssembler,
    video_init_sent: bool,
    audio_init_sent: bool,
    codecs_sent: bool,
}

impl TsDemuxer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            pmt_pid: None,
            video_pid: None,
            audio_pid: None,
            video_codec: None,
            audio_codec: None,
            video_pes: PesAssembler::default(),
            audio_pes: PesAssembler::default(),
            video_init_sent: false,
            audio_init_sent: false,
            codecs_sent: false,
        }
    }

    /// Feeds raw bytes, appending produced events to `out`.
    pub fn push(&mut self, data: &[u8], out: &mut Vec<DemuxEvent>) -> Result<(), DemuxError> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= TS_PACKET_SIZE {
            if self.buf[0] != SYNC_BYTE {
                // Resync: discard up to the next sync byte.
                match self.buf.iter().position(|&b| b == SYNC_BYTE) {
                    Some(pos) => {
                        let _ = self.buf.split_to(pos);
                        continue;
                    }
                    None => {
                        self.buf.clear();
                        return Err(DemuxError::LostSync);
                    }
                }
            }
            let packet = self.buf.split_to(TS_PACKET_SIZE);
            self.parse_packet(&packet, out)?;
        }
        Ok(())
    }

    /// Flushes any partially assembled samples (end of stream).
    pub fn flush(&mut self, out: &mut Vec<DemuxEvent>) {
        if let Some((payload, pts, dts)) = self.video_pes.take() {
            self.emit_video(payload, pts, dts, out);
        }
        if let Some((payload, pts, dts)) = self.audio_pes.take() {
            self.emit_audio(payload, pts, dts, out);
        }
    }

    fn parse_packet(&mut self, packet: &[u8], out: &mut Vec<DemuxEvent>) -> Result<(), DemuxError> {
        let pid = (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]);
        let payload_start = packet[1] & 0x40 != 0;
        let adaptation = (packet[3] >> 4) & 0x03;

        let mut offset = 4;
        if adaptation == 2 {
            return Ok(()); // adaptation field only, no payload
        }
        if adaptation == 3 {
            let len = packet[4] as usize;
            offset += 1 + len;
            if offset >= TS_PACKET_SIZE {
                return Ok(());
            }
        }
        let payload = &packet[offset..];

        if pid == 0 {
            self.parse_pat(payload, payload_start)?;
        } else if Some(pid) == self.pmt_pid {
            self.parse_pmt(payload, payload_start, out)?;
        } else if Some(pid) == self.video_pid {
            self.accumulate(true, payload, payload_start, out);
        } else if Some(pid) == self.audio_pid {
            self.accumulate(false, payload, payload_start, out);
        }
        Ok(())
    }

    fn parse_pat(&mut self, payload: &[u8], payload_start: bool) -> Result<(), DemuxError> {
        if !payload_start || self.pmt_pid.is_some() {
            return Ok(());
        }
        let section = skip_pointer(payload).ok_or(DemuxError::MalformedSection("PAT"))?;
        // table_id(1) len(2) tsid(2) flags(1) section numbers(2) = 8 bytes,
        // then 4-byte program entries.
        if section.len() < 12 {
            return Err(DemuxError::MalformedSection("PAT"));
        }
        let mut entries = &section[8..section.len() - 4]; // strip CRC
        while entries.len() >= 4 {
            let program = (u16::from(entries[0]) << 8) | u16::from(entries[1]);
            let pid = (u16::from(entries[2] & 0x1F) << 8) | u16::from(entries[3]);
            if program != 0 {
                self.pmt_pid = Some(pid);
                break; // first program only
            }
            entries = &entries[4..];
        }
        Ok(())
    }

    fn parse_pmt(
        &mut self,
        payload: &[u8],
        payload_start: bool,
        out: &mut Vec<DemuxEvent>,
    ) -> Result<(), DemuxError> {
        if !payload_start || self.video_pid.is_some() || self.audio_pid.is_some() {
            return Ok(());
        }
        let section = skip_pointer(payload).ok_or(DemuxError::MalformedSection("PMT"))?;
        if section.len() < 16 {
            return Err(DemuxError::MalformedSection("PMT"));
        }
        let program_info_len = ((usize::from(section[10]) & 0x0F) << 8) | usize::from(section[11]);
        let mut streams = &section[12 + program_info_len..section.len() - 4];
        while streams.len() >= 5 {
            let stream_type = streams[0];
            let pid = (u16::from(streams[1] & 0x1F) << 8) | u16::from(streams[2]);
            let es_info_len = ((usize::from(streams[3]) & 0x0F) << 8) | usize::from(streams[4]);
            match stream_type {
                0x1B if self.video_pid.is_none() => {
                    self.video_pid = Some(pid);
                    self.video_codec = Some(CodecTag::new("h264"));
                }
                0x24 if self.video_pid.is_none() => {
                    self.video_pid = Some(pid);
                    self.video_codec = Some(CodecTag::new("hevc"));
                }
                0x0F if self.audio_pid.is_none() => {
                    self.audio_pid = Some(pid);
                    self.audio_codec = Some(CodecTag::new("aac"));
                }
                0x03 | 0x04 if self.audio_pid.is_none() => {
                    self.audio_pid = Some(pid);
                    self.audio_codec = Some(CodecTag::new("mp3"));
                }
                0x81 if self.audio_pid.is_none() => {
                    self.audio_pid = Some(pid);
                    self.audio_codec = Some(CodecTag::new("ac3"));
                }
                _ => {}
            }
            if streams.len() < 5 + es_info_len {
                break;
            }
            streams = &streams[5 + es_info_len..];
        }
        if !self.codecs_sent {
            if let (Some(video), Some(audio)) = (&self.video_codec, &self.audio_codec) {
                out.push(DemuxEvent::Codecs {
                    video: video.clone(),
                    audio: audio.clone(),
                });
                self.codecs_sent = true;
            }
        }
        Ok(())
    }

    fn accumulate(
        &mut self,
        is_video: bool,
        payload: &[u8],
        payload_start: bool,
        out: &mut Vec<DemuxEvent>,
    ) {
        if payload_start {
            // Complete the previous PES first.
            let taken = if is_video {
                self.video_pes.take()
            } else {
                self.audio_pes.take()
            };
            if let Some((data, pts, dts)) = taken {
                if is_video {
                    self.emit_video(data, pts, dts, out);
                } else {
                    self.emit_audio(data, pts, dts, out);
                }
            }
            if let Some((body, pts, dts)) = parse_pes_header(payload) {
                let pes = if is_video {
                    &mut self.video_pes
                } else {
                    &mut self.audio_pes
                };
                pes.started = true;
                pes.pts = pts;
                pes.dts = dts;
                pes.data.extend_from_slice(body);
            }
        } else {
            let pes = if is_video {
                &mut self.video_pes
            } else {
                &mut self.audio_pes
            };
            if pes.started {
                pes.data.extend_from_slice(payload);
            }
        }
    }

    fn emit_video(&mut self, payload: Bytes, pts: i64, dts: i64, out: &mut Vec<DemuxEvent>) {
        let hevc = self
            .video_codec
            .as_ref()
            .is_some_and(|c| c.as_str() == "hevc");
        let keyframe = if hevc {
            annexb_has_nal(&payload, &[19, 20], true)
        } else {
            annexb_has_nal(&payload, &[5], false)
        };
        if keyframe && !self.video_init_sent {
            let param_types: &[u8] = if hevc { &[32, 33, 34] } else { &[7, 8] };
            if let Some(init) = extract_annexb_nals(&payload, param_types, hevc) {
                out.push(DemuxEvent::VideoInit(init));
                self.video_init_sent = true;
            }
        }
        out.push(DemuxEvent::Video(SampleInput {
            pts,
            dts,
            payload,
            keyframe,
        }));
    }

    fn emit_audio(&mut self, payload: Bytes, pts: i64, dts: i64, out: &mut Vec<DemuxEvent>) {
        let aac = self
            .audio_codec
            .as_ref()
            .is_some_and(|c| c.as_str() == "aac");
        if aac && !self.audio_init_sent {
            if let Some(asc) = asc_from_adts(&payload) {
                out.push(DemuxEvent::AudioInit(asc));
                self.audio_init_sent = true;
            }
        }
        out.push(DemuxEvent::Audio(SampleInput {
            pts,
            dts,
            payload,
            keyframe: false,
        }));
    }
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Skips the pointer field preceding a PSI section.
fn skip_pointer(payload: &[u8]) -> Option<&[u8]> {
    let pointer = *payload.first()? as usize;
    payload.get(1 + pointer..)
}

/// Parses a PES header, returning (payload body, pts, dts).
fn parse_pes_header(data: &[u8]) -> Option<(&[u8], i64, i64)> {
    if data.len() < 9 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
        return None;
    }
    let flags = data[7];
    let header_len = data[8] as usize;
    let body = data.get(9 + header_len..)?;
    let mut pts = 0i64;
    if flags & 0x80 != 0 {
        pts = parse_timestamp(data.get(9..14)?);
    }
    let mut dts = pts;
    if flags & 0x40 != 0 {
        dts = parse_timestamp(data.get(14..19)?);
    }
    Some((body, pts, dts))
}

/// Decodes a 33-bit 90 kHz timestamp from its 5-byte PES encoding.
fn parse_timestamp(b: &[u8]) -> i64 {
    (i64::from(b[0] & 0x0E) << 29)
        | (i64::from(b[1]) << 22)
        | (i64::from(b[2] & 0xFE) << 14)
        | (i64::from(b[3]) << 7)
        | (i64::from(b[4]) >> 1)
}

/// Iterates annex-B NAL units in `data`, yielding (type, start, end).
/// Shared with the fMP4 packager for length-prefix conversion.
pub(crate) fn annexb_nals(data: &[u8], hevc: bool) -> Vec<(u8, usize, usize)> {
    let mut nals = Vec::new();
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    for (idx, &start) in starts.iter().enumerate() {
        if start >= data.len() {
            continue;
        }
        let end = starts
            .get(idx + 1)
            .map(|&next| {
                // Strip the start code (and a possible preceding zero byte).
                let mut e = next - 3;
                if e > start && data[e - 1] == 0 {
                    e -= 1;
                }
                e
            })
            .unwrap_or(data.len());
        let nal_type = if hevc {
            (data[start] >> 1) & 0x3F
        } else {
            data[start] & 0x1F
        };
        nals.push((nal_type, start, end));
    }
    nals
}

fn annexb_has_nal(data: &[u8], types: &[u8], hevc: bool) -> bool {
    annexb_nals(data, hevc)
        .iter()
        .any(|(t, _, _)| types.contains(t))
}

/// Extracts the named NAL units as a single annex-B blob.
fn extract_annexb_nals(data: &[u8], types: &[u8], hevc: bool) -> Option<Bytes> {
    let mut out = BytesMut::new();
    for (t, start, end) in annexb_nals(data, hevc) {
        if types.contains(&t) {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(&data[start..end]);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out.freeze())
    }
}

/// Synthesizes a 2-byte AudioSpecificConfig from the first ADTS header.
fn asc_from_adts(payload: &[u8]) -> Option<Bytes> {
    if payload.len() < 7 || payload[0] != 0xFF || payload[1] & 0xF0 != 0xF0 {
        return None;
    }
    let profile = (payload[2] >> 6) & 0x03; // object type - 1
    let sfi = (payload[2] >> 2) & 0x0F;
    let channels = ((payload[2] & 0x01) << 2) | (payload[3] >> 6);
    let object_type = u16::from(profile) + 1;
    let config: u16 = (object_type << 11) | (u16::from(sfi) << 7) | (u16::from(channels) << 3);
    Some(Bytes::copy_from_slice(&config.to_be_bytes()))
}
