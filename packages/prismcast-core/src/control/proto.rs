//! Control-plane wire messages.
//!
//! Hand-derived prost messages framed by the length-delimited codec in
//! [`super::framing`]: every frame on the wire is a length-prefixed
//! protobuf [`Envelope`]. One persistent connection carries
//! Register/Heartbeat; each transcode job runs on its own connection
//! opened by the worker after a `TranscodeAssign`.

use prost::Message;

use crate::transcode::registry as reg;

/// Top-level frame envelope.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(
        oneof = "Frame",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11"
    )]
    pub frame: Option<Frame>,
}

impl Envelope {
    #[must_use]
    pub fn of(frame: Frame) -> Self {
        Self { frame: Some(frame) }
    }
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Frame {
    #[prost(message, tag = "1")]
    Register(Register),
    #[prost(message, tag = "2")]
    RegisterAck(RegisterAck),
    #[prost(message, tag = "3")]
    Heartbeat(Heartbeat),
    #[prost(message, tag = "4")]
    HeartbeatAck(HeartbeatAck),
    #[prost(message, tag = "5")]
    TranscodeAssign(TranscodeAssign),
    #[prost(message, tag = "6")]
    TranscodeOpen(TranscodeOpen),
    #[prost(message, tag = "7")]
    TranscodeStart(TranscodeStart),
    #[prost(message, tag = "8")]
    SampleBatch(SampleBatch),
    #[prost(message, tag = "9")]
    Progress(Progress),
    #[prost(message, tag = "10")]
    TranscodeError(TranscodeError),
    #[prost(message, tag = "11")]
    TranscodeStop(TranscodeStop),
}

#[derive(Clone, PartialEq, Message)]
pub struct Gpu {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(uint32, tag = "3")]
    pub max_encode_sessions: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Capabilities {
    #[prost(string, repeated, tag = "1")]
    pub video_encoders: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub video_decoders: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub audio_encoders: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub audio_decoders: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    pub hw_accels: Vec<String>,
    #[prost(message, repeated, tag = "6")]
    pub gpus: Vec<Gpu>,
    #[prost(uint32, tag = "7")]
    pub max_concurrent_jobs: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Register {
    #[prost(string, tag = "1")]
    pub daemon_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub version: String,
    #[prost(string, tag = "4")]
    pub auth_token: String,
    #[prost(message, optional, tag = "5")]
    pub capabilities: Option<Capabilities>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RegisterAck {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(uint64, tag = "2")]
    pub heartbeat_interval_secs: u64,
    #[prost(string, tag = "3")]
    pub coordinator_version: String,
    #[prost(string, tag = "4")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GpuStat {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(float, tag = "2")]
    pub utilization_percent: f32,
    #[prost(uint32, tag = "3")]
    pub active_encode_sessions: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Stats {
    #[prost(float, tag = "1")]
    pub cpu_percent: f32,
    #[prost(uint64, tag = "2")]
    pub memory_used_bytes: u64,
    #[prost(uint64, tag = "3")]
    pub memory_total_bytes: u64,
    #[prost(float, tag = "4")]
    pub load_average: f32,
    #[prost(message, repeated, tag = "5")]
    pub gpus: Vec<GpuStat>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Heartbeat {
    #[prost(string, tag = "1")]
    pub daemon_id: String,
    #[prost(message, optional, tag = "2")]
    pub stats: Option<Stats>,
    #[prost(string, repeated, tag = "3")]
    pub active_jobs: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatAck {}

/// Coordinator -> worker on the control connection: open a transcode
/// stream for this job.
#[derive(Clone, PartialEq, Message)]
pub struct TranscodeAssign {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

/// Worker -> coordinator as the first frame of a fresh transcode
/// connection.
#[derive(Clone, PartialEq, Message)]
pub struct TranscodeOpen {
    #[prost(string, tag = "1")]
    pub daemon_id: String,
    #[prost(string, tag = "2")]
    pub job_id: String,
    #[prost(string, tag = "3")]
    pub auth_token: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct TranscodeStart {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(string, tag = "2")]
    pub source_video: String,
    #[prost(string, tag = "3")]
    pub source_audio: String,
    #[prost(string, tag = "4")]
    pub target_video: String,
    #[prost(string, tag = "5")]
    pub target_audio: String,
    #[prost(string, optional, tag = "6")]
    pub hw_accel: Option<String>,
    #[prost(uint32, optional, tag = "7")]
    pub video_bitrate: Option<u32>,
    #[prost(uint32, optional, tag = "8")]
    pub audio_bitrate: Option<u32>,
    /// Codec init data blobs (annex-B parameter sets / ASC).
    #[prost(bytes = "vec", tag = "9")]
    pub video_init: Vec<u8>,
    #[prost(bytes = "vec", tag = "10")]
    pub audio_init: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireSample {
    #[prost(int64, tag = "1")]
    pub pts: i64,
    #[prost(int64, tag = "2")]
    pub dts: i64,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "4")]
    pub keyframe: bool,
    #[prost(uint64, tag = "5")]
    pub sequence: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SampleBatch {
    #[prost(string, tag = "1")]
    pub job_id: String,
    /// Strictly increasing per direction; out-of-order or duplicate
    /// batches are discarded by the receiver.
    #[prost(uint64, tag = "2")]
    pub batch_sequence: u64,
    #[prost(message, repeated, tag = "3")]
    pub video: Vec<WireSample>,
    #[prost(message, repeated, tag = "4")]
    pub audio: Vec<WireSample>,
    /// Codec init data captured by the sender, delivered once when first
    /// available (empty otherwise).
    #[prost(bytes = "vec", tag = "5")]
    pub video_init: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub audio_init: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Progress {
    #[prost(string, tag = "1")]
    pub job_id: String,
    /// Acknowledgement watermark driving sender flow control.
    #[prost(uint64, tag = "2")]
    pub last_batch_received: u64,
    #[prost(uint64, tag = "3")]
    pub samples_encoded: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Internal = 0,
    SessionLimitReached = 1,
    DecodeFailed = 2,
    EncoderInitFailed = 3,
    UpstreamEof = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct TranscodeError {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(enumeration = "ErrorCode", tag = "2")]
    pub code: i32,
    #[prost(bool, tag = "3")]
    pub recoverable: bool,
    #[prost(string, tag = "4")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct TranscodeStop {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions to and from registry types
// ─────────────────────────────────────────────────────────────────────────────

impl From<Capabilities> for reg::WorkerCapabilities {
    fn from(c: Capabilities) -> Self {
        Self {
            video_encoders: c.video_encoders,
            video_decoders: c.video_decoders,
            audio_encoders: c.audio_encoders,
            audio_decoders: c.audio_decoders,
            hw_accels: c.hw_accels,
            gpus: c
                .gpus
                .into_iter()
                .map(|g| reg::GpuCapability {
                    id: g.id,
                    name: g.name,
                    max_encode_sessions: g.max_encode_sessions,
                })
                .collect(),
            max_concurrent_jobs: c.max_concurrent_jobs,
        }
    }
}

impl From<reg::WorkerCapabilities> for Capabilities {
    fn from(c: reg::WorkerCapabilities) -> Self {
        Self {
            video_encoders: c.video_encoders,
            video_decoders: c.video_decoders,
            audio_encoders: c.audio_encoders,
            audio_decoders: c.audio_decoders,
            hw_accels: c.hw_accels,
            gpus: c
                .gpus
                .into_iter()
                .map(|g| Gpu {
                    id: g.id,
                    name: g.name,
                    max_encode_sessions: g.max_encode_sessions,
                })
                .collect(),
            max_concurrent_jobs: c.max_concurrent_jobs,
        }
    }
}

impl From<Stats> for reg::SystemStats {
    fn from(s: Stats) -> Self {
        Self {
            cpu_percent: s.cpu_percent,
            memory_used_bytes: s.memory_used_bytes,
            memory_total_bytes: s.memory_total_bytes,
            load_average: s.load_average,
            gpus: s
                .gpus
                .into_iter()
                .map(|g| reg::GpuStats {
                    id: g.id,
                    utilization_percent: g.utilization_percent,
                    active_encode_sessions: g.active_encode_sessions,
                })
                .collect(),
        }
    }
}

impl From<reg::SystemStats> for Stats {
    fn from(s: reg::SystemStats) -> Self {
        Self {
            cpu_percent: s.cpu_percent,
            memory_used_bytes: s.memory_used_bytes,
            memory_total_bytes: s.memory_total_bytes,
            load_average: s.load_average,
            gpus: s
                .gpus
                .into_iter()
                .map(|g| GpuStat {
                    id: g.id,
                    utilization_percent: g.utilization_percent,
                    active_encode_sessions: g.active_encode_sessions,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(envelope: &Envelope) -> Envelope {
        let bytes = envelope.encode_to_vec();
        Envelope::decode(bytes.as_slice()).expect("decode")
    }

    #[test]
    fn register_round_trips() {
        let envelope = Envelope::of(Frame::Register(Register {
            daemon_id: "w1".into(),
            name: "Worker One".into(),
            version: "0.4.0".into(),
            auth_token: "secret".into(),
            capabilities: Some(Capabilities {
                video_encoders: vec!["h264".into(), "hevc".into()],
                video_decoders: vec!["h264".into()],
                audio_encoders: vec!["aac".into()],
                audio_decoders: vec!["aac".into()],
                hw_accels: vec!["cuda".into()],
                gpus: vec![Gpu {
                    id: "gpu0".into(),
                    name: "RTX".into(),
                    max_encode_sessions: 3,
                }],
                max_concurrent_jobs: 4,
            }),
        }));
        assert_eq!(round_trip(&envelope), envelope);
    }

    #[test]
    fn heartbeat_round_trips() {
        let envelope = Envelope::of(Frame::Heartbeat(Heartbeat {
            daemon_id: "w1".into(),
            stats: Some(Stats {
                cpu_percent: 42.5,
                memory_used_bytes: 1 << 30,
                memory_total_bytes: 4 << 30,
                load_average: 1.25,
                gpus: vec![GpuStat {
                    id: "gpu0".into(),
                    utilization_percent: 33.0,
                    active_encode_sessions: 1,
                }],
            }),
            active_jobs: vec!["job-1".into()],
        }));
        assert_eq!(round_trip(&envelope), envelope);
    }

    #[test]
    fn transcode_start_round_trips() {
        let envelope = Envelope::of(Frame::TranscodeStart(TranscodeStart {
            job_id: "job-1".into(),
            source_video: "h264".into(),
            source_audio: "aac".into(),
            target_video: "hevc".into(),
            target_audio: "aac".into(),
            hw_accel: Some("cuda".into()),
            video_bitrate: Some(3000),
            audio_bitrate: None,
            video_init: vec![0, 0, 0, 1, 0x67],
            audio_init: vec![0x11, 0x90],
        }));
        assert_eq!(round_trip(&envelope), envelope);
    }

    #[test]
    fn sample_batch_round_trips() {
        let envelope = Envelope::of(Frame::SampleBatch(SampleBatch {
            job_id: "job-1".into(),
            batch_sequence: 7,
            video: vec![WireSample {
                pts: 90_000,
                dts: 87_000,
                payload: vec![1, 2, 3],
                keyframe: true,
                sequence: 41,
            }],
            audio: vec![WireSample {
                pts: 90_000,
                dts: 90_000,
                payload: vec![9],
                keyframe: false,
                sequence: 80,
            }],
            // First batch of a stream carries the captured init data.
            video_init: vec![0, 0, 0, 1, 0x67, 0xAA],
            audio_init: vec![0x11, 0x90],
        }));
        let decoded = round_trip(&envelope);
        assert_eq!(decoded, envelope);
        if let Some(Frame::SampleBatch(batch)) = decoded.frame {
            assert_eq!(batch.video_init, vec![0, 0, 0, 1, 0x67, 0xAA]);
            assert_eq!(batch.audio_init, vec![0x11, 0x90]);
        } else {
            panic!("wrong frame");
        }
    }

    #[test]
    fn transcode_error_round_trips_with_code() {
        let envelope = Envelope::of(Frame::TranscodeError(TranscodeError {
            job_id: "job-1".into(),
            code: ErrorCode::SessionLimitReached as i32,
            recoverable: true,
            message: "gpu sessions exhausted".into(),
        }));
        let decoded = round_trip(&envelope);
        assert_eq!(decoded, envelope);
        if let Some(Frame::TranscodeError(err)) = decoded.frame {
            assert!(matches!(
                ErrorCode::try_from(err.code),
                Ok(ErrorCode::SessionLimitReached)
            ));
        } else {
            panic!("wrong frame");
        }
    }
}
