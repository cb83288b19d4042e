//! ffmpeg subprocess execution.
//!
//! [`run_transcode`] pumps elementary samples through an encoder child
//! process: source samples are muxed to MPEG-TS on stdin, the encoded TS on
//! stdout is demuxed back into the sink variant. The same pump serves the
//! coordinator's local executor and the remote worker daemon.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::relay::demux::{DemuxEvent, TsDemuxer};
use crate::relay::{CodecTag, MediaType, ReadOutcome, Variant, VariantReader};
use crate::packagers::mpegts::TsMuxer;
use crate::state::CoordinatorConfig;

use super::job::TranscodeJob;
use super::scheduler::{JobEvents, JobOutcome, LocalBackend};
use super::TranscodeSpec;

/// Lines of stderr kept for diagnostics.
const STDERR_TAIL: usize = 20;
/// Video samples between PSI repetitions on the encoder's stdin.
const PSI_INTERVAL: u64 = 40;

/// Everything needed to run one encoder subprocess.
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub ffmpeg_path: String,
    pub target_video: CodecTag,
    pub target_audio: CodecTag,
    pub hw_accel: Option<String>,
    pub video_bitrate: Option<u32>,
    pub audio_bitrate: Option<u32>,
}

impl FfmpegSettings {
    /// Builds settings from a job spec and an executor's ffmpeg path.
    #[must_use]
    pub fn from_spec(spec: &TranscodeSpec, ffmpeg_path: &str) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_string(),
            target_video: spec.target.video.clone(),
            target_audio: spec.target.audio.clone(),
            hw_accel: spec.hw_accel.clone(),
            video_bitrate: spec.video_bitrate,
            audio_bitrate: spec.audio_bitrate,
        }
    }
}

/// Maps a target codec tag and optional accelerator to an ffmpeg encoder.
fn video_encoder(codec: &CodecTag, accel: Option<&str>) -> String {
    match (codec.as_str(), accel) {
        ("hevc", Some("cuda")) => "hevc_nvenc".to_string(),
        ("hevc", Some("vaapi")) => "hevc_vaapi".to_string(),
        ("hevc", _) => "libx265".to_string(),
        ("h264", Some("cuda")) => "h264_nvenc".to_string(),
        ("h264", Some("vaapi")) => "h264_vaapi".to_string(),
        ("h264", _) => "libx264".to_string(),
        (other, _) => other.to_string(),
    }
}

fn audio_encoder(codec: &CodecTag) -> String {
    match codec.as_str() {
        "aac" => "aac".to_string(),
        "mp3" => "libmp3lame".to_string(),
        "ac3" => "ac3".to_string(),
        other => other.to_string(),
    }
}

fn build_args(settings: &FfmpegSettings) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    // Input hardening for piped live TS: regenerate timestamps, drop
    // corrupt packets instead of aborting.
    args.extend(
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-fflags",
            "+genpts+discardcorrupt",
            "-f",
            "mpegts",
            "-i",
            "pipe:0",
            "-map",
            "0:v:0",
            "-map",
            "0:a:0?",
            "-sn",
            "-dn",
        ]
        .map(String::from),
    );
    args.push("-c:v".to_string());
    args.push(video_encoder(
        &settings.target_video,
        settings.hw_accel.as_deref(),
    ));
    if let Some(kbps) = settings.video_bitrate {
        args.push("-b:v".to_string());
        args.push(format!("{kbps}k"));
    }
    args.push("-c:a".to_string());
    args.push(audio_encoder(&settings.target_audio));
    if let Some(kbps) = settings.audio_bitrate {
        args.push("-b:a".to_string());
        args.push(format!("{kbps}k"));
    }
    args.extend(["-f", "mpegts", "pipe:1"].map(String::from));
    args
}

/// How a transcode run ended.
#[derive(Debug)]
pub enum RunEnd {
    /// Source drained and the encoder exited cleanly.
    Completed,
    /// Cancelled through the token; the child was killed.
    Cancelled,
    /// Encoder failed or exited before the source closed.
    Failed { error: String, recoverable: bool },
}

/// Runs one encoder subprocess, pumping `source` through it into `sink`.
pub async fn run_transcode(
    settings: FfmpegSettings,
    mut source: VariantReader,
    sink: Arc<Variant>,
    cancel: CancellationToken,
) -> RunEnd {
    let args = build_args(&settings);
    log::debug!("[Ffmpeg] spawning {} {}", settings.ffmpeg_path, args.join(" "));

    let mut child = match Command::new(&settings.ffmpeg_path)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return RunEnd::Failed {
                error: format!("failed to spawn encoder: {e}"),
                recoverable: true,
            }
        }
    };

    let mut stdin = child.stdin.take().expect("stdin piped");
    let mut stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let source_codecs = (
        source.variant().key().video.clone(),
        source.variant().key().audio.clone(),
    );

    // Feeder: source samples -> TS -> encoder stdin.
    let feed_cancel = cancel.clone();
    let feeder = tokio::spawn(async move {
        let mut muxer = TsMuxer::new(source_codecs.0, source_codecs.1);
        let mut since_psi = 0u64;
        let mut source_drained = false;
        loop {
            let outcome = tokio::select! {
                _ = feed_cancel.cancelled() => break,
                outcome = source.next(MediaType::Video) => outcome,
            };
            match outcome {
                ReadOutcome::Closed => {
                    source_drained = true;
                    break;
                }
                ReadOutcome::Skipped { to } => {
                    log::debug!("[Ffmpeg] feeder skipped to seq {to}");
                    continue;
                }
                ReadOutcome::Sample { sample, .. } => {
                    let mut out = BytesMut::new();
                    if since_psi == 0 {
                        muxer.write_psi(&mut out);
                    }
                    since_psi = (since_psi + 1) % PSI_INTERVAL;
                    while let Some(ReadOutcome::Sample { sample: audio, .. }) =
                        source.try_next(MediaType::Audio)
                    {
                        muxer.write_sample(MediaType::Audio, &audio, &mut out);
                    }
                    muxer.write_sample(MediaType::Video, &sample, &mut out);
                    if stdin.write_all(&out).await.is_err() {
                        // Encoder went away; the waiter reports why.
                        break;
                    }
                }
            }
        }
        // Dropping stdin closes the pipe and lets the encoder flush.
        drop(stdin);
        source_drained
    });

    // Reader: encoder stdout -> demux -> sink variant.
    let read_sink = Arc::clone(&sink);
    let reader = tokio::spawn(async move {
        let mut demux = TsDemuxer::new();
        let mut events = Vec::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if demux.push(&buf[..n], &mut events).is_err() {
                        break;
                    }
                    for event in events.drain(..) {
                        match event {
                            DemuxEvent::VideoInit(data) => {
                                read_sink.init_data().set(MediaType::Video, data);
                            }
                            DemuxEvent::AudioInit(data) => {
                                read_sink.init_data().set(MediaType::Audio, data);
                            }
                            DemuxEvent::Video(input) => {
                                read_sink.push(MediaType::Video, input);
                            }
                            DemuxEvent::Audio(input) => {
                                read_sink.push(MediaType::Audio, input);
                            }
                            DemuxEvent::Codecs { .. } => {}
                        }
                    }
                }
            }
        }
    });

    // Stderr tail for diagnostics.
    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
    let tail_writer = Arc::clone(&tail);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut tail = tail_writer.lock();
            if tail.len() >= STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            feeder.abort();
            reader.abort();
            return RunEnd::Cancelled;
        }
        status = child.wait() => status,
    };

    let source_drained = feeder.await.unwrap_or(false);
    let _ = reader.await;

    let stderr_tail = tail.lock().iter().cloned().collect::<Vec<_>>().join("; ");

    match status {
        Err(e) => RunEnd::Failed {
            error: format!("encoder wait failed: {e}"),
            recoverable: true,
        },
        Ok(status) if !status.success() => RunEnd::Failed {
            error: format!("encoder exited with {status}: {stderr_tail}"),
            recoverable: true,
        },
        Ok(_) if !source_drained => RunEnd::Failed {
            error: format!("encoder exited prematurely: {stderr_tail}"),
            recoverable: true,
        },
        Ok(_) => RunEnd::Completed,
    }
}

/// In-process executor for transcode jobs, with its own concurrency limit
/// separate from the remote worker pool.
pub struct LocalExecutor {
    ffmpeg_path: String,
    video_encoders: Vec<String>,
    audio_encoders: Vec<String>,
    hw_accels: Vec<String>,
    slots: Arc<Semaphore>,
}

impl LocalExecutor {
    #[must_use]
    pub fn new(config: &CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            video_encoders: config.local_video_encoders.clone(),
            audio_encoders: config.local_audio_encoders.clone(),
            hw_accels: config.local_hw_accels.clone(),
            slots: Arc::new(Semaphore::new(config.local_max_jobs)),
        })
    }
}

impl LocalBackend for LocalExecutor {
    fn covers(&self, spec: &TranscodeSpec) -> bool {
        self.video_encoders
            .iter()
            .any(|c| c == spec.target.video.as_str())
            && self
                .audio_encoders
                .iter()
                .any(|c| c == spec.target.audio.as_str())
    }

    fn available(&self) -> i64 {
        self.slots.available_permits() as i64
    }

    fn has_accel(&self, accel: &str) -> bool {
        self.hw_accels.iter().any(|a| a == accel)
    }

    fn execute(&self, job: Arc<TranscodeJob>, events: Arc<dyn JobEvents>) {
        let slots = Arc::clone(&self.slots);
        let settings = FfmpegSettings::from_spec(&job.spec, &self.ffmpeg_path);
        tokio::spawn(async move {
            // The scheduler checked capacity, but acquire anyway: a racing
            // dispatch loses gracefully instead of oversubscribing.
            let Ok(_permit) = slots.try_acquire() else {
                events.job_terminated(
                    &job.id,
                    JobOutcome::Failed {
                        error: "local executor at capacity".to_string(),
                        recoverable: true,
                    },
                );
                return;
            };

            job.mark_running();
            let source = job.source().reader();
            let sink = Arc::clone(job.target());
            let end = run_transcode(settings, source, sink, job.cancel_token().clone()).await;

            let outcome = match end {
                RunEnd::Completed | RunEnd::Cancelled => JobOutcome::Completed,
                RunEnd::Failed { error, recoverable } => {
                    JobOutcome::Failed { error, recoverable }
                }
            };
            events.job_terminated(&job.id, outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::VariantKey;

    fn settings(video: &str, accel: Option<&str>) -> FfmpegSettings {
        FfmpegSettings {
            ffmpeg_path: "ffmpeg".to_string(),
            target_video: CodecTag::new(video),
            target_audio: CodecTag::new("aac"),
            hw_accel: accel.map(str::to_string),
            video_bitrate: Some(3000),
            audio_bitrate: Some(128),
        }
    }

    #[test]
    fn encoder_selection_honors_accel() {
        assert_eq!(video_encoder(&CodecTag::new("hevc"), Some("cuda")), "hevc_nvenc");
        assert_eq!(video_encoder(&CodecTag::new("hevc"), None), "libx265");
        assert_eq!(video_encoder(&CodecTag::new("h264"), Some("vaapi")), "h264_vaapi");
    }

    #[test]
    fn args_carry_bitrates_and_mapping() {
        let args = build_args(&settings("hevc", None));
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx265"));
        assert!(joined.contains("-b:v 3000k"));
        assert!(joined.contains("-b:a 128k"));
        assert!(joined.contains("-f mpegts pipe:1"));
    }

    #[test]
    fn local_executor_covers_configured_codecs() {
        let config = CoordinatorConfig::default();
        let executor = LocalExecutor::new(&config);
        let spec = TranscodeSpec {
            channel_id: "ch".to_string(),
            source: VariantKey::new("h264", "aac"),
            target: VariantKey::new("h264", "aac"),
            hw_accel: None,
            video_bitrate: None,
            audio_bitrate: None,
        };
        assert!(executor.covers(&spec));
        let hevc = TranscodeSpec {
            target: VariantKey::new("hevc", "aac"),
            ..spec
        };
        assert!(!executor.covers(&hevc));
        assert_eq!(executor.available(), 2);
    }
}
