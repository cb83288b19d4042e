//! Worker side of the control plane.
//!
//! Maintains the Register/Heartbeat connection with reconnect backoff, and
//! opens one transcode connection per assigned job. The actual encoding
//! reuses the same ffmpeg pump as the coordinator's local executor: an
//! inbound staging variant is fed from coordinator batches, and the
//! encoder's output variant is drained back into batches.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::relay::{CodecTag, MediaType, ReadOutcome, SampleInput, Variant, VariantKey};
use crate::transcode::registry::{SystemStats, WorkerCapabilities};
use crate::transcode::{run_transcode, FfmpegSettings, RunEnd};

use super::framing::{FrameSink, FramedConn};
use super::proto::{
    Capabilities, ErrorCode, Frame, Heartbeat, Progress, Register, SampleBatch, TranscodeError,
    TranscodeOpen, TranscodeStart,
};
use super::ControlError;

/// Source of live system stats for heartbeats. The worker binary plugs in
/// a sysinfo-backed implementation; tests use a constant one.
pub trait StatsSource: Send + Sync {
    fn sample(&self) -> SystemStats;
}

/// Connection settings for one worker daemon.
#[derive(Debug, Clone)]
pub struct WorkerClientConfig {
    pub coordinator_addr: String,
    pub daemon_id: String,
    pub name: String,
    pub auth_token: String,
    pub capabilities: WorkerCapabilities,
    pub ffmpeg_path: String,
    /// Ring capacities for the per-job staging variants.
    pub video_ring_capacity: usize,
    pub audio_ring_capacity: usize,
}

/// The worker daemon's control-plane client.
pub struct WorkerClient {
    config: WorkerClientConfig,
    stats: Arc<dyn StatsSource>,
    active_jobs: Arc<DashMap<String, CancellationToken>>,
}

impl WorkerClient {
    #[must_use]
    pub fn new(config: WorkerClientConfig, stats: Arc<dyn StatsSource>) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats,
            active_jobs: Arc::new(DashMap::new()),
        })
    }

    #[must_use]
    pub fn active_job_count(&self) -> usize {
        self.active_jobs.len()
    }

    /// Runs the client until cancelled, reconnecting with bounded backoff.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.session(&cancel).await {
                Ok(()) => {
                    backoff = Duration::from_secs(1);
                }
                Err(ControlError::AuthRejected | ControlError::VersionRejected(_)) => {
                    // Persistent rejections back off to the ceiling; the
                    // operator has to fix configuration.
                    log::error!("[Worker] registration rejected, retrying in 60s");
                    backoff = Duration::from_secs(60);
                }
                Err(e) => {
                    log::warn!("[Worker] control session ended: {e}");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
        // Abort any jobs still running.
        for entry in self.active_jobs.iter() {
            entry.value().cancel();
        }
        log::info!("[Worker] client stopped");
    }

    /// One control-connection lifetime: register, then heartbeat and
    /// accept assignments until the stream drops.
    async fn session(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), ControlError> {
        let stream = TcpStream::connect(&self.config.coordinator_addr)
            .await
            .map_err(ControlError::Io)?;
        let mut conn = FramedConn::new(stream);

        conn.send(Frame::Register(Register {
            daemon_id: self.config.daemon_id.clone(),
            name: self.config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            auth_token: self.config.auth_token.clone(),
            capabilities: Some(Capabilities::from(self.config.capabilities.clone())),
        }))
        .await?;

        let ack = match conn.recv().await? {
            Some(Frame::RegisterAck(ack)) => ack,
            Some(_) => return Err(ControlError::UnexpectedFrame("expected RegisterAck")),
            None => return Err(ControlError::StreamClosed),
        };
        if !ack.accepted {
            log::error!("[Worker] registration rejected: {}", ack.message);
            return Err(ControlError::AuthRejected);
        }

        let interval = Duration::from_secs(ack.heartbeat_interval_secs.max(1));
        log::info!(
            "[Worker] registered with coordinator v{} (heartbeat {:?})",
            ack.coordinator_version,
            interval
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let active: Vec<String> = self
                        .active_jobs
                        .iter()
                        .map(|e| e.key().clone())
                        .collect();
                    conn.send(Frame::Heartbeat(Heartbeat {
                        daemon_id: self.config.daemon_id.clone(),
                        stats: Some(self.stats.sample().into()),
                        active_jobs: active,
                    }))
                    .await?;
                }
                frame = conn.recv() => match frame? {
                    Some(Frame::HeartbeatAck(_)) => {}
                    Some(Frame::TranscodeAssign(assign)) => {
                        log::info!("[Worker] assigned job {}", assign.job_id);
                        let client = Arc::clone(self);
                        let job_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            client.run_job(assign.job_id, job_cancel).await;
                        });
                    }
                    Some(_) => {
                        log::warn!("[Worker] unexpected frame on control connection");
                    }
                    None => return Err(ControlError::StreamClosed),
                },
            }
        }
    }

    /// One transcode stream: open, validate, pump through ffmpeg.
    async fn run_job(self: Arc<Self>, job_id: String, cancel: CancellationToken) {
        let stream = match TcpStream::connect(&self.config.coordinator_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("[Worker] transcode dial failed for {job_id}: {e}");
                return;
            }
        };
        let mut conn = FramedConn::new(stream);

        if conn
            .send(Frame::TranscodeOpen(TranscodeOpen {
                daemon_id: self.config.daemon_id.clone(),
                job_id: job_id.clone(),
                auth_token: self.config.auth_token.clone(),
            }))
            .await
            .is_err()
        {
            return;
        }

        let start = match conn.recv().await {
            Ok(Some(Frame::TranscodeStart(start))) => start,
            Ok(Some(Frame::TranscodeError(error))) => {
                log::warn!("[Worker] coordinator refused job {job_id}: {}", error.message);
                return;
            }
            _ => return,
        };

        // A worker never accepts a Start its capabilities do not advertise.
        let caps = &self.config.capabilities;
        let advertised = caps
            .video_encoders
            .iter()
            .any(|c| c == &start.target_video)
            && caps.audio_encoders.iter().any(|c| c == &start.target_audio);
        if !advertised {
            let _ = conn
                .send(Frame::TranscodeError(TranscodeError {
                    job_id,
                    code: ErrorCode::EncoderInitFailed as i32,
                    recoverable: true,
                    message: format!(
                        "encoder {}/{} not advertised",
                        start.target_video, start.target_audio
                    ),
                }))
                .await;
            return;
        }
        if self.active_jobs.len() >= caps.max_concurrent_jobs as usize {
            let _ = conn
                .send(Frame::TranscodeError(TranscodeError {
                    job_id,
                    code: ErrorCode::SessionLimitReached as i32,
                    recoverable: true,
                    message: "concurrent job limit reached".to_string(),
                }))
                .await;
            return;
        }

        self.active_jobs.insert(job_id.clone(), cancel.clone());
        let result = self.pump_job(conn, &job_id, start, cancel.clone()).await;
        self.active_jobs.remove(&job_id);
        if let Err(e) = result {
            log::warn!("[Worker] job {job_id} stream error: {e}");
        }
    }

    async fn pump_job(
        &self,
        conn: FramedConn,
        job_id: &str,
        start: TranscodeStart,
        cancel: CancellationToken,
    ) -> Result<(), ControlError> {
        // Staging variants on either side of the encoder.
        let source_key = VariantKey::new(start.source_video.as_str(), start.source_audio.as_str());
        let target_key = VariantKey::new(start.target_video.as_str(), start.target_audio.as_str());
        let inbound = Arc::new(Variant::new(
            source_key,
            self.config.video_ring_capacity,
            self.config.audio_ring_capacity,
        ));
        let outbound = Arc::new(Variant::new(
            target_key,
            self.config.video_ring_capacity,
            self.config.audio_ring_capacity,
        ));
        if !start.video_init.is_empty() {
            inbound
                .init_data()
                .set(MediaType::Video, Bytes::from(start.video_init.clone()));
        }
        if !start.audio_init.is_empty() {
            inbound
                .init_data()
                .set(MediaType::Audio, Bytes::from(start.audio_init.clone()));
        }

        let settings = FfmpegSettings {
            ffmpeg_path: self.config.ffmpeg_path.clone(),
            target_video: CodecTag::new(&start.target_video),
            target_audio: CodecTag::new(&start.target_audio),
            hw_accel: start.hw_accel.clone(),
            video_bitrate: start.video_bitrate,
            audio_bitrate: start.audio_bitrate,
        };
        // The encoder fills this slot on failure; the sender reports it as
        // the stream's terminal frame.
        let failure: Arc<parking_lot::Mutex<Option<TranscodeError>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let encoder_inbound = inbound.reader();
        let encoder_outbound = Arc::clone(&outbound);
        let encoder_cancel = cancel.clone();
        let encoder_failure = Arc::clone(&failure);
        let encoder_job_id = job_id.to_string();
        let encoder = tokio::spawn(async move {
            let end = run_transcode(
                settings,
                encoder_inbound,
                Arc::clone(&encoder_outbound),
                encoder_cancel,
            )
            .await;
            if let RunEnd::Failed { error, recoverable } = end {
                log::warn!("[Worker] encoder failed for job {encoder_job_id}: {error}");
                let code = if error.contains("spawn") {
                    ErrorCode::EncoderInitFailed
                } else {
                    ErrorCode::Internal
                };
                *encoder_failure.lock() = Some(TranscodeError {
                    job_id: encoder_job_id,
                    code: code as i32,
                    recoverable,
                    message: error,
                });
            }
            // Whatever happened, downstream drains and sees end-of-stream.
            encoder_outbound.close();
        });

        let (sink, mut stream) = conn.split();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        // Outbound pump: encoded samples -> batches + progress acks, then
        // the failure frame (if any) as the terminal message.
        let sender = tokio::spawn(send_encoded(
            job_id.to_string(),
            outbound.reader(),
            Arc::clone(&outbound),
            sink,
            progress_rx,
            Arc::clone(&failure),
            cancel.clone(),
        ));

        // Inbound pump: coordinator batches -> staging variant.
        let inbound_variant = Arc::clone(&inbound);
        let inbound_cancel = cancel.clone();
        let inbound_job_id = job_id.to_string();
        let receiver = tokio::spawn(async move {
            let mut last_seen = 0u64;
            loop {
                let frame = tokio::select! {
                    _ = inbound_cancel.cancelled() => break,
                    frame = stream.recv() => frame,
                };
                match frame {
                    Ok(Some(Frame::SampleBatch(batch))) => {
                        if batch.batch_sequence <= last_seen {
                            continue;
                        }
                        last_seen = batch.batch_sequence;
                        for sample in batch.video {
                            inbound_variant.push(
                                MediaType::Video,
                                SampleInput {
                                    pts: sample.pts,
                                    dts: sample.dts,
                                    payload: Bytes::from(sample.payload),
                                    keyframe: sample.keyframe,
                                },
                            );
                        }
                        for sample in batch.audio {
                            inbound_variant.push(
                                MediaType::Audio,
                                SampleInput {
                                    pts: sample.pts,
                                    dts: sample.dts,
                                    payload: Bytes::from(sample.payload),
                                    keyframe: false,
                                },
                            );
                        }
                        let _ = progress_tx.send(last_seen);
                    }
                    Ok(Some(Frame::TranscodeStop(_))) => {
                        log::debug!("[Worker] stop received for job {inbound_job_id}");
                        inbound_variant.close();
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        // Coordinator went away; stop the encoder too.
                        inbound_variant.close();
                        inbound_cancel.cancel();
                        break;
                    }
                }
            }
        });

        // The encoder finishing (via Stop or failure) ends the sender; the
        // receiver is then obsolete and both connection halves drop.
        let _ = encoder.await;
        let _ = sender.await;
        receiver.abort();
        let _ = receiver.await;
        Ok(())
    }
}

/// Worker -> coordinator: encoded samples in batches, interleaved with
/// progress acknowledgements for the inbound direction. When the encoder
/// recorded a failure, it is sent as the terminal frame.
async fn send_encoded(
    job_id: String,
    mut reader: crate::relay::VariantReader,
    outbound: Arc<Variant>,
    mut sink: FrameSink,
    mut progress_rx: mpsc::UnboundedReceiver<u64>,
    failure: Arc<parking_lot::Mutex<Option<TranscodeError>>>,
    cancel: CancellationToken,
) {
    let mut batch_sequence = 0u64;
    let mut init_sent = false;
    let mut samples_encoded = 0u64;
    let mut progress_open = true;

    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => return,
            ack = progress_rx.recv(), if progress_open => {
                match ack {
                    Some(last_batch_received) => {
                        let progress = Progress {
                            job_id: job_id.clone(),
                            last_batch_received,
                            samples_encoded,
                        };
                        if sink.send(Frame::Progress(progress)).await.is_err() {
                            return;
                        }
                    }
                    None => progress_open = false,
                }
                continue;
            }
            outcome = reader.next(MediaType::Video) => outcome,
        };

        let mut video = Vec::new();
        let mut audio = Vec::new();
        let mut closed = false;
        match first {
            ReadOutcome::Closed => closed = true,
            ReadOutcome::Skipped { .. } => continue,
            ReadOutcome::Sample { sample, .. } => {
                video.push(super::server::wire_sample(&sample));
            }
        }
        while let Some(ReadOutcome::Sample { sample, .. }) = reader.try_next(MediaType::Video) {
            video.push(super::server::wire_sample(&sample));
        }
        while let Some(ReadOutcome::Sample { sample, .. }) = reader.try_next(MediaType::Audio) {
            audio.push(super::server::wire_sample(&sample));
        }

        if !video.is_empty() || !audio.is_empty() {
            batch_sequence += 1;
            samples_encoded += (video.len() + audio.len()) as u64;
            let (video_init, audio_init) = if init_sent {
                (Vec::new(), Vec::new())
            } else {
                let video_init = outbound
                    .init_data()
                    .get(MediaType::Video)
                    .map(|b| b.to_vec());
                let audio_init = outbound
                    .init_data()
                    .get(MediaType::Audio)
                    .map(|b| b.to_vec());
                if video_init.is_some() || audio_init.is_some() {
                    init_sent = true;
                }
                (
                    video_init.unwrap_or_default(),
                    audio_init.unwrap_or_default(),
                )
            };
            let batch = SampleBatch {
                job_id: job_id.clone(),
                batch_sequence,
                video,
                audio,
                video_init,
                audio_init,
            };
            if sink.send(Frame::SampleBatch(batch)).await.is_err() {
                return;
            }
        }

        if closed {
            // Encoder finished. Report a recorded failure; otherwise the
            // connection close itself signals completion.
            let recorded_error = failure.lock().take();
            if let Some(error) = recorded_error {
                let _ = sink.send(Frame::TranscodeError(error)).await;
            }
            return;
        }
    }
}
