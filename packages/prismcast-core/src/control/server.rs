//! Coordinator side of the control plane.
//!
//! One listener serves both connection kinds: a worker's persistent
//! Register/Heartbeat connection, and the per-job transcode streams the
//! worker opens back after a `TranscodeAssign`. The server implements
//! [`RemoteDispatcher`] for the scheduler.
//!
//! No registry or scheduler lock is ever held across a network await.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::relay::{MediaType, ReadOutcome, SampleInput};
use crate::state::CoordinatorConfig;
use crate::transcode::{Assignment, JobEvents, JobOutcome, RemoteDispatcher, Scheduler, TranscodeJob};

use super::framing::{FrameSink, FrameStream, FramedConn};
use super::proto::{
    ErrorCode, Frame, HeartbeatAck, RegisterAck, SampleBatch, TranscodeAssign, TranscodeStart,
    TranscodeStop, WireSample,
};

/// Timeout for the first frame of a fresh connection.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

struct Connection {
    nonce: String,
    assign_tx: mpsc::UnboundedSender<TranscodeAssign>,
}

struct PendingJob {
    job: Arc<TranscodeJob>,
    events: Arc<dyn JobEvents>,
}

/// Control-plane listener and per-worker connection state.
pub struct ControlServer {
    scheduler: Arc<Scheduler>,
    config: CoordinatorConfig,
    connections: DashMap<String, Connection>,
    awaiting_open: DashMap<String, PendingJob>,
}

impl ControlServer {
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            config,
            connections: DashMap::new(),
            awaiting_open: DashMap::new(),
        })
    }

    /// Accept loop. Runs until cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        log::info!(
            "[Control] listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string())
        );
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("[Control] accept failed: {e}");
                        continue;
                    }
                },
            };
            log::debug!("[Control] connection from {peer}");
            let server = Arc::clone(&self);
            let conn_cancel = cancel.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, conn_cancel).await;
            });
        }
        log::info!("[Control] listener stopped");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, cancel: CancellationToken) {
        let mut conn = FramedConn::new(stream);
        let hello = tokio::time::timeout(HELLO_TIMEOUT, conn.recv()).await;
        match hello {
            Ok(Ok(Some(Frame::Register(register)))) => {
                self.worker_connection(conn, register, cancel).await;
            }
            Ok(Ok(Some(Frame::TranscodeOpen(open)))) => {
                self.transcode_connection(conn, open, cancel).await;
            }
            Ok(Ok(Some(_))) => {
                log::warn!("[Control] connection opened with unexpected frame");
            }
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => {}
        }
    }

    fn auth_ok(&self, presented: &str) -> bool {
        match &self.config.auth_token {
            Some(expected) => expected == presented,
            None => true,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Register + Heartbeat connection
    // ─────────────────────────────────────────────────────────────────────

    async fn worker_connection(
        self: &Arc<Self>,
        mut conn: FramedConn,
        register: super::proto::Register,
        cancel: CancellationToken,
    ) {
        let daemon_id = register.daemon_id.clone();

        if !self.auth_ok(&register.auth_token) || register.version.is_empty() {
            let reason = if register.version.is_empty() {
                "missing version"
            } else {
                "bad auth token"
            };
            log::warn!("[Control] rejecting registration from {daemon_id}: {reason}");
            let _ = conn
                .send(Frame::RegisterAck(RegisterAck {
                    accepted: false,
                    heartbeat_interval_secs: 0,
                    coordinator_version: env!("CARGO_PKG_VERSION").to_string(),
                    message: reason.to_string(),
                }))
                .await;
            return;
        }

        let capabilities = register.capabilities.unwrap_or_default().into();
        let registered = self.scheduler.registry().register(
            daemon_id.clone(),
            register.name,
            register.version,
            capabilities,
        );
        self.scheduler.on_worker_reassigned(registered.orphaned_jobs);

        let nonce = Uuid::new_v4().to_string();
        let (assign_tx, mut assign_rx) = mpsc::unbounded_channel();
        self.connections.insert(
            daemon_id.clone(),
            Connection {
                nonce: nonce.clone(),
                assign_tx,
            },
        );

        if conn
            .send(Frame::RegisterAck(RegisterAck {
                accepted: true,
                heartbeat_interval_secs: self.config.heartbeat_interval_secs,
                coordinator_version: env!("CARGO_PKG_VERSION").to_string(),
                message: String::new(),
            }))
            .await
            .is_err()
        {
            self.drop_connection(&daemon_id, &nonce);
            return;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                assign = assign_rx.recv() => {
                    let Some(assign) = assign else { break };
                    if conn.send(Frame::TranscodeAssign(assign)).await.is_err() {
                        break;
                    }
                }
                frame = conn.recv() => match frame {
                    Ok(Some(Frame::Heartbeat(heartbeat))) => {
                        let known = self.scheduler.registry().heartbeat(
                            &heartbeat.daemon_id,
                            heartbeat.stats.unwrap_or_default().into(),
                            heartbeat.active_jobs,
                        );
                        if !known {
                            // Registry lost this worker (liveness sweep);
                            // force a clean re-register.
                            log::warn!("[Control] heartbeat from unregistered {daemon_id}");
                            break;
                        }
                        if conn.send(Frame::HeartbeatAck(HeartbeatAck {})).await.is_err() {
                            break;
                        }
                        self.scheduler.on_worker_heartbeat();
                    }
                    Ok(Some(_)) => {
                        log::warn!("[Control] unexpected frame on control connection from {daemon_id}");
                    }
                    Ok(None) | Err(_) => break,
                },
            }
        }

        self.drop_connection(&daemon_id, &nonce);
    }

    /// Removes this connection's state, unless a reconnect already
    /// replaced it. Only the current connection may declare the worker
    /// dead.
    fn drop_connection(&self, daemon_id: &str, nonce: &str) {
        let is_current = self
            .connections
            .get(daemon_id)
            .is_some_and(|c| c.nonce == nonce);
        if !is_current {
            return;
        }
        self.connections.remove(daemon_id);
        if let Some(dead) = self.scheduler.registry().remove(daemon_id) {
            log::warn!(
                "[Control] worker {daemon_id} disconnected with {} active jobs",
                dead.jobs.len()
            );
            self.scheduler.on_worker_dead(daemon_id, dead.jobs);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Per-job transcode stream
    // ─────────────────────────────────────────────────────────────────────

    async fn transcode_connection(
        self: &Arc<Self>,
        mut conn: FramedConn,
        open: super::proto::TranscodeOpen,
        cancel: CancellationToken,
    ) {
        if !self.auth_ok(&open.auth_token) {
            return;
        }
        let Some((_, pending)) = self.awaiting_open.remove(&open.job_id) else {
            log::warn!("[Control] transcode open for unknown job {}", open.job_id);
            let _ = conn
                .send(Frame::TranscodeError(super::proto::TranscodeError {
                    job_id: open.job_id,
                    code: ErrorCode::Internal as i32,
                    recoverable: false,
                    message: "job not awaiting open".to_string(),
                }))
                .await;
            return;
        };
        let PendingJob { job, events } = pending;

        let assigned_here = matches!(
            job.assignment(),
            Some(Assignment::Worker(ref id)) if *id == open.daemon_id
        );
        if !assigned_here {
            log::warn!(
                "[Control] job {} opened by {} but assigned elsewhere",
                job.id,
                open.daemon_id
            );
            return;
        }

        job.mark_running();

        let start = TranscodeStart {
            job_id: job.id.clone(),
            source_video: job.spec.source.video.to_string(),
            source_audio: job.spec.source.audio.to_string(),
            target_video: job.spec.target.video.to_string(),
            target_audio: job.spec.target.audio.to_string(),
            hw_accel: job.spec.hw_accel.clone(),
            video_bitrate: job.spec.video_bitrate,
            audio_bitrate: job.spec.audio_bitrate,
            video_init: job
                .source()
                .init_data()
                .get(MediaType::Video)
                .map(|b| b.to_vec())
                .unwrap_or_default(),
            audio_init: job
                .source()
                .init_data()
                .get(MediaType::Audio)
                .map(|b| b.to_vec())
                .unwrap_or_default(),
        };

        if conn.send(Frame::TranscodeStart(start)).await.is_err() {
            events.job_terminated(
                &job.id,
                JobOutcome::Failed {
                    error: "transcode stream failed before start".to_string(),
                    recoverable: true,
                },
            );
            return;
        }

        let (sink, stream) = conn.split();
        let (acked_tx, acked_rx) = watch::channel(0u64);
        let stop_sent = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let feeder = tokio::spawn(feed_samples(
            Arc::clone(&job),
            sink,
            acked_rx,
            self.config.batch_max_samples,
            self.config.max_inflight_batches,
            Arc::clone(&stop_sent),
            cancel.clone(),
        ));

        let outcome = receive_encoded(Arc::clone(&job), stream, acked_tx, stop_sent, cancel).await;
        feeder.abort();
        let _ = feeder.await;
        events.job_terminated(&job.id, outcome);
    }
}

impl RemoteDispatcher for ControlServer {
    fn dispatch(
        &self,
        daemon_id: &str,
        job: Arc<TranscodeJob>,
        events: Arc<dyn JobEvents>,
    ) -> Result<(), String> {
        let Some(connection) = self.connections.get(daemon_id) else {
            return Err(format!("no control connection for {daemon_id}"));
        };
        let assign = TranscodeAssign {
            job_id: job.id.clone(),
        };
        self.awaiting_open
            .insert(job.id.clone(), PendingJob { job, events });
        connection
            .assign_tx
            .send(assign)
            .map_err(|_| format!("control connection to {daemon_id} is closing"))
    }
}

/// Coordinator -> worker direction: source samples in flow-controlled
/// batches, then `Stop` when the source drains.
async fn feed_samples(
    job: Arc<TranscodeJob>,
    mut sink: FrameSink,
    mut acked: watch::Receiver<u64>,
    batch_max: usize,
    max_inflight: u64,
    stop_sent: Arc<std::sync::atomic::AtomicBool>,
    cancel: CancellationToken,
) {
    let mut reader = job.source().reader();
    reader.rewind_to_keyframe();
    let mut batch_sequence = 0u64;
    let job_cancel = job.cancel_token().clone();

    loop {
        // Flow control: stall while the worker is behind by max_inflight.
        while batch_sequence > *acked.borrow() + max_inflight {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = job_cancel.cancelled() => return,
                changed = acked.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let mut video = Vec::new();
        let mut audio = Vec::new();
        let mut source_closed = false;

        // Block for the first sample, then batch whatever else is ready.
        let first = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = job_cancel.cancelled() => {
                stop_sent.store(true, std::sync::atomic::Ordering::SeqCst);
                let _ = sink.send(Frame::TranscodeStop(TranscodeStop {
                    job_id: job.id.clone(),
                })).await;
                return;
            }
            outcome = reader.next(MediaType::Video) => outcome,
        };
        match first {
            ReadOutcome::Closed => source_closed = true,
            ReadOutcome::Skipped { .. } => continue,
            ReadOutcome::Sample { sample, .. } => video.push(wire_sample(&sample)),
        }

        while video.len() + audio.len() < batch_max {
            match reader.try_next(MediaType::Video) {
                Some(ReadOutcome::Sample { sample, .. }) => video.push(wire_sample(&sample)),
                Some(ReadOutcome::Closed) => {
                    source_closed = true;
                    break;
                }
                _ => break,
            }
        }
        while video.len() + audio.len() < batch_max {
            match reader.try_next(MediaType::Audio) {
                Some(ReadOutcome::Sample { sample, .. }) => audio.push(wire_sample(&sample)),
                _ => break,
            }
        }

        if !video.is_empty() || !audio.is_empty() {
            batch_sequence += 1;
            let batch = SampleBatch {
                job_id: job.id.clone(),
                batch_sequence,
                video,
                audio,
                video_init: Vec::new(),
                audio_init: Vec::new(),
            };
            if sink.send(Frame::SampleBatch(batch)).await.is_err() {
                return;
            }
        }

        if source_closed {
            stop_sent.store(true, std::sync::atomic::Ordering::SeqCst);
            let _ = sink
                .send(Frame::TranscodeStop(TranscodeStop {
                    job_id: job.id.clone(),
                }))
                .await;
            return;
        }
    }
}

/// Worker -> coordinator direction: encoded batches into the target
/// variant, progress acks into the feeder's watermark.
async fn receive_encoded(
    job: Arc<TranscodeJob>,
    mut stream: FrameStream,
    acked: watch::Sender<u64>,
    stop_sent: Arc<std::sync::atomic::AtomicBool>,
    cancel: CancellationToken,
) -> JobOutcome {
    let target = job.target();
    let mut last_seen = 0u64;
    let job_cancel = job.cancel_token().clone();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return JobOutcome::Completed,
            _ = job_cancel.cancelled() => return JobOutcome::Completed,
            frame = stream.recv() => frame,
        };
        match frame {
            Ok(Some(Frame::SampleBatch(batch))) => {
                if batch.batch_sequence <= last_seen {
                    log::debug!(
                        "[Control] discarding out-of-order batch {} for job {}",
                        batch.batch_sequence,
                        job.id
                    );
                    continue;
                }
                last_seen = batch.batch_sequence;
                if !batch.video_init.is_empty() {
                    target
                        .init_data()
                        .set(MediaType::Video, Bytes::from(batch.video_init));
                }
                if !batch.audio_init.is_empty() {
                    target
                        .init_data()
                        .set(MediaType::Audio, Bytes::from(batch.audio_init));
                }
                for sample in batch.video {
                    target.push(MediaType::Video, sample_input(sample));
                }
                for sample in batch.audio {
                    target.push(MediaType::Audio, sample_input(sample));
                }
            }
            Ok(Some(Frame::Progress(progress))) => {
                let _ = acked.send(progress.last_batch_received);
            }
            Ok(Some(Frame::TranscodeError(error))) => {
                let code = ErrorCode::try_from(error.code).unwrap_or(ErrorCode::Internal);
                return JobOutcome::Failed {
                    error: format!("{code:?}: {}", error.message),
                    recoverable: error.recoverable,
                };
            }
            Ok(Some(_)) => {
                log::warn!("[Control] unexpected frame on transcode stream for {}", job.id);
            }
            Ok(None) => {
                // Orderly close after Stop means the worker finished;
                // a close with the source still live is a lost worker.
                if stop_sent.load(std::sync::atomic::Ordering::SeqCst) {
                    return JobOutcome::Completed;
                }
                return JobOutcome::Failed {
                    error: "transcode stream closed mid-job".to_string(),
                    recoverable: true,
                };
            }
            Err(e) => {
                return JobOutcome::Failed {
                    error: format!("transcode stream failed: {e}"),
                    recoverable: true,
                };
            }
        }
    }
}

pub(crate) fn wire_sample(sample: &crate::relay::Sample) -> WireSample {
    WireSample {
        pts: sample.pts,
        dts: sample.dts,
        payload: sample.payload.to_vec(),
        keyframe: sample.keyframe,
        sequence: sample.sequence,
    }
}

fn sample_input(sample: WireSample) -> SampleInput {
    SampleInput {
        pts: sample.pts,
        dts: sample.dts,
        payload: Bytes::from(sample.payload),
        keyframe: sample.keyframe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CoordinatorConfig;
    use crate::transcode::registry::WorkerRegistry;
    use crate::transcode::{LocalBackend, TranscodeSpec};
    use crate::relay::{Variant, VariantKey};

    struct NoLocal;
    impl LocalBackend for NoLocal {
        fn covers(&self, _spec: &TranscodeSpec) -> bool {
            false
        }
        fn available(&self) -> i64 {
            0
        }
        fn has_accel(&self, _accel: &str) -> bool {
            false
        }
        fn execute(&self, _job: Arc<TranscodeJob>, _events: Arc<dyn JobEvents>) {}
    }

    fn server() -> Arc<ControlServer> {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(5), 3, 6));
        let scheduler = Scheduler::new(registry, Arc::new(NoLocal), Duration::from_secs(30));
        ControlServer::new(scheduler, CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn dispatch_without_connection_fails() {
        let server = server();
        let spec = TranscodeSpec {
            channel_id: "ch".into(),
            source: VariantKey::new("h264", "aac"),
            target: VariantKey::new("hevc", "aac"),
            hw_accel: None,
            video_bitrate: None,
            audio_bitrate: None,
        };
        let source = Arc::new(Variant::new(spec.source.clone(), 8, 8));
        let target = Arc::new(Variant::new(spec.target.clone(), 8, 8));
        let job = TranscodeJob::new(spec, source, target);
        let events: Arc<dyn JobEvents> = Arc::clone(&server.scheduler) as Arc<dyn JobEvents>;
        assert!(server.dispatch("ghost", job, events).is_err());
    }

    #[tokio::test]
    async fn wire_sample_round_trip_preserves_fields() {
        let sample = crate::relay::Sample {
            pts: 123,
            dts: 120,
            payload: Bytes::from_static(b"abc"),
            keyframe: true,
            sequence: 9,
        };
        let wire = wire_sample(&sample);
        let input = sample_input(wire);
        assert_eq!(input.pts, 123);
        assert_eq!(input.dts, 120);
        assert!(input.keyframe);
        assert_eq!(&input.payload[..], b"abc");
    }
}
