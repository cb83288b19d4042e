//! Capability-aware job placement.
//!
//! The scheduler turns a transcode specification into an execution
//! placement: the local executor or a remote worker. Placement reads
//! registry snapshots, so heartbeat updates are never blocked, and once a
//! job is placed it is not preempted. Unplaceable jobs wait in a FIFO
//! pending queue that is re-attempted on every heartbeat and completion.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::relay::session::TranscodeBackend;
use crate::relay::{RelayError, Variant};

use super::job::{Assignment, JobState, TranscodeJob, TranscodeSpec};
use super::registry::{WorkerRegistry, WorkerSnapshot};

/// How a dispatched job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed,
    Failed { error: String, recoverable: bool },
}

/// Executor callbacks into the scheduler.
pub trait JobEvents: Send + Sync {
    fn job_terminated(&self, job_id: &str, outcome: JobOutcome);
}

/// Local execution backend seam (implemented by the ffmpeg executor).
pub trait LocalBackend: Send + Sync {
    /// Whether the local executor advertises the spec's codecs.
    fn covers(&self, spec: &TranscodeSpec) -> bool;
    /// Jobs the local executor can still take.
    fn available(&self) -> i64;
    /// Whether the local executor provides the named accelerator.
    fn has_accel(&self, accel: &str) -> bool;
    /// Starts the job; reports termination through `events`.
    fn execute(&self, job: Arc<TranscodeJob>, events: Arc<dyn JobEvents>);
}

/// Remote dispatch seam (implemented by the control-plane server).
pub trait RemoteDispatcher: Send + Sync {
    /// Opens the transcode stream for `job` on a worker.
    fn dispatch(
        &self,
        daemon_id: &str,
        job: Arc<TranscodeJob>,
        events: Arc<dyn JobEvents>,
    ) -> Result<(), String>;
}

struct Candidate {
    assignment: Assignment,
    hardware: bool,
    capacity: i64,
    cpu_percent: f32,
    active_jobs: usize,
}

/// Selects local or remote execution for transcode jobs.
pub struct Scheduler {
    registry: Arc<WorkerRegistry>,
    local: Arc<dyn LocalBackend>,
    remote: Mutex<Option<Arc<dyn RemoteDispatcher>>>,
    jobs: DashMap<String, Arc<TranscodeJob>>,
    pending: Mutex<VecDeque<String>>,
    /// (job id, executor id) pairs excluded from placement until the instant.
    cooldowns: Mutex<HashMap<(String, String), Instant>>,
    cooldown: Duration,
    /// Self-reference so trait-object callers (sessions, executors) can
    /// reach Arc-based helpers. Set once at construction.
    self_ref: Mutex<Weak<Scheduler>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        local: Arc<dyn LocalBackend>,
        cooldown: Duration,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            registry,
            local,
            remote: Mutex::new(None),
            jobs: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            cooldowns: Mutex::new(HashMap::new()),
            cooldown,
            self_ref: Mutex::new(Weak::new()),
        });
        *scheduler.self_ref.lock() = Arc::downgrade(&scheduler);
        scheduler
    }

    fn strong_self(&self) -> Option<Arc<Scheduler>> {
        self.self_ref.lock().upgrade()
    }

    /// Wires in the control-plane server once it exists. The server holds
    /// the scheduler, so this back-edge is set post-construction.
    pub fn set_remote(&self, remote: Arc<dyn RemoteDispatcher>) {
        *self.remote.lock() = Some(remote);
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn job(&self, job_id: &str) -> Option<Arc<TranscodeJob>> {
        self.jobs.get(job_id).map(|j| Arc::clone(j.value()))
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Called by the control plane on every accepted heartbeat.
    pub fn on_worker_heartbeat(&self) {
        self.kick();
    }

    /// Called when a worker re-registers: its previous jobs return to
    /// Pending for fresh placement.
    pub fn on_worker_reassigned(&self, orphaned_jobs: Vec<String>) {
        for job_id in orphaned_jobs {
            if let Some(job) = self.job(&job_id) {
                if !job.is_terminal() {
                    log::info!("[Scheduler] requeueing job {job_id} after worker reconnect");
                    job.mark_pending();
                    self.pending.lock().push_back(job_id);
                }
            }
        }
        self.kick();
    }

    /// Called when a worker is declared dead with active jobs: each is
    /// failed, and variants that still have readers get a fresh job.
    pub fn on_worker_dead(&self, daemon_id: &str, job_ids: Vec<String>) {
        for job_id in job_ids {
            let Some(job) = self.job(&job_id) else { continue };
            if job.is_terminal() {
                continue;
            }
            job.mark_failed(format!("worker {daemon_id} lost"));
            self.replace_if_watched(&job, None);
            self.jobs.remove(&job_id);
        }
        self.kick();
    }

    /// Spawns the liveness sweep driving Stale/Dead transitions.
    pub fn spawn_liveness_sweep(
        self: &Arc<Self>,
        interval: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                for dead in scheduler.registry.sweep_liveness() {
                    scheduler.on_worker_dead(&dead.daemon_id, dead.jobs);
                }
            }
        })
    }

    /// Creates a replacement job (new id, same spec and variants) when the
    /// target variant still has readers. `exclude` blacklists an executor
    /// for the replacement for the cooldown window.
    fn replace_if_watched(&self, failed: &Arc<TranscodeJob>, exclude: Option<&str>) {
        let target = failed.target();
        if target.reader_count() == 0 || target.is_closed() {
            return;
        }
        let replacement = TranscodeJob::new(
            failed.spec.clone(),
            Arc::clone(failed.source()),
            Arc::clone(target),
        );
        if let Some(executor_id) = exclude {
            self.cooldowns.lock().insert(
                (replacement.id.clone(), executor_id.to_string()),
                Instant::now() + self.cooldown,
            );
        }
        target.set_job(replacement.id.clone());
        log::info!(
            "[Scheduler] replacing failed job {} with {} for {}",
            failed.id,
            replacement.id,
            failed.spec.target
        );
        self.jobs
            .insert(replacement.id.clone(), Arc::clone(&replacement));
        self.pending.lock().push_back(replacement.id.clone());
    }

    /// Attempts placement for every pending job, FIFO order. Jobs that
    /// still have no candidate stay queued.
    pub fn kick(&self) {
        let queued: Vec<String> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        let mut still_pending = VecDeque::new();

        for job_id in queued {
            let Some(job) = self.job(&job_id) else { continue };
            if job.state() != JobState::Pending {
                continue;
            }
            match self.try_place(&job) {
                Some(assignment) => self.dispatch(&job, assignment),
                None => still_pending.push_back(job_id),
            }
        }

        if !still_pending.is_empty() {
            let mut pending = self.pending.lock();
            // Anything submitted while we were placing keeps FIFO order
            // behind the retained jobs.
            for job_id in pending.drain(..) {
                still_pending.push_back(job_id);
            }
            *pending = still_pending;
        }
    }

    /// The placement algorithm. Returns `None` when every capable executor
    /// is at capacity or cooling down.
    fn try_place(&self, job: &Arc<TranscodeJob>) -> Option<Assignment> {
        let spec = &job.spec;
        let now = Instant::now();
        let cooldowns = self.cooldowns.lock();
        let cooling = |executor: &str| {
            cooldowns
                .get(&(job.id.clone(), executor.to_string()))
                .is_some_and(|until| *until > now)
        };

        let mut candidates = Vec::new();

        for worker in self.registry.snapshot() {
            if !worker_covers(&worker, spec) || cooling(&worker.daemon_id) {
                continue;
            }
            let capacity = worker.available_capacity();
            if capacity <= 0 {
                continue;
            }
            let hardware = spec
                .hw_accel
                .as_deref()
                .is_some_and(|accel| worker.capabilities.has_accel(accel));
            if hardware {
                // GPU-accelerated placement also needs a free encode session.
                match worker.available_gpu_sessions() {
                    Some(sessions) if sessions > 0 => {}
                    _ => continue,
                }
            }
            candidates.push(Candidate {
                assignment: Assignment::Worker(worker.daemon_id.clone()),
                hardware,
                capacity,
                cpu_percent: worker.stats.cpu_percent,
                active_jobs: worker.active_job_count,
            });
        }

        if self.local.covers(spec) && !cooling("local") {
            let capacity = self.local.available();
            if capacity > 0 {
                let hardware = spec
                    .hw_accel
                    .as_deref()
                    .is_some_and(|accel| self.local.has_accel(accel));
                candidates.push(Candidate {
                    assignment: Assignment::Local,
                    hardware,
                    capacity,
                    cpu_percent: 0.0,
                    active_jobs: 0,
                });
            }
        }

        if candidates.is_empty() {
            return None;
        }

        // Prefer the hardware partition when the request names an accel.
        let any_hardware = candidates.iter().any(|c| c.hardware);
        let mut pool: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| !any_hardware || c.hardware)
            .collect();

        pool.sort_by(|a, b| {
            b.capacity
                .cmp(&a.capacity)
                .then(a.cpu_percent.total_cmp(&b.cpu_percent))
                .then(a.active_jobs.cmp(&b.active_jobs))
                .then(a.assignment.id().cmp(b.assignment.id()))
        });
        pool.into_iter().next().map(|c| c.assignment)
    }

    fn dispatch(&self, job: &Arc<TranscodeJob>, assignment: Assignment) {
        let Some(events) = self
            .strong_self()
            .map(|s| s as Arc<dyn JobEvents>)
        else {
            // Shutting down; nothing left to run the job.
            return;
        };
        match assignment {
            Assignment::Local => {
                log::info!("[Scheduler] job {} -> local executor", job.id);
                job.mark_dispatched(Assignment::Local);
                self.local.execute(Arc::clone(job), events);
            }
            Assignment::Worker(daemon_id) => {
                let remote = self.remote.lock().clone();
                let Some(remote) = remote else {
                    // Control plane not up yet; leave the job pending.
                    self.pending.lock().push_back(job.id.clone());
                    return;
                };
                log::info!("[Scheduler] job {} -> worker {}", job.id, daemon_id);
                job.mark_dispatched(Assignment::Worker(daemon_id.clone()));
                self.registry.assign_job(&daemon_id, &job.id);
                if let Err(e) = remote.dispatch(&daemon_id, Arc::clone(job), events) {
                    log::warn!(
                        "[Scheduler] dispatch of {} to {} failed: {}; requeueing",
                        job.id,
                        daemon_id,
                        e
                    );
                    self.registry.release_job(&daemon_id, &job.id);
                    job.mark_pending();
                    self.pending.lock().push_back(job.id.clone());
                }
            }
        }
    }

    /// Drops expired cooldown entries. Called opportunistically.
    fn sweep_cooldowns(&self) {
        let now = Instant::now();
        self.cooldowns.lock().retain(|_, until| *until > now);
    }
}

impl TranscodeBackend for Scheduler {
    fn submit(
        &self,
        spec: TranscodeSpec,
        source: Arc<Variant>,
        target: Arc<Variant>,
    ) -> Result<String, RelayError> {
        // Fast capability check, ignoring capacity: a job that no known
        // executor could ever run fails immediately instead of pending.
        let local_capable = self.local.covers(&spec);
        let remote_capable = self
            .registry
            .snapshot()
            .iter()
            .any(|worker| worker_covers(worker, &spec));
        if !local_capable && !remote_capable {
            return Err(RelayError::CapabilityMissing(format!(
                "{} -> {}",
                spec.source, spec.target
            )));
        }

        let job = TranscodeJob::new(spec, source, target);
        let job_id = job.id.clone();
        self.jobs.insert(job_id.clone(), Arc::clone(&job));
        self.pending.lock().push_back(job_id.clone());
        self.kick();
        Ok(job_id)
    }

    fn cancel(&self, job_id: &str) {
        if let Some((_, job)) = self.jobs.remove(job_id) {
            log::debug!("[Scheduler] cancelling job {job_id}");
            if let Some(Assignment::Worker(daemon_id)) = job.assignment() {
                self.registry.release_job(&daemon_id, job_id);
            }
            if !job.is_terminal() {
                job.mark_completed();
            }
        }
        self.pending.lock().retain(|id| id != job_id);
    }
}

impl JobEvents for Scheduler {
    fn job_terminated(&self, job_id: &str, outcome: JobOutcome) {
        let Some(job) = self.job(job_id) else { return };
        if let Some(Assignment::Worker(daemon_id)) = job.assignment() {
            self.registry.release_job(&daemon_id, job_id);
        }
        self.sweep_cooldowns();

        match outcome {
            JobOutcome::Completed => {
                log::info!("[Scheduler] job {job_id} completed");
                job.mark_completed();
                // The upstream finished; readers drain the target and see
                // end-of-stream.
                job.target().close();
                self.jobs.remove(job_id);
            }
            JobOutcome::Failed { error, recoverable } => {
                log::warn!("[Scheduler] job {job_id} failed (recoverable={recoverable}): {error}");
                let exclude = job.assignment().map(|a| a.id().to_string());
                job.mark_failed(error);
                if recoverable {
                    self.replace_if_watched(&job, exclude.as_deref());
                } else {
                    job.target().mark_errored();
                }
                self.jobs.remove(job_id);
            }
        }
        self.kick();
    }
}

fn worker_covers(worker: &WorkerSnapshot, spec: &TranscodeSpec) -> bool {
    worker.capabilities.covers(
        spec.source.video.as_str(),
        spec.source.audio.as_str(),
        spec.target.video.as_str(),
        spec.target.audio.as_str(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::VariantKey;
    use crate::transcode::registry::{
        GpuCapability, GpuStats, SystemStats, WorkerCapabilities,
    };

    struct FakeLocal {
        video: Vec<String>,
        audio: Vec<String>,
        accels: Vec<String>,
        capacity: i64,
        executed: Mutex<Vec<String>>,
    }

    impl FakeLocal {
        fn none() -> Arc<Self> {
            Arc::new(Self {
                video: vec![],
                audio: vec![],
                accels: vec![],
                capacity: 0,
                executed: Mutex::new(vec![]),
            })
        }

        fn with(video: &str, audio: &str, capacity: i64) -> Arc<Self> {
            Arc::new(Self {
                video: vec![video.to_string()],
                audio: vec![audio.to_string()],
                accels: vec![],
                capacity,
                executed: Mutex::new(vec![]),
            })
        }
    }

    impl LocalBackend for FakeLocal {
        fn covers(&self, spec: &TranscodeSpec) -> bool {
            self.video.iter().any(|v| v == spec.target.video.as_str())
                && self.audio.iter().any(|a| a == spec.target.audio.as_str())
        }
        fn available(&self) -> i64 {
            self.capacity
        }
        fn has_accel(&self, accel: &str) -> bool {
            self.accels.iter().any(|a| a == accel)
        }
        fn execute(&self, job: Arc<TranscodeJob>, _events: Arc<dyn JobEvents>) {
            self.executed.lock().push(job.id.clone());
            job.mark_running();
        }
    }

    struct FakeRemote {
        dispatched: Mutex<Vec<(String, String)>>,
    }

    impl RemoteDispatcher for FakeRemote {
        fn dispatch(
            &self,
            daemon_id: &str,
            job: Arc<TranscodeJob>,
            _events: Arc<dyn JobEvents>,
        ) -> Result<(), String> {
            self.dispatched
                .lock()
                .push((daemon_id.to_string(), job.id.clone()));
            job.mark_running();
            Ok(())
        }
    }

    fn caps(video_enc: &str, hw: &[&str], max_jobs: u32) -> WorkerCapabilities {
        WorkerCapabilities {
            video_encoders: vec![video_enc.to_string()],
            video_decoders: vec!["h264".to_string()],
            audio_encoders: vec!["aac".to_string()],
            audio_decoders: vec!["aac".to_string()],
            hw_accels: hw.iter().map(|s| s.to_string()).collect(),
            gpus: if hw.is_empty() {
                vec![]
            } else {
                vec![GpuCapability {
                    id: "gpu0".into(),
                    name: "GPU".into(),
                    max_encode_sessions: 2,
                }]
            },
            max_concurrent_jobs: max_jobs,
        }
    }

    fn spec(target_video: &str, hw: Option<&str>) -> TranscodeSpec {
        TranscodeSpec {
            channel_id: "ch1".to_string(),
            source: VariantKey::new("h264", "aac"),
            target: VariantKey::new(target_video, "aac"),
            hw_accel: hw.map(str::to_string),
            video_bitrate: None,
            audio_bitrate: None,
        }
    }

    fn variants(spec: &TranscodeSpec) -> (Arc<Variant>, Arc<Variant>) {
        (
            Arc::new(Variant::new(spec.source.clone(), 8, 8)),
            Arc::new(Variant::new(spec.target.clone(), 8, 8)),
        )
    }

    fn registry() -> Arc<WorkerRegistry> {
        Arc::new(WorkerRegistry::new(Duration::from_secs(5), 3, 6))
    }

    #[tokio::test]
    async fn submit_fails_fast_without_capability() {
        let scheduler = Scheduler::new(registry(), FakeLocal::none(), Duration::from_secs(30));
        let spec = spec("hevc", None);
        let (source, target) = variants(&spec);
        let err = scheduler.submit(spec, source, target).unwrap_err();
        assert!(matches!(err, RelayError::CapabilityMissing(_)));
    }

    #[tokio::test]
    async fn capable_worker_at_capacity_leaves_job_pending() {
        let registry = registry();
        registry.register("w1".into(), "W".into(), "1".into(), caps("hevc", &[], 1));
        registry.assign_job("w1", "occupying");
        let scheduler = Scheduler::new(registry, FakeLocal::none(), Duration::from_secs(30));
        let spec = spec("hevc", None);
        let (source, target) = variants(&spec);
        let job_id = scheduler.submit(spec, source, target).expect("submitted");
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(scheduler.job(&job_id).unwrap().state(), JobState::Pending);
    }

    #[tokio::test]
    async fn gpu_preferred_job_falls_back_to_software() {
        // Scenario: only software workers available, GPU-preferred request.
        let registry = registry();
        registry.register("sw".into(), "SW".into(), "1".into(), caps("hevc", &[], 2));
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            FakeLocal::none(),
            Duration::from_secs(30),
        );
        let remote = Arc::new(FakeRemote {
            dispatched: Mutex::new(vec![]),
        });
        scheduler.set_remote(Arc::clone(&remote) as Arc<dyn RemoteDispatcher>);

        let spec = spec("hevc", Some("cuda"));
        let (source, target) = variants(&spec);
        scheduler.submit(spec, source, target).expect("submitted");
        assert_eq!(remote.dispatched.lock().len(), 1);
        assert_eq!(remote.dispatched.lock()[0].0, "sw");
    }

    #[tokio::test]
    async fn hardware_partition_preferred_when_available() {
        let registry = registry();
        registry.register("sw".into(), "SW".into(), "1".into(), caps("hevc", &[], 8));
        registry.register("gpu".into(), "GPU".into(), "1".into(), caps("hevc", &["cuda"], 2));
        registry.heartbeat(
            "gpu",
            SystemStats {
                gpus: vec![GpuStats {
                    id: "gpu0".into(),
                    utilization_percent: 10.0,
                    active_encode_sessions: 0,
                }],
                ..Default::default()
            },
            vec![],
        );
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            FakeLocal::none(),
            Duration::from_secs(30),
        );
        let remote = Arc::new(FakeRemote {
            dispatched: Mutex::new(vec![]),
        });
        scheduler.set_remote(Arc::clone(&remote) as Arc<dyn RemoteDispatcher>);

        // Software worker has more spare capacity, but hardware wins.
        let spec = spec("hevc", Some("cuda"));
        let (source, target) = variants(&spec);
        scheduler.submit(spec, source, target).expect("submitted");
        assert_eq!(remote.dispatched.lock()[0].0, "gpu");
    }

    #[tokio::test]
    async fn ties_break_by_capacity_then_cpu() {
        let registry = registry();
        registry.register("a".into(), "A".into(), "1".into(), caps("hevc", &[], 4));
        registry.register("b".into(), "B".into(), "1".into(), caps("hevc", &[], 2));
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            FakeLocal::none(),
            Duration::from_secs(30),
        );
        let remote = Arc::new(FakeRemote {
            dispatched: Mutex::new(vec![]),
        });
        scheduler.set_remote(Arc::clone(&remote) as Arc<dyn RemoteDispatcher>);

        let spec = spec("hevc", None);
        let (source, target) = variants(&spec);
        scheduler.submit(spec, source, target).expect("submitted");
        // "a" has available capacity 4 vs 2.
        assert_eq!(remote.dispatched.lock()[0].0, "a");
    }

    #[tokio::test]
    async fn local_executor_is_a_candidate() {
        let local = FakeLocal::with("hevc", "aac", 1);
        let scheduler = Scheduler::new(registry(), Arc::clone(&local) as Arc<dyn LocalBackend>, Duration::from_secs(30));
        let spec = spec("hevc", None);
        let (source, target) = variants(&spec);
        let job_id = scheduler.submit(spec, source, target).expect("submitted");
        assert_eq!(local.executed.lock().as_slice(), &[job_id]);
    }

    #[tokio::test]
    async fn recoverable_failure_requeues_with_cooldown_when_watched() {
        let registry = registry();
        registry.register("w1".into(), "W".into(), "1".into(), caps("hevc", &[], 2));
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            FakeLocal::none(),
            Duration::from_secs(30),
        );
        let remote = Arc::new(FakeRemote {
            dispatched: Mutex::new(vec![]),
        });
        scheduler.set_remote(Arc::clone(&remote) as Arc<dyn RemoteDispatcher>);

        let spec = spec("hevc", None);
        let (source, target) = variants(&spec);
        let job_id = scheduler
            .submit(spec, Arc::clone(&source), Arc::clone(&target))
            .expect("submitted");
        // Keep a reader open so the replacement fires.
        let reader = target.reader();

        scheduler.job_terminated(
            &job_id,
            JobOutcome::Failed {
                error: "SESSION_LIMIT_REACHED".to_string(),
                recoverable: true,
            },
        );

        // Replacement exists, is pending (w1 is cooling down for it).
        let replacement_id = target.job().expect("replacement linked");
        assert_ne!(replacement_id, job_id);
        assert_eq!(scheduler.pending_count(), 1);
        drop(reader);
    }

    #[tokio::test]
    async fn non_recoverable_failure_errors_the_variant() {
        let registry = registry();
        registry.register("w1".into(), "W".into(), "1".into(), caps("hevc", &[], 2));
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            FakeLocal::none(),
            Duration::from_secs(30),
        );
        let remote = Arc::new(FakeRemote {
            dispatched: Mutex::new(vec![]),
        });
        scheduler.set_remote(remote as Arc<dyn RemoteDispatcher>);

        let spec = spec("hevc", None);
        let (source, target) = variants(&spec);
        let job_id = scheduler
            .submit(spec, source, Arc::clone(&target))
            .expect("submitted");
        scheduler.job_terminated(
            &job_id,
            JobOutcome::Failed {
                error: "ENCODER_INIT_FAILED".to_string(),
                recoverable: false,
            },
        );
        assert!(target.is_errored());
    }

    #[tokio::test]
    async fn worker_death_requeues_watched_jobs() {
        let registry = registry();
        registry.register("w1".into(), "W".into(), "1".into(), caps("hevc", &[], 2));
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            FakeLocal::none(),
            Duration::from_secs(30),
        );
        let remote = Arc::new(FakeRemote {
            dispatched: Mutex::new(vec![]),
        });
        scheduler.set_remote(remote as Arc<dyn RemoteDispatcher>);

        let spec = spec("hevc", None);
        let (source, target) = variants(&spec);
        let job_id = scheduler
            .submit(spec, source, Arc::clone(&target))
            .expect("submitted");
        let reader = target.reader();

        let dead = registry.remove("w1").expect("removed");
        scheduler.on_worker_dead(&dead.daemon_id, vec![job_id.clone()]);

        let replacement_id = target.job().expect("replacement");
        assert_ne!(replacement_id, job_id);
        // No workers remain, so the replacement is pending.
        assert_eq!(scheduler.pending_count(), 1);
        drop(reader);
    }
}
