//! Worker registry: connected daemons, capabilities, and live capacity.
//!
//! # Concurrency design
//!
//! The registry is guarded by a single `RwLock`; the scheduler never reads
//! it directly but takes [`WorkerSnapshot`]s, so placement decisions do not
//! block heartbeat updates and the lock never spans network I/O.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A GPU advertised by a worker, with its encode session ceiling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuCapability {
    pub id: String,
    pub name: String,
    pub max_encode_sessions: u32,
}

/// Capabilities a worker declares at Register time.
///
/// Declared values stay stable until reconnect; the scheduler treats them
/// as data, so new encoders are a worker-side configuration change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub video_encoders: Vec<String>,
    pub video_decoders: Vec<String>,
    pub audio_encoders: Vec<String>,
    pub audio_decoders: Vec<String>,
    pub hw_accels: Vec<String>,
    pub gpus: Vec<GpuCapability>,
    pub max_concurrent_jobs: u32,
}

impl WorkerCapabilities {
    /// Whether the worker advertises every encoder/decoder a spec needs.
    #[must_use]
    pub fn covers(&self, video_decoder: &str, audio_decoder: &str, video_encoder: &str, audio_encoder: &str) -> bool {
        self.video_decoders.iter().any(|c| c == video_decoder)
            && self.audio_decoders.iter().any(|c| c == audio_decoder)
            && self.video_encoders.iter().any(|c| c == video_encoder)
            && self.audio_encoders.iter().any(|c| c == audio_encoder)
    }

    #[must_use]
    pub fn has_accel(&self, accel: &str) -> bool {
        self.hw_accels.iter().any(|a| a == accel)
    }
}

/// Live per-GPU stats from a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuStats {
    pub id: String,
    pub utilization_percent: f32,
    pub active_encode_sessions: u32,
}

/// Live system stats from a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub load_average: f32,
    pub gpus: Vec<GpuStats>,
}

/// Worker liveness, derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Live,
    Stale,
    Dead,
}

/// Registry record for one connected daemon.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub daemon_id: String,
    pub name: String,
    pub version: String,
    pub capabilities: WorkerCapabilities,
    pub stats: SystemStats,
    pub active_jobs: HashSet<String>,
    pub last_heartbeat: Instant,
    pub liveness: Liveness,
}

/// Immutable view of a worker for placement decisions.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub daemon_id: String,
    pub capabilities: WorkerCapabilities,
    pub stats: SystemStats,
    pub active_job_count: usize,
    pub liveness: Liveness,
}

impl WorkerSnapshot {
    /// Jobs the worker can still take.
    #[must_use]
    pub fn available_capacity(&self) -> i64 {
        i64::from(self.capabilities.max_concurrent_jobs) - self.active_job_count as i64
    }

    /// Remaining encode sessions on the named GPU, if the worker has one.
    /// Reported heartbeat counts are the source of truth.
    #[must_use]
    pub fn available_gpu_sessions(&self) -> Option<i64> {
        let best = self
            .capabilities
            .gpus
            .iter()
            .map(|gpu| {
                let active = self
                    .stats
                    .gpus
                    .iter()
                    .find(|g| g.id == gpu.id)
                    .map_or(0, |g| g.active_encode_sessions);
                i64::from(gpu.max_encode_sessions) - i64::from(active)
            })
            .max()?;
        Some(best)
    }
}

/// Outcome of a register call.
#[derive(Debug)]
pub struct Registered {
    /// Jobs attributed to the prior connection with this daemon id; the
    /// scheduler returns them to Pending.
    pub orphaned_jobs: Vec<String>,
}

/// A worker removed by the liveness sweep, with its stranded jobs.
#[derive(Debug)]
pub struct DeadWorker {
    pub daemon_id: String,
    pub jobs: Vec<String>,
}

/// Tracks connected remote daemons, their capabilities and live load.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerRecord>>,
    heartbeat_interval: Duration,
    stale_after_missed: u32,
    dead_after_missed: u32,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new(heartbeat_interval: Duration, stale_after_missed: u32, dead_after_missed: u32) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            heartbeat_interval,
            stale_after_missed,
            dead_after_missed,
        }
    }

    /// Registers (or re-registers) a daemon. Idempotent by daemon id: a
    /// reconnect replaces the prior record and surrenders its jobs.
    pub fn register(
        &self,
        daemon_id: String,
        name: String,
        version: String,
        capabilities: WorkerCapabilities,
    ) -> Registered {
        let mut workers = self.workers.write();
        let orphaned_jobs = workers
            .remove(&daemon_id)
            .map(|prior| prior.active_jobs.into_iter().collect())
            .unwrap_or_default();

        log::info!(
            "[WorkerRegistry] registered {daemon_id} ({name} v{version}), \
             {} video encoders, {} gpus, max {} jobs",
            capabilities.video_encoders.len(),
            capabilities.gpus.len(),
            capabilities.max_concurrent_jobs,
        );

        workers.insert(
            daemon_id.clone(),
            WorkerRecord {
                daemon_id,
                name,
                version,
                capabilities,
                stats: SystemStats::default(),
                active_jobs: HashSet::new(),
                last_heartbeat: Instant::now(),
                liveness: Liveness::Live,
            },
        );
        Registered { orphaned_jobs }
    }

    /// Applies a heartbeat. Returns false for unknown daemons (the worker
    /// must re-register).
    pub fn heartbeat(&self, daemon_id: &str, stats: SystemStats, active_jobs: Vec<String>) -> bool {
        let mut workers = self.workers.write();
        let Some(record) = workers.get_mut(daemon_id) else {
            return false;
        };
        record.stats = stats;
        record.active_jobs = active_jobs.into_iter().collect();
        record.last_heartbeat = Instant::now();
        record.liveness = Liveness::Live;
        true
    }

    /// Records a job dispatched to a worker.
    pub fn assign_job(&self, daemon_id: &str, job_id: &str) {
        if let Some(record) = self.workers.write().get_mut(daemon_id) {
            record.active_jobs.insert(job_id.to_string());
        }
    }

    /// Clears a job from a worker's active set.
    pub fn release_job(&self, daemon_id: &str, job_id: &str) {
        if let Some(record) = self.workers.write().get_mut(daemon_id) {
            record.active_jobs.remove(job_id);
        }
    }

    /// Removes a daemon explicitly (its control connection closed).
    pub fn remove(&self, daemon_id: &str) -> Option<DeadWorker> {
        self.workers.write().remove(daemon_id).map(|record| DeadWorker {
            daemon_id: record.daemon_id,
            jobs: record.active_jobs.into_iter().collect(),
        })
    }

    /// Advances liveness by heartbeat age: Live -> Stale after
    /// `stale_after_missed` intervals, Stale -> Dead (removed, returned to
    /// the caller) after `dead_after_missed`.
    pub fn sweep_liveness(&self) -> Vec<DeadWorker> {
        let stale_after = self.heartbeat_interval * self.stale_after_missed;
        let dead_after = self.heartbeat_interval * self.dead_after_missed;
        let mut dead = Vec::new();

        let mut workers = self.workers.write();
        workers.retain(|id, record| {
            let age = record.last_heartbeat.elapsed();
            if age >= dead_after {
                log::warn!("[WorkerRegistry] {id} missed {} heartbeats, declaring dead", self.dead_after_missed);
                dead.push(DeadWorker {
                    daemon_id: record.daemon_id.clone(),
                    jobs: record.active_jobs.iter().cloned().collect(),
                });
                return false;
            }
            if age >= stale_after && record.liveness == Liveness::Live {
                log::warn!("[WorkerRegistry] {id} heartbeat stale ({age:?})");
                record.liveness = Liveness::Stale;
            }
            true
        });
        dead
    }

    /// Snapshot of all live workers for the scheduler.
    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .read()
            .values()
            .filter(|record| record.liveness == Liveness::Live)
            .map(|record| WorkerSnapshot {
                daemon_id: record.daemon_id.clone(),
                capabilities: record.capabilities.clone(),
                stats: record.stats.clone(),
                active_job_count: record.active_jobs.len(),
                liveness: record.liveness,
            })
            .collect()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(max_jobs: u32) -> WorkerCapabilities {
        WorkerCapabilities {
            video_encoders: vec!["libx265".to_string()],
            video_decoders: vec!["h264".to_string()],
            audio_encoders: vec!["aac".to_string()],
            audio_decoders: vec!["aac".to_string()],
            hw_accels: vec![],
            gpus: vec![],
            max_concurrent_jobs: max_jobs,
        }
    }

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(Duration::from_secs(5), 3, 6)
    }

    #[test]
    fn reconnect_replaces_record_and_orphans_jobs() {
        let registry = registry();
        registry.register("w1".into(), "Worker".into(), "1.0".into(), caps(2));
        registry.assign_job("w1", "job-a");
        registry.assign_job("w1", "job-b");

        let result = registry.register("w1".into(), "Worker".into(), "1.1".into(), caps(2));
        let mut orphaned = result.orphaned_jobs;
        orphaned.sort();
        assert_eq!(orphaned, vec!["job-a", "job-b"]);
        assert_eq!(registry.worker_count(), 1);
        // New record starts with an empty job set.
        assert_eq!(registry.snapshot()[0].active_job_count, 0);
    }

    #[test]
    fn heartbeat_from_unknown_daemon_is_rejected() {
        let registry = registry();
        assert!(!registry.heartbeat("ghost", SystemStats::default(), vec![]));
    }

    #[test]
    fn snapshot_reflects_capacity() {
        let registry = registry();
        registry.register("w1".into(), "Worker".into(), "1.0".into(), caps(3));
        registry.assign_job("w1", "job-a");
        let snap = &registry.snapshot()[0];
        assert_eq!(snap.available_capacity(), 2);
    }

    #[test]
    fn gpu_sessions_use_reported_counts() {
        let registry = registry();
        let mut capabilities = caps(4);
        capabilities.gpus = vec![GpuCapability {
            id: "gpu0".into(),
            name: "Test GPU".into(),
            max_encode_sessions: 3,
        }];
        capabilities.hw_accels = vec!["cuda".into()];
        registry.register("w1".into(), "Worker".into(), "1.0".into(), capabilities);
        registry.heartbeat(
            "w1",
            SystemStats {
                gpus: vec![GpuStats {
                    id: "gpu0".into(),
                    utilization_percent: 50.0,
                    active_encode_sessions: 2,
                }],
                ..Default::default()
            },
            vec![],
        );
        let snap = &registry.snapshot()[0];
        assert_eq!(snap.available_gpu_sessions(), Some(1));
    }

    #[test]
    fn remove_returns_stranded_jobs() {
        let registry = registry();
        registry.register("w1".into(), "Worker".into(), "1.0".into(), caps(2));
        registry.assign_job("w1", "job-a");
        let dead = registry.remove("w1").expect("removed");
        assert_eq!(dead.jobs, vec!["job-a"]);
        assert_eq!(registry.worker_count(), 0);
    }
}
