//! Core configuration types.
//!
//! Every timeout and capacity named by the relay, coordinator and pipeline
//! subsystems is tunable here. Binaries load these from YAML and apply env
//! overrides; library consumers construct them directly.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the streaming relay core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Capacity of each variant's video sample ring.
    pub video_ring_capacity: usize,

    /// Capacity of each variant's audio sample ring.
    pub audio_ring_capacity: usize,

    /// Seconds a target variant may have zero readers before destruction.
    pub variant_idle_secs: u64,

    /// Seconds a session may have zero clients before teardown.
    pub session_idle_secs: u64,

    /// Interval of the session reaper sweep.
    pub reaper_interval_secs: u64,

    /// Origin dial timeout.
    pub origin_dial_timeout_secs: u64,

    /// Origin read idle timeout; a stalled origin triggers reconnect.
    pub origin_read_idle_secs: u64,

    /// Client read idle timeout on continuous streams.
    pub client_read_idle_secs: u64,

    /// Target segment duration for HLS/DASH packaging.
    pub segment_target_secs: u64,

    /// Number of segments in the sliding media playlist window.
    pub playlist_window: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            video_ring_capacity: 1000,
            audio_ring_capacity: 2000,
            variant_idle_secs: 60,
            session_idle_secs: 60,
            reaper_interval_secs: 10,
            origin_dial_timeout_secs: 10,
            origin_read_idle_secs: 30,
            client_read_idle_secs: 10,
            segment_target_secs: 6,
            playlist_window: 5,
        }
    }
}

impl RelayConfig {
    /// Validates capacities that would break ring or playlist semantics.
    pub fn validate(&self) -> Result<(), String> {
        if self.video_ring_capacity == 0 || self.audio_ring_capacity == 0 {
            return Err("ring capacities must be >= 1".to_string());
        }
        if self.playlist_window == 0 {
            return Err("playlist_window must be >= 1".to_string());
        }
        if self.segment_target_secs == 0 {
            return Err("segment_target_secs must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Configuration for the distributed transcode coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Heartbeat cadence negotiated with workers (seconds).
    pub heartbeat_interval_secs: u64,

    /// Heartbeats missed before a worker is considered stale.
    pub stale_after_missed: u32,

    /// Heartbeats missed before a worker is declared dead and removed.
    pub dead_after_missed: u32,

    /// Shared token workers must present at Register time.
    /// `None` disables authentication (trusted networks only).
    pub auth_token: Option<String>,

    /// Maximum concurrent local transcode jobs.
    pub local_max_jobs: usize,

    /// Video codecs the local executor can encode (codec tags).
    pub local_video_encoders: Vec<String>,

    /// Audio codecs the local executor can encode (codec tags).
    pub local_audio_encoders: Vec<String>,

    /// Hardware accelerators available to the local executor.
    pub local_hw_accels: Vec<String>,

    /// Path to the ffmpeg binary used for local jobs.
    pub ffmpeg_path: String,

    /// Cooldown applied to a (job, worker) pair after a recoverable failure.
    pub retry_cooldown_secs: u64,

    /// Maximum samples per SampleBatch frame.
    pub batch_max_samples: usize,

    /// Maximum unacknowledged batches in flight per transcode stream.
    pub max_inflight_batches: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            stale_after_missed: 3,
            dead_after_missed: 6,
            auth_token: None,
            local_max_jobs: 2,
            local_video_encoders: vec!["h264".to_string()],
            local_audio_encoders: vec!["aac".to_string()],
            local_hw_accels: Vec::new(),
            ffmpeg_path: "ffmpeg".to_string(),
            retry_cooldown_secs: 30,
            batch_max_samples: 32,
            max_inflight_batches: 8,
        }
    }
}

impl CoordinatorConfig {
    /// Validates values the control plane depends on.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be >= 1".to_string());
        }
        if self.dead_after_missed <= self.stale_after_missed {
            return Err("dead_after_missed must exceed stale_after_missed".to_string());
        }
        if self.batch_max_samples == 0 || self.max_inflight_batches == 0 {
            return Err("batch sizing must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Configuration for the generation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Default per-stage timeout (seconds).
    pub stage_timeout_secs: u64,

    /// Timeout for the ingestion guard stage (seconds).
    pub guard_timeout_secs: u64,

    /// Bounded parallelism for logo fetches.
    pub logo_parallelism: usize,

    /// Days a cached logo is retained before the background sweep removes it.
    pub logo_retention_days: u64,

    /// Directory for the content-addressed logo cache.
    pub logo_dir: PathBuf,

    /// Directory for published playlist/guide artifacts.
    pub output_dir: PathBuf,

    /// Programs are streamed to the guide writer in batches of this size.
    pub program_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: 600,
            guard_timeout_secs: 600,
            logo_parallelism: 8,
            logo_retention_days: 30,
            logo_dir: PathBuf::from("data/logos"),
            output_dir: PathBuf::from("data/output"),
            program_batch_size: 1000,
        }
    }
}

impl PipelineConfig {
    /// Validates values the pipeline depends on.
    pub fn validate(&self) -> Result<(), String> {
        if self.logo_parallelism == 0 {
            return Err("logo_parallelism must be >= 1".to_string());
        }
        if self.program_batch_size == 0 {
            return Err("program_batch_size must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Top-level configuration for the Prismcast coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay core tunables.
    pub relay: RelayConfig,

    /// Transcode coordinator tunables.
    pub coordinator: CoordinatorConfig,

    /// Generation pipeline tunables.
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Validates all subsections.
    pub fn validate(&self) -> Result<(), String> {
        self.relay.validate()?;
        self.coordinator.validate()?;
        self.pipeline.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn dead_threshold_must_exceed_stale() {
        let mut config = CoordinatorConfig::default();
        config.dead_after_missed = config.stale_after_missed;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_ring_capacity_rejected() {
        let config = RelayConfig {
            video_ring_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
