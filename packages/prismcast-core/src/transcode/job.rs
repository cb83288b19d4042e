//! Transcode job records.
//!
//! A job is the unit of dispatch between a target variant and an executor
//! (local subprocess or remote worker). It holds the two variant handles it
//! pumps between and nothing else of the session, so terminating a job can
//! never reach back into session state.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::relay::{Variant, VariantKey};

/// What a job transforms, and with which hints.
#[derive(Debug, Clone, Serialize)]
pub struct TranscodeSpec {
    pub channel_id: String,
    pub source: VariantKey,
    pub target: VariantKey,
    /// Preferred hardware accelerator; placement prefers but never requires it.
    pub hw_accel: Option<String>,
    /// Video bitrate hint in kbit/s.
    pub video_bitrate: Option<u32>,
    /// Audio bitrate hint in kbit/s.
    pub audio_bitrate: Option<u32>,
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Dispatched,
    Running,
    Failed,
    Completed,
}

/// Where a job was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Local,
    Worker(String),
}

impl Assignment {
    /// Stable identifier used in logs and candidate ordering.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Worker(id) => id,
        }
    }
}

/// A running or queued transformation from a source variant to a target.
pub struct TranscodeJob {
    pub id: String,
    pub spec: TranscodeSpec,
    source: Arc<Variant>,
    target: Arc<Variant>,
    state: Mutex<JobState>,
    assignment: Mutex<Option<Assignment>>,
    started_at: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl TranscodeJob {
    #[must_use]
    pub fn new(spec: TranscodeSpec, source: Arc<Variant>, target: Arc<Variant>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            spec,
            source,
            target,
            state: Mutex::new(JobState::Pending),
            assignment: Mutex::new(None),
            started_at: Mutex::new(None),
            last_error: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Source variant the job reads from.
    #[must_use]
    pub fn source(&self) -> &Arc<Variant> {
        &self.source
    }

    /// Target variant the job feeds.
    #[must_use]
    pub fn target(&self) -> &Arc<Variant> {
        &self.target
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    #[must_use]
    pub fn assignment(&self) -> Option<Assignment> {
        self.assignment.lock().clone()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Cancellation token observed by the executor pumping this job.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Pending -> Dispatched, recording the placement.
    pub fn mark_dispatched(&self, assignment: Assignment) {
        *self.state.lock() = JobState::Dispatched;
        *self.assignment.lock() = Some(assignment);
    }

    /// Dispatched -> Running, stamping the start time.
    pub fn mark_running(&self) {
        *self.state.lock() = JobState::Running;
        *self.started_at.lock() = Some(Instant::now());
    }

    /// Terminal failure. Records the error; the scheduler decides whether
    /// the variant gets a replacement job.
    pub fn mark_failed(&self, error: impl Into<String>) {
        let error = error.into();
        *self.state.lock() = JobState::Failed;
        *self.last_error.lock() = Some(error);
        self.cancel.cancel();
    }

    /// Clean completion (variant closed or encoder finished at Stop).
    pub fn mark_completed(&self) {
        *self.state.lock() = JobState::Completed;
        self.cancel.cancel();
    }

    /// Returns the job to Pending for re-placement (worker reconnect).
    pub fn mark_pending(&self) {
        *self.state.lock() = JobState::Pending;
        *self.assignment.lock() = None;
    }

    /// Whether the job has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), JobState::Failed | JobState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Arc<TranscodeJob> {
        let spec = TranscodeSpec {
            channel_id: "ch1".to_string(),
            source: VariantKey::new("h264", "aac"),
            target: VariantKey::new("hevc", "aac"),
            hw_accel: None,
            video_bitrate: Some(3000),
            audio_bitrate: None,
        };
        let source = Arc::new(Variant::new(spec.source.clone(), 8, 8));
        let target = Arc::new(Variant::new(spec.target.clone(), 8, 8));
        TranscodeJob::new(spec, source, target)
    }

    #[test]
    fn lifecycle_transitions() {
        let job = job();
        assert_eq!(job.state(), JobState::Pending);
        job.mark_dispatched(Assignment::Worker("w1".to_string()));
        assert_eq!(job.state(), JobState::Dispatched);
        assert_eq!(job.assignment(), Some(Assignment::Worker("w1".to_string())));
        job.mark_running();
        assert_eq!(job.state(), JobState::Running);
        job.mark_failed("encoder exited");
        assert!(job.is_terminal());
        assert!(job.cancel_token().is_cancelled());
        assert_eq!(job.last_error().as_deref(), Some("encoder exited"));
    }

    #[test]
    fn requeue_clears_assignment() {
        let job = job();
        job.mark_dispatched(Assignment::Local);
        job.mark_pending();
        assert_eq!(job.state(), JobState::Pending);
        assert!(job.assignment().is_none());
    }
}
