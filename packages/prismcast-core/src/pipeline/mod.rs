//! Playlist/guide generation pipeline.
//!
//! An ordered stage runner: ingestion guard, channel and program loading,
//! declarative mapping and filtering, numbering, logo caching, streamed
//! artifact generation, and atomic publish. Runs for the same proxy are
//! serialized; stage failure leaves previously published outputs
//! untouched.

pub mod filtering;
pub mod guard;
pub mod logos;
pub mod mapping;
pub mod model;
pub mod numbering;
pub mod output;
pub mod run;

pub use logos::LogoCache;
pub use model::{
    Assignment, Channel, ChannelSource, Field, FilterKind, FilterRule, IngestionTracker,
    MappingRule, MatchOp, NoopIngestionTracker, NumberingMode, Predicate, ProgramSource,
    Programme, Proxy,
};
pub use run::{GenerationPipeline, GenerationRun, RunStatus};

use thiserror::Error;

/// Errors terminating a generation run.
#[derive(Debug, Error)]
pub enum StageError {
    /// Ingestion jobs touching the proxy's sources did not settle in time.
    #[error("ingestion guard timed out: {0}")]
    GuardTimeout(String),

    /// A channel or program source failed.
    #[error("source failed: {0}")]
    Source(String),

    /// Filesystem trouble while writing temp artifacts.
    #[error("artifact I/O failed: {0}")]
    Io(String),

    /// The atomic publish could not complete; prior outputs remain.
    #[error("publish failed: {0}")]
    Publish(String),

    /// A stage exceeded its configured timeout.
    #[error("stage {0} timed out")]
    Timeout(String),

    /// The run was cancelled; no artifacts were mutated.
    #[error("generation cancelled")]
    Cancelled,
}

impl StageError {
    /// Stage name recorded on the run and surfaced in API errors.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        match self {
            Self::GuardTimeout(_) => "ingestion_guard",
            Self::Source(_) => "load",
            Self::Io(_) => "generate",
            Self::Publish(_) => "publish",
            Self::Timeout(stage) => stage,
            Self::Cancelled => "cancelled",
        }
    }
}
