//! Prismcast Core - shared library for the Prismcast IPTV platform.
//!
//! This crate provides the core functionality for Prismcast, an IPTV
//! aggregation and relay platform. It is consumed by the coordinator
//! server and the transcode worker daemon.
//!
//! # Architecture
//!
//! - [`relay`]: session-multiplexed elementary-stream relay (ring
//!   buffers, variants, sessions, origin ingest)
//! - [`transcode`]: job scheduling, the local ffmpeg executor, and the
//!   worker registry
//! - [`control`]: the coordinator/worker control plane (length-prefixed
//!   protobuf frames over TCP)
//! - [`packagers`]: HLS-TS, HLS-fMP4, DASH and continuous-TS packaging
//! - [`pipeline`]: playlist/guide generation with atomic publish
//! - [`api`]: the axum HTTP surface
//! - [`error`]: centralized error types
//!
//! # Abstraction seams
//!
//! Collaborators the core does not own are traits with injected
//! implementations: [`relay::manager::OriginResolver`],
//! [`pipeline::ChannelSource`], [`pipeline::ProgramSource`],
//! [`pipeline::IngestionTracker`], [`api::ProxyStore`], and
//! [`control::StatsSource`].

#![warn(clippy::all)]

pub mod api;
pub mod control;
pub mod error;
pub mod packagers;
pub mod pipeline;
pub mod relay;
pub mod state;
pub mod transcode;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{router, start_server, AppState, ProxyStore};
pub use control::{ControlServer, WorkerClient, WorkerClientConfig};
pub use error::{ErrorCode, PrismError, PrismResult};
pub use relay::{CodecTag, MediaType, Sample, SessionManager, VariantKey};
pub use state::{Config, CoordinatorConfig, PipelineConfig, RelayConfig};
pub use transcode::{LocalExecutor, Scheduler, WorkerRegistry};
pub use utils::now_millis;
