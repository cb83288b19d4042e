//! Control plane between the coordinator and remote transcode workers.
//!
//! Three logical operations over length-prefixed protobuf frames:
//! Register, Heartbeat, and the per-job bidirectional Transcode stream.
//! The worker dials the coordinator and keeps one control connection for
//! Register/Heartbeat; each assigned job gets its own connection that the
//! worker opens back to the coordinator.

pub mod client;
pub mod framing;
pub mod proto;
pub mod server;

pub use client::{StatsSource, WorkerClient, WorkerClientConfig};
pub use framing::FramedConn;
pub use server::ControlServer;

use thiserror::Error;

/// Errors surfaced by the control plane.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control stream I/O failed: {0}")]
    Io(std::io::Error),

    #[error("frame decode failed: {0}")]
    Decode(prost::DecodeError),

    #[error("registration rejected: bad auth token")]
    AuthRejected,

    #[error("registration rejected: unsupported version {0}")]
    VersionRejected(String),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("control stream closed")]
    StreamClosed,
}
