//! Streaming relay core.
//!
//! A session-multiplexed, variant-keyed elementary-stream buffer: one
//! [`Session`] per channel fans a single origin ingress out to arbitrarily
//! many downstream readers, spawning transcode variants on demand. Format
//! packagers consume variants through independent cursors.

pub mod demux;
pub mod manager;
pub mod origin;
pub mod ring;
pub mod sample;
pub mod session;
pub mod variant;

pub use manager::{SessionHandle, SessionManager};
pub use ring::{ReadOutcome, RingBuffer};
pub use sample::{CodecTag, MediaType, Sample, SampleInput, CLOCK_HZ};
pub use session::{Session, VariantRequest};
pub use variant::{InitData, Variant, VariantKey, VariantReader};

use thiserror::Error;

/// Errors surfaced by the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Origin dial or read failed and no buffered data remains.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The variant entered its terminal error state.
    #[error("variant {0} errored")]
    VariantErrored(String),

    /// A read hit a closed ring before any data was produced.
    #[error("ring closed")]
    RingClosed,

    /// No worker or local executor advertises the required encoders.
    #[error("no capable executor: {0}")]
    CapabilityMissing(String),

    /// The origin byte stream could not be demuxed.
    #[error("demux failed: {0}")]
    Demux(String),
}
