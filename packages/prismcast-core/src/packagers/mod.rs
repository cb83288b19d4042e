//! Format packagers: pure transformations from a variant's ring cursors to
//! output bytes.
//!
//! - [`mpegts`]: PAT/PMT/PES muxing for HLS-TS segments and continuous TS
//! - [`fmp4`]: init segments and moof/mdat fragments for HLS-fMP4 and DASH
//! - [`segmenter`]: keyframe-bounded segmentation shared by all segmented
//!   formats
//! - [`hls`] / [`dash`]: manifest emission
//! - [`continuous`]: the endless TS stream

pub mod continuous;
pub mod dash;
pub mod fmp4;
pub mod hls;
pub mod mpegts;
pub mod segmenter;

pub use continuous::continuous_ts;
pub use segmenter::{SegmentRecord, Segmenter};
