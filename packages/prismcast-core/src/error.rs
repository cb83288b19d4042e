//! Centralized error types for the Prismcast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::control::ControlError;
use crate::pipeline::StageError;
use crate::relay::RelayError;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for RelayError {
    fn code(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::VariantErrored(_) => "variant_errored",
            Self::RingClosed => "ring_closed",
            Self::CapabilityMissing(_) => "capability_missing",
            Self::Demux(_) => "demux_failed",
        }
    }
}

impl ErrorCode for ControlError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "control_io_failed",
            Self::Decode(_) => "control_decode_failed",
            Self::AuthRejected => "auth_rejected",
            Self::VersionRejected(_) => "version_rejected",
            Self::UnexpectedFrame(_) => "unexpected_frame",
            Self::StreamClosed => "stream_closed",
        }
    }
}

impl ErrorCode for StageError {
    fn code(&self) -> &'static str {
        match self {
            Self::GuardTimeout(_) => "ingestion_guard_timeout",
            Self::Source(_) => "stage_source_failed",
            Self::Io(_) => "stage_io_failed",
            Self::Publish(_) => "publish_failed",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "stage_timeout",
        }
    }
}

/// Application-wide error type for the Prismcast coordinator.
#[derive(Debug, Error)]
pub enum PrismError {
    /// Requested channel has no configured origin.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Requested proxy does not exist or has no published artifacts.
    #[error("Proxy not found: {0}")]
    ProxyNotFound(String),

    /// Requested segment index is outside the retained window.
    #[error("Segment not found: {0}")]
    SegmentNotFound(u64),

    /// Origin dial or read failed and the retained buffer is exhausted.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// No worker or local executor can fulfil the requested codec pair.
    #[error("No capable executor for {0}")]
    CapabilityMissing(String),

    /// The variant entered its terminal error state.
    #[error("Variant errored: {0}")]
    VariantErrored(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A generation run failed; the failing stage is recorded on the run.
    #[error("Generation failed in stage {stage}: {message}")]
    StageFailed { stage: String, message: String },

    /// A generation run for the same proxy is already in flight.
    #[error("Generation already running for proxy {0}")]
    GenerationBusy(String),

    /// Operation was cancelled; no artifacts were mutated.
    #[error("Cancelled")]
    Cancelled,

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PrismError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChannelNotFound(_) => "channel_not_found",
            Self::ProxyNotFound(_) => "proxy_not_found",
            Self::SegmentNotFound(_) => "segment_not_found",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::CapabilityMissing(_) => "capability_missing",
            Self::VariantErrored(_) => "variant_errored",
            Self::InvalidRequest(_) => "invalid_request",
            Self::StageFailed { .. } => "stage_failed",
            Self::GenerationBusy(_) => "generation_busy",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ChannelNotFound(_) | Self::ProxyNotFound(_) | Self::SegmentNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::CapabilityMissing(_) | Self::UpstreamUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::GenerationBusy(_) => StatusCode::CONFLICT,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type PrismResult<T> = Result<T, PrismError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for PrismError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RelayError> for PrismError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::UpstreamUnavailable(msg) => Self::UpstreamUnavailable(msg),
            RelayError::VariantErrored(msg) => Self::VariantErrored(msg),
            RelayError::CapabilityMissing(msg) => Self::CapabilityMissing(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StageError> for PrismError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Cancelled => Self::Cancelled,
            other => Self::StageFailed {
                stage: other.stage_name().to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_missing_maps_to_service_unavailable() {
        let err = PrismError::CapabilityMissing("hevc/aac".into());
        assert_eq!(err.code(), "capability_missing");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn segment_not_found_maps_to_404() {
        let err = PrismError::SegmentNotFound(42);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
