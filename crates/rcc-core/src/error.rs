//! Centralized error types for the RCC.
//!
//! This module provides a unified error type used across every component.
//! There is no inbound HTTP surface on this crate (see `DESIGN.md`), so
//! unlike an API server this type has no `IntoResponse` impl — it exists to
//! give callers a stable `code()` for logging/telemetry and a place for
//! component-local error enums to convert into.

use thiserror::Error;

/// Trait for error types that provide a machine-readable error code.
///
/// Implemented by component-local error enums so their codes flow through
/// into [`RccError`]'s own `code()` uniformly.
pub trait ErrorCode {
    /// Returns a machine-readable error code, stable across releases.
    fn code(&self) -> &'static str;
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum RccError {
    /// Broker session failed to connect, publish, or subscribe.
    #[error("broker error: {0}")]
    Broker(String),

    /// WebRTC peer failed during SDP/ICE negotiation or media setup.
    #[error("webrtc error: {0}")]
    WebRtc(String),

    /// Audio device (capture or playback) could not be opened or used.
    #[error("audio device error: {0}")]
    AudioDevice(String),

    /// Camera device could not be opened or read.
    #[error("camera error: {0}")]
    Camera(String),

    /// GPS serial port could not be opened or read.
    #[error("gps error: {0}")]
    Gps(String),

    /// An HTTP call to an external collaborator (TURN, segmentation, detect) failed.
    #[error("http error: {0}")]
    Http(String),

    /// Malformed or unexpected wire payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Requested call/stream/device state transition is not permitted.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A value read from the configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unrecoverable startup error.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl RccError {
    /// Returns a machine-readable error code for logging/telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Broker(_) => "broker_error",
            Self::WebRtc(_) => "webrtc_error",
            Self::AudioDevice(_) => "audio_device_error",
            Self::Camera(_) => "camera_error",
            Self::Gps(_) => "gps_error",
            Self::Http(_) => "http_error",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::InvalidState(_) => "invalid_state",
            Self::Configuration(_) => "configuration_error",
            Self::Fatal(_) => "fatal_error",
        }
    }
}

impl ErrorCode for RccError {
    fn code(&self) -> &'static str {
        RccError::code(self)
    }
}

/// Convenient Result alias for crate-wide operations.
pub type RccResult<T> = Result<T, RccError>;

impl From<reqwest::Error> for RccError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<serde_json::Error> for RccError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

impl From<std::io::Error> for RccError {
    fn from(err: std::io::Error) -> Self {
        Self::Fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_error_has_correct_code() {
        let err = RccError::InvalidState("call already active".into());
        assert_eq!(err.code(), "invalid_state");
    }

    #[test]
    fn broker_error_has_correct_code() {
        let err = RccError::Broker("connection refused".into());
        assert_eq!(err.code(), "broker_error");
    }
}
