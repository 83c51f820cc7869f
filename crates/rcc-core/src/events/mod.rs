//! Event system for observing RCC state transitions.
//!
//! This module provides:
//! - [`EventEmitter`] trait for components to emit domain events
//! - Event types for each domain (call, VAP, broker, telemetry, alarms)
//!
//! Nothing in this crate has an inbound HTTP/WS surface (see `DESIGN.md`), so
//! unlike the grounding library's broadcast-to-WebSocket bridge, this bridge
//! exists purely so tests and an embedding host can observe RCC behavior
//! without polling component state directly.

mod bridge;
mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Events emitted by the RCC, categorized by originating component.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum RccEvent {
    /// Events from the call coordinator / WebRTC peer (C7, C8).
    Call(CallEvent),

    /// Events from the voice activity pipeline (C4).
    Vap(VapEvent),

    /// Events from the broker session (C5).
    Broker(BrokerEvent),

    /// Events from telemetry publishers (C10).
    Telemetry(TelemetryEvent),

    /// Events from sensor alarms (C11).
    Alarm(AlarmEvent),
}

/// Events related to call/peer lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CallEvent {
    /// A call session was created (inbound offer or SOS initiation).
    Started {
        /// "callee" or "caller".
        role: &'static str,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// ICE connection state changed.
    IceStateChanged {
        /// New ICE connection state, e.g. "checking", "connected", "failed".
        state: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Call session torn down.
    Ended {
        /// Reason the call ended ("closed", "failed", "disconnected").
        reason: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Events related to the voice activity pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VapEvent {
    /// Endpointing detected the start of speech.
    SpeechStarted {
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// An utterance was finalized and queued for upload.
    UtteranceEmitted {
        /// Stream identifier the utterance was published under.
        #[serde(rename = "streamId")]
        stream_id: String,
        /// Duration of the utterance in seconds.
        #[serde(rename = "durationSecs")]
        duration_secs: f32,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Pipeline paused (microphone released) for an active call.
    Paused {
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Pipeline resumed after a call ended.
    Resumed {
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Events related to the broker session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BrokerEvent {
    /// Session established (initial connect or after reconnect).
    Connected {
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Session lost; the reconnect loop will retry with backoff.
    Disconnected {
        /// Human-readable reason.
        reason: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Events related to periodic telemetry publication.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TelemetryEvent {
    /// A GPS fix was published.
    GpsPublished {
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Segmentation endpoint reported an unsafe scene.
    SegmentationWarning {
        /// Name of the audio asset played back.
        #[serde(rename = "audioFile")]
        audio_file: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Events related to ToF sensor alarms.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AlarmEvent {
    /// An obstacle alert was raised and is within the rate limit.
    ObstacleDetected {
        /// Distance reading in centimeters that triggered the alert.
        #[serde(rename = "distanceCm")]
        distance_cm: f32,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

impl From<CallEvent> for RccEvent {
    fn from(event: CallEvent) -> Self {
        RccEvent::Call(event)
    }
}

impl From<VapEvent> for RccEvent {
    fn from(event: VapEvent) -> Self {
        RccEvent::Vap(event)
    }
}

impl From<BrokerEvent> for RccEvent {
    fn from(event: BrokerEvent) -> Self {
        RccEvent::Broker(event)
    }
}

impl From<TelemetryEvent> for RccEvent {
    fn from(event: TelemetryEvent) -> Self {
        RccEvent::Telemetry(event)
    }
}

impl From<AlarmEvent> for RccEvent {
    fn from(event: AlarmEvent) -> Self {
        RccEvent::Alarm(event)
    }
}
