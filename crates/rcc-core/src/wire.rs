//! Wire payload types exchanged with the broker.
//!
//! One struct per message shape named in the external interfaces, following
//! the teacher's serde-struct-per-message idiom: `#[serde(rename_all =
//! "camelCase")]` by default, explicit `#[serde(rename = "...")]` only where
//! the wire name isn't camelCase-derivable.

use serde::{Deserialize, Serialize};

/// Inbound or outbound WebRTC SDP offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferMessage {
    /// Always `"offer"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The SDP offer body.
    pub sdp: String,
    /// Identifier of the caller, present on inbound SOS offers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    /// Whether this offer represents an emergency (SOS-initiated) call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_emergency: Option<bool>,
}

impl OfferMessage {
    /// Builds an outbound offer for an SOS-initiated call.
    #[must_use]
    pub fn emergency(sdp: String) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp,
            caller_id: None,
            is_emergency: Some(true),
        }
    }
}

/// Inbound or outbound WebRTC SDP answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMessage {
    /// Always `"answer"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The SDP answer body.
    pub sdp: String,
}

impl AnswerMessage {
    /// Builds an outbound answer.
    #[must_use]
    pub fn new(sdp: String) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp,
        }
    }
}

/// Inbound or outbound trickled ICE candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMessage {
    /// The ICE candidate SDP line, including the `candidate:` prefix.
    pub candidate: String,
    /// Media stream identification tag the candidate belongs to.
    pub sdp_mid: String,
    /// Index of the `m=` section the candidate belongs to.
    pub sdp_m_line_index: u16,
}

/// Outbound speech-to-text audio chunk (device → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SttChunkMessage {
    /// Identifier of the publishing device.
    pub device_id: String,
    /// Identifier grouping all chunks of one utterance.
    pub stream_id: String,
    /// Zero-based index of this chunk within the stream.
    pub chunk_index: u32,
    /// Total number of chunks in the stream.
    pub total_chunks: u32,
    /// Whether this is the final chunk of the stream.
    pub is_last: bool,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Always `"pcm16le"`.
    pub format: String,
    /// Sample rate of the encoded PCM, in Hz.
    pub sample_rate: u32,
    /// Base64-encoded PCM payload.
    pub data: String,
}

/// Inbound playback audio chunk (server → device).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkMessage {
    /// Identifier grouping all chunks of one reassembly stream.
    pub server_stream_id: String,
    /// Zero-based index of this chunk within the stream.
    pub chunk_index: u32,
    /// Total number of chunks in the stream.
    pub total_chunks: u32,
    /// Whether this is the final chunk of the stream.
    pub is_last: bool,
    /// PCM sample format identifier.
    pub format: String,
    /// Sample rate of the encoded PCM, in Hz.
    pub sample_rate: u32,
    /// Base64-encoded PCM payload.
    pub data: String,
}

/// Outbound GPS fix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GpsMessage {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Ground speed in kilometers per hour.
    pub speed_kmh: f64,
    /// Battery level indicator (device-specific units/scale).
    pub pin: i32,
}

/// Outbound obstacle detection event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObstacleMessage {
    /// Identifier of the publishing device.
    pub device_id: String,
    /// Unix timestamp in milliseconds.
    pub ts: u64,
    /// Measured distance to the obstacle.
    pub distance: f32,
    /// Always `"m"`.
    pub unit: String,
    /// Classification label for the detected obstacle, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Objects the detect endpoint reported within the snapshot.
    #[serde(default)]
    pub detected_objects: Vec<String>,
    /// Severity label assigned to this alert.
    pub severity: String,
}

/// Inbound command message (extensible; only `send_sms` is interpreted today).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    /// The command name, e.g. `"send_sms"`.
    pub command: String,
    /// Recipient phone number. Snake-case on the wire, matching the
    /// original implementation's actual field name rather than its
    /// (inaccurate) docstring.
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Message body.
    #[serde(default)]
    pub message: Option<String>,
}

/// Response envelope returned by the segmentation and object-detect HTTP
/// endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpResponseEnvelope<T> {
    /// Whether the call succeeded, if the endpoint reports it explicitly.
    #[serde(default)]
    pub success: Option<bool>,
    /// The endpoint-specific payload.
    pub data: T,
}

/// Payload returned by `POST <base>/segment`.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentationData {
    /// Whether the scene was judged safe.
    pub is_safe: bool,
    /// Name of the warning audio asset to play when unsafe.
    #[serde(default)]
    pub audio_file: Option<String>,
}

/// Payload returned by `POST <base>/detect`.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectData {
    /// Labels of objects detected in the snapshot.
    #[serde(default)]
    pub detected_objects: Vec<String>,
    /// Name of the warning audio asset to play.
    #[serde(default)]
    pub audio_file: Option<String>,
}

/// TURN/STUN ICE server credential, as returned by the credential endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IceServerCredential {
    /// STUN/TURN URLs for this server entry.
    pub urls: Vec<String>,
    /// TURN username, if this is a TURN entry.
    #[serde(default)]
    pub username: Option<String>,
    /// TURN credential, if this is a TURN entry.
    #[serde(default)]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_message_round_trips() {
        let msg = OfferMessage::emergency("v=0...".to_string());
        let json = serde_json::to_string(&msg).unwrap();
        let back: OfferMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "offer");
        assert_eq!(back.is_emergency, Some(true));
    }

    #[test]
    fn candidate_message_uses_camel_case_fields() {
        let msg = CandidateMessage {
            candidate: "candidate:1 1 UDP 2122260223 192.168.1.5 54321 typ host".to_string(),
            sdp_mid: "0".to_string(),
            sdp_m_line_index: 0,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("sdpMid").is_some());
        assert!(json.get("sdpMLineIndex").is_some());
    }

    #[test]
    fn command_message_uses_snake_case_phone_number() {
        let json = r#"{"command":"send_sms","phone_number":"+15551234567","message":"help"}"#;
        let msg: CommandMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.phone_number.as_deref(), Some("+15551234567"));
    }
}
