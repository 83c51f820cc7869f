//! Signaling Router (C6): dispatches inbound broker messages by topic
//! suffix onto a worker pool independent of the broker I/O loop.
//!
//! Grounded on the original source's `handlers.py` `handle_message`/
//! `_run_async_*_handler` thread-per-message dispatch, reimplemented as
//! `tokio::spawn` tasks off the broker's event-loop poll — the same
//! "don't block the I/O loop" discipline, with the concurrency primitive
//! swapped for the idiomatic Rust one.

use std::sync::Arc;

use crate::broker::BrokerClient;
use crate::call_coordinator::CallCoordinator;
use crate::reassembly::ReassemblyStore;
use crate::runtime::TaskSpawner;
use crate::wire::{AnswerMessage, CandidateMessage, CommandMessage, OfferMessage};

/// Suffixes the router matches against the end of an inbound topic.
mod suffix {
    pub const AUDIO: &str = "/audio";
    pub const COMMAND: &str = "/command";
    pub const WEBRTC_OFFER: &str = "webrtc/offer";
    pub const WEBRTC_ANSWER: &str = "webrtc/answer";
    pub const WEBRTC_CANDIDATE: &str = "webrtc/candidate";
}

/// Handles `command` messages. Extensible: only `send_sms` is interpreted
/// today, matching the original source's coverage.
pub trait CommandHandler: Send + Sync {
    /// Handles a parsed command message.
    fn handle(&self, command: CommandMessage);
}

/// No-op command handler for configurations that don't wire one in.
pub struct NoopCommandHandler;

impl CommandHandler for NoopCommandHandler {
    fn handle(&self, command: CommandMessage) {
        log::debug!("[Signaling] command received with no handler installed: {}", command.command);
    }
}

/// Routes inbound broker payloads to the appropriate component.
pub struct SignalingRouter {
    coordinator: Arc<CallCoordinator>,
    reassembly: Arc<ReassemblyStore>,
    command_handler: Arc<dyn CommandHandler>,
    spawner: Arc<dyn TaskSpawner>,
}

impl SignalingRouter {
    /// Creates a router bound to its collaborators.
    #[must_use]
    pub fn new(
        coordinator: Arc<CallCoordinator>,
        reassembly: Arc<ReassemblyStore>,
        command_handler: Arc<dyn CommandHandler>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Self {
        Self {
            coordinator,
            reassembly,
            command_handler,
            spawner,
        }
    }

    /// Routes one inbound message, spawning its handling onto the worker
    /// pool so long-running setup (SDP negotiation) never blocks the
    /// broker's I/O loop.
    pub fn route(&self, topic: &str, payload: Vec<u8>) {
        if topic.ends_with(suffix::WEBRTC_OFFER) {
            self.route_offer(payload);
        } else if topic.ends_with(suffix::WEBRTC_ANSWER) {
            self.route_answer(payload);
        } else if topic.ends_with(suffix::WEBRTC_CANDIDATE) {
            self.route_candidate(payload);
        } else if topic.ends_with(suffix::COMMAND) {
            self.route_command(payload);
        } else if topic.ends_with(suffix::AUDIO) {
            self.route_audio(payload);
        } else {
            log::debug!("[Signaling] no route for topic {topic}");
        }
    }

    fn route_offer(&self, payload: Vec<u8>) {
        let coordinator = Arc::clone(&self.coordinator);
        self.spawner.spawn(async move {
            match serde_json::from_slice::<OfferMessage>(&payload) {
                Ok(offer) => coordinator.handle_inbound_offer(offer).await,
                Err(e) => log::warn!("[Signaling] malformed offer: {e}"),
            }
        });
    }

    fn route_answer(&self, payload: Vec<u8>) {
        let coordinator = Arc::clone(&self.coordinator);
        self.spawner.spawn(async move {
            match serde_json::from_slice::<AnswerMessage>(&payload) {
                Ok(answer) => coordinator.handle_inbound_answer(answer).await,
                Err(e) => log::warn!("[Signaling] malformed answer: {e}"),
            }
        });
    }

    fn route_candidate(&self, payload: Vec<u8>) {
        let coordinator = Arc::clone(&self.coordinator);
        self.spawner.spawn(async move {
            match serde_json::from_slice::<CandidateMessage>(&payload) {
                Ok(candidate) => coordinator.handle_inbound_candidate(candidate).await,
                Err(e) => log::warn!("[Signaling] malformed candidate: {e}"),
            }
        });
    }

    fn route_command(&self, payload: Vec<u8>) {
        let handler = Arc::clone(&self.command_handler);
        self.spawner.spawn(async move {
            match serde_json::from_slice::<CommandMessage>(&payload) {
                Ok(command) => handler.handle(command),
                Err(e) => log::warn!("[Signaling] malformed command: {e}"),
            }
        });
    }

    fn route_audio(&self, payload: Vec<u8>) {
        let reassembly = Arc::clone(&self.reassembly);
        self.spawner.spawn(async move {
            if let Err(e) = reassembly.handle_chunk_bytes(&payload).await {
                log::warn!("[Signaling] malformed audio chunk: {e}");
            }
        });
    }
}

/// Dials a [`BrokerClient`] subscription into a [`SignalingRouter`]: every
/// inbound message on any subscribed topic is routed by suffix.
pub fn wire_broker_to_router(broker: &dyn BrokerClient, topics: &[String], router: Arc<SignalingRouter>) {
    for topic in topics {
        let router = Arc::clone(&router);
        let topic_owned = topic.clone();
        broker.subscribe(
            topic.clone(),
            Arc::new(move |received_topic, payload| {
                debug_assert_eq!(received_topic, topic_owned);
                router.route(&received_topic, payload);
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_matching_identifies_offer_topic() {
        assert!("device/abc/webrtc/offer".ends_with(suffix::WEBRTC_OFFER));
        assert!(!"device/abc/webrtc/answer".ends_with(suffix::WEBRTC_OFFER));
    }

    #[test]
    fn suffix_matching_identifies_audio_topic() {
        assert!("device/abc/audio".ends_with(suffix::AUDIO));
    }

    #[test]
    fn suffix_matching_identifies_command_topic() {
        assert!("device/abc/command".ends_with(suffix::COMMAND));
    }
}
