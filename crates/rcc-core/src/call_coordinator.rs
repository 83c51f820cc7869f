//! Call Coordinator (C8): single critical-section owner of the shared
//! microphone/speaker/camera, driving call start/accept/teardown.
//!
//! Grounded on the original source's `webrtc_manager.py` coupling to the
//! voice pipeline and mqtt handlers, broken apart per the component design
//! note: the coordinator is an explicit mediator holding the peer and VAP,
//! rather than either reaching into the other directly. State transitions
//! are serialized behind a single async mutex, matching the "who owns the
//! mic" discipline described for resource arbitration.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::Mutex as AsyncMutex;

use crate::broker::BrokerClient;
use crate::config::Config;
use crate::error::{RccError, RccResult};
use crate::events::{BroadcastEventBridge, RccEvent};
use crate::runtime::TaskSpawner;
use crate::vap::VoiceActivityPipeline;
use crate::wire::{AnswerMessage, CandidateMessage, OfferMessage};
use crate::webrtc_peer::{PeerRole, WebRtcPeer};

/// Post-pause grace period before the WebRTC peer is allowed to touch the
/// microphone, giving VAP time to actually release the capture device.
const DEVICE_RELEASE_GRACE: Duration = Duration::from_millis(500);

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No call in progress; VAP owns the microphone.
    Idle,
    /// SDP/ICE negotiation underway; VAP has been asked to release.
    Negotiating,
    /// Media flowing.
    Active,
    /// Peer is being closed; VAP will be resumed once complete.
    TearingDown,
}

/// Arbitrates exclusive device ownership between VAP and the WebRTC peer,
/// and drives the call state machine.
pub struct CallCoordinator {
    state: AsyncMutex<CallState>,
    peer: Arc<WebRtcPeer>,
    vap: Arc<VoiceActivityPipeline>,
    broker: Arc<dyn BrokerClient>,
    topics: CallTopics,
    spawner: Arc<dyn TaskSpawner>,
}

/// Resolved topic strings the coordinator publishes to.
#[derive(Debug, Clone)]
pub struct CallTopics {
    /// Outbound `/webrtc/answer` topic.
    pub answer: String,
    /// Outbound `/webrtc/candidate` topic.
    pub candidate: String,
    /// Outbound `/webrtc/offer` topic, used for SOS initiation.
    pub offer: String,
}

impl CallTopics {
    /// Resolves topic templates from configuration.
    pub fn from_config(config: &Config) -> RccResult<Self> {
        let resolve = |key: &str| {
            config
                .resolve_topic(key)
                .ok_or_else(|| RccError::Configuration(format!("missing topic template: {key}")))
        };
        Ok(Self {
            answer: resolve("webrtc_answer")?,
            candidate: resolve("webrtc_candidate")?,
            offer: resolve("webrtc_offer")?,
        })
    }
}

impl CallCoordinator {
    /// Creates a coordinator and starts the background ICE-state watcher
    /// that drives `connected`/`failed`/`disconnected`/`closed` transitions.
    #[must_use]
    pub fn new(
        peer: Arc<WebRtcPeer>,
        vap: Arc<VoiceActivityPipeline>,
        broker: Arc<dyn BrokerClient>,
        topics: CallTopics,
        events: &BroadcastEventBridge,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            state: AsyncMutex::new(CallState::Idle),
            peer,
            vap,
            broker,
            topics,
            spawner: Arc::clone(&spawner),
        });
        coordinator.clone().watch_ice_state(events.subscribe());
        coordinator
    }

    /// Returns the current call state.
    pub async fn state(&self) -> CallState {
        *self.state.lock().await
    }

    fn watch_ice_state(self: Arc<Self>, mut receiver: tokio::sync::broadcast::Receiver<RccEvent>) {
        let coordinator = self;
        coordinator.spawner.clone().spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(RccEvent::Call(crate::events::CallEvent::IceStateChanged {
                        state,
                        ..
                    })) => {
                        coordinator.on_ice_state_changed(&state).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_ice_state_changed(&self, state: &str) {
        match state {
            "connected" | "completed" => {
                // Idempotent: no device reacquisition on repeated connects.
                let mut guard = self.state.lock().await;
                if *guard == CallState::Negotiating {
                    *guard = CallState::Active;
                }
            }
            "failed" | "disconnected" | "closed" => {
                self.teardown().await;
            }
            _ => {}
        }
    }

    /// Handles an inbound SDP offer: pauses VAP, initializes the peer as
    /// callee, answers, and publishes any candidates already available in
    /// the finalized local SDP, then the answer itself.
    pub async fn handle_inbound_offer(&self, offer: OfferMessage) {
        let mut guard = self.state.lock().await;
        if *guard != CallState::Idle {
            log::warn!("[CallCoordinator] rejecting offer: call already in progress ({guard:?})");
            return;
        }
        *guard = CallState::Negotiating;
        drop(guard);

        self.vap.pause();
        tokio::time::sleep(DEVICE_RELEASE_GRACE).await;

        if let Err(e) = self.peer.initialize(PeerRole::Callee).await {
            log::warn!("[CallCoordinator] peer init failed: {e}");
            self.teardown().await;
            return;
        }

        match self.peer.handle_offer(&offer).await {
            Ok((candidates, answer)) => {
                for candidate in candidates {
                    self.publish_candidate(&candidate).await;
                }
                self.publish_answer(&answer).await;
                let mut guard = self.state.lock().await;
                if *guard == CallState::Negotiating {
                    *guard = CallState::Active;
                }
            }
            Err(e) => {
                log::warn!("[CallCoordinator] offer handling failed: {e}");
                self.teardown().await;
            }
        }
    }

    /// Handles an inbound SDP answer, completing a caller-initiated (SOS)
    /// call. Discarded if no call is being negotiated.
    pub async fn handle_inbound_answer(&self, answer: AnswerMessage) {
        let guard = self.state.lock().await;
        if *guard != CallState::Negotiating {
            log::warn!("[CallCoordinator] discarding answer: not negotiating ({guard:?})");
            return;
        }
        drop(guard);

        if let Err(e) = self.peer.handle_answer(&answer).await {
            log::warn!("[CallCoordinator] answer handling failed: {e}");
            self.teardown().await;
        }
    }

    /// Handles an inbound trickled ICE candidate. The peer buffers it
    /// internally if the remote description isn't set yet, so this is
    /// dispatched regardless of coordinator state.
    pub async fn handle_inbound_candidate(&self, candidate: CandidateMessage) {
        if let Err(e) = self.peer.handle_candidate(candidate).await {
            log::warn!("[CallCoordinator] candidate handling failed: {e}");
        }
    }

    /// Initiates an SOS call: pauses VAP, creates a peer as caller, and
    /// publishes the resulting offer. Rejected if a call is already
    /// underway.
    pub async fn initiate_sos(&self) -> RccResult<()> {
        let mut guard = self.state.lock().await;
        if *guard != CallState::Idle {
            return Err(RccError::InvalidState(format!(
                "cannot initiate SOS call while {guard:?}"
            )));
        }
        *guard = CallState::Negotiating;
        drop(guard);

        self.vap.pause();
        tokio::time::sleep(DEVICE_RELEASE_GRACE).await;

        if let Err(e) = self.peer.initialize(PeerRole::Caller).await {
            self.teardown().await;
            return Err(e);
        }

        match self.peer.create_offer().await {
            Ok(offer) => {
                self.publish_offer(&offer).await;
                Ok(())
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Tears down the active call: closes the peer and resumes VAP. Safe
    /// to call from any state; idempotent.
    pub async fn teardown(&self) {
        let mut guard = self.state.lock().await;
        if *guard == CallState::Idle {
            return;
        }
        *guard = CallState::TearingDown;
        drop(guard);

        self.peer.close().await;
        self.vap.resume(self.spawner.as_ref());

        *self.state.lock().await = CallState::Idle;
    }

    async fn publish_answer(&self, answer: &AnswerMessage) {
        self.publish(&self.topics.answer, answer).await;
    }

    async fn publish_offer(&self, offer: &OfferMessage) {
        self.publish(&self.topics.offer, offer).await;
    }

    async fn publish_candidate(&self, candidate: &CandidateMessage) {
        self.publish(&self.topics.candidate, candidate).await;
    }

    async fn publish<T: serde::Serialize>(&self, topic: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => {
                if let Err(e) = self.broker.publish(topic, value, QoS::AtLeastOnce, false).await {
                    log::warn!("[CallCoordinator] publish to {topic} failed: {e}");
                }
            }
            Err(e) => log::warn!("[CallCoordinator] failed to serialize payload for {topic}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_states_are_distinct() {
        assert_ne!(CallState::Idle, CallState::Active);
        assert_ne!(CallState::Negotiating, CallState::TearingDown);
    }
}
