//! Bridge implementation that maps domain events to a broadcast channel.
//!
//! The [`BroadcastEventBridge`] lives at the boundary between domain services
//! and any observer of RCC behavior, mapping typed domain events onto a
//! `tokio::sync::broadcast` channel.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::{AlarmEvent, BrokerEvent, CallEvent, RccEvent, TelemetryEvent, VapEvent};

/// Bridges domain events to a broadcast channel.
///
/// This adapter implements [`EventEmitter`] by forwarding events to a
/// `tokio::sync::broadcast` channel that any subscriber can drain. An
/// optional external emitter can additionally be set after construction,
/// for embedding contexts that want to forward events elsewhere (e.g. a
/// desktop companion app paired over the broker).
///
/// # Thread Safety
///
/// The bridge is `Send + Sync` and can be shared across async tasks.
/// The external emitter uses `RwLock` to allow setting it after construction.
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<RccEvent>,
    external_emitter: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Creates a new bridge wrapping an existing broadcast sender.
    pub fn with_sender(tx: broadcast::Sender<RccEvent>) -> Self {
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets an external emitter that every event is additionally forwarded to.
    ///
    /// Can be called after construction, which is useful when the external
    /// target isn't available until later in startup.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.external_emitter.write() = Some(emitter);
    }

    /// Returns a new receiver for the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<RccEvent> {
        self.tx.subscribe()
    }

    /// Returns a reference to the broadcast sender.
    pub fn sender(&self) -> &broadcast::Sender<RccEvent> {
        &self.tx
    }
}

/// Generates an [`EventEmitter`] method that forwards to the external emitter
/// (if set) and then sends to the broadcast channel.
macro_rules! impl_emit {
    ($method:ident, $event_ty:ty, $variant:ident) => {
        fn $method(&self, event: $event_ty) {
            if let Some(ref emitter) = *self.external_emitter.read() {
                emitter.$method(event.clone());
            }
            if let Err(e) = self.tx.send(RccEvent::$variant(event)) {
                log::trace!("[EventBridge] No broadcast receivers: {}", e);
            }
        }
    };
}

impl EventEmitter for BroadcastEventBridge {
    impl_emit!(emit_call, CallEvent, Call);
    impl_emit!(emit_vap, VapEvent, Vap);
    impl_emit!(emit_broker, BrokerEvent, Broker);
    impl_emit!(emit_telemetry, TelemetryEvent, Telemetry);
    impl_emit!(emit_alarm, AlarmEvent, Alarm);
}
