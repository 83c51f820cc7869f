//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than a concrete
//! broadcast channel, which keeps them testable and swappable.

use super::{AlarmEvent, BrokerEvent, CallEvent, TelemetryEvent, VapEvent};

/// Trait for emitting domain events without knowledge of transport.
///
/// Every RCC component holds an `Arc<dyn EventEmitter>` rather than a
/// concrete channel, so tests can substitute a counting emitter and
/// `rcc-device` can substitute the real broadcast bridge.
pub trait EventEmitter: Send + Sync {
    /// Emits a call lifecycle event.
    fn emit_call(&self, event: CallEvent);

    /// Emits a voice activity pipeline event.
    fn emit_vap(&self, event: VapEvent);

    /// Emits a broker session event.
    fn emit_broker(&self, event: BrokerEvent);

    /// Emits a telemetry publication event.
    fn emit_telemetry(&self, event: TelemetryEvent);

    /// Emits a sensor alarm event.
    fn emit_alarm(&self, event: AlarmEvent);
}

/// No-op emitter for tests or embedding contexts with no observer attached.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_call(&self, _event: CallEvent) {}
    fn emit_vap(&self, _event: VapEvent) {}
    fn emit_broker(&self, _event: BrokerEvent) {}
    fn emit_telemetry(&self, _event: TelemetryEvent) {}
    fn emit_alarm(&self, _event: AlarmEvent) {}
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_call(&self, event: CallEvent) {
        tracing::debug!(?event, "call_event");
    }

    fn emit_vap(&self, event: VapEvent) {
        tracing::debug!(?event, "vap_event");
    }

    fn emit_broker(&self, event: BrokerEvent) {
        tracing::debug!(?event, "broker_event");
    }

    fn emit_telemetry(&self, event: TelemetryEvent) {
        tracing::debug!(?event, "telemetry_event");
    }

    fn emit_alarm(&self, event: AlarmEvent) {
        tracing::debug!(?event, "alarm_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Test emitter that counts events.
    struct CountingEventEmitter {
        call_count: AtomicUsize,
        alarm_count: AtomicUsize,
    }

    impl CountingEventEmitter {
        fn new() -> Self {
            Self {
                call_count: AtomicUsize::new(0),
                alarm_count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit_call(&self, _event: CallEvent) {
            self.call_count.fetch_add(1, Ordering::SeqCst);
        }

        fn emit_vap(&self, _event: VapEvent) {}
        fn emit_broker(&self, _event: BrokerEvent) {}
        fn emit_telemetry(&self, _event: TelemetryEvent) {}

        fn emit_alarm(&self, _event: AlarmEvent) {
            self.alarm_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter::new());

        emitter.emit_call(CallEvent::Started {
            role: "callee",
            timestamp: 0,
        });
        emitter.emit_call(CallEvent::Ended {
            reason: "closed".to_string(),
            timestamp: 0,
        });
        emitter.emit_alarm(AlarmEvent::ObstacleDetected {
            distance_cm: 42.0,
            timestamp: 0,
        });

        assert_eq!(emitter.call_count.load(Ordering::SeqCst), 2);
        assert_eq!(emitter.alarm_count.load(Ordering::SeqCst), 1);
    }
}
