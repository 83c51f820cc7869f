//! Broker session (C5): durable pub/sub connection with reconnect backoff.
//!
//! Grounded on the teacher's `sonos/retry.rs` `with_retry`/`RETRY_DELAYS_MS`
//! backoff idiom, generalized from a fixed 3-step SOAP retry into an
//! uncapped exponential 1s→5s reconnect loop, plus the original source's
//! `gprs_connection.py`-style durable-session semantics. Built on `rumqttc`,
//! the idiomatic async Rust equivalent of the original's `paho`-style MQTT
//! client: an event loop you poll, and a handle you publish through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};

use crate::config::BrokerConfig;
use crate::error::{RccError, RccResult};
use crate::events::{BrokerEvent, EventEmitter};
use crate::runtime::TaskSpawner;
use crate::utils::now_millis;

/// Handler invoked for every inbound message on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Contract for the broker session, independent of the underlying client.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connects (or reconnects) to the broker.
    async fn connect(&self) -> RccResult<()>;

    /// Serializes `payload` to a JSON byte body and publishes it. Callers
    /// pass a `serde_json::Value`, never pre-serialized bytes or strings.
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        qos: QoS,
        retain: bool,
    ) -> RccResult<()>;

    /// Registers a handler for inbound messages on `topic`. The subscribe
    /// set is re-established automatically on every reconnect.
    fn subscribe(&self, topic: String, handler: MessageHandler);

    /// Disconnects from the broker.
    async fn disconnect(&self);
}

/// `rumqttc`-backed broker session.
pub struct RumqttBrokerSession {
    client: AsyncClient,
    subscriptions: DashMap<String, MessageHandler>,
    event_emitter: Arc<dyn EventEmitter>,
    connected: Arc<AtomicBool>,
    backoff_min_ms: u64,
    backoff_max_ms: u64,
}

impl RumqttBrokerSession {
    /// Creates a session and spawns its event-loop poller.
    ///
    /// The returned session's `subscribe` calls take effect immediately if
    /// already connected, and are replayed on every future reconnect.
    pub fn new(
        config: &BrokerConfig,
        client_id: &str,
        event_emitter: Arc<dyn EventEmitter>,
        spawner: &dyn TaskSpawner,
    ) -> Arc<Self> {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, 64);

        let session = Arc::new(Self {
            client,
            subscriptions: DashMap::new(),
            event_emitter,
            connected: Arc::new(AtomicBool::new(false)),
            backoff_min_ms: config.reconnect_backoff_min_ms,
            backoff_max_ms: config.reconnect_backoff_max_ms,
        });

        session.clone().spawn_event_loop(event_loop, spawner);
        session
    }

    fn spawn_event_loop(self: Arc<Self>, mut event_loop: EventLoop, spawner: &dyn TaskSpawner) {
        let session = self;
        spawner.spawn(async move {
            let mut backoff_ms = session.backoff_min_ms;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff_ms = session.backoff_min_ms;
                        session.connected.store(true, Ordering::SeqCst);
                        session.event_emitter.emit_broker(BrokerEvent::Connected {
                            timestamp: now_millis(),
                        });
                        session.resubscribe_all();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(handler) = session.subscriptions.get(publish.topic.as_str()) {
                            handler(publish.topic.clone(), publish.payload.to_vec());
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if session.connected.swap(false, Ordering::SeqCst) {
                            session.event_emitter.emit_broker(BrokerEvent::Disconnected {
                                reason: e.to_string(),
                                timestamp: now_millis(),
                            });
                        }
                        log::warn!("[Broker] event loop error: {e}, retrying in {backoff_ms}ms");
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(session.backoff_max_ms);
                    }
                }
            }
        });
    }

    fn resubscribe_all(&self) {
        for entry in self.subscriptions.iter() {
            let topic = entry.key().clone();
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                    log::warn!("[Broker] resubscribe to {topic} failed: {e}");
                }
            });
        }
    }

    /// Returns whether the session currently believes it is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for RumqttBrokerSession {
    async fn connect(&self) -> RccResult<()> {
        // rumqttc connects lazily on the first poll; nothing to do eagerly
        // beyond the event loop already spawned in `new`.
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        qos: QoS,
        retain: bool,
    ) -> RccResult<()> {
        let body = serde_json::to_vec(&payload)?;
        self.client
            .publish(topic, qos, retain, body)
            .await
            .map_err(|e| RccError::Broker(e.to_string()))
    }

    fn subscribe(&self, topic: String, handler: MessageHandler) {
        self.subscriptions.insert(topic.clone(), handler);
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                log::warn!("[Broker] subscribe to {topic} failed: {e}");
            }
        });
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            log::warn!("[Broker] disconnect error: {e}");
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = 1_000u64;
        let max = 5_000u64;
        let mut seen = vec![backoff];
        for _ in 0..5 {
            backoff = (backoff * 2).min(max);
            seen.push(backoff);
        }
        assert_eq!(seen, vec![1000, 2000, 4000, 5000, 5000, 5000]);
    }

    #[tokio::test]
    async fn new_session_starts_disconnected() {
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..BrokerConfig::default()
        };
        let emitter = Arc::new(NoopEventEmitter);
        let spawner = crate::runtime::TokioSpawner::current();
        let session = RumqttBrokerSession::new(&config, "test-client", emitter, &spawner);
        assert!(!session.is_connected());
    }
}
