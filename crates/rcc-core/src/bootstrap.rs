//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! components (C1-C11) are instantiated and wired together in dependency
//! order. This pattern provides:
//!
//! - **Clarity**: All dependency relationships are visible in one place
//! - **Testability**: Easy to swap implementations for testing
//! - **Maintainability**: Component creation logic is isolated from usage

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::alarms::{AlarmThresholds, SensorAlarms, TofSensor};
use crate::assets::WavAssetLibrary;
use crate::audio_io::{AssetLibrary, AudioEngine};
use crate::broker::{BrokerClient, RumqttBrokerSession};
use crate::call_coordinator::{CallCoordinator, CallTopics};
use crate::camera::{CameraDevice, CameraSource};
use crate::config::Config;
use crate::error::{RccError, RccResult};
use crate::events::{BroadcastEventBridge, EventEmitter};
use crate::reassembly::ReassemblyStore;
use crate::registry::DeviceRegistry;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::signaling::{wire_broker_to_router, CommandHandler, NoopCommandHandler, SignalingRouter};
use crate::telemetry::{GpsPublisher, SegmentationPublisher};
use crate::vap::VoiceActivityPipeline;
use crate::webrtc_peer::{IceServerCache, WebRtcPeer};

/// Hardware collaborators the composition root cannot construct itself:
/// concrete device backends are platform-specific and supplied by the
/// embedding binary (`rcc-device`'s `main.rs` constructs the real ones;
/// tests substitute fakes).
pub struct HardwareDeps {
    /// Microphone/speaker backend (C2).
    pub audio: Arc<dyn AudioEngine>,
    /// Camera capture backend (C3).
    pub camera: Arc<dyn CameraDevice>,
    /// Time-of-flight distance sensors (C11). Empty disables obstacle alerts.
    pub tof_sensors: Vec<Arc<dyn TofSensor>>,
    /// Warning/prompt asset resolver (C10/C11).
    pub assets: Arc<dyn AssetLibrary>,
    /// Inbound command handler (extensible; `send_sms` today).
    pub command_handler: Arc<dyn CommandHandler>,
}

impl HardwareDeps {
    /// Builds the standard hardware stack: `cpal` audio, `nokhwa` camera,
    /// a filesystem-backed asset library, no ToF sensors (none configured
    /// by default), and the no-op command handler.
    #[must_use]
    pub fn standard(assets_dir: PathBuf) -> Self {
        Self {
            audio: Arc::new(crate::cpal_audio::CpalAudioEngine::new()),
            camera: Arc::new(crate::nokhwa_camera::NokhwaCameraDevice::new()),
            tof_sensors: Vec::new(),
            assets: Arc::new(WavAssetLibrary::new(assets_dir)),
            command_handler: Arc::new(NoopCommandHandler),
        }
    }
}

/// Container for all bootstrapped components (C1-C11).
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Process-wide device handle registry (C1).
    pub registry: Arc<DeviceRegistry>,
    /// Broker session (C5).
    pub broker: Arc<dyn BrokerClient>,
    /// Event bridge observers can subscribe to.
    pub event_bridge: Arc<BroadcastEventBridge>,
    /// Voice activity pipeline (C4).
    pub vap: Arc<VoiceActivityPipeline>,
    /// Camera capture (C3).
    pub camera: Arc<CameraSource>,
    /// WebRTC peer (C7).
    pub peer: Arc<WebRtcPeer>,
    /// Call coordinator (C8).
    pub call_coordinator: Arc<CallCoordinator>,
    /// Signaling router (C6).
    pub signaling: Arc<SignalingRouter>,
    /// Reassembly store for inbound playback audio (C9).
    pub reassembly: Arc<ReassemblyStore>,
    /// GPS telemetry publisher (C10).
    pub gps: Arc<GpsPublisher>,
    /// Scene segmentation publisher (C10).
    pub segmentation: Arc<SegmentationPublisher>,
    /// Sensor alarms (C11).
    pub alarms: Arc<SensorAlarms>,
    /// Task spawner shared by every background loop.
    pub spawner: Arc<dyn TaskSpawner>,
}

impl BootstrappedServices {
    /// Initiates graceful shutdown in reverse dependency order: stop VAP
    /// (releases the microphone) -> close the WebRTC peer -> stop the
    /// camera -> disconnect the broker. Each step is idempotent.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");

        self.vap.pause();
        self.gps.stop();
        self.segmentation.stop();
        self.alarms.stop();
        self.reassembly.stop();

        let close = self.peer.close();
        if tokio::time::timeout(Duration::from_secs(2), close)
            .await
            .is_err()
        {
            log::warn!("[Bootstrap] peer close timed out during shutdown");
        }

        self.camera.stop();
        self.broker.disconnect().await;

        log::info!("[Bootstrap] Shutdown complete");
    }
}

fn create_http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to create HTTP client")
}

/// Bootstraps all RCC components with their dependencies.
///
/// This is the composition root where every component is instantiated and
/// wired together. The wiring order matters - components are created in
/// dependency order:
///
/// 1. Device registry (C1) and shared infrastructure (HTTP client, event bridge, spawner)
/// 2. Broker session (C5), depends on nothing but config
/// 3. Camera (C3) and voice activity pipeline (C4), depend on hardware + broker
/// 4. WebRTC peer (C7), depends on the ICE server cache and event bridge
/// 5. Call coordinator (C8), depends on the peer, VAP, and broker
/// 6. Reassembly store (C9), depends on nothing but playback plumbing
/// 7. Signaling router (C6), depends on the call coordinator and reassembly store
/// 8. Telemetry publishers (C10) and sensor alarms (C11), depend on camera/broker/assets
///
/// # Errors
///
/// Returns an error if configuration is invalid or a topic template is missing.
pub fn bootstrap_services(
    config: &Config,
    hardware: HardwareDeps,
) -> RccResult<BootstrappedServices> {
    config
        .validate()
        .map_err(RccError::Configuration)?;

    let registry = Arc::new(DeviceRegistry::new());
    let http_client = create_http_client();
    let event_bridge = Arc::new(BroadcastEventBridge::new(256));
    let spawner: Arc<dyn TaskSpawner> = Arc::new(TokioSpawner::current());
    let emitter: Arc<dyn EventEmitter> = Arc::clone(&event_bridge) as Arc<dyn EventEmitter>;

    let broker: Arc<dyn BrokerClient> = RumqttBrokerSession::new(
        &config.broker,
        &config.device_id,
        Arc::clone(&emitter),
        spawner.as_ref(),
    );
    registry.register("broker", Arc::clone(&broker));

    let camera = Arc::new(CameraSource::new(
        Arc::clone(&hardware.camera),
        config.camera_index.unwrap_or(0),
    ));
    if config.camera_index.is_some() {
        camera.start(spawner.as_ref());
    }
    registry.register("camera", Arc::clone(&camera));
    registry.register("audio", Arc::clone(&hardware.audio));

    let vap = Arc::new(VoiceActivityPipeline::new(
        Arc::clone(&hardware.audio),
        Arc::clone(&broker),
        Arc::clone(&emitter),
        config,
    ));
    vap.resume(spawner.as_ref());

    let ice_servers = Arc::new(IceServerCache::new(
        http_client.clone(),
        format!("{}/ice-servers", config.server_http_base),
        config.turn_api_key.clone(),
    ));
    let peer = Arc::new(WebRtcPeer::new(ice_servers, Arc::clone(&emitter)));

    let call_topics = CallTopics::from_config(config)?;
    let call_coordinator = CallCoordinator::new(
        Arc::clone(&peer),
        Arc::clone(&vap),
        Arc::clone(&broker),
        call_topics,
        &event_bridge,
        Arc::clone(&spawner),
    );

    let playback = crate::audio_io::StreamQueue::new();
    hardware
        .audio
        .stream_start(config.audio.sample_rate, 1)
        .map_err(|e| RccError::AudioDevice(e.to_string()))?;
    let reassembly = ReassemblyStore::new(
        Arc::clone(&playback),
        config.debug_audio_dump,
        config.data_dir.join("debug_audio"),
    );
    reassembly.start_sweeper(spawner.as_ref());

    let signaling = Arc::new(SignalingRouter::new(
        Arc::clone(&call_coordinator),
        Arc::clone(&reassembly),
        Arc::clone(&hardware.command_handler),
        Arc::clone(&spawner),
    ));

    let subscribe_topics: Vec<String> = ["audio", "command", "webrtc_offer", "webrtc_answer", "webrtc_candidate"]
        .iter()
        .filter_map(|&key| config.resolve_topic(key))
        .collect();
    wire_broker_to_router(broker.as_ref(), &subscribe_topics, Arc::clone(&signaling));

    let gps_topic = config
        .resolve_topic("gps")
        .ok_or_else(|| RccError::Configuration("missing topic template: gps".to_string()))?;
    let gps = Arc::new(GpsPublisher::new(
        config.telemetry.gps.clone(),
        config.data_dir.clone(),
        config.device_id.clone(),
        gps_topic,
        Arc::clone(&broker),
        Arc::clone(&emitter),
    ));
    gps.start(spawner.as_ref());

    let segmentation = Arc::new(SegmentationPublisher::new(
        config.telemetry.segmentation.clone(),
        Arc::clone(&camera),
        http_client.clone(),
        config.server_http_base.clone(),
        config.segmentation_api_key.clone(),
        Arc::clone(&hardware.audio),
        Arc::clone(&hardware.assets),
        Arc::clone(&emitter),
    ));
    segmentation.start(spawner.as_ref());

    let obstacle_topic = config
        .resolve_topic("obstacle")
        .ok_or_else(|| RccError::Configuration("missing topic template: obstacle".to_string()))?;
    let alarms = SensorAlarms::new(
        hardware.tof_sensors,
        AlarmThresholds {
            rate_limit_ms: config.alarms.rate_limit_ms,
            ..AlarmThresholds::default()
        },
        Arc::clone(&camera),
        http_client,
        config.server_http_base.clone(),
        config.device_id.clone(),
        Arc::clone(&broker),
        obstacle_topic,
        Arc::clone(&hardware.audio),
        Arc::clone(&hardware.assets),
        Arc::clone(&emitter),
    );
    if config.alarms.enabled {
        alarms.start(spawner.as_ref());
    }

    Ok(BootstrappedServices {
        registry,
        broker,
        event_bridge,
        vap,
        camera,
        peer,
        call_coordinator,
        signaling,
        reassembly,
        gps,
        segmentation,
        alarms,
        spawner,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_client_has_timeout() {
        let client = create_http_client();
        assert!(client.get("http://example.com").build().is_ok());
    }
}
