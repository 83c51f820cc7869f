//! Sensor Alarms (C11): time-of-flight obstacle detection with rate-limited
//! alerts.
//!
//! The I²C ToF sensor itself is out of scope (specified only at the
//! [`TofSensor`] interface); this module owns the 2Hz poll loop, the
//! distance threshold, and the capture/upload/playback sequence. Rate
//! limiting follows `broker.rs`'s simple last-fired timestamp check rather
//! than a token bucket, since a single scalar threshold is all the policy
//! needs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;

use crate::audio_io::{AssetLibrary, AudioEngine};
use crate::broker::BrokerClient;
use crate::camera::CameraSource;
use crate::error::RccResult;
use crate::events::{AlarmEvent, EventEmitter};
use crate::runtime::TaskSpawner;
use crate::utils::now_millis;
use crate::wire::{HttpResponseEnvelope, ObstacleMessage};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const ALERT_MIN_CM: f32 = 100.0;
const ALERT_MAX_CM: f32 = 150.0;
const STOP_SOUND_ASSET: &str = "stop_sound.wav";

/// Abstraction over a single time-of-flight distance sensor.
pub trait TofSensor: Send + Sync {
    /// Reads the current distance, in centimeters.
    fn read_distance_cm(&self) -> RccResult<f32>;
}

/// Configuration controlling the alert threshold and rate limit.
#[derive(Debug, Clone, Copy)]
pub struct AlarmThresholds {
    /// Lower bound (inclusive) of the alert distance window, in centimeters.
    pub min_cm: f32,
    /// Upper bound (inclusive) of the alert distance window, in centimeters.
    pub max_cm: f32,
    /// Minimum time between alerts, in milliseconds.
    pub rate_limit_ms: u64,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            min_cm: ALERT_MIN_CM,
            max_cm: ALERT_MAX_CM,
            rate_limit_ms: 3_000,
        }
    }
}

/// Returns whether `distance_cm` falls within the alert window.
#[must_use]
pub fn is_alert_distance(distance_cm: f32, thresholds: &AlarmThresholds) -> bool {
    distance_cm >= thresholds.min_cm && distance_cm <= thresholds.max_cm
}

/// Polls one or more ToF sensors and raises rate-limited obstacle alerts:
/// plays a stop sound, snapshots the camera, uploads to the detect
/// endpoint, and plays the returned warning asset on success.
pub struct SensorAlarms {
    sensors: Vec<Arc<dyn TofSensor>>,
    thresholds: AlarmThresholds,
    camera: Arc<CameraSource>,
    http: reqwest::Client,
    base_url: String,
    device_id: String,
    broker: Arc<dyn BrokerClient>,
    obstacle_topic: String,
    audio: Arc<dyn AudioEngine>,
    assets: Arc<dyn AssetLibrary>,
    emitter: Arc<dyn EventEmitter>,
    last_alert_ms: AtomicU64,
    running: Arc<AtomicBool>,
}

impl SensorAlarms {
    /// Creates a sensor alarm poller.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sensors: Vec<Arc<dyn TofSensor>>,
        thresholds: AlarmThresholds,
        camera: Arc<CameraSource>,
        http: reqwest::Client,
        base_url: String,
        device_id: String,
        broker: Arc<dyn BrokerClient>,
        obstacle_topic: String,
        audio: Arc<dyn AudioEngine>,
        assets: Arc<dyn AssetLibrary>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sensors,
            thresholds,
            camera,
            http,
            base_url,
            device_id,
            broker,
            obstacle_topic,
            audio,
            assets,
            emitter,
            last_alert_ms: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Starts the 2Hz poll loop.
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        let alarms = Arc::clone(self);
        spawner.spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                if !alarms.running.load(Ordering::SeqCst) {
                    break;
                }
                alarms.poll_once().await;
            }
        });
    }

    /// Stops the poll loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn poll_once(&self) {
        let mut closest: Option<f32> = None;
        for sensor in &self.sensors {
            match sensor.read_distance_cm() {
                Ok(distance) => {
                    if is_alert_distance(distance, &self.thresholds) {
                        closest = Some(closest.map_or(distance, |c: f32| c.min(distance)));
                    }
                }
                Err(e) => log::warn!("[Alarms] ToF read failed: {e}"),
            }
        }

        let Some(distance_cm) = closest else {
            return;
        };

        let now = now_millis();
        let last = self.last_alert_ms.load(Ordering::SeqCst);
        if now.saturating_sub(last) < self.thresholds.rate_limit_ms {
            return;
        }
        self.last_alert_ms.store(now, Ordering::SeqCst);

        self.emitter.emit_alarm(AlarmEvent::ObstacleDetected {
            distance_cm,
            timestamp: now,
        });

        crate::audio_io::play_warning_asset(self.audio.as_ref(), self.assets.as_ref(), STOP_SOUND_ASSET);
        self.upload_and_warn(distance_cm, now).await;
    }

    async fn upload_and_warn(&self, distance_cm: f32, now: u64) {
        let Some(frame) = self.camera.latest_frame() else {
            log::warn!("[Alarms] no camera frame available for obstacle snapshot");
            return;
        };

        let jpeg = match encode_snapshot(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("[Alarms] snapshot encode failed: {e}");
                return;
            }
        };

        let part = match reqwest::multipart::Part::bytes(jpeg)
            .file_name("obstacle.jpg")
            .mime_str("image/jpeg")
        {
            Ok(part) => part,
            Err(e) => {
                log::warn!("[Alarms] multipart build failed: {e}");
                return;
            }
        };
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = match self
            .http
            .post(format!("{}/detect", self.base_url))
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                log::warn!("[Alarms] detect upload failed: {e}");
                return;
            }
        };

        let mut detected_objects = Vec::new();
        match response.json::<HttpResponseEnvelope<crate::wire::DetectData>>().await {
            Ok(envelope) => {
                detected_objects = envelope.data.detected_objects.clone();
                if let Some(asset) = envelope.data.audio_file {
                    crate::audio_io::play_warning_asset(self.audio.as_ref(), self.assets.as_ref(), &asset);
                }
                log::debug!(
                    "[Alarms] obstacle at {distance_cm}cm uploaded for device {} (ts={now})",
                    self.device_id
                );
            }
            Err(e) => log::warn!("[Alarms] detect response malformed: {e}"),
        }

        let message = ObstacleMessage {
            device_id: self.device_id.clone(),
            ts: now,
            distance: distance_cm / 100.0,
            unit: "m".to_string(),
            class: None,
            detected_objects,
            severity: "warning".to_string(),
        };
        match serde_json::to_value(&message) {
            Ok(value) => {
                if let Err(e) = self
                    .broker
                    .publish(&self.obstacle_topic, value, QoS::AtLeastOnce, false)
                    .await
                {
                    log::warn!("[Alarms] obstacle publish failed: {e}");
                }
            }
            Err(e) => log::warn!("[Alarms] failed to serialize obstacle message: {e}"),
        }
    }
}

fn encode_snapshot(frame: &crate::camera::VideoFrame) -> RccResult<Vec<u8>> {
    let rgb = crate::camera::bgr_to_rgb_resized(frame, frame.width, frame.height);
    let image_buffer = image::RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| crate::error::RccError::Camera("frame dimensions do not match buffer length".into()))?;
    let mut bytes: Vec<u8> = Vec::new();
    image::DynamicImage::ImageRgb8(image_buffer)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
        .map_err(|e| crate::error::RccError::Camera(format!("jpeg encode failed: {e}")))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_distances_are_inclusive() {
        let thresholds = AlarmThresholds::default();
        assert!(is_alert_distance(100.0, &thresholds));
        assert!(is_alert_distance(150.0, &thresholds));
    }

    #[test]
    fn distances_just_outside_window_are_not_alerts() {
        let thresholds = AlarmThresholds::default();
        assert!(!is_alert_distance(99.0, &thresholds));
        assert!(!is_alert_distance(151.0, &thresholds));
    }

    struct FixedSensor(f32);
    impl TofSensor for FixedSensor {
        fn read_distance_cm(&self) -> RccResult<f32> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn poll_once_rate_limits_repeated_alerts() {
        use crate::events::NoopEventEmitter;

        struct NoopAudio;
        impl AudioEngine for NoopAudio {
            fn capture_open(
                &self,
                _rate: u32,
                _channels: u16,
                _block: usize,
                _device_hint: Option<&str>,
            ) -> RccResult<crate::audio_io::CaptureHandle> {
                Ok(crate::audio_io::CaptureHandle::new(None))
            }
            fn capture_read(&self, _handle: &crate::audio_io::CaptureHandle) -> RccResult<crate::audio_io::AudioFrame> {
                Err(crate::error::RccError::AudioDevice("unused in test".into()))
            }
            fn capture_close(&self, _handle: crate::audio_io::CaptureHandle) {}
            fn stream_start(&self, _rate: u32, _channels: u16) -> RccResult<()> {
                Ok(())
            }
            fn stream_enqueue(&self, _frame: crate::audio_io::AudioFrame) {}
            fn stream_stop(&self) {}
            fn play_pcm(&self, _samples: &[i16], _rate: u32, _channels: u16) -> RccResult<()> {
                Ok(())
            }
        }

        struct NoopAssets;
        impl AssetLibrary for NoopAssets {
            fn load(&self, _name: &str) -> RccResult<(Vec<i16>, u32, u16)> {
                Ok((vec![], 16_000, 1))
            }
        }

        struct NoopBroker;
        #[async_trait::async_trait]
        impl BrokerClient for NoopBroker {
            async fn connect(&self) -> RccResult<()> {
                Ok(())
            }
            async fn publish(&self, _topic: &str, _payload: serde_json::Value, _qos: QoS, _retain: bool) -> RccResult<()> {
                Ok(())
            }
            fn subscribe(&self, _topic: String, _handler: crate::broker::MessageHandler) {}
            async fn disconnect(&self) {}
        }

        let alarms = SensorAlarms::new(
            vec![Arc::new(FixedSensor(120.0))],
            AlarmThresholds::default(),
            Arc::new(CameraSource::new(Arc::new(NoCameraDevice), 0)),
            reqwest::Client::new(),
            "http://localhost".to_string(),
            "device-1".to_string(),
            Arc::new(NoopBroker),
            "device/device-1/obstacle".to_string(),
            Arc::new(NoopAudio),
            Arc::new(NoopAssets),
            Arc::new(NoopEventEmitter),
        );

        alarms.poll_once().await;
        let first = alarms.last_alert_ms.load(Ordering::SeqCst);
        alarms.poll_once().await;
        let second = alarms.last_alert_ms.load(Ordering::SeqCst);
        assert_eq!(first, second, "second alert within the rate-limit window should be suppressed");
    }

    struct NoCameraDevice;
    impl crate::camera::CameraDevice for NoCameraDevice {
        fn open(&self, _index: u32) -> RccResult<()> {
            Ok(())
        }
        fn read_frame(&self) -> RccResult<crate::camera::VideoFrame> {
            Err(crate::error::RccError::Camera("unused in test".into()))
        }
        fn close(&self) {}
    }
}
