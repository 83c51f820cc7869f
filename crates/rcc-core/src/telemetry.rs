//! Telemetry Publishers (C10): GPS, startup ping, and scene-segmentation
//! senders.
//!
//! Grounded on the original source's `module/gps.py` (NMEA GPRMC parsing,
//! last-fix JSON restore, CSV history log) and `mqtt/handlers.py`'s
//! segmentation upload loop. The dedicated reader/sender threads become
//! `TaskSpawner`-spawned loops; `tokio_serial` replaces `pyserial`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::QoS;
use tokio::io::AsyncBufReadExt;

use crate::audio_io::{AssetLibrary, AudioEngine};
use crate::broker::BrokerClient;
use crate::camera::{bgr_to_rgb_resized, CameraSource};
use crate::config::{GpsConfig, LastGpsFix, SegmentationConfig};
use crate::error::{RccError, RccResult};
use crate::events::{EventEmitter, TelemetryEvent};
use crate::runtime::TaskSpawner;
use crate::utils::now_millis;
use crate::wire::{GpsMessage, HttpResponseEnvelope, SegmentationData};

const SEGMENT_DOWNSCALE: u32 = 64;
const SEGMENT_DECAY: f64 = 0.8;
const SEGMENT_GROWTH: f64 = 1.2;
const SEGMENT_INTERVAL_MIN_SECS: u64 = 2;
const SEGMENT_INTERVAL_MAX_SECS: u64 = 10;
const CSV_LOG_INTERVAL_MS: u64 = 5_000;
const JSON_SAVE_INTERVAL_MS: u64 = 10_000;
const MOCK_BATTERY_PIN: i32 = 85;

/// A single parsed GPS fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Ground speed in kilometers per hour.
    pub speed_kmh: f64,
}

/// Parses a `$GPRMC`/`$GNRMC` NMEA sentence into a fix, if it carries a
/// valid (`A`) status. Field layout:
/// `$GPRMC,time,status,lat,N/S,lon,E/W,speed_knots,course,date,...`
#[must_use]
pub fn parse_gprmc(line: &str) -> Option<GpsFix> {
    let line = line.trim();
    if !(line.starts_with("$GPRMC") || line.starts_with("$GNRMC")) {
        return None;
    }
    let body = line.split('*').next().unwrap_or(line);
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 8 || fields.get(2) != Some(&"A") {
        return None;
    }

    let latitude = parse_nmea_coordinate(fields[3], fields[4])?;
    let longitude = parse_nmea_coordinate(fields[5], fields[6])?;
    let speed_knots: f64 = fields[7].parse().unwrap_or(0.0);
    Some(GpsFix {
        latitude,
        longitude,
        speed_kmh: speed_knots * 1.852,
    })
}

/// Parses one NMEA `ddmm.mmmm`/`dddmm.mmmm` coordinate plus hemisphere
/// letter into signed decimal degrees.
fn parse_nmea_coordinate(raw: &str, hemisphere: &str) -> Option<f64> {
    if raw.is_empty() {
        return None;
    }
    let dot = raw.find('.')?;
    let deg_len = dot.saturating_sub(2);
    let degrees: f64 = raw[..deg_len].parse().ok()?;
    let minutes: f64 = raw[deg_len..].parse().ok()?;
    let mut decimal = degrees + minutes / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

/// Great-circle distance between two fixes, in meters (haversine).
#[must_use]
pub fn distance_meters(a: &LastGpsFix, b: &GpsFix) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Reads and publishes GPS fixes from a serial NMEA stream.
pub struct GpsPublisher {
    config: GpsConfig,
    data_dir: PathBuf,
    device_id: String,
    topic: String,
    broker: Arc<dyn BrokerClient>,
    emitter: Arc<dyn EventEmitter>,
    last_published: Mutex<LastGpsFix>,
    running: Arc<AtomicBool>,
}

impl GpsPublisher {
    /// Creates a GPS publisher, restoring the last persisted fix.
    #[must_use]
    pub fn new(
        config: GpsConfig,
        data_dir: PathBuf,
        device_id: String,
        topic: String,
        broker: Arc<dyn BrokerClient>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        let last_published = Mutex::new(LastGpsFix::load(&data_dir));
        Self {
            config,
            data_dir,
            device_id,
            topic,
            broker,
            emitter,
            last_published,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Starts the background serial-reader loop, if GPS telemetry is enabled.
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        if !self.config.enabled {
            log::info!("[Telemetry] GPS publisher disabled by configuration");
            return;
        }
        let publisher = Arc::clone(self);
        spawner.spawn(async move {
            let mut backoff_secs = 1u64;
            while publisher.running.load(Ordering::SeqCst) {
                match publisher.open_port().await {
                    Ok(port) => {
                        backoff_secs = 1;
                        publisher.read_loop(port).await;
                    }
                    Err(e) => {
                        log::warn!("[Telemetry] GPS serial port unavailable: {e}");
                        tokio::time::sleep(Duration::from_secs(backoff_secs.min(5))).await;
                        backoff_secs = (backoff_secs * 2).min(5);
                    }
                }
            }
        });
    }

    /// Stops the background loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn open_port(&self) -> RccResult<tokio_serial::SerialStream> {
        use tokio_serial::SerialPortBuilderExt;
        tokio_serial::new(&self.config.port, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| RccError::Gps(e.to_string()))
    }

    async fn read_loop(&self, port: tokio_serial::SerialStream) {
        let mut reader = tokio::io::BufReader::new(port);
        let mut line = String::new();
        let mut last_csv_log_ms = 0u64;
        let mut last_json_save_ms = 0u64;
        let mut last_publish_ms = 0u64;
        let mut interval_secs = self.config.send_interval_min;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("[Telemetry] GPS read error: {e}");
                    break;
                }
            }

            let Some(fix) = parse_gprmc(&line) else {
                continue;
            };
            let now = now_millis();

            if now.saturating_sub(last_json_save_ms) >= JSON_SAVE_INTERVAL_MS {
                let record = LastGpsFix {
                    latitude: fix.latitude,
                    longitude: fix.longitude,
                    speed_kmh: fix.speed_kmh,
                    timestamp: now,
                };
                if let Err(e) = record.save(&self.data_dir) {
                    log::warn!("[Telemetry] failed to persist GPS fix: {e}");
                }
                last_json_save_ms = now;
            }

            if now.saturating_sub(last_csv_log_ms) >= CSV_LOG_INTERVAL_MS {
                if let Err(e) = append_gps_history(&self.data_dir, &fix) {
                    log::warn!("[Telemetry] failed to append GPS history: {e}");
                }
                last_csv_log_ms = now;
            }

            let displacement = distance_meters(&self.last_published.lock(), &fix);
            let due = now.saturating_sub(last_publish_ms) >= interval_secs * 1_000;
            if displacement >= self.config.diff_threshold || due {
                self.publish(&fix).await;
                *self.last_published.lock() = LastGpsFix {
                    latitude: fix.latitude,
                    longitude: fix.longitude,
                    speed_kmh: fix.speed_kmh,
                    timestamp: now,
                };
                last_publish_ms = now;
                interval_secs = self.config.send_interval_min;
            } else {
                interval_secs = (interval_secs + 1).min(self.config.send_interval_max);
            }
        }
    }

    async fn publish(&self, fix: &GpsFix) {
        let message = GpsMessage {
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed_kmh: fix.speed_kmh,
            pin: MOCK_BATTERY_PIN,
        };
        match serde_json::to_value(&message) {
            Ok(value) => {
                if let Err(e) = self.broker.publish(&self.topic, value, QoS::AtMostOnce, false).await {
                    log::warn!("[Telemetry] GPS publish failed: {e}");
                    return;
                }
                self.emitter.emit_telemetry(TelemetryEvent::GpsPublished {
                    timestamp: now_millis(),
                });
                log::debug!("[Telemetry] GPS published for device {}", self.device_id);
            }
            Err(e) => log::warn!("[Telemetry] failed to serialize GPS message: {e}"),
        }
    }
}

fn append_gps_history(data_dir: &Path, fix: &GpsFix) -> RccResult<()> {
    let history_dir = data_dir.join("logs").join("gps_history");
    std::fs::create_dir_all(&history_dir)?;

    let now = chrono::Local::now();
    let path = history_dir.join(format!("gps_track_{}.csv", now.format("%Y-%m-%d")));
    let file_exists = path.exists();

    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
    if !file_exists {
        writeln!(file, "Timestamp,Date,Time,Latitude,Longitude,Speed_KMH")?;
    }
    writeln!(
        file,
        "{},{},{},{},{},{}",
        now.to_rfc3339(),
        now.format("%Y-%m-%d"),
        now.format("%H:%M:%S"),
        fix.latitude,
        fix.longitude,
        fix.speed_kmh
    )?;
    Ok(())
}

/// Publishes a single heartbeat message on startup.
pub async fn publish_ping(broker: &dyn BrokerClient, topic: &str, device_id: &str) {
    let payload = serde_json::json!({ "device_id": device_id, "status": "online", "timestamp": now_millis() });
    if let Err(e) = broker.publish(topic, payload, QoS::AtMostOnce, false).await {
        log::warn!("[Telemetry] ping publish failed: {e}");
    }
}

/// Compares two downscaled frames via mean absolute pixel difference,
/// driving an adaptive-interval scene-safety publisher.
pub struct SegmentationPublisher {
    config: SegmentationConfig,
    camera: Arc<CameraSource>,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    audio: Arc<dyn AudioEngine>,
    assets: Arc<dyn AssetLibrary>,
    emitter: Arc<dyn EventEmitter>,
    running: Arc<AtomicBool>,
}

impl SegmentationPublisher {
    /// Creates a segmentation publisher.
    #[must_use]
    pub fn new(
        config: SegmentationConfig,
        camera: Arc<CameraSource>,
        http: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        audio: Arc<dyn AudioEngine>,
        assets: Arc<dyn AssetLibrary>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            config,
            camera,
            http,
            base_url,
            api_key,
            audio,
            assets,
            emitter,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Starts the background adaptive-interval sender, if enabled.
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        if !self.config.enabled {
            log::info!("[Telemetry] segmentation publisher disabled by configuration");
            return;
        }
        let publisher = Arc::clone(self);
        spawner.spawn(async move {
            let mut interval_secs = publisher.config.interval_secs.clamp(
                SEGMENT_INTERVAL_MIN_SECS,
                SEGMENT_INTERVAL_MAX_SECS,
            );
            let mut previous_downscale: Option<Vec<u8>> = None;

            while publisher.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(interval_secs)).await;
                if !publisher.running.load(Ordering::SeqCst) {
                    break;
                }

                let Some(frame) = publisher.camera.latest_frame() else {
                    continue;
                };
                let downscale = bgr_to_rgb_resized(&frame, SEGMENT_DOWNSCALE, SEGMENT_DOWNSCALE);

                let difference = previous_downscale
                    .as_ref()
                    .map(|prev| mean_abs_diff(prev, &downscale))
                    .unwrap_or(0.0);
                previous_downscale = Some(downscale);

                if difference > SEGMENT_DIFF_THRESHOLD {
                    interval_secs = ((interval_secs as f64) * SEGMENT_DECAY).max(SEGMENT_INTERVAL_MIN_SECS as f64) as u64;
                    publisher.upload(&frame).await;
                } else {
                    interval_secs = ((interval_secs as f64) * SEGMENT_GROWTH).min(SEGMENT_INTERVAL_MAX_SECS as f64) as u64;
                }
            }
        });
    }

    /// Stops the background sender.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn upload(&self, frame: &crate::camera::VideoFrame) {
        let jpeg = match encode_jpeg(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("[Telemetry] segmentation frame encode failed: {e}");
                return;
            }
        };

        let part = match reqwest::multipart::Part::bytes(jpeg)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
        {
            Ok(part) => part,
            Err(e) => {
                log::warn!("[Telemetry] segmentation multipart build failed: {e}");
                return;
            }
        };
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut request = self.http.post(format!("{}/segment", self.base_url)).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => match response.json::<HttpResponseEnvelope<SegmentationData>>().await {
                Ok(envelope) if !envelope.data.is_safe => {
                    self.emitter.emit_telemetry(TelemetryEvent::SegmentationWarning {
                        audio_file: envelope.data.audio_file.clone().unwrap_or_default(),
                        timestamp: now_millis(),
                    });
                    if let Some(asset) = envelope.data.audio_file {
                        crate::audio_io::play_warning_asset(self.audio.as_ref(), self.assets.as_ref(), &asset);
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("[Telemetry] segmentation response malformed: {e}"),
            },
            Err(e) => log::warn!("[Telemetry] segmentation upload failed: {e}"),
        }
    }
}

const SEGMENT_DIFF_THRESHOLD: f64 = 15.0;

fn encode_jpeg(frame: &crate::camera::VideoFrame) -> RccResult<Vec<u8>> {
    let rgb = bgr_to_rgb_resized(frame, frame.width, frame.height);
    let image_buffer = image::RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| RccError::Camera("frame dimensions do not match buffer length".into()))?;
    let mut bytes: Vec<u8> = Vec::new();
    image::DynamicImage::ImageRgb8(image_buffer)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
        .map_err(|e| RccError::Camera(format!("jpeg encode failed: {e}")))?;
    Ok(bytes)
}

/// Mean absolute per-channel pixel difference between two equally-sized
/// RGB24 buffers.
#[must_use]
pub fn mean_abs_diff(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let sum: u64 = a.iter().zip(b).map(|(x, y)| (*x as i32 - *y as i32).unsigned_abs() as u64).sum();
    sum as f64 / a.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_gprmc_sentence() {
        let line = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        let fix = parse_gprmc(line).unwrap();
        assert!((fix.latitude - 48.1173).abs() < 1e-3);
        assert!((fix.longitude - 11.5167).abs() < 1e-3);
        assert!((fix.speed_kmh - 022.4 * 1.852).abs() < 1e-6);
    }

    #[test]
    fn rejects_void_status_sentence() {
        let line = "$GPRMC,123519,V,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        assert!(parse_gprmc(line).is_none());
    }

    #[test]
    fn rejects_non_rmc_sentence() {
        assert!(parse_gprmc("$GPGGA,123519,4807.038,N*00").is_none());
    }

    #[test]
    fn southern_western_hemisphere_are_negative() {
        let line = "$GPRMC,123519,A,4807.038,S,01131.000,W,000.0,084.4,230394,003.1,W*6A";
        let fix = parse_gprmc(line).unwrap();
        assert!(fix.latitude < 0.0);
        assert!(fix.longitude < 0.0);
    }

    #[test]
    fn distance_meters_is_zero_for_identical_points() {
        let a = LastGpsFix { latitude: 10.0, longitude: 106.0, speed_kmh: 0.0, timestamp: 0 };
        let b = GpsFix { latitude: 10.0, longitude: 106.0, speed_kmh: 0.0 };
        assert!(distance_meters(&a, &b) < 1e-6);
    }

    #[test]
    fn distance_meters_is_positive_for_distinct_points() {
        let a = LastGpsFix { latitude: 10.0, longitude: 106.0, speed_kmh: 0.0, timestamp: 0 };
        let b = GpsFix { latitude: 10.01, longitude: 106.0, speed_kmh: 0.0 };
        assert!(distance_meters(&a, &b) > 1000.0);
    }

    #[test]
    fn mean_abs_diff_is_zero_for_identical_buffers() {
        let buf = vec![10u8, 20, 30, 40];
        assert_eq!(mean_abs_diff(&buf, &buf), 0.0);
    }

    #[test]
    fn mean_abs_diff_detects_change() {
        let a = vec![0u8, 0, 0, 0];
        let b = vec![10u8, 10, 10, 10];
        assert_eq!(mean_abs_diff(&a, &b), 10.0);
    }
}
