//! Device configuration.
//!
//! [`Config`] is assembled from a YAML file and validated once at startup,
//! the way the grounding library validates `StreamingConfig`: panics belong
//! to the binary's startup path, never to library code.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Topic template for a single MQTT-style subscription or publish target.
///
/// Every value in [`Config::topics`] is a template containing a single
/// `{device_id}` placeholder, resolved once at startup by
/// [`Config::resolve_topic`].
pub type TopicTemplate = String;

/// Device-wide configuration.
///
/// All fields have sensible defaults so a YAML file only needs to override
/// what differs from a stock device.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Unique identifier for this device, used to derive topic names.
    pub device_id: String,

    /// Topic name templates, keyed by logical purpose (`audio`, `command`,
    /// `webrtc_offer`, `webrtc_answer`, `webrtc_candidate`, `gps`, `obstacle`).
    pub topics: HashMap<String, TopicTemplate>,

    /// Broker session configuration.
    pub broker: BrokerConfig,

    /// Audio I/O configuration (C2).
    pub audio: AudioConfig,

    /// Voice activity pipeline configuration (C4).
    pub vap: VapConfig,

    /// Telemetry publisher configuration (C10).
    pub telemetry: TelemetryConfig,

    /// Sensor alarm configuration (C11).
    pub alarms: AlarmConfig,

    /// Base URL for the application server's HTTP API (TURN credentials,
    /// segmentation, object-detection endpoints).
    pub server_http_base: String,

    /// TURN credential API key, if the server requires one.
    pub turn_api_key: Option<String>,

    /// Segmentation endpoint API key, if the server requires one.
    pub segmentation_api_key: Option<String>,

    /// Camera device index, or `None` to disable C3 entirely.
    pub camera_index: Option<u32>,

    /// Directory for persisted state (GPS last-fix cache, debug audio dumps).
    pub data_dir: std::path::PathBuf,

    /// Whether to write a debug WAV dump of the most recent reassembled
    /// playback stream.
    pub debug_audio_dump: bool,
}

/// Broker session configuration (C5).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Broker auth username, if required.
    pub username: Option<String>,
    /// Broker auth password, if required. Opaque: forwarded to the client
    /// without interpreting the auth scheme.
    pub password: Option<String>,
    /// Initial reconnect backoff, in milliseconds.
    pub reconnect_backoff_min_ms: u64,
    /// Reconnect backoff ceiling, in milliseconds.
    pub reconnect_backoff_max_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            reconnect_backoff_min_ms: 1_000,
            reconnect_backoff_max_ms: 5_000,
        }
    }
}

/// Audio capture/playback configuration (C2).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AudioConfig {
    /// Preferred input device index, or `None` for the default device.
    pub mic_index: Option<u32>,
    /// Capture/playback sample rate in Hz.
    pub sample_rate: u32,
    /// Chunk duration in milliseconds for VAP/STT capture.
    pub chunk_ms: u32,
    /// Static microphone gain multiplier applied before AGC.
    pub microphone_gain: f32,
    /// RMS floor below which input is treated as silence (noise gate).
    pub microphone_noise_gate: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mic_index: None,
            sample_rate: 48_000,
            chunk_ms: 20,
            microphone_gain: 1.0,
            microphone_noise_gate: 0.0,
        }
    }
}

/// Voice activity pipeline configuration (C4).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VapConfig {
    /// RMS threshold above which audio is considered speech.
    pub silence_threshold: f32,
    /// Sustained silence duration (seconds) required to finalize an utterance.
    pub silence_duration: f32,
    /// Minimum utterance duration (seconds); shorter utterances are discarded.
    pub min_speech_duration: f32,
}

impl Default for VapConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.02,
            silence_duration: 5.0,
            min_speech_duration: 0.5,
        }
    }
}

/// GPS telemetry configuration (C10).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GpsConfig {
    /// Whether the GPS publisher runs at all.
    pub enabled: bool,
    /// Serial port device path for the GPS module.
    pub port: String,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Minimum displacement (meters) required to publish early.
    pub diff_threshold: f64,
    /// Minimum interval between publishes, in seconds.
    pub send_interval_min: u64,
    /// Maximum interval between publishes, in seconds.
    pub send_interval_max: u64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            diff_threshold: 10.0,
            send_interval_min: 5,
            send_interval_max: 30,
        }
    }
}

/// Segmentation (scene-safety) publisher configuration (C10).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Whether the segmentation publisher runs at all.
    pub enabled: bool,
    /// Interval between segmentation uploads, in seconds.
    pub interval_secs: u64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
        }
    }
}

/// Telemetry publisher configuration (C10): GPS and segmentation senders.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    /// GPS publisher configuration.
    pub gps: GpsConfig,
    /// Segmentation publisher configuration.
    pub segmentation: SegmentationConfig,
}

/// Sensor alarm configuration (C11).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlarmConfig {
    /// Whether obstacle alerting runs at all.
    pub enabled: bool,
    /// Distance threshold in centimeters below which an obstacle alert fires.
    pub distance_threshold_cm: f32,
    /// Minimum interval between alerts, in milliseconds (rate limit).
    pub rate_limit_ms: u64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_threshold_cm: 50.0,
            rate_limit_ms: 3_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut topics = HashMap::new();
        topics.insert("audio".to_string(), "device/{device_id}/audio".to_string());
        topics.insert(
            "command".to_string(),
            "device/{device_id}/command".to_string(),
        );
        topics.insert(
            "webrtc_offer".to_string(),
            "device/{device_id}/webrtc/offer".to_string(),
        );
        topics.insert(
            "webrtc_answer".to_string(),
            "device/{device_id}/webrtc/answer".to_string(),
        );
        topics.insert(
            "webrtc_candidate".to_string(),
            "device/{device_id}/webrtc/candidate".to_string(),
        );
        topics.insert("gps".to_string(), "device/{device_id}/gps".to_string());
        topics.insert(
            "obstacle".to_string(),
            "device/{device_id}/obstacle".to_string(),
        );

        Self {
            device_id: "rcc-device".to_string(),
            topics,
            broker: BrokerConfig::default(),
            audio: AudioConfig::default(),
            vap: VapConfig::default(),
            telemetry: TelemetryConfig::default(),
            alarms: AlarmConfig::default(),
            server_http_base: "https://localhost:8443".to_string(),
            turn_api_key: None,
            segmentation_api_key: None,
            camera_index: Some(0),
            data_dir: std::path::PathBuf::from("."),
            debug_audio_dump: false,
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file, falling back to defaults for
    /// any field the file omits.
    ///
    /// Returns `Config::default()` if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid YAML.
    pub fn load(path: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                serde_yaml::from_str(&contents).map_err(|e| format!("invalid config: {e}"))
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field encountered.
    pub fn validate(&self) -> Result<(), String> {
        if self.device_id.trim().is_empty() {
            return Err("device_id must not be empty".to_string());
        }
        if self.audio.sample_rate == 0 {
            return Err("audio.sample_rate must be >= 1".to_string());
        }
        if self.audio.chunk_ms == 0 {
            return Err("audio.chunk_ms must be >= 1".to_string());
        }
        if self.telemetry.gps.send_interval_min > self.telemetry.gps.send_interval_max {
            return Err(
                "telemetry.gps.send_interval_min must be <= telemetry.gps.send_interval_max"
                    .to_string(),
            );
        }
        Ok(())
    }

    /// Resolves a topic template by key, substituting the configured device ID.
    ///
    /// Returns `None` if no template is registered under `key`.
    #[must_use]
    pub fn resolve_topic(&self, key: &str) -> Option<String> {
        self.topics
            .get(key)
            .map(|template| template.replace("{device_id}", &self.device_id))
    }
}

const GPS_FIX_FILE: &str = "gps_lastfix.json";

/// Global mutex serializing all GPS fix file operations.
static GPS_FIX_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn gps_fix_lock() -> &'static Mutex<()> {
    GPS_FIX_LOCK.get_or_init(|| Mutex::new(()))
}

/// The last GPS fix persisted to disk, so a restart doesn't publish a stale
/// position derived from `(0.0, 0.0)`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LastGpsFix {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Speed over ground in km/h.
    pub speed_kmh: f64,
    /// Unix timestamp in milliseconds when the fix was recorded.
    pub timestamp: u64,
}

impl LastGpsFix {
    /// Loads the last persisted fix from the data directory.
    ///
    /// Returns the default (zeroed) fix if no file exists or it is invalid.
    #[must_use]
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(GPS_FIX_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Persists this fix to the data directory using an atomic write
    /// (temp file + rename) to avoid corruption on crash.
    pub fn save(&self, data_dir: &Path) -> std::io::Result<()> {
        let _guard = gps_fix_lock().lock();
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(GPS_FIX_FILE);
        let temp_path = data_dir.join("gps_lastfix.json.tmp");
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_empty_device_id() {
        let mut config = Config::default();
        config.device_id = "".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_inverted_gps_interval() {
        let mut config = Config::default();
        config.telemetry.gps.send_interval_min = 30;
        config.telemetry.gps.send_interval_max = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_topic_substitutes_device_id() {
        let mut config = Config::default();
        config.device_id = "device-42".to_string();
        assert_eq!(
            config.resolve_topic("audio"),
            Some("device/device-42/audio".to_string())
        );
        assert_eq!(config.resolve_topic("nonexistent"), None);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let config = Config::load(Path::new("/nonexistent/path/config.yaml")).unwrap();
        assert_eq!(config.device_id, "rcc-device");
    }

    #[test]
    fn gps_fix_round_trips_through_atomic_save() {
        let dir = tempfile::tempdir().unwrap();
        let fix = LastGpsFix {
            latitude: 37.7749,
            longitude: -122.4194,
            speed_kmh: 42.5,
            timestamp: 1_700_000_000_000,
        };
        fix.save(dir.path()).unwrap();
        let loaded = LastGpsFix::load(dir.path());
        assert_eq!(loaded, fix);
    }

    #[test]
    fn gps_fix_load_missing_file_is_zeroed_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = LastGpsFix::load(dir.path());
        assert_eq!(loaded, LastGpsFix::default());
    }
}
