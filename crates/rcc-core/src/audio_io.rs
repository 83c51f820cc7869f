//! Audio I/O (C2): capture, continuous playback, and loudness shaping.
//!
//! Capture is 16-bit signed mono. Playback accepts PCM of arbitrary
//! rate/channels and resamples/remixes to the continuous output stream's
//! configured rate. Gain math (AGC target-RMS, `tanh` soft limiter) is
//! ported from `_handle_incoming_audio` in the grounding source's MQTT
//! handler, applied here to `f32` samples in `[-1, 1]` using `cpal` for
//! device I/O instead of PyAudio.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{RccError, RccResult};

/// One block of captured or synthesized audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved PCM samples.
    pub samples: Vec<i16>,
    /// Sample rate of `samples`, in Hz.
    pub sample_rate: u32,
    /// Channel count of `samples`.
    pub channels: u16,
}

impl AudioFrame {
    /// Returns the frame duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u32 {
        let frames = self.samples.len() as u32 / self.channels.max(1) as u32;
        (frames * 1000) / self.sample_rate.max(1)
    }
}

/// Opaque handle to an open capture device. Dropping it releases the device.
pub struct CaptureHandle {
    device_hint: Option<String>,
}

/// Abstraction over audio capture and playback devices, so components
/// depend on a trait object rather than `cpal` directly.
///
/// Implementations must tolerate a transient "device busy" error by
/// retrying internally (three attempts, 500ms apart) before surfacing
/// [`RccError::AudioDevice`].
pub trait AudioEngine: Send + Sync {
    /// Opens the capture device, returning a handle good until closed.
    ///
    /// `device_hint` is a substring to prefer among enumerated device names
    /// (e.g. `"USB Audio Device"`); `None` selects the platform default.
    fn capture_open(
        &self,
        rate: u32,
        channels: u16,
        block: usize,
        device_hint: Option<&str>,
    ) -> RccResult<CaptureHandle>;

    /// Reads the next block of samples from an open capture handle.
    fn capture_read(&self, handle: &CaptureHandle) -> RccResult<AudioFrame>;

    /// Closes a capture handle. Idempotent.
    fn capture_close(&self, handle: CaptureHandle);

    /// Starts the continuous output stream at the given rate/channels.
    fn stream_start(&self, rate: u32, channels: u16) -> RccResult<()>;

    /// Enqueues a frame onto the continuous output stream.
    ///
    /// Any component may enqueue frames concurrently; the underlying
    /// callback serializes them.
    fn stream_enqueue(&self, frame: AudioFrame);

    /// Stops the continuous output stream.
    fn stream_stop(&self);

    /// Plays a complete in-memory PCM buffer to completion outside the
    /// continuous stream (used for short warning/prompt assets).
    fn play_pcm(&self, samples: &[i16], rate: u32, channels: u16) -> RccResult<()>;
}

/// Loudness-shaping configuration applied to inbound call audio before it
/// reaches the continuous playback stream.
#[derive(Debug, Clone, Copy)]
pub struct GainConfig {
    /// Static multiplier applied before AGC.
    pub base_gain: f32,
    /// RMS level AGC aims to reach.
    pub target_rms: f32,
    /// Hard ceiling on the multiplier AGC may apply.
    pub max_gain: f32,
    /// Hard ceiling on the total applied gain (base × AGC).
    pub max_total_gain: f32,
    /// RMS floor below which AGC does not engage (treated as near-silence).
    pub agc_floor: f32,
    /// `tanh` drive for the soft limiter; `None` disables limiting.
    pub limiter_drive: Option<f32>,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            base_gain: 1.0,
            target_rms: 0.1,
            max_gain: 4.0,
            max_total_gain: 6.0,
            agc_floor: 200.0 / i16::MAX as f32,
            limiter_drive: Some(3.0),
        }
    }
}

/// Applies base gain, target-RMS AGC, and an optional `tanh` soft limiter
/// to a float32 buffer in `[-1, 1]`, in place.
///
/// Mirrors `_handle_incoming_audio`'s gain pipeline: AGC only engages above
/// `agc_floor`, its multiplier is clamped to `max_gain`, and the applied
/// total gain (base × AGC) is clamped to `max_total_gain` regardless.
pub fn apply_gain(samples: &mut [f32], cfg: &GainConfig) {
    let rms = rms_of(samples);
    let agc_gain = if rms > cfg.agc_floor {
        (cfg.target_rms / rms).clamp(1.0, cfg.max_gain)
    } else {
        1.0
    };
    let applied = (cfg.base_gain * agc_gain).min(cfg.max_total_gain);

    for s in samples.iter_mut() {
        let mut v = *s * applied;
        if let Some(drive) = cfg.limiter_drive {
            v = soft_limit(v, drive);
        }
        *s = v.clamp(-1.0, 1.0);
    }
}

/// Soft limiter: `tanh(drive*x)/tanh(drive)`, preserving unity gain near zero.
fn soft_limit(x: f32, drive: f32) -> f32 {
    (drive * x).tanh() / drive.tanh()
}

/// Computes the root-mean-square level of a float32 sample buffer.
#[must_use]
pub fn rms_of(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Converts 16-bit PCM to float32 in `[-1, 1]`.
#[must_use]
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| f32::from(s) / f32::from(i16::MAX))
        .collect()
}

/// Converts float32 samples in `[-1, 1]` to clipped 16-bit PCM.
#[must_use]
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

/// Remixes a mono buffer to stereo by duplicating each sample, or a stereo
/// buffer to mono by taking the left channel. Other channel counts pass
/// through unchanged.
#[must_use]
pub fn remix_channels(samples: &[i16], from_channels: u16, to_channels: u16) -> Vec<i16> {
    match (from_channels, to_channels) {
        (1, 2) => samples.iter().flat_map(|&s| [s, s]).collect(),
        (2, 1) => samples.chunks_exact(2).map(|pair| pair[0]).collect(),
        _ => samples.to_vec(),
    }
}

/// Linear-interpolation resampler from `from_rate` to `to_rate`, operating
/// on a single channel of interleaved-free samples.
#[must_use]
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let out_len = ((samples.len() as f64) * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos.floor() as usize;
        let frac = src_pos - idx as f64;
        let a = samples.get(idx).copied().unwrap_or(0) as f64;
        let b = samples.get(idx + 1).copied().unwrap_or(a as i16) as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

/// Fixed-size reassembly buffer for the continuous output stream's pull
/// callback: dequeues up to `block` samples, concatenating partial frames,
/// pushing the unused tail back, and zero-padding any shortfall.
pub struct StreamQueue {
    inner: Mutex<VecDeque<i16>>,
}

impl StreamQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
        })
    }

    /// Appends samples to the tail of the queue.
    pub fn push(&self, samples: &[i16]) {
        self.inner.lock().extend(samples.iter().copied());
    }

    /// Pulls exactly `block` samples, zero-padding if fewer are available.
    #[must_use]
    pub fn pull(&self, block: usize) -> Vec<i16> {
        let mut guard = self.inner.lock();
        let mut out = Vec::with_capacity(block);
        for _ in 0..block {
            out.push(guard.pop_front().unwrap_or(0));
        }
        out
    }

    /// Returns the number of samples currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns whether the queue currently holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for StreamQueue {
    fn default() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }
}

/// Opens a capture device with up to three retries spaced 500ms apart,
/// the policy the external interface section mandates for transient
/// "device busy" failures.
pub async fn capture_open_with_retry(
    engine: &dyn AudioEngine,
    rate: u32,
    channels: u16,
    block: usize,
    device_hint: Option<&str>,
) -> RccResult<CaptureHandle> {
    let mut last_err = None;
    for attempt in 0..3 {
        match engine.capture_open(rate, channels, block, device_hint) {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                log::warn!("[AudioIO] capture_open attempt {attempt} failed: {e}");
                last_err = Some(e);
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RccError::AudioDevice("capture device unavailable".into())))
}

impl CaptureHandle {
    /// Creates a handle remembering which device hint it was opened with
    /// (used by `cpal`-backed engines to reconnect to the same device).
    #[must_use]
    pub fn new(device_hint: Option<String>) -> Self {
        Self { device_hint }
    }

    /// Returns the device hint this handle was opened with, if any.
    #[must_use]
    pub fn device_hint(&self) -> Option<&str> {
        self.device_hint.as_deref()
    }
}

/// Resolves named warning/prompt assets (e.g. `"obstacle_ahead.wav"`) to
/// decoded PCM, so telemetry (C10) and sensor alarms (C11) can play a
/// server-referenced asset by name without knowing where it's stored.
pub trait AssetLibrary: Send + Sync {
    /// Loads `name`, returning mono/stereo PCM and its native rate/channels.
    fn load(&self, name: &str) -> RccResult<(Vec<i16>, u32, u16)>;
}

/// Plays a named warning asset to completion via `engine.play_pcm`. Missing
/// or undecodable assets are logged and otherwise ignored, matching the
/// "failures during a call play no audible error" policy.
pub fn play_warning_asset(engine: &dyn AudioEngine, assets: &dyn AssetLibrary, name: &str) {
    match assets.load(name) {
        Ok((samples, rate, channels)) => {
            if let Err(e) = engine.play_pcm(&samples, rate, channels) {
                log::warn!("[AudioIO] failed to play warning asset {name}: {e}");
            }
        }
        Err(e) => log::warn!("[AudioIO] failed to load warning asset {name}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_of(&[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn rms_of_constant_signal_matches_amplitude() {
        assert!((rms_of(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn apply_gain_boosts_quiet_signal_toward_target_rms() {
        let mut samples = vec![0.01_f32; 100];
        let cfg = GainConfig::default();
        let before_rms = rms_of(&samples);
        apply_gain(&mut samples, &cfg);
        let after_rms = rms_of(&samples);
        assert!(after_rms > before_rms);
    }

    #[test]
    fn apply_gain_never_exceeds_max_total_gain() {
        let mut samples = vec![0.001_f32; 100];
        let cfg = GainConfig {
            max_gain: 100.0,
            max_total_gain: 2.0,
            base_gain: 1.0,
            ..GainConfig::default()
        };
        apply_gain(&mut samples, &cfg);
        for s in samples {
            assert!(s.abs() <= 1.0);
        }
    }

    #[test]
    fn soft_limit_is_bounded() {
        assert!(soft_limit(10.0, 3.0).abs() <= 1.0001);
        assert!(soft_limit(-10.0, 3.0).abs() <= 1.0001);
    }

    #[test]
    fn remix_mono_to_stereo_duplicates_samples() {
        let mono = [1, 2, 3];
        assert_eq!(remix_channels(&mono, 1, 2), vec![1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn remix_stereo_to_mono_takes_left_channel() {
        let stereo = [1, 100, 2, 200, 3, 300];
        assert_eq!(remix_channels(&stereo, 2, 1), vec![1, 2, 3]);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let samples = [1, 2, 3, 4];
        assert_eq!(resample_linear(&samples, 48_000, 48_000), vec![1, 2, 3, 4]);
    }

    #[test]
    fn resample_upsampling_increases_length() {
        let samples = [0, 1000, 0, -1000];
        let out = resample_linear(&samples, 8_000, 16_000);
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn stream_queue_zero_pads_shortfall() {
        let q = StreamQueue::new();
        q.push(&[1, 2]);
        let block = q.pull(5);
        assert_eq!(block, vec![1, 2, 0, 0, 0]);
    }

    #[test]
    fn stream_queue_pushes_unused_tail_back() {
        let q = StreamQueue::new();
        q.push(&[1, 2, 3, 4, 5]);
        let first = q.pull(3);
        assert_eq!(first, vec![1, 2, 3]);
        let second = q.pull(3);
        assert_eq!(second, vec![4, 5, 0]);
    }
}
