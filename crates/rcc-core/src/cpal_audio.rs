//! `cpal`-backed [`AudioEngine`] (C2).
//!
//! One capture session and one continuous playback session are active at a
//! time, matching the original source's single-microphone/single-speaker
//! assumption. Grounded on
//! `other_examples/35aa5016_mmaudet-visio-mobile__crates-visio-desktop-src-audio_cpal.rs.rs`'s
//! `SendSyncStream` wrapper (`cpal::Stream` is `!Send`/`!Sync` but safe to
//! hold without moving across threads) and its input/output callback shape.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::audio_io::{AudioEngine, AudioFrame, CaptureHandle};
use crate::error::{RccError, RccResult};

/// Wraps a `cpal::Stream` so it can live behind `Arc<dyn AudioEngine>`.
///
/// Never moved across threads after creation; only dropped, which stops it.
struct SendSyncStream(#[allow(dead_code)] cpal::Stream);
unsafe impl Send for SendSyncStream {}
unsafe impl Sync for SendSyncStream {}

struct CaptureSession {
    _stream: SendSyncStream,
    buffer: Arc<(Mutex<VecDeque<i16>>, Condvar)>,
    block: usize,
}

struct PlaybackSession {
    _stream: SendSyncStream,
    buffer: Arc<Mutex<VecDeque<i16>>>,
}

/// `cpal` host/device backed [`AudioEngine`].
pub struct CpalAudioEngine {
    capture: Mutex<Option<CaptureSession>>,
    playback: Mutex<Option<PlaybackSession>>,
}

impl Default for CpalAudioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalAudioEngine {
    /// Creates an engine with no active capture or playback session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capture: Mutex::new(None),
            playback: Mutex::new(None),
        }
    }

    fn find_input_device(host: &cpal::Host, hint: Option<&str>) -> Option<cpal::Device> {
        if let Some(hint) = hint {
            if let Ok(devices) = host.input_devices() {
                for device in devices {
                    if device.name().map(|n| n.contains(hint)).unwrap_or(false) {
                        return Some(device);
                    }
                }
            }
        }
        host.default_input_device()
    }
}

impl AudioEngine for CpalAudioEngine {
    fn capture_open(
        &self,
        rate: u32,
        channels: u16,
        block: usize,
        device_hint: Option<&str>,
    ) -> RccResult<CaptureHandle> {
        let host = cpal::default_host();
        let device = Self::find_input_device(&host, device_hint)
            .ok_or_else(|| RccError::AudioDevice("no input audio device available".into()))?;

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer: Arc<(Mutex<VecDeque<i16>>, Condvar)> =
            Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let buffer_cb = Arc::clone(&buffer);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let (lock, cvar) = &*buffer_cb;
                    let mut queue = lock.lock().unwrap();
                    queue.extend(data.iter().map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16));
                    cvar.notify_all();
                },
                |err| log::warn!("[AudioIO] capture stream error: {err}"),
                None,
            )
            .map_err(|e| RccError::AudioDevice(format!("build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| RccError::AudioDevice(format!("play input stream: {e}")))?;

        *self.capture.lock().unwrap() = Some(CaptureSession {
            _stream: SendSyncStream(stream),
            buffer,
            block,
        });

        Ok(CaptureHandle::new(device_hint.map(str::to_string)))
    }

    fn capture_read(&self, _handle: &CaptureHandle) -> RccResult<AudioFrame> {
        let guard = self.capture.lock().unwrap();
        let session = guard
            .as_ref()
            .ok_or_else(|| RccError::AudioDevice("no open capture session".into()))?;
        let (lock, cvar) = &*session.buffer;
        let mut queue = lock.lock().unwrap();
        while queue.len() < session.block {
            let (q, timeout) = cvar.wait_timeout(queue, Duration::from_millis(500)).unwrap();
            queue = q;
            if timeout.timed_out() && queue.len() < session.block {
                break;
            }
        }
        let samples: Vec<i16> = queue.drain(..queue.len().min(session.block)).collect();
        let mut samples = samples;
        samples.resize(session.block, 0);
        Ok(AudioFrame {
            samples,
            sample_rate: 0,
            channels: 1,
        })
    }

    fn capture_close(&self, _handle: CaptureHandle) {
        *self.capture.lock().unwrap() = None;
    }

    fn stream_start(&self, rate: u32, channels: u16) -> RccResult<()> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| RccError::AudioDevice("no output audio device available".into()))?;

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let buffer_cb = Arc::clone(&buffer);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = buffer_cb.lock().unwrap();
                    for sample in data.iter_mut() {
                        let s = queue.pop_front().unwrap_or(0);
                        *sample = f32::from(s) / f32::from(i16::MAX);
                    }
                },
                |err| log::warn!("[AudioIO] playback stream error: {err}"),
                None,
            )
            .map_err(|e| RccError::AudioDevice(format!("build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| RccError::AudioDevice(format!("play output stream: {e}")))?;

        *self.playback.lock().unwrap() = Some(PlaybackSession {
            _stream: SendSyncStream(stream),
            buffer,
        });
        Ok(())
    }

    fn stream_enqueue(&self, frame: AudioFrame) {
        if let Some(session) = self.playback.lock().unwrap().as_ref() {
            session.buffer.lock().unwrap().extend(frame.samples);
        }
    }

    fn stream_stop(&self) {
        *self.playback.lock().unwrap() = None;
    }

    fn play_pcm(&self, samples: &[i16], rate: u32, channels: u16) -> RccResult<()> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| RccError::AudioDevice("no output audio device available".into()))?;

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::new(Mutex::new(VecDeque::from(samples.to_vec())));
        let buffer_cb = Arc::clone(&buffer);
        let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(samples.len()));
        let remaining_cb = Arc::clone(&remaining);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = buffer_cb.lock().unwrap();
                    for sample in data.iter_mut() {
                        match queue.pop_front() {
                            Some(s) => {
                                *sample = f32::from(s) / f32::from(i16::MAX);
                                remaining_cb.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                            }
                            None => *sample = 0.0,
                        }
                    }
                },
                |err| log::warn!("[AudioIO] one-shot playback stream error: {err}"),
                None,
            )
            .map_err(|e| RccError::AudioDevice(format!("build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| RccError::AudioDevice(format!("play output stream: {e}")))?;

        let frame_duration_ms = 1000.0 / f64::from(rate.max(1));
        let total_ms = (samples.len() as f64 / f64::from(channels.max(1))) * frame_duration_ms;
        std::thread::sleep(Duration::from_millis(total_ms as u64 + 50));
        drop(stream);
        Ok(())
    }
}
