//! Voice Activity Pipeline (C4): RMS-endpointed utterance capture/upload.
//!
//! The endpointing state machine is ported directly from the original
//! source's `vad.py` `VoiceActivityDetector`: a listening/speaking state
//! transition on an RMS threshold, sustained silence finalizes the
//! utterance, short utterances are discarded. While listening, a 10-chunk
//! FIFO buffer is kept, but it is discarded rather than prepended on the
//! listening-to-speaking transition — the original overwrites
//! `self.audio_buffer` with just the triggering chunk, it does not splice
//! the pre-roll in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine;
use rumqttc::QoS;

use crate::audio_io::{rms_of, AudioEngine};
use crate::broker::BrokerClient;
use crate::config::{Config, VapConfig};
use crate::error::RccResult;
use crate::events::{EventEmitter, VapEvent};
use crate::runtime::TaskSpawner;
use crate::utils::now_millis;
use crate::wire::SttChunkMessage;

const PREROLL_CAPACITY: usize = 10;
const CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Listening,
    Speaking,
}

/// Pure RMS endpointing state machine, decoupled from audio I/O so it can
/// be tested with synthetic chunks and an explicit clock.
pub struct RmsEndpointer {
    config: VapConfig,
    state: EndpointState,
    preroll: VecDeque<Vec<i16>>,
    accumulated: Vec<i16>,
    speech_start_ms: u64,
    silence_start_ms: Option<u64>,
}

/// A finalized utterance ready for chunked publish.
pub struct Utterance {
    /// Concatenated PCM samples spanning the whole utterance, starting at
    /// the chunk that crossed the silence threshold.
    pub samples: Vec<i16>,
}

impl RmsEndpointer {
    /// Creates an endpointer with the given configuration.
    #[must_use]
    pub fn new(config: VapConfig) -> Self {
        Self {
            config,
            state: EndpointState::Listening,
            preroll: VecDeque::with_capacity(PREROLL_CAPACITY),
            accumulated: Vec::new(),
            speech_start_ms: 0,
            silence_start_ms: None,
        }
    }

    /// Feeds one chunk of mono PCM samples at `now_ms`. Returns a finalized
    /// utterance if sustained silence just closed one out.
    pub fn process_chunk(&mut self, chunk: &[i16], now_ms: u64) -> Option<Utterance> {
        let float_chunk: Vec<f32> = chunk
            .iter()
            .map(|&s| f32::from(s) / f32::from(i16::MAX))
            .collect();
        let rms = rms_of(&float_chunk);
        let is_loud = rms > self.config.silence_threshold;

        match self.state {
            EndpointState::Listening => {
                if is_loud {
                    self.state = EndpointState::Speaking;
                    self.speech_start_ms = now_ms;
                    self.silence_start_ms = None;
                    self.accumulated.clear();
                    self.accumulated.extend_from_slice(chunk);
                    self.preroll.clear();
                } else {
                    if self.preroll.len() >= PREROLL_CAPACITY {
                        self.preroll.pop_front();
                    }
                    self.preroll.push_back(chunk.to_vec());
                }
                None
            }
            EndpointState::Speaking => {
                self.accumulated.extend_from_slice(chunk);
                if is_loud {
                    self.silence_start_ms = None;
                    None
                } else {
                    let silence_started = *self.silence_start_ms.get_or_insert(now_ms);
                    let silence_elapsed_secs =
                        (now_ms.saturating_sub(silence_started)) as f32 / 1000.0;
                    if silence_elapsed_secs >= self.config.silence_duration {
                        self.finalize(now_ms)
                    } else {
                        None
                    }
                }
            }
        }
    }

    fn finalize(&mut self, now_ms: u64) -> Option<Utterance> {
        let speech_duration_secs =
            (now_ms.saturating_sub(self.speech_start_ms)) as f32 / 1000.0;
        let samples = std::mem::take(&mut self.accumulated);
        self.state = EndpointState::Listening;
        self.silence_start_ms = None;

        if speech_duration_secs < self.config.min_speech_duration {
            None
        } else {
            Some(Utterance { samples })
        }
    }
}

/// Splits a finalized utterance into fixed-size byte chunks and publishes
/// each as a [`SttChunkMessage`] in index order, at QoS 1.
pub async fn publish_utterance(
    broker: &dyn BrokerClient,
    topic: &str,
    device_id: &str,
    sample_rate: u32,
    utterance: &Utterance,
) -> RccResult<()> {
    let bytes: Vec<u8> = utterance
        .samples
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();
    let chunks: Vec<&[u8]> = bytes.chunks(CHUNK_BYTES).collect();
    let total_chunks = chunks.len().max(1) as u32;
    let stream_id = format!("voice_{}", now_millis());

    if chunks.is_empty() {
        return Ok(());
    }

    for (index, chunk) in chunks.iter().enumerate() {
        let message = SttChunkMessage {
            device_id: device_id.to_string(),
            stream_id: stream_id.clone(),
            chunk_index: index as u32,
            total_chunks,
            is_last: index as u32 + 1 == total_chunks,
            timestamp: now_millis(),
            format: "pcm16le".to_string(),
            sample_rate,
            data: base64::engine::general_purpose::STANDARD.encode(chunk),
        };
        broker
            .publish(topic, serde_json::to_value(&message)?, QoS::AtLeastOnce, false)
            .await?;
    }
    Ok(())
}

/// Owns the microphone and drives the endpointer loop as a background task.
///
/// `pause`/`resume` are the only way to release the microphone for WebRTC,
/// and must fully complete before the call peer opens the device.
pub struct VoiceActivityPipeline {
    audio: Arc<dyn AudioEngine>,
    broker: Arc<dyn BrokerClient>,
    emitter: Arc<dyn EventEmitter>,
    device_id: String,
    topic: String,
    audio_config: crate::config::AudioConfig,
    vap_config: VapConfig,
    running: Arc<AtomicBool>,
}

impl VoiceActivityPipeline {
    /// Creates a pipeline bound to its collaborators. Call [`Self::resume`]
    /// to begin capturing.
    pub fn new(
        audio: Arc<dyn AudioEngine>,
        broker: Arc<dyn BrokerClient>,
        emitter: Arc<dyn EventEmitter>,
        config: &Config,
    ) -> Self {
        Self {
            audio,
            broker,
            emitter,
            device_id: config.device_id.clone(),
            topic: config
                .resolve_topic("audio")
                .unwrap_or_else(|| format!("device/{}/audio", config.device_id)),
            audio_config: config.audio.clone(),
            vap_config: config.vap.clone(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens the microphone and starts the capture/endpoint/publish loop.
    pub fn resume(&self, spawner: &dyn TaskSpawner) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emitter.emit_vap(VapEvent::Resumed {
            timestamp: now_millis(),
        });

        let audio = Arc::clone(&self.audio);
        let broker = Arc::clone(&self.broker);
        let emitter = Arc::clone(&self.emitter);
        let device_id = self.device_id.clone();
        let topic = self.topic.clone();
        let audio_config = self.audio_config.clone();
        let vap_config = self.vap_config.clone();
        let running = Arc::clone(&self.running);

        spawner.spawn(async move {
            let chunk_samples = (audio_config.sample_rate as usize * audio_config.chunk_ms as usize) / 1000;
            let handle = match crate::audio_io::capture_open_with_retry(
                audio.as_ref(),
                audio_config.sample_rate,
                1,
                chunk_samples,
                audio_config.mic_index.map(|i| i.to_string()).as_deref(),
            )
            .await
            {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("[VAP] failed to open microphone: {e}");
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let mut endpointer = RmsEndpointer::new(vap_config);
            let mut speaking_emitted = false;

            while running.load(Ordering::SeqCst) {
                let frame = match audio.capture_read(&handle) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("[VAP] capture_read error: {e}");
                        break;
                    }
                };

                let now = now_millis();
                if let Some(utterance) = endpointer.process_chunk(&frame.samples, now) {
                    speaking_emitted = false;
                    emitter.emit_vap(VapEvent::UtteranceEmitted {
                        stream_id: format!("voice_{now}"),
                        duration_secs: utterance.samples.len() as f32
                            / audio_config.sample_rate as f32,
                        timestamp: now,
                    });
                    if let Err(e) = publish_utterance(
                        broker.as_ref(),
                        &topic,
                        &device_id,
                        audio_config.sample_rate,
                        &utterance,
                    )
                    .await
                    {
                        log::warn!("[VAP] failed to publish utterance: {e}");
                    }
                } else if !speaking_emitted {
                    // A cheap way to surface speech-start without threading
                    // internal endpointer state through the public API.
                    let loud = rms_of(
                        &frame
                            .samples
                            .iter()
                            .map(|&s| f32::from(s) / f32::from(i16::MAX))
                            .collect::<Vec<_>>(),
                    ) > endpointer_threshold(&endpointer);
                    if loud {
                        speaking_emitted = true;
                        emitter.emit_vap(VapEvent::SpeechStarted { timestamp: now });
                    }
                }
            }

            audio.capture_close(handle);
        });
    }

    /// Tears down the capture handle and VAP state, releasing the
    /// microphone for another owner (the WebRTC peer).
    pub fn pause(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.emitter.emit_vap(VapEvent::Paused {
            timestamp: now_millis(),
        });
    }
}

fn endpointer_threshold(endpointer: &RmsEndpointer) -> f32 {
    endpointer.config.silence_threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_chunk(len: usize) -> Vec<i16> {
        vec![10_000; len]
    }

    fn quiet_chunk(len: usize) -> Vec<i16> {
        vec![0; len]
    }

    #[test]
    fn short_utterance_below_min_duration_is_discarded() {
        let mut endpointer = RmsEndpointer::new(VapConfig {
            silence_threshold: 0.1,
            silence_duration: 1.0,
            min_speech_duration: 2.0,
        });

        assert!(endpointer.process_chunk(&loud_chunk(100), 0).is_none());
        let result = endpointer.process_chunk(&quiet_chunk(100), 100);
        assert!(result.is_none());
        let result = endpointer.process_chunk(&quiet_chunk(100), 1_200);
        assert!(result.is_none(), "too short, should be discarded");
    }

    #[test]
    fn sustained_speech_then_silence_emits_utterance() {
        let mut endpointer = RmsEndpointer::new(VapConfig {
            silence_threshold: 0.1,
            silence_duration: 1.0,
            min_speech_duration: 0.1,
        });

        assert!(endpointer.process_chunk(&loud_chunk(100), 0).is_none());
        assert!(endpointer.process_chunk(&loud_chunk(100), 500).is_none());
        assert!(endpointer.process_chunk(&quiet_chunk(100), 600).is_none());
        let result = endpointer.process_chunk(&quiet_chunk(100), 1_700);
        assert!(result.is_some());
    }

    #[test]
    fn preroll_buffer_is_discarded_on_speech_start() {
        let mut endpointer = RmsEndpointer::new(VapConfig {
            silence_threshold: 0.1,
            silence_duration: 0.5,
            min_speech_duration: 0.0,
        });

        // Several quiet chunks fill the pre-roll buffer.
        for t in 0..5 {
            endpointer.process_chunk(&quiet_chunk(10), t * 20);
        }
        endpointer.process_chunk(&loud_chunk(10), 200);
        let result = endpointer.process_chunk(&quiet_chunk(10), 800);
        let utterance = result.expect("utterance should finalize");
        // the loud chunk plus the one trailing quiet chunk, no pre-roll spliced in
        assert_eq!(utterance.samples.len(), 20);
    }

    #[test]
    fn preroll_buffer_caps_at_ten_chunks() {
        let mut endpointer = RmsEndpointer::new(VapConfig {
            silence_threshold: 0.1,
            silence_duration: 0.5,
            min_speech_duration: 0.0,
        });

        for t in 0..20 {
            endpointer.process_chunk(&quiet_chunk(10), t * 20);
        }
        assert_eq!(endpointer.preroll.len(), PREROLL_CAPACITY);
    }

    #[tokio::test]
    async fn publish_utterance_splits_into_chunks_and_marks_last() {
        use crate::events::NoopEventEmitter;
        use std::sync::Mutex as StdMutex;

        struct RecordingBroker {
            published: StdMutex<Vec<(String, serde_json::Value)>>,
        }

        #[async_trait::async_trait]
        impl BrokerClient for RecordingBroker {
            async fn connect(&self) -> RccResult<()> {
                Ok(())
            }
            async fn publish(
                &self,
                topic: &str,
                payload: serde_json::Value,
                _qos: QoS,
                _retain: bool,
            ) -> RccResult<()> {
                self.published
                    .lock()
                    .unwrap()
                    .push((topic.to_string(), payload));
                Ok(())
            }
            fn subscribe(&self, _topic: String, _handler: crate::broker::MessageHandler) {}
            async fn disconnect(&self) {}
        }

        let _ = Arc::new(NoopEventEmitter);
        let broker = RecordingBroker {
            published: StdMutex::new(Vec::new()),
        };

        let utterance = Utterance {
            samples: vec![1i16; 20_000],
        };
        publish_utterance(&broker, "device/x/audio", "device-x", 16_000, &utterance)
            .await
            .unwrap();

        let published = broker.published.lock().unwrap();
        assert!(published.len() > 1, "expected multiple chunks");
        let last = published.last().unwrap();
        assert_eq!(last.1["isLast"], serde_json::Value::Bool(true));
    }
}
