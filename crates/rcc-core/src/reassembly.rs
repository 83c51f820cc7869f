//! Audio Reassembly (C9): reconstitutes playback audio chunked over the
//! broker back into continuous PCM.
//!
//! Grounded on the original source's `handlers.py` chunk-buffering for
//! inbound TTS audio: a per-`stream_id` map from chunk index to bytes, a
//! background sweeper that finalizes stale streams, and debug `.wav`
//! persistence. The sweeper here is a `tokio::time::interval` loop in place
//! of the original's dedicated thread.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;

use crate::audio_io::StreamQueue;
use crate::error::{RccError, RccResult};
use crate::runtime::TaskSpawner;
use crate::utils::now_millis;
use crate::wire::AudioChunkMessage;

/// Streams older than this are finalized with whatever chunks have arrived.
const STREAM_TIMEOUT_MS: u64 = 15_000;
/// Sweeper cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct PendingStream {
    chunks: BTreeMap<u32, Vec<u8>>,
    total_chunks: u32,
    sample_rate: u32,
    first_seen_ms: u64,
    completed: bool,
}

impl PendingStream {
    fn new(total_chunks: u32, sample_rate: u32) -> Self {
        Self {
            chunks: BTreeMap::new(),
            total_chunks,
            sample_rate,
            first_seen_ms: now_millis(),
            completed: false,
        }
    }

    fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.chunks.len() as u32 >= self.total_chunks
    }

    /// Concatenates chunks in index order, logging any gaps.
    fn concatenate(&self, stream_id: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for index in 0..self.total_chunks {
            match self.chunks.get(&index) {
                Some(bytes) => out.extend_from_slice(bytes),
                None => log::warn!(
                    "[Reassembly] stream {stream_id} missing chunk {index}/{}",
                    self.total_chunks
                ),
            }
        }
        out
    }
}

/// Reassembles chunked inbound playback audio and enqueues it to the
/// continuous playback stream.
pub struct ReassemblyStore {
    pending: DashMap<String, PendingStream>,
    playback: Arc<StreamQueue>,
    debug_dump: bool,
    debug_dir: PathBuf,
    running: Arc<AtomicBool>,
}

impl ReassemblyStore {
    /// Creates a store that enqueues completed streams onto `playback`.
    ///
    /// `debug_dump` gates writing a `.wav` copy of every completed stream to
    /// `debug_dir`, mirroring `Config::debug_audio_dump`.
    #[must_use]
    pub fn new(playback: Arc<StreamQueue>, debug_dump: bool, debug_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            playback,
            debug_dump,
            debug_dir,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Starts the background sweeper that finalizes streams idle past
    /// [`STREAM_TIMEOUT_MS`].
    pub fn start_sweeper(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        let store = Arc::clone(self);
        spawner.spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                if !store.running.load(Ordering::SeqCst) {
                    break;
                }
                store.sweep();
            }
        });
    }

    /// Stops the background sweeper.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn sweep(&self) {
        let now = now_millis();
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| !entry.completed && now.saturating_sub(entry.first_seen_ms) >= STREAM_TIMEOUT_MS)
            .map(|entry| entry.key().clone())
            .collect();
        for stream_id in stale {
            self.finalize(&stream_id);
        }
    }

    /// Parses and applies one inbound audio-chunk payload.
    pub async fn handle_chunk_bytes(&self, payload: &[u8]) -> RccResult<()> {
        let message: AudioChunkMessage = serde_json::from_slice(payload)?;
        self.handle_chunk(message)
    }

    fn handle_chunk(&self, message: AudioChunkMessage) -> RccResult<()> {
        let bytes = BASE64
            .decode(message.data.as_bytes())
            .map_err(|e| RccError::InvalidPayload(format!("bad base64 audio chunk: {e}")))?;

        {
            let mut entry = self
                .pending
                .entry(message.server_stream_id.clone())
                .or_insert_with(|| PendingStream::new(message.total_chunks, message.sample_rate));
            entry.chunks.insert(message.chunk_index, bytes);
            if message.total_chunks > 0 {
                entry.total_chunks = message.total_chunks;
            }
        }

        if message.is_last || self.pending.get(&message.server_stream_id).map(|e| e.is_complete()).unwrap_or(false) {
            self.finalize(&message.server_stream_id);
        }
        Ok(())
    }

    fn finalize(&self, stream_id: &str) {
        let Some((_, mut stream)) = self.pending.remove(stream_id) else {
            return;
        };
        if stream.completed {
            return;
        }
        stream.completed = true;

        let bytes = stream.concatenate(stream_id);
        let samples = bytes_to_i16_le(&bytes);
        self.playback.push(&samples);

        if self.debug_dump {
            if let Err(e) = write_debug_wav(&self.debug_dir, &samples, stream.sample_rate) {
                log::warn!("[Reassembly] debug wav write failed for {stream_id}: {e}");
            }
        }
    }
}

fn bytes_to_i16_le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Fixed filename the original overwrites on every completed stream
/// (`debug/audio_response_from_server.wav`), not one file per stream_id.
const DEBUG_WAV_FILENAME: &str = "audio_response_from_server.wav";

fn write_debug_wav(dir: &std::path::Path, samples: &[i16], sample_rate: u32) -> RccResult<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(DEBUG_WAV_FILENAME);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec)
        .map_err(|e| RccError::Fatal(format!("wav create failed: {e}")))?;
    for sample in samples {
        writer
            .write_sample(*sample)
            .map_err(|e| RccError::Fatal(format!("wav write failed: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| RccError::Fatal(format!("wav finalize failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_message(stream_id: &str, index: u32, total: u32, is_last: bool, samples: &[i16]) -> AudioChunkMessage {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        AudioChunkMessage {
            server_stream_id: stream_id.to_string(),
            chunk_index: index,
            total_chunks: total,
            is_last,
            format: "pcm16le".to_string(),
            sample_rate: 16_000,
            data: BASE64.encode(bytes),
        }
    }

    #[test]
    fn finalizes_on_last_chunk_and_enqueues_in_order() {
        let playback = StreamQueue::new();
        let store = ReassemblyStore::new(Arc::clone(&playback), false, PathBuf::from("/tmp"));

        store.handle_chunk(chunk_message("s1", 0, 2, false, &[1, 2, 3])).unwrap();
        assert!(store.pending.contains_key("s1"));
        store.handle_chunk(chunk_message("s1", 1, 2, true, &[4, 5])).unwrap();

        assert!(!store.pending.contains_key("s1"));
        let drained = playback.pull(5);
        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn finalizes_when_received_count_reaches_total_without_is_last_flag() {
        let playback = StreamQueue::new();
        let store = ReassemblyStore::new(Arc::clone(&playback), false, PathBuf::from("/tmp"));

        store.handle_chunk(chunk_message("s2", 0, 2, false, &[9])).unwrap();
        store.handle_chunk(chunk_message("s2", 1, 2, false, &[10])).unwrap();

        assert!(!store.pending.contains_key("s2"));
    }

    #[test]
    fn sweep_finalizes_stale_streams_with_missing_chunks() {
        let playback = StreamQueue::new();
        let store = ReassemblyStore::new(Arc::clone(&playback), false, PathBuf::from("/tmp"));

        store.handle_chunk(chunk_message("s3", 0, 3, false, &[7, 7])).unwrap();
        {
            let mut entry = store.pending.get_mut("s3").unwrap();
            entry.first_seen_ms = 0;
        }
        store.sweep();

        assert!(!store.pending.contains_key("s3"));
        assert_eq!(playback.pull(2), vec![7, 7]);
    }

    #[test]
    fn bytes_to_i16_le_round_trips() {
        let samples: Vec<i16> = vec![-1, 0, 1, 12345];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(bytes_to_i16_le(&bytes), samples);
    }
}
