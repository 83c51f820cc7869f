//! Filesystem-backed [`AssetLibrary`] (supports C10/C11 warning playback).
//!
//! Loads `.wav` files from a configured assets directory via `hound`, the
//! same crate [`crate::reassembly`] uses for debug WAV dumps.

use std::path::{Path, PathBuf};

use crate::audio_io::AssetLibrary;
use crate::error::{RccError, RccResult};

/// Resolves asset names to `<assets_dir>/<name>`, decoding via `hound`.
pub struct WavAssetLibrary {
    assets_dir: PathBuf,
}

impl WavAssetLibrary {
    /// Creates a library rooted at `assets_dir`.
    #[must_use]
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
        }
    }
}

impl AssetLibrary for WavAssetLibrary {
    fn load(&self, name: &str) -> RccResult<(Vec<i16>, u32, u16)> {
        let path: &Path = &self.assets_dir.join(name);
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| RccError::AudioDevice(format!("open asset {name}: {e}")))?;
        let spec = reader.spec();
        let samples: Result<Vec<i16>, _> = match spec.sample_format {
            hound::SampleFormat::Int => reader.samples::<i16>().collect(),
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect(),
        };
        let samples =
            samples.map_err(|e| RccError::AudioDevice(format!("decode asset {name}: {e}")))?;
        Ok((samples, spec.sample_rate, spec.channels))
    }
}
