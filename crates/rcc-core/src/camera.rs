//! Camera (C3): background capture into a single-slot latest-frame buffer.
//!
//! A background task owns the capture device and reads frames continuously;
//! readers take a snapshot of the latest frame without blocking the capture
//! loop. After `max_consecutive_failures` read failures in a row the handle
//! is released and reopened after `reopen_delay`. Grounded on the Camera
//! component design note; uses `nokhwa` for the capture device the way
//! `other_examples/...eyecam_net-src-lib.rs.rs` wires a capture loop into a
//! latest-frame buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::RccResult;
use crate::runtime::TaskSpawner;

/// A single captured video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw BGR24 pixel data, row-major.
    pub bgr: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Monotonic capture timestamp in milliseconds.
    pub timestamp_ms: u64,
}

/// Abstraction over a camera capture device.
pub trait CameraDevice: Send + Sync {
    /// Opens the device at `index`.
    fn open(&self, index: u32) -> RccResult<()>;
    /// Reads the next frame. Returns an error on transient failure.
    fn read_frame(&self) -> RccResult<VideoFrame>;
    /// Releases the device. Idempotent.
    fn close(&self);
}

/// Background capture loop feeding a single-slot latest-frame buffer.
pub struct CameraSource {
    device: Arc<dyn CameraDevice>,
    index: u32,
    latest: Arc<RwLock<Option<VideoFrame>>>,
    max_consecutive_failures: u32,
    reopen_delay: Duration,
    running: Arc<AtomicBool>,
}

impl CameraSource {
    /// Creates a camera source. Call [`CameraSource::start`] to begin
    /// capturing in the background.
    #[must_use]
    pub fn new(device: Arc<dyn CameraDevice>, index: u32) -> Self {
        Self {
            device,
            index,
            latest: Arc::new(RwLock::new(None)),
            max_consecutive_failures: 10,
            reopen_delay: Duration::from_secs(2),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overrides the consecutive-failure threshold before reopening.
    #[must_use]
    pub fn with_max_consecutive_failures(mut self, n: u32) -> Self {
        self.max_consecutive_failures = n;
        self
    }

    /// Overrides the delay before reopening after the device is released.
    #[must_use]
    pub fn with_reopen_delay(mut self, delay: Duration) -> Self {
        self.reopen_delay = delay;
        self
    }

    /// Returns the most recently captured frame, or `None` if capture has
    /// not produced one yet.
    #[must_use]
    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.latest.read().clone()
    }

    /// Starts the background capture loop on the given spawner.
    pub fn start(&self, spawner: &dyn TaskSpawner) {
        self.running.store(true, Ordering::SeqCst);
        let device = Arc::clone(&self.device);
        let latest = Arc::clone(&self.latest);
        let running = Arc::clone(&self.running);
        let index = self.index;
        let max_failures = self.max_consecutive_failures;
        let reopen_delay = self.reopen_delay;

        spawner.spawn(async move {
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = device.open(index) {
                    log::warn!("[Camera] open failed: {e}");
                    tokio::time::sleep(reopen_delay).await;
                    continue;
                }

                let mut consecutive_failures = 0u32;
                while running.load(Ordering::SeqCst) {
                    match device.read_frame() {
                        Ok(frame) => {
                            consecutive_failures = 0;
                            *latest.write() = Some(frame);
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            log::warn!(
                                "[Camera] read_frame failed ({consecutive_failures}/{max_failures}): {e}"
                            );
                            if consecutive_failures >= max_failures {
                                break;
                            }
                        }
                    }
                }

                device.close();
                if running.load(Ordering::SeqCst) {
                    tokio::time::sleep(reopen_delay).await;
                }
            }
        });
    }

    /// Signals the background loop to stop after its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Resizes a BGR24 buffer to `target_width`×`target_height` using nearest-
/// neighbor sampling, then returns it as RGB24.
///
/// Used by the WebRTC video track to convert camera frames (BGR, native
/// resolution) to the outbound track's expected RGB 640×480 format.
#[must_use]
pub fn bgr_to_rgb_resized(
    frame: &VideoFrame,
    target_width: u32,
    target_height: u32,
) -> Vec<u8> {
    let mut out = vec![0u8; (target_width * target_height * 3) as usize];
    if frame.width == 0 || frame.height == 0 {
        return out;
    }
    for ty in 0..target_height {
        let sy = ty * frame.height / target_height;
        for tx in 0..target_width {
            let sx = tx * frame.width / target_width;
            let src_idx = ((sy * frame.width + sx) * 3) as usize;
            let dst_idx = ((ty * target_width + tx) * 3) as usize;
            if src_idx + 2 < frame.bgr.len() && dst_idx + 2 < out.len() {
                out[dst_idx] = frame.bgr[src_idx + 2]; // R <- B
                out[dst_idx + 1] = frame.bgr[src_idx + 1]; // G
                out[dst_idx + 2] = frame.bgr[src_idx]; // B <- R
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    struct FlakyDevice {
        opens: AtomicU32,
        reads: AtomicU32,
        fail_after: u32,
        log: StdMutex<Vec<&'static str>>,
    }

    impl CameraDevice for FlakyDevice {
        fn open(&self, _index: u32) -> RccResult<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push("open");
            Ok(())
        }

        fn read_frame(&self) -> RccResult<VideoFrame> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_after {
                return Err(crate::error::RccError::Camera("no frame".into()));
            }
            Ok(VideoFrame {
                bgr: vec![0; 12],
                width: 2,
                height: 2,
                timestamp_ms: u64::from(n),
            })
        }

        fn close(&self) {
            self.log.lock().unwrap().push("close");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn camera_source_reopens_after_consecutive_failures() {
        let device = Arc::new(FlakyDevice {
            opens: AtomicU32::new(0),
            reads: AtomicU32::new(0),
            fail_after: 2,
            log: StdMutex::new(Vec::new()),
        });
        let source = CameraSource::new(device.clone(), 0)
            .with_max_consecutive_failures(2)
            .with_reopen_delay(Duration::from_millis(10));

        let spawner = crate::runtime::TokioSpawner::current();
        source.start(&spawner);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(source.latest_frame().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        source.stop();
        assert!(device.opens.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn bgr_to_rgb_resized_swaps_channel_order() {
        let frame = VideoFrame {
            bgr: vec![10, 20, 30, 10, 20, 30, 10, 20, 30, 10, 20, 30],
            width: 2,
            height: 2,
            timestamp_ms: 0,
        };
        let rgb = bgr_to_rgb_resized(&frame, 2, 2);
        assert_eq!(&rgb[0..3], &[30, 20, 10]);
    }
}
