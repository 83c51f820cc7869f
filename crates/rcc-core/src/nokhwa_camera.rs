//! `nokhwa`-backed [`CameraDevice`] (C3).
//!
//! One open camera at a time, matching [`CameraSource`](crate::camera::CameraSource)'s
//! single-device ownership model. `nokhwa::Camera` is not `Sync` on every
//! backend; wrapped the same way `cpal::Stream` is wrapped in
//! [`crate::cpal_audio`] — held without being moved across threads after open.

use std::sync::Mutex;

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;

use crate::camera::{CameraDevice, VideoFrame};
use crate::error::{RccError, RccResult};
use crate::utils::now_millis;

struct SendSyncCamera(Camera);
unsafe impl Send for SendSyncCamera {}
unsafe impl Sync for SendSyncCamera {}

/// Opens a system camera by index and decodes frames to BGR24.
pub struct NokhwaCameraDevice {
    inner: Mutex<Option<SendSyncCamera>>,
}

impl Default for NokhwaCameraDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl NokhwaCameraDevice {
    /// Creates a device with no camera open yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl CameraDevice for NokhwaCameraDevice {
    fn open(&self, index: u32) -> RccResult<()> {
        let requested =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
        let camera = Camera::new(CameraIndex::Index(index), requested)
            .map_err(|e| RccError::Camera(format!("open camera {index}: {e}")))?;
        *self.inner.lock().unwrap() = Some(SendSyncCamera(camera));
        let mut guard = self.inner.lock().unwrap();
        if let Some(wrapped) = guard.as_mut() {
            wrapped
                .0
                .open_stream()
                .map_err(|e| RccError::Camera(format!("open stream: {e}")))?;
        }
        Ok(())
    }

    fn read_frame(&self) -> RccResult<VideoFrame> {
        let mut guard = self.inner.lock().unwrap();
        let wrapped = guard
            .as_mut()
            .ok_or_else(|| RccError::Camera("camera not open".into()))?;
        let frame = wrapped
            .0
            .frame()
            .map_err(|e| RccError::Camera(format!("read frame: {e}")))?;
        let decoded = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| RccError::Camera(format!("decode frame: {e}")))?;
        let width = decoded.width();
        let height = decoded.height();
        let rgb = decoded.into_raw();
        let mut bgr = Vec::with_capacity(rgb.len());
        for chunk in rgb.chunks_exact(3) {
            bgr.push(chunk[2]);
            bgr.push(chunk[1]);
            bgr.push(chunk[0]);
        }
        Ok(VideoFrame {
            bgr,
            width,
            height,
            timestamp_ms: now_millis(),
        })
    }

    fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(mut wrapped) = guard.take() {
            let _ = wrapped.0.stop_stream();
        }
    }
}
