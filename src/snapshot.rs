//! On-demand still capture from the live video source
//!
//! The bridge is registered as a [`VideoSink`]. A request raises a one-shot
//! flag and blocks; the next frame delivered while the flag is up is copied
//! into the slot and the waiter is woken. Encoding happens on the requesting
//! thread so the delivery thread only pays for a copy, and only when asked.

use crate::errors::SnapshotError;
use crate::media::{convert, VideoSink};
use crate::types::{EncodedImage, Rotation, VideoFrame};
use image::codecs::jpeg::JpegEncoder;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Default)]
struct SnapshotSlot {
    frame: Option<VideoFrame>,
    shutdown: bool,
}

pub struct SnapshotBridge {
    requested: AtomicBool,
    slot: Mutex<SnapshotSlot>,
    cond: Condvar,
    // Serializes requests: at most one outstanding at a time
    request_lock: Mutex<()>,
    jpeg_quality: u8,
    served: AtomicU64,
}

impl SnapshotBridge {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            requested: AtomicBool::new(false),
            slot: Mutex::new(SnapshotSlot::default()),
            cond: Condvar::new(),
            request_lock: Mutex::new(()),
            jpeg_quality: jpeg_quality.clamp(1, 100),
            served: AtomicU64::new(0),
        }
    }

    /// A request is waiting for the next frame
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Snapshots successfully encoded so far
    pub fn snapshots_served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Capture the next delivered frame as a JPEG
    ///
    /// `timeout` covers both waiting behind another request and waiting for
    /// the frame. The request flag is always lowered before returning.
    pub fn request_snapshot(&self, timeout: Duration) -> Result<EncodedImage, SnapshotError> {
        let deadline = Instant::now() + timeout;
        let _turn = self
            .request_lock
            .try_lock_until(deadline)
            .ok_or(SnapshotError::Busy(timeout))?;

        let frame = {
            let mut slot = self.slot.lock();
            if slot.shutdown {
                return Err(SnapshotError::Interrupted);
            }
            slot.frame = None;
            self.requested.store(true, Ordering::Release);

            loop {
                if slot.shutdown {
                    self.requested.store(false, Ordering::Release);
                    return Err(SnapshotError::Interrupted);
                }
                if let Some(frame) = slot.frame.take() {
                    break frame;
                }
                if self.cond.wait_until(&mut slot, deadline).timed_out() && slot.frame.is_none() {
                    self.requested.store(false, Ordering::Release);
                    log::warn!("No frame delivered within {:?} for snapshot", timeout);
                    return Err(SnapshotError::Timeout(timeout));
                }
            }
        };

        log::debug!("Encoding snapshot from frame {}", frame.sequence);
        let image = encode_jpeg(&frame, self.jpeg_quality)?;
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(image)
    }

    /// Release any waiting request with [`SnapshotError::Interrupted`] and
    /// refuse new ones
    pub fn shutdown(&self) {
        let mut slot = self.slot.lock();
        slot.shutdown = true;
        slot.frame = None;
        self.requested.store(false, Ordering::Release);
        self.cond.notify_all();
    }
}

impl VideoSink for SnapshotBridge {
    fn on_frame(&self, frame: &VideoFrame) {
        if !self.requested.load(Ordering::Acquire) {
            return;
        }

        let mut slot = self.slot.lock();
        // Re-check under the lock: a timed-out request lowers the flag first
        if !self.requested.load(Ordering::Acquire) || slot.frame.is_some() {
            return;
        }
        slot.frame = Some(frame.clone());
        self.requested.store(false, Ordering::Release);
        self.cond.notify_one();
    }
}

/// Encode `frame` as a JPEG, applying its rotation
pub fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<EncodedImage, SnapshotError> {
    let rgb = convert::frame_to_rgb(frame).ok_or_else(|| {
        SnapshotError::Encoding(format!(
            "{:?} frame buffer of {} bytes is too short for {}x{}",
            frame.format,
            frame.data.len(),
            frame.width,
            frame.height
        ))
    })?;

    let img = image::RgbImage::from_vec(frame.width, frame.height, rgb)
        .ok_or_else(|| SnapshotError::Encoding("Failed to create image from frame data".to_string()))?;
    let img = match frame.rotation {
        Rotation::None => img,
        Rotation::Deg90 => image::imageops::rotate90(&img),
        Rotation::Deg180 => image::imageops::rotate180(&img),
        Rotation::Deg270 => image::imageops::rotate270(&img),
    };
    let (width, height) = img.dimensions();

    let mut data = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut data, quality.clamp(1, 100));
    img.write_with_encoder(encoder)
        .map_err(|e| SnapshotError::Encoding(e.to_string()))?;

    Ok(EncodedImage {
        data,
        content_type: JPEG_CONTENT_TYPE,
        width,
        height,
    })
}
