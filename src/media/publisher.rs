//! H.264 publishing onto the WebRTC video track
//!
//! Frames are copied off the delivery thread into a two-slot queue and
//! encoded on a dedicated thread. When the queue is full the frame is
//! dropped. The negotiated video ceiling is enforced by skipping encoder
//! input once the current one-second window has used its bit budget, which
//! lowers the frame rate without breaking the reference chain.

use crate::engine::rtc::{RtcEngine, SenderCaps};
use crate::errors::CaptureError;
use crate::media::{convert, VideoSink};
use crate::types::{MediaKind, VideoFrame};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const WINDOW: Duration = Duration::from_secs(1);

/// Frames waiting for the encoder; anything beyond this is dropped
const MAX_QUEUED_FRAMES: usize = 2;

/// Per-second bit budget derived from the current ceiling
#[derive(Debug)]
struct BitrateGovernor {
    window_start: Instant,
    bits_in_window: u64,
}

impl BitrateGovernor {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            bits_in_window: 0,
        }
    }

    /// Whether another frame may be encoded under `cap_kbps`
    fn admit(&mut self, cap_kbps: Option<u32>, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.bits_in_window = 0;
        }
        match cap_kbps {
            None => true,
            Some(kbps) => self.bits_in_window < u64::from(kbps) * 1000,
        }
    }

    fn record(&mut self, bytes: usize) {
        self.bits_in_window += bytes as u64 * 8;
    }
}

struct EncodeLoop {
    track: Arc<TrackLocalStaticSample>,
    runtime: tokio::runtime::Handle,
    caps: Arc<SenderCaps>,
    frame_interval: Duration,
    skipped: Arc<AtomicU64>,
}

impl EncodeLoop {
    fn run(self, frames: Receiver<VideoFrame>) {
        let mut encoder = match Encoder::new() {
            Ok(encoder) => encoder,
            Err(e) => {
                log::error!("Failed to create H.264 encoder: {}", e);
                return;
            }
        };
        let mut governor = BitrateGovernor::new(Instant::now());
        let mut last_write: Option<Instant> = None;
        let mut encoded = 0u64;

        while let Ok(frame) = frames.recv() {
            let now = Instant::now();
            if !governor.admit(self.caps.get(MediaKind::Video), now) {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if frame.width % 2 != 0 || frame.height % 2 != 0 {
                log::warn!("Skipping {}x{} frame, H.264 needs even dimensions", frame.width, frame.height);
                continue;
            }
            let Some(yuv) = convert::frame_to_i420(&frame) else {
                log::warn!("Skipping malformed frame {}", frame.sequence);
                continue;
            };

            let yuv_buffer = YUVBuffer::from_vec(yuv, frame.width as usize, frame.height as usize);
            let bitstream = match encoder.encode(&yuv_buffer) {
                Ok(bitstream) => bitstream,
                Err(e) => {
                    log::warn!("H.264 encoding failed: {}", e);
                    continue;
                }
            };
            if encoded == 0 && !matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I) {
                log::debug!("First encoded frame is not a keyframe");
            }
            let data = bitstream.to_vec();
            if data.is_empty() {
                continue;
            }
            governor.record(data.len());

            let duration = last_write.map_or(self.frame_interval, |t| now.duration_since(t));
            last_write = Some(now);
            let sample = Sample {
                data: bytes::Bytes::from(data),
                duration,
                ..Default::default()
            };
            if let Err(e) = self.runtime.block_on(self.track.write_sample(&sample)) {
                log::warn!("Failed to write video sample: {}", e);
            }
            encoded += 1;
        }
        log::debug!("H.264 publisher stopped after {} frames", encoded);
    }
}

/// Bounded hand-off from the delivery thread to the encoder
struct FrameQueue {
    tx: Mutex<Option<Sender<VideoFrame>>>,
    dropped: AtomicU64,
}

impl FrameQueue {
    fn new(tx: Sender<VideoFrame>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a copy of `frame` without blocking. Returns false if it was dropped.
    fn offer(&self, frame: &VideoFrame) -> bool {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("H.264 publisher is no longer running");
                false
            }
        }
    }

    /// Disconnect the encoder so its receive loop ends
    fn close(&self) {
        self.tx.lock().take();
    }
}

/// Encodes delivered frames and writes them to the engine's video track
pub struct H264Publisher {
    frames: FrameQueue,
    worker: Mutex<Option<JoinHandle<()>>>,
    skipped: Arc<AtomicU64>,
}

impl H264Publisher {
    /// Start encoding for `engine`'s published video track
    pub fn start(engine: &RtcEngine, fps: u32) -> Result<Self, CaptureError> {
        let track = engine
            .video_track()
            .ok_or_else(|| CaptureError::Initialization("video track has not been published".to_string()))?;

        let skipped = Arc::new(AtomicU64::new(0));
        let encode_loop = EncodeLoop {
            track,
            runtime: engine.runtime_handle(),
            caps: engine.sender_caps(),
            frame_interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            skipped: Arc::clone(&skipped),
        };

        let (tx, rx) = crossbeam_channel::bounded(MAX_QUEUED_FRAMES);
        let worker = std::thread::Builder::new()
            .name("rtccam-h264".to_string())
            .spawn(move || encode_loop.run(rx))?;

        log::info!("H.264 publisher started");
        Ok(Self {
            frames: FrameQueue::new(tx),
            worker: Mutex::new(Some(worker)),
            skipped,
        })
    }

    /// Frames dropped because the encoder was busy
    pub fn dropped_frames(&self) -> u64 {
        self.frames.dropped.load(Ordering::Relaxed)
    }

    /// Frames not encoded to stay under the bitrate ceiling
    pub fn skipped_frames(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.frames.close();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::warn!("H.264 publisher thread panicked");
            }
        }
    }
}

impl VideoSink for H264Publisher {
    fn on_frame(&self, frame: &VideoFrame) {
        self.frames.offer(frame);
    }
}

impl Drop for H264Publisher {
    fn drop(&mut self) {
        self.stop();
    }
}
