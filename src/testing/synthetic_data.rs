//! Synthetic frames and frame pumps for offline tests and benchmarks

use crate::media::convert::rgb_to_i420;
use crate::media::synthetic::pattern_frame;
use crate::media::VideoSource;
use crate::types::{PixelFormat, VideoFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Packed RGB gradient frame that changes with `frame_number`
pub fn synthetic_video_frame(frame_number: u64, width: u32, height: u32) -> VideoFrame {
    pattern_frame(frame_number, width, height)
}

/// Same pattern as [`synthetic_video_frame`], in I420 layout
pub fn synthetic_i420_frame(frame_number: u64, width: u32, height: u32) -> VideoFrame {
    let rgb = pattern_frame(frame_number, width, height);
    VideoFrame::new(rgb_to_i420(&rgb.data, width, height), width, height, PixelFormat::I420)
        .with_sequence(frame_number)
}

/// Delivers synthetic frames into a [`VideoSource`] from a background thread
/// until dropped
pub struct FramePump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FramePump {
    /// Start after `initial_delay`, then deliver one frame every `interval`
    pub fn start(source: Arc<VideoSource>, width: u32, height: u32, initial_delay: Duration, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(initial_delay);
            let mut sequence = 0;
            while !flag.load(Ordering::Relaxed) {
                source.deliver(&synthetic_video_frame(sequence, width, height));
                sequence += 1;
                std::thread::sleep(interval);
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for FramePump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
