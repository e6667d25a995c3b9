//! Moving test pattern capture, used when no camera is attached

use crate::config::CaptureConfig;
use crate::errors::CaptureError;
use crate::media::{CaptureSource, VideoSource};
use crate::types::{PixelFormat, Rotation, VideoFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// RGB gradient that shifts with every frame so consecutive frames differ
pub fn pattern_frame(sequence: u64, width: u32, height: u32) -> VideoFrame {
    let mut data = vec![0u8; (width * height * 3) as usize];

    let base = (sequence % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            data[idx] = base.wrapping_add((x % 256) as u8);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base.wrapping_add(((x + y) % 256) as u8);
        }
    }

    VideoFrame::new(data, width, height, PixelFormat::Rgb24).with_sequence(sequence)
}

pub struct SyntheticCapture {
    width: u32,
    height: u32,
    interval: Duration,
    rotation: Rotation,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            rotation: Rotation::None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        let [width, height] = config.resolution;
        let mut capture = Self::new(width, height, config.fps);
        capture.rotation = config.rotation();
        capture
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }
}

impl CaptureSource for SyntheticCapture {
    fn start(&mut self, target: Arc<VideoSource>) -> Result<(), CaptureError> {
        if self.thread.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }
        self.stop_flag.store(false, Ordering::Relaxed);

        let stop_flag = Arc::clone(&self.stop_flag);
        let (width, height, interval, rotation) = (self.width, self.height, self.interval, self.rotation);
        let handle = std::thread::Builder::new()
            .name("rtccam-synthetic-capture".to_string())
            .spawn(move || {
                let mut sequence = 0u64;
                let mut next = Instant::now();
                while !stop_flag.load(Ordering::Relaxed) {
                    let frame = pattern_frame(sequence, width, height).with_rotation(rotation);
                    target.deliver(&frame);
                    sequence += 1;

                    next += interval;
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
                log::debug!("Synthetic capture stopped after {} frames", sequence);
            })?;

        log::info!(
            "Synthetic capture started at {}x{}, {:.1} fps",
            self.width,
            self.height,
            1.0 / self.interval.as_secs_f64()
        );
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::warn!("Synthetic capture thread panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VideoSink;
    use parking_lot::Mutex;

    #[test]
    fn test_pattern_frame_size() {
        let frame = pattern_frame(0, 64, 48);
        assert_eq!(frame.data.len(), 64 * 48 * 3);
        assert!(frame.is_well_formed());
    }

    #[test]
    fn test_pattern_frames_differ() {
        let a = pattern_frame(0, 32, 24);
        let b = pattern_frame(1, 32, 24);
        assert_ne!(a.data[0], b.data[0]);
    }

    #[derive(Default)]
    struct Counter(Mutex<Vec<VideoFrame>>);

    impl VideoSink for Counter {
        fn on_frame(&self, frame: &VideoFrame) {
            self.0.lock().push(frame.clone());
        }
    }

    #[test]
    fn test_capture_delivers_until_stopped() {
        let source = Arc::new(VideoSource::new());
        let counter = Arc::new(Counter::default());
        source.add_sink(counter.clone());

        let mut capture = SyntheticCapture::new(16, 16, 100).with_rotation(Rotation::Deg90);
        capture.start(Arc::clone(&source)).unwrap();
        assert!(matches!(
            capture.start(Arc::clone(&source)),
            Err(CaptureError::AlreadyStarted)
        ));
        std::thread::sleep(Duration::from_millis(100));
        capture.stop();
        assert!(!capture.is_running());

        let frames = counter.0.lock();
        assert!(!frames.is_empty());
        assert_eq!(frames[0].rotation, Rotation::Deg90);
        let delivered = source.frames_delivered();
        drop(frames);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(source.frames_delivered(), delivered);
    }
}
