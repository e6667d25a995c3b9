//! Live video frame delivery
//!
//! A [`VideoSource`] stands for the published video track on the capture
//! side. Capture sources push raw frames into it from their own thread and it
//! fans each frame out to every registered [`VideoSink`].

#[cfg(feature = "camera")]
pub mod camera;
pub mod convert;
#[cfg(feature = "h264")]
pub mod publisher;
pub mod synthetic;

use crate::config::{CaptureConfig, CaptureSourceKind};
use crate::errors::CaptureError;
use crate::types::VideoFrame;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use synthetic::SyntheticCapture;

/// Receives every frame the source delivers, on the delivering thread
pub trait VideoSink: Send + Sync {
    fn on_frame(&self, frame: &VideoFrame);
}

/// Registration token returned by [`VideoSource::add_sink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Frame fan-out point between a capture source and its consumers
#[derive(Default)]
pub struct VideoSource {
    sinks: RwLock<Vec<(SinkId, Arc<dyn VideoSink>)>>,
    next_id: AtomicU64,
    delivered: AtomicU64,
}

impl VideoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn VideoSink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.write().push((id, sink));
        log::debug!("Added video sink {:?}", id);
        id
    }

    /// Returns false if the sink was not registered
    pub fn remove_sink(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        let removed = sinks.len() != before;
        if removed {
            log::debug!("Removed video sink {:?}", id);
        }
        removed
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Frames delivered since creation
    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Hand `frame` to every sink in registration order
    pub fn deliver(&self, frame: &VideoFrame) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        for (_, sink) in self.sinks.read().iter() {
            sink.on_frame(frame);
        }
    }
}

/// A running producer of frames
pub trait CaptureSource: Send {
    /// Start pushing frames into `target`
    fn start(&mut self, target: Arc<VideoSource>) -> Result<(), CaptureError>;

    /// Stop producing. Stopping a stopped source is a no-op.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Build the capture source selected in `config`
pub fn capture_from_config(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, CaptureError> {
    match config.source {
        CaptureSourceKind::Synthetic => Ok(Box::new(SyntheticCapture::from_config(config))),
        #[cfg(feature = "camera")]
        CaptureSourceKind::Camera => Ok(Box::new(camera::CameraCapture::from_config(config))),
        #[cfg(not(feature = "camera"))]
        CaptureSourceKind::Camera => Err(CaptureError::Initialization(
            "camera source requested but crate built without the camera feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        sequences: Mutex<Vec<u64>>,
    }

    impl VideoSink for Recorder {
        fn on_frame(&self, frame: &VideoFrame) {
            self.sequences.lock().push(frame.sequence);
        }
    }

    fn frame(sequence: u64) -> VideoFrame {
        VideoFrame::new(vec![0; 12], 2, 2, PixelFormat::Rgb24).with_sequence(sequence)
    }

    #[test]
    fn test_deliver_reaches_every_sink() {
        let source = VideoSource::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        source.add_sink(a.clone());
        source.add_sink(b.clone());

        source.deliver(&frame(1));
        source.deliver(&frame(2));

        assert_eq!(*a.sequences.lock(), vec![1, 2]);
        assert_eq!(*b.sequences.lock(), vec![1, 2]);
        assert_eq!(source.frames_delivered(), 2);
    }

    #[test]
    fn test_removed_sink_stops_receiving() {
        let source = VideoSource::new();
        let sink = Arc::new(Recorder::default());
        let id = source.add_sink(sink.clone());

        source.deliver(&frame(1));
        assert!(source.remove_sink(id));
        assert!(!source.remove_sink(id));
        source.deliver(&frame(2));

        assert_eq!(*sink.sequences.lock(), vec![1]);
        assert_eq!(source.sink_count(), 0);
    }

    #[cfg(not(feature = "camera"))]
    #[test]
    fn test_camera_source_needs_feature() {
        let config = CaptureConfig {
            source: CaptureSourceKind::Camera,
            ..CaptureConfig::default()
        };
        assert!(capture_from_config(&config).is_err());
    }
}
