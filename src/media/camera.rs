//! Camera capture through nokhwa
//!
//! The camera handle lives on its own thread for its whole lifetime; frames
//! arrive on nokhwa's callback thread and are pushed straight into the
//! [`VideoSource`].

use crate::config::CaptureConfig;
use crate::errors::CaptureError;
use crate::media::{CaptureSource, VideoSource};
use crate::types::{PixelFormat, Rotation, VideoFrame};
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution},
    CallbackCamera,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct CameraSettings {
    device_index: u32,
    resolution: [u32; 2],
    fps: u32,
    rotation: Rotation,
}

impl CameraSettings {
    fn open(&self, target: Arc<VideoSource>) -> Result<CallbackCamera, CaptureError> {
        let [width, height] = self.resolution;
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
            Resolution::new(width, height),
            FrameFormat::MJPEG,
            self.fps,
        )));

        let rotation = self.rotation;
        let sequence = AtomicU64::new(0);
        let mut camera = CallbackCamera::new(CameraIndex::Index(self.device_index), requested, move |buffer| {
            match buffer.decode_image::<RgbFormat>() {
                Ok(image) => {
                    let (w, h) = (image.width(), image.height());
                    let frame = VideoFrame::new(image.into_raw(), w, h, PixelFormat::Rgb24)
                        .with_sequence(sequence.fetch_add(1, Ordering::Relaxed))
                        .with_rotation(rotation);
                    target.deliver(&frame);
                }
                Err(e) => log::warn!("Dropping undecodable camera frame: {}", e),
            }
        })
        .map_err(|e| CaptureError::Initialization(format!("Failed to initialize camera: {}", e)))?;

        camera
            .open_stream()
            .map_err(|e| CaptureError::Initialization(format!("Failed to start stream: {}", e)))?;
        Ok(camera)
    }
}

pub struct CameraCapture {
    settings: CameraSettings,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CameraCapture {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            settings: CameraSettings {
                device_index: config.device_index,
                resolution: config.resolution,
                fps: config.fps,
                rotation: config.rotation(),
            },
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl CaptureSource for CameraCapture {
    fn start(&mut self, target: Arc<VideoSource>) -> Result<(), CaptureError> {
        if self.thread.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }
        self.stop_flag.store(false, Ordering::Relaxed);

        let (ready_tx, ready_rx) = mpsc::channel();
        let stop_flag = Arc::clone(&self.stop_flag);
        let settings = self.settings;
        let handle = std::thread::Builder::new()
            .name("rtccam-camera".to_string())
            .spawn(move || {
                let mut camera = match settings.open(target) {
                    Ok(camera) => {
                        let _ = ready_tx.send(Ok(()));
                        camera
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !stop_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                if let Err(e) = camera.stop_stream() {
                    log::warn!("Failed to stop camera stream: {}", e);
                }
            })?;

        let ready = ready_rx
            .recv()
            .map_err(|_| CaptureError::Initialization("camera thread exited during startup".to_string()))
            .and_then(|result| result);
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        log::info!(
            "Camera {} streaming at {}x{}, {} fps",
            self.settings.device_index,
            self.settings.resolution[0],
            self.settings.resolution[1],
            self.settings.fps
        );
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::warn!("Camera thread panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
