//! Offline test support
//!
//! A scripted [`LoopbackEngine`] that stands in for a real peer connection
//! stack, plus synthetic frames for exercising the snapshot path without a
//! camera.

pub mod loopback;
pub mod synthetic_data;

pub use loopback::{sample_offer, LoopbackEngine, LoopbackScript, LoopbackSession};
pub use synthetic_data::{synthetic_i420_frame, synthetic_video_frame, FramePump};
