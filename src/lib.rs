//! rtccam: single-viewer WebRTC camera source with HTTP signaling
//!
//! A viewer POSTs its SDP offer to the signaling endpoint and gets back an
//! answer that already carries every gathered ICE candidate, so no trickle
//! channel is needed. The same endpoint serves JPEG stills taken from the
//! live capture pipeline.
//!
//! # Features
//! - Blocking offer/answer negotiation with a bounded ICE gathering wait
//! - One live peer session at a time; a new offer supersedes the old one
//! - Bitrate ceilings applied once the viewer connects
//! - On-demand JPEG snapshots from the next captured frame
//! - Synthetic or camera (`camera` feature) capture, H.264 publishing (`h264`)
//!
//! # Usage
//! ```rust,ignore
//! use rtccam::{config::RtcCamConfig, server::{Router, SignalingServer}};
//!
//! let config = RtcCamConfig::load_or_default();
//! let engine = std::sync::Arc::new(rtccam::engine::RtcEngine::new()?);
//! let factory = rtccam::MediaSessionFactory::new(engine, &config.negotiation)?;
//! let session = rtccam::SignalingSession::new(factory, config.negotiation.ice_gathering_timeout());
//! let snapshot = std::sync::Arc::new(rtccam::SnapshotBridge::new(config.snapshot.jpeg_quality));
//! let router = Router::new(session, snapshot, &config.server, &config.snapshot);
//! let server = SignalingServer::from_config(&config.server, router)?;
//! ```
pub mod config;
pub mod engine;
pub mod errors;
pub mod media;
pub mod server;
pub mod signaling;
pub mod snapshot;
pub mod types;

// Testing utilities - scripted engine and synthetic frames for offline testing
pub mod testing;

// Re-exports for convenience
pub use errors::{CaptureError, ConfigError, EngineError, ServerError, SignalingError, SnapshotError};
pub use server::{Router, SignalingServer};
pub use signaling::{MediaSessionFactory, NegotiationBarrier, SignalingSession};
pub use snapshot::SnapshotBridge;
pub use types::{EncodedImage, SessionDescription, VideoFrame};

/// Initialize logging, defaulting to `rtccam=info` when `RUST_LOG` is unset
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("rtccam=info");
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        webrtc: cfg!(feature = "webrtc"),
        h264: cfg!(feature = "h264"),
        camera: cfg!(feature = "camera"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub webrtc: bool,
    pub h264: bool,
    pub camera: bool,
}
