//! rtccam signaling server
//!
//! # Usage
//!
//! ```bash
//! # Defaults, or ./rtccam.toml when present
//! cargo run --bin rtccam-server
//!
//! # Explicit config file
//! cargo run --bin rtccam-server -- /etc/rtccam.toml
//!
//! # Override single keys from the environment
//! RTCCAM__SERVER__PORT=9000 RTCCAM__CAPTURE__SOURCE=camera \
//! cargo run --bin rtccam-server --features camera
//! ```

use anyhow::Context;
use rtccam::config::RtcCamConfig;
use rtccam::engine::{MediaEngine, RtcEngine};
use rtccam::media::publisher::H264Publisher;
use rtccam::media::{self, VideoSource};
use rtccam::server::{Router, SignalingServer};
use rtccam::{MediaSessionFactory, SignalingSession, SnapshotBridge};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

fn main() -> anyhow::Result<()> {
    rtccam::init_logging();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(RtcCamConfig::default_path);
    let config = RtcCamConfig::load_from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate().context("invalid configuration")?;

    log::info!("{} {} starting", rtccam::NAME, rtccam::VERSION);

    let engine = Arc::new(RtcEngine::new().context("starting WebRTC engine")?);
    let media_engine: Arc<dyn MediaEngine> = engine.clone();
    let factory = MediaSessionFactory::new(media_engine, &config.negotiation)
        .context("publishing local tracks")?;
    let session = SignalingSession::new(factory, config.negotiation.ice_gathering_timeout());

    let source = Arc::new(VideoSource::new());
    let snapshot = Arc::new(SnapshotBridge::new(config.snapshot.jpeg_quality));
    source.add_sink(snapshot.clone());

    let publisher = Arc::new(
        H264Publisher::start(&engine, config.capture.fps).context("starting H.264 publisher")?,
    );
    source.add_sink(publisher.clone());

    let mut capture = media::capture_from_config(&config.capture).context("creating capture source")?;
    capture
        .start(Arc::clone(&source))
        .context("starting capture")?;

    let router = Router::new(session, snapshot, &config.server, &config.snapshot);
    let mut server = SignalingServer::from_config(&config.server, router)?;

    let (stop_tx, stop_rx) = mpsc::channel();
    let stopping = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if stopping.swap(true, Ordering::SeqCst) {
            log::warn!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        let _ = stop_tx.send(());
    })
    .context("installing Ctrl+C handler")?;

    log::info!("Serving on http://{}, press Ctrl+C to stop", server.local_addr());
    let _ = stop_rx.recv();

    server.shutdown();
    capture.stop();
    publisher.stop();
    log::info!(
        "H.264 publisher dropped {} and skipped {} frames",
        publisher.dropped_frames(),
        publisher.skipped_frames()
    );
    log::info!("Delivered {} frames", source.frames_delivered());
    Ok(())
}
