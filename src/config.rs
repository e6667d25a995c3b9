//! Configuration management for rtccam
//!
//! Provides loading, saving and validation of the signaling endpoint,
//! negotiation, snapshot and capture settings. Files are TOML; any key can be
//! overridden from the environment as `RTCCAM__<SECTION>__<KEY>`.

use crate::engine::IceServer;
use crate::errors::ConfigError;
use crate::types::Rotation;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcCamConfig {
    pub server: ServerConfig,
    pub negotiation: NegotiationConfig,
    pub snapshot: SnapshotConfig,
    pub capture: CaptureConfig,
}

/// HTTP signaling endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_address: String,
    /// Plaintext HTTP port
    pub port: u16,
    /// Number of request-handling threads
    pub workers: usize,
    /// Paths accepting SDP offers
    pub offer_paths: Vec<String>,
    /// Path serving JPEG snapshots
    pub snapshot_path: String,
}

/// Offer/answer negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// STUN/TURN servers handed to every new session
    pub ice_servers: Vec<IceServer>,
    /// Upper bound on the ICE gathering wait, 0 waits indefinitely
    pub ice_gathering_timeout_ms: u64,
    /// Media stream id grouping the published tracks
    pub stream_id: String,
    /// Ceiling applied to the video sender once connected (kbps)
    pub video_max_bitrate_kbps: u32,
    /// Ceiling applied to the audio sender once connected (kbps)
    pub audio_max_bitrate_kbps: u32,
    /// Publish an audio track next to the video track. Off by default since
    /// no capture source produces audio.
    pub enable_audio: bool,
}

/// Still snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// How long a request waits for the next frame
    pub timeout_ms: u64,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSourceKind {
    Synthetic,
    Camera,
}

/// Capture pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: CaptureSourceKind,
    /// Camera index for the `camera` source
    pub device_index: u32,
    /// Capture resolution [width, height]
    pub resolution: [u32; 2],
    /// Frames per second
    pub fps: u32,
    /// Clockwise rotation in degrees (0, 90, 180, 270)
    pub rotation: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            workers: 4,
            offer_paths: vec!["/".to_string(), "/webrtc".to_string(), "/webcam".to_string()],
            snapshot_path: "/snapshot".to_string(),
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            ice_gathering_timeout_ms: 10_000,
            stream_id: "rtccam".to_string(),
            video_max_bitrate_kbps: 4000,
            audio_max_bitrate_kbps: 64,
            enable_audio: false,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            jpeg_quality: 90,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: CaptureSourceKind::Synthetic,
            device_index: 0,
            resolution: [1920, 1080],
            fps: 30,
            rotation: 0,
        }
    }
}

impl ServerConfig {
    /// Socket address built from `bind_address` and `port`
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("Invalid bind address: {}", e)))
    }
}

impl NegotiationConfig {
    /// `None` means wait for gathering without bound
    pub fn ice_gathering_timeout(&self) -> Option<Duration> {
        match self.ice_gathering_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl SnapshotConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CaptureConfig {
    pub fn rotation(&self) -> Rotation {
        Rotation::from_degrees(self.rotation).unwrap_or_default()
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

impl RtcCamConfig {
    /// Load configuration from a TOML file, layered under environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
        }

        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix("RTCCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RtcCamConfig = settings.try_deserialize()?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("rtccam.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        // Server
        if self.server.port == 0 {
            return invalid("Port must be non-zero");
        }
        if self.server.workers == 0 {
            return invalid("At least one HTTP worker is required");
        }
        self.server.socket_addr()?;
        if self.server.offer_paths.is_empty() {
            return invalid("At least one offer path is required");
        }
        let all_paths = self
            .server
            .offer_paths
            .iter()
            .chain(std::iter::once(&self.server.snapshot_path));
        for path in all_paths {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "Path {:?} must start with '/'",
                    path
                )));
            }
        }
        if self.server.offer_paths.contains(&self.server.snapshot_path) {
            return invalid("Snapshot path must differ from the offer paths");
        }

        // Negotiation
        if self.negotiation.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return invalid("ICE server entries need at least one URL");
        }
        if self.negotiation.video_max_bitrate_kbps == 0 || self.negotiation.audio_max_bitrate_kbps == 0 {
            return invalid("Bitrate ceilings must be non-zero");
        }
        if self.negotiation.stream_id.is_empty() {
            return invalid("Stream id must not be empty");
        }

        // Snapshot
        if self.snapshot.timeout_ms == 0 {
            return invalid("Snapshot timeout must be non-zero");
        }
        if self.snapshot.jpeg_quality == 0 || self.snapshot.jpeg_quality > 100 {
            return invalid("JPEG quality must be between 1 and 100");
        }

        // Capture
        if self.capture.resolution[0] == 0 || self.capture.resolution[1] == 0 {
            return invalid("Invalid capture resolution");
        }
        if self.capture.fps == 0 || self.capture.fps > 240 {
            return invalid("Invalid capture FPS (must be 1-240)");
        }
        if Rotation::from_degrees(self.capture.rotation).is_none() {
            return invalid("Rotation must be 0, 90, 180 or 270");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RtcCamConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.snapshot.timeout_ms, 2000);
        assert_eq!(
            config.negotiation.ice_servers[0].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
        assert!(config.negotiation.video_max_bitrate_kbps > config.negotiation.audio_max_bitrate_kbps);
        // Nothing feeds an audio track yet
        assert!(!config.negotiation.enable_audio);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut bad = RtcCamConfig::default();
        bad.server.port = 0;
        assert!(bad.validate().is_err());

        let mut bad = RtcCamConfig::default();
        bad.server.offer_paths = vec!["webrtc".to_string()];
        assert!(bad.validate().is_err());

        let mut bad = RtcCamConfig::default();
        bad.server.snapshot_path = "/webrtc".to_string();
        assert!(bad.validate().is_err());

        let mut bad = RtcCamConfig::default();
        bad.snapshot.jpeg_quality = 0;
        assert!(bad.validate().is_err());

        let mut bad = RtcCamConfig::default();
        bad.capture.rotation = 45;
        assert!(bad.validate().is_err());

        let mut bad = RtcCamConfig::default();
        bad.negotiation.ice_servers.push(IceServer {
            urls: vec![],
            username: None,
            credential: None,
        });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_ice_timeout_zero_means_unbounded() {
        let mut config = RtcCamConfig::default();
        assert_eq!(
            config.negotiation.ice_gathering_timeout(),
            Some(Duration::from_secs(10))
        );
        config.negotiation.ice_gathering_timeout_ms = 0;
        assert_eq!(config.negotiation.ice_gathering_timeout(), None);
    }

    #[test]
    fn test_config_toml_format() {
        let config = RtcCamConfig::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[server]"));
        assert!(toml_string.contains("[negotiation]"));
        assert!(toml_string.contains("[snapshot]"));
        assert!(toml_string.contains("[capture]"));
        assert!(toml_string.contains("ice_gathering_timeout_ms"));
        assert!(toml_string.contains("source = \"synthetic\""));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = RtcCamConfig::load_from_file("nonexistent_rtccam_file.toml");
        assert!(result.is_ok());
        assert_eq!(result.unwrap().server.snapshot_path, "/snapshot");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rtccam.toml");

        let mut config = RtcCamConfig::default();
        config.server.port = 9443;
        config.capture.rotation = 180;
        config.negotiation.ice_servers.push(IceServer {
            urls: vec!["turn:turn.example.net:3478".to_string()],
            username: Some("cam".to_string()),
            credential: Some("secret".to_string()),
        });
        config.save_to_file(&path).unwrap();

        let loaded = RtcCamConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.server.port, 9443);
        assert_eq!(loaded.capture.rotation(), Rotation::Deg180);
        assert_eq!(loaded.negotiation.ice_servers, config.negotiation.ice_servers);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[server]\nport = 9090\n").unwrap();

        let loaded = RtcCamConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.server.port, 9090);
        assert_eq!(loaded.server.workers, 4);
        assert_eq!(loaded.negotiation.stream_id, "rtccam");
    }
}
