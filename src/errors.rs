use std::time::Duration;
use thiserror::Error;

/// Failure reported by the external media engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Engine initialization error: {0}")]
    Initialization(String),
    #[error("Session allocation error: {0}")]
    SessionAllocation(String),
    #[error("Session description error: {0}")]
    Description(String),
    #[error("Sender error: {0}")]
    Sender(String),
    #[error("Session is closed")]
    Closed,
}

/// Failure of one offer/answer negotiation
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    #[error("Session creation failed: {0}")]
    SessionCreation(#[source] EngineError),
    #[error("Remote description rejected: {0}")]
    RemoteDescriptionRejected(#[source] EngineError),
    #[error("Answer generation failed: {0}")]
    AnswerGeneration(#[source] EngineError),
    #[error("No local description available after ICE gathering")]
    MissingLocalDescription,
    #[error("ICE gathering did not complete within {0:?}")]
    NegotiationTimeout(Duration),
    #[error("Wait for ICE gathering was interrupted")]
    InterruptedWait,
    #[error("Signaling bridge is shut down")]
    Shutdown,
}

impl SignalingError {
    /// HTTP status the signaling endpoint answers with
    pub fn status_code(&self) -> u16 {
        match self {
            SignalingError::MalformedRequest(_) => 400,
            SignalingError::NegotiationTimeout(_) => 504,
            _ => 500,
        }
    }
}

/// Failure of a snapshot request
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("No frame arrived within {0:?}")]
    Timeout(Duration),
    #[error("Snapshot request was interrupted")]
    Interrupted,
    #[error("Another snapshot request did not finish within {0:?}")]
    Busy(Duration),
    #[error("Snapshot encoding error: {0}")]
    Encoding(String),
}

impl SnapshotError {
    /// HTTP status the snapshot endpoint answers with
    pub fn status_code(&self) -> u16 {
        match self {
            SnapshotError::Timeout(_) | SnapshotError::Busy(_) => 504,
            _ => 500,
        }
    }
}

/// Configuration loading, saving and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Failures of the HTTP endpoint itself
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind signaling server to {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Failures of a capture source
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture initialization error: {0}")]
    Initialization(String),
    #[error("Capture source is already running")]
    AlreadyStarted,
    #[error("Failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}
