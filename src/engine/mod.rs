//! Media engine collaborator interface
//!
//! The signaling bridge never talks to ICE, DTLS or RTP directly. It drives a
//! [`MediaEngine`] that owns the published local tracks and hands out one
//! [`SessionHandle`] per negotiation. Engine events come back through a
//! [`SessionObserver`], usually on a thread owned by the engine.

#[cfg(feature = "webrtc")]
pub mod rtc;

use crate::errors::EngineError;
use crate::types::{
    IceConnectionState, IceGatheringState, MediaKind, SessionDescription, SignalingState,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[cfg(feature = "webrtc")]
pub use rtc::RtcEngine;

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// A local track published by the engine, shared by every session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
}

/// What a new session is created with
#[derive(Debug, Clone, Copy)]
pub struct SessionRequest<'a> {
    pub ice_servers: &'a [IceServer],
    pub tracks: &'a [TrackInfo],
}

/// Real-time media engine
pub trait MediaEngine: Send + Sync {
    /// Publish the local tracks under `stream_id`. Repeated calls return the
    /// same tracks.
    fn create_local_tracks(
        &self,
        stream_id: &str,
        with_audio: bool,
    ) -> Result<Vec<TrackInfo>, EngineError>;

    /// Allocate a session bound to `request.tracks`. The observer receives
    /// every event of that session and nothing else.
    fn create_session(
        &self,
        request: SessionRequest<'_>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Arc<dyn SessionHandle>, EngineError>;
}

/// One peer connection negotiation owned by the engine
///
/// The description calls block until the engine has finished the step.
/// `senders`, `set_max_bitrate` and `ice_gathering_state` may be called from
/// inside an observer callback and must not wait on engine work.
pub trait SessionHandle: Send + Sync {
    fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), EngineError>;

    fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Installing the local description starts ICE gathering
    fn set_local_description(&self, desc: &SessionDescription) -> Result<(), EngineError>;

    /// Current local description, including every candidate gathered so far
    fn local_description(&self) -> Option<SessionDescription>;

    fn ice_gathering_state(&self) -> IceGatheringState;

    /// Media kinds of the outbound senders bound to this session
    fn senders(&self) -> Vec<MediaKind>;

    fn set_max_bitrate(&self, kind: MediaKind, kbps: u32) -> Result<(), EngineError>;

    /// Release the session. Closing twice is a no-op.
    fn close(&self);
}

/// Engine callbacks for one session
pub trait SessionObserver: Send + Sync {
    fn on_signaling_state_change(&self, state: SignalingState);

    fn on_ice_connection_state_change(&self, state: IceConnectionState);

    fn on_ice_gathering_state_change(&self, state: IceGatheringState);

    fn on_ice_candidate(&self, candidate: &str);

    /// Remote track announced by the viewer
    fn on_track(&self, kind: MediaKind, track_id: &str);
}
