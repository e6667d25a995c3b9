//! Creates negotiation sessions on the media engine and routes their
//! callbacks back into the bridge.

use crate::config::NegotiationConfig;
use crate::engine::{IceServer, MediaEngine, SessionHandle, SessionObserver, SessionRequest, TrackInfo};
use crate::errors::{EngineError, SignalingError};
use crate::signaling::barrier::NegotiationBarrier;
use crate::types::{IceConnectionState, IceGatheringState, MediaKind, SignalingState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Per-kind ceiling issued to outbound senders once the link is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateCaps {
    pub video_kbps: u32,
    pub audio_kbps: u32,
}

impl BitrateCaps {
    pub fn for_kind(&self, kind: MediaKind) -> u32 {
        match kind {
            MediaKind::Video => self.video_kbps,
            MediaKind::Audio => self.audio_kbps,
        }
    }
}

impl From<&NegotiationConfig> for BitrateCaps {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            video_kbps: config.video_max_bitrate_kbps,
            audio_kbps: config.audio_max_bitrate_kbps,
        }
    }
}

/// State one negotiation shares with its engine callbacks
///
/// Each negotiation gets a fresh context, so a late callback from a torn-down
/// session can only touch its own barrier.
pub struct NegotiationContext {
    id: String,
    gathering: NegotiationBarrier,
    handle: Mutex<Option<Weak<dyn SessionHandle>>>,
    caps: BitrateCaps,
    caps_applied: AtomicBool,
    connection: Mutex<IceConnectionState>,
    candidates: AtomicUsize,
}

impl NegotiationContext {
    fn new(caps: BitrateCaps) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            gathering: NegotiationBarrier::new(),
            handle: Mutex::new(None),
            caps,
            caps_applied: AtomicBool::new(false),
            connection: Mutex::new(IceConnectionState::New),
            candidates: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Barrier released when ICE gathering reports complete
    pub fn gathering(&self) -> &NegotiationBarrier {
        &self.gathering
    }

    pub fn connection_state(&self) -> IceConnectionState {
        *self.connection.lock()
    }

    pub fn bitrate_caps_applied(&self) -> bool {
        self.caps_applied.load(Ordering::Acquire)
    }

    pub fn gathered_candidates(&self) -> usize {
        self.candidates.load(Ordering::Relaxed)
    }

    fn attach(&self, handle: &Arc<dyn SessionHandle>) {
        *self.handle.lock() = Some(Arc::downgrade(handle));
    }

    fn detach(&self) {
        self.handle.lock().take();
    }

    /// Issue the per-kind ceiling to every sender, at most once per negotiation.
    /// A connected event that finds no sender ready leaves the caps pending
    /// for the next one.
    fn apply_bitrate_caps(&self) {
        if self.caps_applied.load(Ordering::Acquire) {
            return;
        }
        let handle = self.handle.lock().as_ref().and_then(Weak::upgrade);
        let Some(handle) = handle else {
            log::warn!("Session {} connected without a live handle, skipping bitrate cap", self.id);
            return;
        };

        let senders = handle.senders();
        if senders.is_empty() {
            log::warn!("Session {} has no senders ready for a bitrate cap", self.id);
            return;
        }
        if self.caps_applied.swap(true, Ordering::AcqRel) {
            return;
        }
        for kind in senders {
            let kbps = self.caps.for_kind(kind);
            match handle.set_max_bitrate(kind, kbps) {
                Ok(()) => log::info!("Session {}: {} sender capped at {} kbps", self.id, kind, kbps),
                Err(e) => log::warn!("Session {}: failed to cap {} sender: {}", self.id, kind, e),
            }
        }
    }
}

impl SessionObserver for NegotiationContext {
    fn on_signaling_state_change(&self, state: SignalingState) {
        log::debug!("Session {} signaling state: {:?}", self.id, state);
    }

    fn on_ice_connection_state_change(&self, state: IceConnectionState) {
        log::debug!("Session {} ICE connection state: {:?}", self.id, state);
        *self.connection.lock() = state;
        if state.is_connected() {
            self.apply_bitrate_caps();
        }
    }

    fn on_ice_gathering_state_change(&self, state: IceGatheringState) {
        log::debug!("Session {} ICE gathering state: {:?}", self.id, state);
        if state == IceGatheringState::Complete {
            log::debug!("Session {} gathering complete, notifying", self.id);
            self.gathering.signal();
        }
    }

    fn on_ice_candidate(&self, candidate: &str) {
        self.candidates.fetch_add(1, Ordering::Relaxed);
        log::debug!("Session {} local candidate: {}", self.id, candidate);
    }

    fn on_track(&self, kind: MediaKind, track_id: &str) {
        // Send-only role, remote media is not consumed
        log::debug!("Session {} ignoring remote {} track {}", self.id, kind, track_id);
    }
}

/// A live engine session plus the context its callbacks write into
pub struct MediaSession {
    handle: Arc<dyn SessionHandle>,
    context: Arc<NegotiationContext>,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
}

impl MediaSession {
    pub fn id(&self) -> &str {
        self.context.id()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn handle(&self) -> &Arc<dyn SessionHandle> {
        &self.handle
    }

    pub fn context(&self) -> &Arc<NegotiationContext> {
        &self.context
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the barrier and the engine session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("Session {} already closed", self.id());
            return;
        }
        self.context.gathering.cancel();
        self.context.detach();
        self.handle.close();
        log::info!("Session {} closed", self.id());
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates sessions bound to the published local tracks
pub struct MediaSessionFactory {
    engine: Arc<dyn MediaEngine>,
    tracks: Vec<TrackInfo>,
    ice_servers: Vec<IceServer>,
    caps: BitrateCaps,
}

impl MediaSessionFactory {
    /// Publish the local tracks once; every session created afterwards binds them
    pub fn new(engine: Arc<dyn MediaEngine>, config: &NegotiationConfig) -> Result<Self, EngineError> {
        let tracks = engine.create_local_tracks(&config.stream_id, config.enable_audio)?;
        log::info!(
            "Published {} local track(s) under stream {}",
            tracks.len(),
            config.stream_id
        );

        Ok(Self {
            engine,
            tracks,
            ice_servers: config.ice_servers.clone(),
            caps: BitrateCaps::from(config),
        })
    }

    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    pub fn bitrate_caps(&self) -> BitrateCaps {
        self.caps
    }

    pub fn create_session(&self) -> Result<MediaSession, SignalingError> {
        let context = Arc::new(NegotiationContext::new(self.caps));
        let observer: Arc<dyn SessionObserver> = context.clone();

        let request = SessionRequest {
            ice_servers: &self.ice_servers,
            tracks: &self.tracks,
        };
        let handle = self
            .engine
            .create_session(request, observer)
            .map_err(SignalingError::SessionCreation)?;
        context.attach(&handle);

        log::debug!("Created session {}", context.id());
        Ok(MediaSession {
            handle,
            context,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
        })
    }
}
