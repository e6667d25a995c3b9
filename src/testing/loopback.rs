//! Scripted in-process media engine
//!
//! Behaves like a real engine from the bridge's point of view: descriptions
//! are installed synchronously, ICE gathering completes later on a separate
//! thread and appends `a=candidate` lines to the local description, and
//! connectivity can be reported afterwards. Every step can be told to fail.

use crate::engine::{MediaEngine, SessionHandle, SessionObserver, SessionRequest, TrackInfo};
use crate::errors::EngineError;
use crate::types::{
    IceConnectionState, IceGatheringState, MediaKind, SdpType, SessionDescription, SignalingState,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How the loopback engine behaves for sessions created after it is set
#[derive(Debug, Clone)]
pub struct LoopbackScript {
    /// Delay between `set_local_description` and gathering completion
    pub gathering_delay: Duration,
    /// Complete gathering inside `set_local_description`, on the caller's thread
    pub complete_inline: bool,
    /// Gathering starts but never completes
    pub never_complete: bool,
    /// Candidate attributes appended to the local description on completion
    pub candidates: Vec<String>,
    /// Report ICE connected this long after gathering completes
    pub connect_after: Option<Duration>,
    /// Follow the connected report with `Completed`
    pub report_completed: bool,
    /// `senders()` stays empty until just before the `Completed` report
    pub senders_ready_late: bool,
    pub fail_session_creation: bool,
    pub reject_remote_description: bool,
    pub fail_answer: bool,
    /// `local_description()` returns `None` once set
    pub lose_local_description: bool,
}

impl Default for LoopbackScript {
    fn default() -> Self {
        Self {
            gathering_delay: Duration::from_millis(50),
            complete_inline: false,
            never_complete: false,
            candidates: vec![
                "candidate:1 1 udp 2130706431 192.168.1.20 54400 typ host".to_string(),
                "candidate:2 1 udp 1694498815 203.0.113.7 54400 typ srflx raddr 192.168.1.20 rport 54400"
                    .to_string(),
            ],
            connect_after: None,
            report_completed: false,
            senders_ready_late: false,
            fail_session_creation: false,
            reject_remote_description: false,
            fail_answer: false,
            lose_local_description: false,
        }
    }
}

/// Minimal browser-style offer with one video and one audio section
pub fn sample_offer() -> SessionDescription {
    SessionDescription::offer(
        "v=0\r\n\
         o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=group:BUNDLE 0 1\r\n\
         m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
         c=IN IP4 0.0.0.0\r\n\
         a=mid:0\r\n\
         a=recvonly\r\n\
         a=rtpmap:96 H264/90000\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
         c=IN IP4 0.0.0.0\r\n\
         a=mid:1\r\n\
         a=recvonly\r\n\
         a=rtpmap:111 opus/48000/2\r\n",
    )
}

#[derive(Default)]
pub struct LoopbackEngine {
    script: Mutex<LoopbackScript>,
    tracks: Mutex<Option<Vec<TrackInfo>>>,
    sessions: Mutex<Vec<Arc<LoopbackSession>>>,
    created: AtomicUsize,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: LoopbackScript) -> Self {
        Self {
            script: Mutex::new(script),
            ..Self::default()
        }
    }

    pub fn set_script(&self, script: LoopbackScript) {
        *self.script.lock() = script;
    }

    pub fn update_script(&self, update: impl FnOnce(&mut LoopbackScript)) {
        update(&mut self.script.lock());
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Sessions that have not been closed yet
    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().iter().filter(|s| !s.is_closed()).count()
    }

    pub fn last_session(&self) -> Option<Arc<LoopbackSession>> {
        self.sessions.lock().last().cloned()
    }
}

impl MediaEngine for LoopbackEngine {
    fn create_local_tracks(&self, stream_id: &str, with_audio: bool) -> Result<Vec<TrackInfo>, EngineError> {
        let mut tracks = self.tracks.lock();
        let published = tracks.get_or_insert_with(|| {
            let mut list = vec![TrackInfo {
                id: "video".to_string(),
                kind: MediaKind::Video,
                stream_id: stream_id.to_string(),
            }];
            if with_audio {
                list.push(TrackInfo {
                    id: "audio".to_string(),
                    kind: MediaKind::Audio,
                    stream_id: stream_id.to_string(),
                });
            }
            list
        });
        Ok(published.clone())
    }

    fn create_session(
        &self,
        request: SessionRequest<'_>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Arc<dyn SessionHandle>, EngineError> {
        let script = self.script.lock().clone();
        if script.fail_session_creation {
            return Err(EngineError::SessionAllocation("scripted allocation failure".to_string()));
        }

        let mut sessions = self.sessions.lock();
        if sessions.iter().any(|s| !s.is_closed()) {
            return Err(EngineError::SessionAllocation(
                "local tracks are still bound to a live session".to_string(),
            ));
        }

        let index = self.created.fetch_add(1, Ordering::SeqCst);
        let senders = request.tracks.iter().map(|t| t.kind).collect();
        let senders_ready = !script.senders_ready_late;
        let session = Arc::new_cyclic(|me| LoopbackSession {
            me: me.clone(),
            index,
            script,
            senders,
            observer,
            state: Mutex::new(LoopbackState {
                senders_ready,
                ..LoopbackState::default()
            }),
        });
        sessions.push(Arc::clone(&session));
        Ok(session)
    }
}

#[derive(Default)]
struct LoopbackState {
    remote: Option<SessionDescription>,
    local: Option<SessionDescription>,
    gathering: Option<IceGatheringState>,
    bitrates: HashMap<MediaKind, u32>,
    bitrate_updates: usize,
    senders_ready: bool,
    closed: bool,
}

pub struct LoopbackSession {
    me: Weak<LoopbackSession>,
    index: usize,
    script: LoopbackScript,
    senders: Vec<MediaKind>,
    observer: Arc<dyn SessionObserver>,
    state: Mutex<LoopbackState>,
}

impl LoopbackSession {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Ceiling last set for `kind`
    pub fn max_bitrate(&self, kind: MediaKind) -> Option<u32> {
        self.state.lock().bitrates.get(&kind).copied()
    }

    /// Number of `set_max_bitrate` calls accepted so far
    pub fn bitrate_updates(&self) -> usize {
        self.state.lock().bitrate_updates
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.state.lock().closed {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn draft_answer(&self) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            1_000 + self.index
        );
        for (mid, kind) in self.senders.iter().enumerate() {
            let (proto, pt, codec) = match kind {
                MediaKind::Video => ("video", 96, "H264/90000"),
                MediaKind::Audio => ("audio", 111, "opus/48000/2"),
            };
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF {}\r\nc=IN IP4 0.0.0.0\r\na=mid:{}\r\na=sendonly\r\na=rtpmap:{} {}\r\n",
                proto, pt, mid, pt, codec
            ));
        }
        sdp
    }

    fn finish_gathering(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if let Some(local) = state.local.as_mut() {
                for candidate in &self.script.candidates {
                    local.sdp.push_str(&format!("a={}\r\n", candidate));
                }
                local.sdp.push_str("a=end-of-candidates\r\n");
            }
            state.gathering = Some(IceGatheringState::Complete);
        }

        for candidate in &self.script.candidates {
            self.observer.on_ice_candidate(candidate);
        }
        self.observer.on_ice_gathering_state_change(IceGatheringState::Complete);

        if let Some(delay) = self.script.connect_after {
            let me = self.me.clone();
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                if let Some(session) = me.upgrade() {
                    if !session.is_closed() {
                        session.observer.on_ice_connection_state_change(IceConnectionState::Checking);
                        session.observer.on_ice_connection_state_change(IceConnectionState::Connected);
                        if session.script.report_completed {
                            session.state.lock().senders_ready = true;
                            session.observer.on_ice_connection_state_change(IceConnectionState::Completed);
                        }
                    }
                }
            });
        }
    }
}

impl SessionHandle for LoopbackSession {
    fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.script.reject_remote_description {
            return Err(EngineError::Description("scripted remote description rejection".to_string()));
        }
        self.state.lock().remote = Some(desc.clone());
        self.observer.on_signaling_state_change(SignalingState::HaveRemoteOffer);
        self.observer.on_track(MediaKind::Video, "remote-video");
        Ok(())
    }

    fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        if self.script.fail_answer {
            return Err(EngineError::Description("scripted answer failure".to_string()));
        }
        if self.state.lock().remote.is_none() {
            return Err(EngineError::Description("no remote description".to_string()));
        }
        Ok(SessionDescription::answer(self.draft_answer()))
    }

    fn set_local_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        if desc.sdp_type != SdpType::Answer {
            return Err(EngineError::Description(format!("unexpected {} as local description", desc.sdp_type)));
        }
        {
            let mut state = self.state.lock();
            state.local = Some(desc.clone());
            state.gathering = Some(IceGatheringState::Gathering);
        }
        self.observer.on_signaling_state_change(SignalingState::Stable);
        self.observer.on_ice_gathering_state_change(IceGatheringState::Gathering);

        if self.script.never_complete {
            return Ok(());
        }
        if self.script.complete_inline {
            self.finish_gathering();
            return Ok(());
        }

        let me = self.me.clone();
        let delay = self.script.gathering_delay;
        std::thread::Builder::new()
            .name(format!("loopback-ice-{}", self.index))
            .spawn(move || {
                std::thread::sleep(delay);
                if let Some(session) = me.upgrade() {
                    session.finish_gathering();
                }
            })
            .map_err(|e| EngineError::Description(e.to_string()))?;
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        if self.script.lose_local_description {
            return None;
        }
        self.state.lock().local.clone()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.state.lock().gathering.unwrap_or(IceGatheringState::New)
    }

    fn senders(&self) -> Vec<MediaKind> {
        let state = self.state.lock();
        if state.closed || !state.senders_ready {
            return Vec::new();
        }
        self.senders.clone()
    }

    fn set_max_bitrate(&self, kind: MediaKind, kbps: u32) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        if !self.senders.contains(&kind) {
            return Err(EngineError::Sender(format!("no {} sender", kind)));
        }
        state.bitrates.insert(kind, kbps);
        state.bitrate_updates += 1;
        Ok(())
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.observer.on_ice_connection_state_change(IceConnectionState::Closed);
        self.observer.on_signaling_state_change(SignalingState::Closed);
    }
}
