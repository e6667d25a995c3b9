//! Media engine backed by webrtc-rs
//!
//! The engine owns a small tokio runtime. Description calls from request
//! threads `block_on` it; peer connection callbacks run on its worker threads
//! and are forwarded to the session's [`SessionObserver`] synchronously.

use crate::engine::{IceServer, MediaEngine, SessionHandle, SessionObserver, SessionRequest, TrackInfo};
use crate::errors::EngineError;
use crate::types::{
    IceConnectionState, IceGatheringState, MediaKind, SdpType, SessionDescription, SignalingState,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn connection_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn gathering_state(state: RTCIceGathererState) -> IceGatheringState {
    match state {
        RTCIceGathererState::Gathering => IceGatheringState::Gathering,
        // A closed gatherer will not produce more candidates
        RTCIceGathererState::Complete | RTCIceGathererState::Closed => IceGatheringState::Complete,
        _ => IceGatheringState::New,
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let sdp = desc.sdp.clone();
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(EngineError::Description("rollback descriptions are not supported".to_string()))
        }
    };
    parsed.map_err(|e| EngineError::Description(format!("Invalid SDP {}: {}", desc.sdp_type, e)))
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Answer,
    };
    SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    }
}

/// Bitrate ceilings for the published tracks, read by the encoders feeding
/// them. Zero means uncapped.
#[derive(Debug, Default)]
pub struct SenderCaps {
    video_kbps: AtomicU32,
    audio_kbps: AtomicU32,
}

impl SenderCaps {
    pub fn get(&self, kind: MediaKind) -> Option<u32> {
        let kbps = match kind {
            MediaKind::Video => self.video_kbps.load(Ordering::Acquire),
            MediaKind::Audio => self.audio_kbps.load(Ordering::Acquire),
        };
        (kbps > 0).then_some(kbps)
    }

    fn set(&self, kind: MediaKind, kbps: u32) {
        match kind {
            MediaKind::Video => self.video_kbps.store(kbps, Ordering::Release),
            MediaKind::Audio => self.audio_kbps.store(kbps, Ordering::Release),
        }
    }

    fn clear(&self) {
        self.video_kbps.store(0, Ordering::Release);
        self.audio_kbps.store(0, Ordering::Release);
    }
}

struct PublishedTrack {
    info: TrackInfo,
    track: Arc<TrackLocalStaticSample>,
}

struct EngineShared {
    runtime: tokio::runtime::Runtime,
    api: API,
    tracks: Mutex<Vec<PublishedTrack>>,
    caps: Arc<SenderCaps>,
}

impl EngineShared {
    /// Run `future` to completion from a thread outside the runtime
    fn block_on<F: Future>(&self, future: F) -> Result<F::Output, EngineError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(EngineError::Description(
                "blocking engine call made from inside an async context".to_string(),
            ));
        }
        Ok(self.runtime.block_on(future))
    }
}

/// Production engine: one `RTCPeerConnection` per session, shared sample tracks
pub struct RtcEngine {
    shared: Arc<EngineShared>,
}

impl RtcEngine {
    pub fn new() -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("rtccam-rtc")
            .enable_all()
            .build()
            .map_err(|e| EngineError::Initialization(format!("Failed to start runtime: {}", e)))?;

        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|e| EngineError::Initialization(format!("Failed to register codecs: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut codecs)
            .map_err(|e| EngineError::Initialization(format!("Failed to register interceptors: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        log::info!("WebRTC engine initialized");
        Ok(Self {
            shared: Arc::new(EngineShared {
                runtime,
                api,
                tracks: Mutex::new(Vec::new()),
                caps: Arc::new(SenderCaps::default()),
            }),
        })
    }

    /// Published video track, once [`MediaEngine::create_local_tracks`] ran
    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.shared
            .tracks
            .lock()
            .iter()
            .find(|t| t.info.kind == MediaKind::Video)
            .map(|t| Arc::clone(&t.track))
    }

    pub fn runtime_handle(&self) -> tokio::runtime::Handle {
        self.shared.runtime.handle().clone()
    }

    pub fn sender_caps(&self) -> Arc<SenderCaps> {
        Arc::clone(&self.shared.caps)
    }
}

impl MediaEngine for RtcEngine {
    fn create_local_tracks(&self, stream_id: &str, with_audio: bool) -> Result<Vec<TrackInfo>, EngineError> {
        let mut tracks = self.shared.tracks.lock();
        if tracks.is_empty() {
            let video = TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                    rtcp_feedback: vec![],
                },
                "video".to_owned(),
                stream_id.to_owned(),
            );
            tracks.push(PublishedTrack {
                info: TrackInfo {
                    id: "video".to_string(),
                    kind: MediaKind::Video,
                    stream_id: stream_id.to_string(),
                },
                track: Arc::new(video),
            });

            if with_audio {
                let audio = TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                        rtcp_feedback: vec![],
                    },
                    "audio".to_owned(),
                    stream_id.to_owned(),
                );
                tracks.push(PublishedTrack {
                    info: TrackInfo {
                        id: "audio".to_string(),
                        kind: MediaKind::Audio,
                        stream_id: stream_id.to_string(),
                    },
                    track: Arc::new(audio),
                });
            }
            log::debug!("Created {} local track(s)", tracks.len());
        }
        Ok(tracks.iter().map(|t| t.info.clone()).collect())
    }

    fn create_session(
        &self,
        request: SessionRequest<'_>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Arc<dyn SessionHandle>, EngineError> {
        let bound: Vec<(MediaKind, Arc<TrackLocalStaticSample>)> = {
            let tracks = self.shared.tracks.lock();
            request
                .tracks
                .iter()
                .filter_map(|wanted| {
                    tracks
                        .iter()
                        .find(|t| t.info.id == wanted.id)
                        .map(|t| (t.info.kind, Arc::clone(&t.track)))
                })
                .collect()
        };
        if bound.len() != request.tracks.len() {
            return Err(EngineError::SessionAllocation(
                "requested track was never published".to_string(),
            ));
        }

        let config = RTCConfiguration {
            ice_servers: request.ice_servers.iter().map(RTCIceServer::from).collect(),
            ..Default::default()
        };

        let shared = Arc::clone(&self.shared);
        let pc = self.shared.block_on(async {
            let pc = shared
                .api
                .new_peer_connection(config)
                .await
                .map_err(|e| EngineError::SessionAllocation(format!("Failed to create peer connection: {}", e)))?;
            let pc = Arc::new(pc);

            for (kind, track) in &bound {
                let local: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>;
                let sender = pc
                    .add_track(local)
                    .await
                    .map_err(|e| EngineError::SessionAllocation(format!("Failed to add {} track: {}", kind, e)))?;

                // Drain RTCP so the interceptors keep working
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while sender.read(&mut buf).await.is_ok() {}
                });
            }
            Ok::<_, EngineError>(pc)
        })??;

        let gathering = Arc::new(AtomicU8::new(IceGatheringState::New as u8));
        register_callbacks(&pc, observer, Arc::clone(&gathering));

        Ok(Arc::new(RtcSessionHandle {
            shared: Arc::clone(&self.shared),
            pc,
            senders: bound.iter().map(|(kind, _)| *kind).collect(),
            gathering,
            closed: AtomicBool::new(false),
        }))
    }
}

fn register_callbacks(pc: &Arc<RTCPeerConnection>, observer: Arc<dyn SessionObserver>, gathering: Arc<AtomicU8>) {
    let obs = Arc::clone(&observer);
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        obs.on_signaling_state_change(signaling_state(state));
        Box::pin(async {})
    }));

    let obs = Arc::clone(&observer);
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        obs.on_ice_connection_state_change(connection_state(state));
        Box::pin(async {})
    }));

    let obs = Arc::clone(&observer);
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let state = gathering_state(state);
        gathering.store(state as u8, Ordering::Release);
        obs.on_ice_gathering_state_change(state);
        Box::pin(async {})
    }));

    let obs = Arc::clone(&observer);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        match candidate.map(|c| c.to_json()) {
            Some(Ok(init)) => obs.on_ice_candidate(&init.candidate),
            Some(Err(e)) => log::warn!("Failed to serialize local candidate: {}", e),
            None => log::debug!("End of local candidates"),
        }
        Box::pin(async {})
    }));

    let obs = observer;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            obs.on_track(kind, &track.id());
            Box::pin(async {})
        },
    ));
}

fn decode_gathering(raw: u8) -> IceGatheringState {
    match raw {
        r if r == IceGatheringState::Complete as u8 => IceGatheringState::Complete,
        r if r == IceGatheringState::Gathering as u8 => IceGatheringState::Gathering,
        _ => IceGatheringState::New,
    }
}

pub struct RtcSessionHandle {
    shared: Arc<EngineShared>,
    pc: Arc<RTCPeerConnection>,
    senders: Vec<MediaKind>,
    gathering: Arc<AtomicU8>,
    closed: AtomicBool,
}

impl RtcSessionHandle {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

impl SessionHandle for RtcSessionHandle {
    fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let remote = to_rtc_description(desc)?;
        self.shared
            .block_on(self.pc.set_remote_description(remote))?
            .map_err(|e| EngineError::Description(format!("Failed to set remote description: {}", e)))
    }

    fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        let answer = self
            .shared
            .block_on(self.pc.create_answer(None))?
            .map_err(|e| EngineError::Description(format!("Failed to create answer: {}", e)))?;
        Ok(from_rtc_description(answer))
    }

    fn set_local_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let local = to_rtc_description(desc)?;
        self.shared
            .block_on(self.pc.set_local_description(local))?
            .map_err(|e| EngineError::Description(format!("Failed to set local description: {}", e)))
    }

    fn local_description(&self) -> Option<SessionDescription> {
        match self.shared.block_on(self.pc.local_description()) {
            Ok(desc) => desc.map(from_rtc_description),
            Err(e) => {
                log::warn!("Cannot read local description: {}", e);
                None
            }
        }
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        decode_gathering(self.gathering.load(Ordering::Acquire))
    }

    fn senders(&self) -> Vec<MediaKind> {
        if self.closed.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.senders.clone()
    }

    fn set_max_bitrate(&self, kind: MediaKind, kbps: u32) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !self.senders.contains(&kind) {
            return Err(EngineError::Sender(format!("no {} sender on this session", kind)));
        }
        self.shared.caps.set(kind, kbps);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.caps.clear();

        let pc = Arc::clone(&self.pc);
        let close = async move {
            if let Err(e) = pc.close().await {
                log::warn!("Error closing peer connection: {}", e);
            }
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            self.shared.runtime.spawn(close);
        } else {
            self.shared.runtime.block_on(close);
        }
    }
}

impl Drop for RtcSessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(gathering_state(RTCIceGathererState::Complete), IceGatheringState::Complete);
        assert_eq!(gathering_state(RTCIceGathererState::Gathering), IceGatheringState::Gathering);
        assert_eq!(connection_state(RTCIceConnectionState::Connected), IceConnectionState::Connected);
        assert_eq!(signaling_state(RTCSignalingState::HaveRemoteOffer), SignalingState::HaveRemoteOffer);

        for state in [IceGatheringState::New, IceGatheringState::Gathering, IceGatheringState::Complete] {
            assert_eq!(decode_gathering(state as u8), state);
        }
    }

    #[test]
    fn test_tracks_published_once() {
        let engine = RtcEngine::new().unwrap();
        let first = engine.create_local_tracks("cam", true).unwrap();
        let second = engine.create_local_tracks("cam", true).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(engine.video_track().is_some());
    }

    #[test]
    fn test_sender_caps_zero_means_uncapped() {
        let caps = SenderCaps::default();
        assert_eq!(caps.get(MediaKind::Video), None);
        caps.set(MediaKind::Video, 2500);
        assert_eq!(caps.get(MediaKind::Video), Some(2500));
        caps.clear();
        assert_eq!(caps.get(MediaKind::Video), None);
    }

    #[test]
    fn test_rollback_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(&desc).is_err());
    }
}
