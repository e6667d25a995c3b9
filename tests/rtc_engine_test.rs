//! Negotiation against the real WebRTC stack with an in-process viewer
#![cfg(feature = "webrtc")]

use rtccam::config::NegotiationConfig;
use rtccam::engine::RtcEngine;
use rtccam::types::{SdpType, SessionDescription};
use rtccam::{MediaSessionFactory, SignalingSession};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// Receive-only viewer that gathers fully before returning its offer
async fn viewer_offer() -> (Arc<RTCPeerConnection>, String) {
    let mut codecs = CodecRegistry::default();
    codecs.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(codecs).build();
    let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await.unwrap());

    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
    }

    let offer = pc.create_offer(None).await.unwrap();
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.unwrap();
    let _ = gathered.recv().await;
    let sdp = pc.local_description().await.unwrap().sdp;
    (pc, sdp)
}

fn local_signaling() -> SignalingSession {
    let engine = Arc::new(RtcEngine::new().unwrap());
    let config = NegotiationConfig {
        ice_servers: vec![],
        ..NegotiationConfig::default()
    };
    let factory = MediaSessionFactory::new(engine, &config).unwrap();
    SignalingSession::new(factory, Some(Duration::from_secs(10)))
}

#[test]
fn test_answer_is_accepted_by_viewer() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut signaling = local_signaling();

    let (viewer, offer) = runtime.block_on(viewer_offer());
    let answer = signaling.handle_offer(&SessionDescription::offer(offer)).unwrap();

    assert_eq!(answer.sdp_type, SdpType::Answer);
    assert!(answer.candidate_count() > 0);
    assert!(answer.sdp.contains("m=video"));
    assert!(answer.sdp.contains("H264"));

    runtime
        .block_on(viewer.set_remote_description(RTCSessionDescription::answer(answer.sdp).unwrap()))
        .unwrap();

    signaling.shutdown();
    runtime.block_on(viewer.close()).unwrap();
}

#[test]
fn test_second_viewer_supersedes_first() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut signaling = local_signaling();

    let (first, offer) = runtime.block_on(viewer_offer());
    signaling.handle_offer(&SessionDescription::offer(offer)).unwrap();
    let first_id = signaling.active_session_id().unwrap().to_string();

    let (second, offer) = runtime.block_on(viewer_offer());
    let answer = signaling.handle_offer(&SessionDescription::offer(offer)).unwrap();
    assert!(answer.candidate_count() > 0);
    assert_ne!(signaling.active_session_id().unwrap(), first_id);

    signaling.shutdown();
    runtime.block_on(async {
        let _ = first.close().await;
        let _ = second.close().await;
    });
}

#[test]
fn test_garbage_sdp_is_rejected() {
    let mut signaling = local_signaling();
    let err = signaling
        .handle_offer(&SessionDescription::offer("this is not sdp"))
        .unwrap_err();
    assert_eq!(err.status_code(), 500);
    assert!(signaling.active_session().is_none());
}
