//! Value types shared between the signaling bridge, the media engine and the
//! capture pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SDP type tag, serialized in its canonical lowercase form (`"offer"`, `"answer"`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description as exchanged over the signaling endpoint:
/// `{"type": "offer", "sdp": "v=0..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Number of `a=candidate` lines carried in the SDP body
    pub fn candidate_count(&self) -> usize {
        self.sdp
            .lines()
            .filter(|line| line.trim_start().starts_with("a=candidate"))
            .count()
    }
}

/// ICE gathering progress as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// ICE connectivity as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Media can flow and sender parameters are settled
    pub fn is_connected(&self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

/// Offer/answer signaling state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Media kind of a published track or outbound sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Pixel layout of a raw video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, `width * height * 3` bytes
    Rgb24,
    /// Planar YUV 4:2:0, Y plane followed by U then V at quarter resolution
    I420,
}

impl PixelFormat {
    /// Expected buffer length for a frame of the given dimensions
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgb24 => w * h * 3,
            PixelFormat::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }
}

/// Clockwise rotation the sensor output needs to appear upright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

/// One raw frame delivered by the capture pipeline
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            width,
            height,
            format,
            rotation: Rotation::None,
            data,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Buffer length matches the declared dimensions and pixel format
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= self.format.frame_len(self.width, self.height)
    }
}

/// Compressed still image returned by a snapshot request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_description_wire_format() {
        let desc = SessionDescription::answer("v=0\r\n");
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(json, r#"{"type":"answer","sdp":"v=0\r\n"}"#);

        let parsed: SessionDescription =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0"}"#).unwrap();
        assert_eq!(parsed.sdp_type, SdpType::Offer);
        assert_eq!(parsed.sdp, "v=0");
    }

    #[test]
    fn test_unknown_sdp_type_rejected() {
        let parsed = serde_json::from_str::<SessionDescription>(r#"{"type":"bogus","sdp":"v=0"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_candidate_count() {
        let desc = SessionDescription::answer(
            "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host\r\na=end-of-candidates\r\n",
        );
        assert_eq!(desc.candidate_count(), 1);
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(PixelFormat::Rgb24.frame_len(4, 2), 24);
        assert_eq!(PixelFormat::I420.frame_len(4, 2), 8 + 2 * 2);
        assert_eq!(PixelFormat::I420.frame_len(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn test_rotation_degrees() {
        assert_eq!(Rotation::from_degrees(90), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(45), None);
        assert_eq!(Rotation::Deg270.degrees(), 270);
    }

    #[test]
    fn test_connected_states() {
        assert!(IceConnectionState::Connected.is_connected());
        assert!(IceConnectionState::Completed.is_connected());
        assert!(!IceConnectionState::Checking.is_connected());
    }
}
