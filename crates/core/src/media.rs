//! Media negotiation types
//!
//! Plain data exchanged between the call client and the local media
//! capability: session descriptions, ICE candidates, connection states and
//! the capability provider selected by the host at construction time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::traits::{ChunkedAudio, RealtimeMedia};

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (stun: or turn:)
    pub urls: Vec<String>,
    /// Username (for TURN)
    #[serde(default)]
    pub username: Option<String>,
    /// Credential (for TURN)
    #[serde(default)]
    pub credential: Option<String>,
}

impl Default for IceServer {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as carried in `voice:offer` / `voice:answer`
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
}

/// ICE candidate for trickle ICE signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    /// Username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Peer connection state, mirrored from the media abstraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// ICE gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Remote audio made available by the peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Stream identifier reported by the remote side
    pub stream_id: String,
    /// Track identifier
    pub track_id: String,
}

/// Events raised by a peer connection
///
/// These are the Rust shape of `onIceCandidate`, `onTrack`,
/// `onConnectionStateChange` and `onIceGatheringStateChange`.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local ICE candidate was discovered
    IceCandidate(IceCandidate),
    /// Remote track received
    Track(RemoteStream),
    /// Connection state changed
    ConnectionStateChange(PeerConnectionState),
    /// ICE gathering state changed
    IceGatheringStateChange(IceGatheringState),
}

/// Constraints used when acquiring the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A recorded audio segment in fallback relay mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Location of the recorded segment (uploaded file or data URI)
    pub uri: String,
    /// Recorded length in milliseconds
    pub duration_ms: u64,
}

/// How audio flows for a call, chosen once at session start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    /// Real-time peer-to-peer audio
    FullDuplexRealtime,
    /// Periodic recorded chunks relayed over signaling
    ChunkedRelayFallback,
}

/// Media capability supplied by the host environment
///
/// Selected once by the host (not detected inline) and injected into the
/// call manager.
#[derive(Clone)]
pub enum MediaCapabilityProvider {
    /// Full peer-to-peer media is available
    FullDuplex(Arc<dyn RealtimeMedia>),
    /// Only chunked recording and playback is available
    ChunkedFallback(Arc<dyn ChunkedAudio>),
    /// No usable audio capability
    Unavailable { reason: String },
}

impl MediaCapabilityProvider {
    /// Media mode a new session will use, `None` when calls are impossible
    pub fn media_mode(&self) -> Option<MediaMode> {
        match self {
            Self::FullDuplex(_) => Some(MediaMode::FullDuplexRealtime),
            Self::ChunkedFallback(_) => Some(MediaMode::ChunkedRelayFallback),
            Self::Unavailable { .. } => None,
        }
    }
}

impl fmt::Debug for MediaCapabilityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullDuplex(_) => f.write_str("FullDuplex"),
            Self::ChunkedFallback(_) => f.write_str("ChunkedFallback"),
            Self::Unavailable { reason } => {
                f.debug_struct("Unavailable").field("reason", reason).finish()
            },
        }
    }
}
