//! Transport layer for the voice call client
//!
//! Concrete capability implementations:
//! - [`WebRtcMedia`]: full-duplex media over the `webrtc` crate
//! - [`WsSignalingTransport`]: JSON signaling over a reconnecting WebSocket

pub mod webrtc;
pub mod websocket;

pub use self::webrtc::{WebRtcLocalAudio, WebRtcMedia, WebRtcPeer};
pub use websocket::{Frame, WsSignalingTransport};
