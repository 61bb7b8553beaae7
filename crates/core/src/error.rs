//! Error types shared by capability implementations

use thiserror::Error;

/// Errors raised by a signaling transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Transport closed")]
    Closed,

    #[error("Internal transport error: {0}")]
    Internal(String),
}

/// Errors raised by the local media capability or a peer connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// No microphone / audio capability on this platform
    #[error("Media capability unavailable: {0}")]
    Unavailable(String),

    /// Permission denied or device busy while acquiring local audio
    #[error("Failed to acquire local audio: {0}")]
    Acquire(String),

    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    #[error("Session description error: {0}")]
    Description(String),

    #[error("ICE candidate rejected: {0}")]
    IceCandidate(String),

    #[error("Recording failed: {0}")]
    Recording(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Peer connection closed")]
    Closed,
}
