//! Local media capability traits

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::MediaError;
use crate::media::{AudioChunk, AudioConstraints, IceCandidate, IceServer, PeerEvent, SessionDescription};

/// Full-duplex real-time media capability
///
/// Implementations:
/// - `WebRtcMedia` - peer connections over the `webrtc` crate
#[async_trait]
pub trait RealtimeMedia: Send + Sync + 'static {
    /// Acquire the microphone (`getUserMedia` equivalent)
    async fn acquire_local_audio(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Arc<dyn LocalAudioStream>, MediaError>;

    /// Create a new peer connection
    ///
    /// Every event the connection raises is delivered on `events` until the
    /// connection is closed.
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;

    /// Route remote audio to the loudspeaker (true) or earpiece (false)
    fn set_speaker(&self, _enabled: bool) {}
}

/// One peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// Create an offer; `ice_restart` requests fresh ICE credentials
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError>;

    /// Create an answer for the current remote offer
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Set the local description (starts ICE gathering)
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    /// Set the remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Attach the local microphone tracks
    async fn add_local_audio(&self, stream: Arc<dyn LocalAudioStream>) -> Result<(), MediaError>;

    /// Current local description, including candidates gathered so far
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Whether ICE gathering has completed
    fn ice_gathering_complete(&self) -> bool;

    /// Close the connection and stop raising events
    async fn close(&self);
}

/// The captured microphone stream
///
/// Owned by exactly one call session.
pub trait LocalAudioStream: Send + Sync + 'static {
    /// Stream identifier
    fn id(&self) -> &str;

    /// Enable or disable the audio tracks (mute)
    fn set_enabled(&self, enabled: bool);

    /// Stop all tracks and release the device
    ///
    /// Must be safe to call more than once.
    fn stop(&self);

    /// Whether the tracks are still live
    fn is_live(&self) -> bool;
}

/// Chunked record/playback capability for fallback relay mode
#[async_trait]
pub trait ChunkedAudio: Send + Sync + 'static {
    /// Record a segment of the given length and return where it was stored
    async fn record_chunk(&self, duration: Duration) -> Result<AudioChunk, MediaError>;

    /// Play a remote segment immediately
    async fn play_chunk(&self, uri: &str) -> Result<(), MediaError>;

    /// Route playback to the loudspeaker (true) or earpiece (false)
    fn set_speaker(&self, _enabled: bool) {}
}
