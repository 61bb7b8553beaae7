//! Core traits and types for the voice call client
//!
//! This crate provides the vocabulary shared by every other crate:
//! - Capability traits the host supplies (signaling transport, media)
//! - Media negotiation types (SDP, ICE candidates, connection states)
//! - Disposable subscriptions for event handlers
//! - A single bounded retry utility
//! - Error types

pub mod error;
pub mod media;
pub mod retry;
pub mod subscription;
pub mod traits;

pub use error::{MediaError, TransportError};
pub use media::{
    AudioChunk, AudioConstraints, IceCandidate, IceGatheringState, IceServer, MediaCapabilityProvider,
    MediaMode, PeerConnectionState, PeerEvent, RemoteStream, SdpType, SessionDescription,
};
pub use retry::{retry_with_backoff, AttemptFailure, Retried, RetryError, RetryPolicy};
pub use subscription::{HandlerRegistry, Subscription, SubscriptionSet};

// Trait re-exports
pub use traits::{
    ChunkedAudio, LifecycleHandler, LocalAudioStream, PeerConnection, RealtimeMedia,
    SignalHandler, SignalingTransport, TransportLifecycle,
};
