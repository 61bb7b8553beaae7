//! Capability traits consumed by the call client
//!
//! The call client never talks to a platform directly. Everything it needs
//! from the outside world is expressed here so hosts can plug in real
//! implementations and tests can plug in scripted ones.
//!
//! ```text
//! Signaling:
//!   - SignalingTransport: emit / on / lifecycle events over a persistent channel
//!
//! Media:
//!   - RealtimeMedia: acquire microphone, build peer connections
//!   - PeerConnection: offer/answer/ICE against one peer
//!   - LocalAudioStream: the captured microphone stream
//!   - ChunkedAudio: record/play short segments (fallback relay mode)
//! ```

mod media;
mod signaling;

pub use media::{ChunkedAudio, LocalAudioStream, PeerConnection, RealtimeMedia};
pub use signaling::{LifecycleHandler, SignalHandler, SignalingTransport, TransportLifecycle};
