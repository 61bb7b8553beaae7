//! Voice call session client
//!
//! The [`CallManager`] owns at most one [`CallSession`] at a time and
//! coordinates four concerns:
//! - [`SignalingClient`]: message delivery over a reconnecting transport
//! - [`MediaNegotiator`]: offer/answer/ICE exchange and recovery
//! - the call state machine in [`state`]
//! - [`FallbackRelay`]: chunked audio over signaling when real-time media is unavailable
//!
//! UI code observes the call through [`CallEvent`]s from [`CallManager::subscribe`].

pub mod manager;
pub mod negotiation;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod state;

pub use manager::{CallEvent, CallManager, EndReason, IncomingCall};
pub use negotiation::{MediaNegotiator, NegotiationConfig};
pub use relay::{FallbackRelay, RelayConfig};
pub use session::{CallSession, CallSnapshot};
pub use signaling::{InboundSignal, OutboundSignal, SendOutcome, SignalingClient};
pub use state::{CallState, InvalidTransition, Role, Trigger};

use thiserror::Error;
use voice_call_config::ConfigError;
use voice_call_core::{MediaError, TransportError};

/// Errors surfaced by call operations
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Signaling error: {0}")]
    Transport(#[from] TransportError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("No active call")]
    NoActiveCall,

    #[error("Media capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Malformed signaling message: {0}")]
    Protocol(String),

    #[error("Call manager has stopped")]
    ManagerStopped,
}
