//! Call state machine
//!
//! Pure transition function. Every state change of a [`CallSession`]
//! goes through [`transition`]; side effects live in the manager.
//!
//! [`CallSession`]: crate::session::CallSession

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Call session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    /// Outgoing call requested, waiting for the peer to accept
    Calling,
    /// Incoming call waiting for the local user
    Ringing,
    /// Accepted, media being negotiated
    Connecting,
    Connected,
    /// Terminal
    Ended,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Whether the session is still waiting for someone to answer
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Calling | Self::Ringing)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Which side of the call this client is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Placed the call and sends the initial offer
    Caller,
    Receiver,
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Local user placed a call
    StartCall,
    /// `voice:incoming-call`
    IncomingCall,
    /// `voice:call-accepted`
    CallAccepted,
    /// Remote offer (initial or ICE restart)
    RemoteOffer,
    /// Media path reported Connected
    MediaConnected,
    /// Local user accepted
    AcceptCall,
    /// Local user declined
    DeclineCall,
    /// `voice:call-declined`
    PeerDeclined,
    /// `voice:call-ended`
    PeerEnded,
    /// Media recovery budget exhausted
    MediaFailed,
    /// Ring or connection timer fired
    Timeout,
    /// Local user hung up
    EndCall,
    /// Unrecoverable error (protocol error, signaling lost, capability failure)
    Abort,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{trigger} is not allowed while {from}")]
pub struct InvalidTransition {
    pub from: CallState,
    pub trigger: Trigger,
}

/// Next state for `trigger` in `from`
pub fn transition(from: CallState, trigger: Trigger) -> Result<CallState, InvalidTransition> {
    use CallState::*;
    use Trigger::*;

    let next = match (from, trigger) {
        (Ended, _) => None,

        (Idle, StartCall) => Some(Calling),
        (Idle, IncomingCall) => Some(Ringing),

        (Calling, CallAccepted) => Some(Connecting),
        (Ringing, AcceptCall) => Some(Connecting),
        (Ringing, DeclineCall) => Some(Ended),

        (Connecting, RemoteOffer) => Some(Connecting),
        (Connected, RemoteOffer) => Some(Connected),
        (Connecting | Connected, MediaConnected) => Some(Connected),
        (Connecting | Connected, MediaFailed) => Some(Ended),

        (Calling | Connecting | Connected, PeerDeclined) => Some(Ended),
        (Ringing | Calling | Connecting | Connected, PeerEnded) => Some(Ended),
        (Calling | Ringing | Connecting | Connected, Timeout) => Some(Ended),

        (_, EndCall | Abort) => Some(Ended),

        _ => None,
    };

    next.ok_or(InvalidTransition { from, trigger })
}
