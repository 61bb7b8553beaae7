//! Signaling client
//!
//! Typed signaling vocabulary plus delivery over a [`SignalingTransport`]
//! that may drop and reconnect at any time. An offer or answer produced
//! while the transport is down is kept and resent once on reconnect;
//! everything else is dropped.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use voice_call_core::{
    IceCandidate, LifecycleHandler, SessionDescription, SignalingTransport, Subscription,
    TransportError,
};

use crate::CallError;

/// Event names on the wire
pub mod events {
    pub const START_CALL: &str = "voice:start-call";
    pub const INCOMING_CALL: &str = "voice:incoming-call";
    pub const ACCEPT_CALL: &str = "voice:accept-call";
    pub const DECLINE_CALL: &str = "voice:decline-call";
    pub const END_CALL: &str = "voice:end-call";
    pub const OFFER: &str = "voice:offer";
    pub const ANSWER: &str = "voice:answer";
    pub const ICE_CANDIDATE: &str = "voice:ice-candidate";
    pub const CALL_ACCEPTED: &str = "voice:call-accepted";
    pub const CALL_DECLINED: &str = "voice:call-declined";
    pub const CALL_ENDED: &str = "voice:call-ended";
    pub const ERROR: &str = "voice:error";
    pub const AUDIO_CHUNK: &str = "voice:audio-chunk";
}

/// Inbound events registered per session and disposed with it
pub const SESSION_EVENTS: [&str; 8] = [
    events::CALL_ACCEPTED,
    events::CALL_DECLINED,
    events::CALL_ENDED,
    events::OFFER,
    events::ANSWER,
    events::ICE_CANDIDATE,
    events::ERROR,
    events::AUDIO_CHUNK,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallPayload {
    pub receiver_id: String,
    pub call_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    pub call_id: String,
    pub caller_id: String,
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub call_type: Option<String>,
}

/// `{callId[, duration]}` for accept/decline/end and their confirmations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallControlPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl CallControlPayload {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub call_id: String,
    pub offer: SessionDescription,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ice_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub call_id: String,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub call_id: String,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(alias = "message")]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkPayload {
    pub call_id: String,
    pub audio_uri: String,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// Messages this client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSignal {
    StartCall(StartCallPayload),
    AcceptCall(CallControlPayload),
    DeclineCall(CallControlPayload),
    EndCall(CallControlPayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(IceCandidatePayload),
    AudioChunk(AudioChunkPayload),
}

impl OutboundSignal {
    pub fn event(&self) -> &'static str {
        match self {
            Self::StartCall(_) => events::START_CALL,
            Self::AcceptCall(_) => events::ACCEPT_CALL,
            Self::DeclineCall(_) => events::DECLINE_CALL,
            Self::EndCall(_) => events::END_CALL,
            Self::Offer(_) => events::OFFER,
            Self::Answer(_) => events::ANSWER,
            Self::IceCandidate(_) => events::ICE_CANDIDATE,
            Self::AudioChunk(_) => events::AUDIO_CHUNK,
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value, TransportError> {
        let value = match self {
            Self::StartCall(p) => serde_json::to_value(p),
            Self::AcceptCall(p) | Self::DeclineCall(p) | Self::EndCall(p) => serde_json::to_value(p),
            Self::Offer(p) => serde_json::to_value(p),
            Self::Answer(p) => serde_json::to_value(p),
            Self::IceCandidate(p) => serde_json::to_value(p),
            Self::AudioChunk(p) => serde_json::to_value(p),
        };
        value.map_err(|e| TransportError::Encode(e.to_string()))
    }

    /// Offers and answers survive a disconnect; the rest is cheap to lose
    pub fn is_deferrable(&self) -> bool {
        matches!(self, Self::Offer(_) | Self::Answer(_))
    }
}

/// Messages this client receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    IncomingCall(IncomingCallPayload),
    CallAccepted(CallControlPayload),
    CallDeclined(CallControlPayload),
    CallEnded(CallControlPayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(IceCandidatePayload),
    Error(ErrorPayload),
    AudioChunk(AudioChunkPayload),
}

impl InboundSignal {
    pub fn parse(event: &str, data: serde_json::Value) -> Result<Self, CallError> {
        fn decode<T: serde::de::DeserializeOwned>(
            event: &str,
            data: serde_json::Value,
        ) -> Result<T, CallError> {
            serde_json::from_value(data).map_err(|e| CallError::Protocol(format!("{}: {}", event, e)))
        }

        Ok(match event {
            events::INCOMING_CALL => Self::IncomingCall(decode(event, data)?),
            events::CALL_ACCEPTED => Self::CallAccepted(decode(event, data)?),
            events::CALL_DECLINED => Self::CallDeclined(decode(event, data)?),
            events::CALL_ENDED => Self::CallEnded(decode(event, data)?),
            events::OFFER => Self::Offer(decode(event, data)?),
            events::ANSWER => Self::Answer(decode(event, data)?),
            events::ICE_CANDIDATE => Self::IceCandidate(decode(event, data)?),
            events::ERROR => Self::Error(decode(event, data)?),
            events::AUDIO_CHUNK => Self::AudioChunk(decode(event, data)?),
            other => return Err(CallError::Protocol(format!("unknown event {}", other))),
        })
    }

    /// Call the signal refers to, when it carries one
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::IncomingCall(p) => Some(&p.call_id),
            Self::CallAccepted(p) | Self::CallDeclined(p) | Self::CallEnded(p) => {
                p.call_id.as_deref()
            },
            Self::Offer(p) => Some(&p.call_id),
            Self::Answer(p) => Some(&p.call_id),
            Self::IceCandidate(p) => Some(&p.call_id),
            Self::AudioChunk(p) => Some(&p.call_id),
            Self::Error(_) => None,
        }
    }

    /// Call setup and teardown, as opposed to media exchange
    pub fn is_call_control(&self) -> bool {
        matches!(
            self,
            Self::CallAccepted(_) | Self::CallDeclined(_) | Self::CallEnded(_) | Self::Error(_)
        )
    }
}

/// What happened to an outbound signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Stored until the transport reconnects
    Deferred,
    /// Discarded because the transport is down
    Dropped,
}

/// Delivery over the signaling transport
pub struct SignalingClient {
    transport: Arc<dyn SignalingTransport>,
    pending: Mutex<Option<OutboundSignal>>,
    failed_reconnects: AtomicU32,
    max_reconnect_attempts: u32,
}

impl SignalingClient {
    pub fn new(transport: Arc<dyn SignalingTransport>, max_reconnect_attempts: u32) -> Self {
        Self {
            transport,
            pending: Mutex::new(None),
            failed_reconnects: AtomicU32::new(0),
            max_reconnect_attempts,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send now, or defer/drop when the transport is down
    pub fn send(&self, signal: OutboundSignal) -> Result<SendOutcome, CallError> {
        if !self.transport.is_connected() {
            return Ok(self.defer_or_drop(signal));
        }

        match self.transport.emit(signal.event(), signal.payload()?) {
            Ok(()) => {
                tracing::debug!(event = signal.event(), "Signal sent");
                Ok(SendOutcome::Sent)
            },
            Err(TransportError::NotConnected | TransportError::Closed) => {
                Ok(self.defer_or_drop(signal))
            },
            Err(e) => Err(e.into()),
        }
    }

    fn defer_or_drop(&self, signal: OutboundSignal) -> SendOutcome {
        if signal.is_deferrable() {
            let replaced = self.pending.lock().replace(signal);
            if let Some(old) = replaced {
                tracing::debug!(event = old.event(), "Replacing pending signal");
            }
            tracing::debug!("Transport down, signal kept for resend");
            SendOutcome::Deferred
        } else {
            tracing::debug!(event = signal.event(), "Transport down, signal dropped");
            SendOutcome::Dropped
        }
    }

    /// Transport reconnected: flush the pending signal once
    ///
    /// Returns whether a pending signal was sent.
    pub fn on_reconnect(&self) -> Result<bool, CallError> {
        self.failed_reconnects.store(0, Ordering::SeqCst);

        let Some(signal) = self.pending.lock().take() else {
            return Ok(false);
        };

        let event = signal.event();
        match self.send(signal)? {
            SendOutcome::Sent => {
                tracing::info!(event, "Pending signal resent after reconnect");
                Ok(true)
            },
            // Dropped again before the flush; it is pending once more
            _ => Ok(false),
        }
    }

    /// Count a failed reconnect attempt; returns the consecutive failures
    pub fn record_reconnect_failure(&self) -> u32 {
        self.failed_reconnects.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether consecutive failures reached the tolerated maximum
    pub fn reconnect_budget_exhausted(&self) -> bool {
        self.failed_reconnects.load(Ordering::SeqCst) >= self.max_reconnect_attempts
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn clear_pending(&self) {
        self.pending.lock().take();
    }

    /// Forward `event` into `sink` as parsed [`InboundSignal`]s
    pub fn subscribe(&self, event: &'static str, sink: mpsc::UnboundedSender<InboundSignal>) -> Subscription {
        self.transport.on(
            event,
            Arc::new(move |data| match InboundSignal::parse(event, data) {
                Ok(signal) => {
                    let _ = sink.send(signal);
                },
                Err(e) => tracing::warn!(event, error = %e, "Ignoring malformed signal"),
            }),
        )
    }

    /// Register every per-session event
    pub fn subscribe_session(&self, sink: &mpsc::UnboundedSender<InboundSignal>) -> Vec<Subscription> {
        SESSION_EVENTS
            .into_iter()
            .map(|event| self.subscribe(event, sink.clone()))
            .collect()
    }

    pub fn on_lifecycle(&self, handler: LifecycleHandler) -> Subscription {
        self.transport.on_lifecycle(handler)
    }
}
