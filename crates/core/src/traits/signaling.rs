//! Signaling transport trait

use std::sync::Arc;

use crate::error::TransportError;
use crate::subscription::Subscription;

/// Handler invoked with the JSON payload of a named event
pub type SignalHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Handler invoked on transport lifecycle changes
pub type LifecycleHandler = Arc<dyn Fn(&TransportLifecycle) + Send + Sync>;

/// Lifecycle events raised by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportLifecycle {
    /// First successful connection
    Connected,
    /// Connection dropped
    Disconnected { reason: String },
    /// Connection restored after a drop
    Reconnected { attempt: u32 },
    /// A reconnection attempt failed
    ReconnectFailed { attempt: u32 },
    /// Reconnection gave up; the transport is dead
    Closed { reason: String },
}

/// Persistent bidirectional channel to the signaling backend
///
/// `on` returns a [`Subscription`]; dropping or disposing it unregisters
/// the handler, so there is no separate `off`.
pub trait SignalingTransport: Send + Sync + 'static {
    /// Send an event with a JSON payload
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), TransportError>;

    /// Register a handler for an inbound event
    fn on(&self, event: &str, handler: SignalHandler) -> Subscription;

    /// Register a handler for lifecycle changes
    fn on_lifecycle(&self, handler: LifecycleHandler) -> Subscription;

    /// Whether the channel is currently connected
    fn is_connected(&self) -> bool;
}
