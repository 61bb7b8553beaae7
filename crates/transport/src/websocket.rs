//! WebSocket signaling transport
//!
//! Frames are JSON text messages of the form `{"event": <name>, "data": <payload>}`.
//! A supervisor task owns the socket; when it drops, the task reconnects
//! with [`retry_with_backoff`] and reports progress as lifecycle events.
//! The outbound queue outlives individual sockets: frames accepted by
//! `emit` but not yet written go out on the next connection.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use voice_call_config::SignalingConfig;
use voice_call_core::{
    retry_with_backoff, HandlerRegistry, LifecycleHandler, RetryPolicy, SignalHandler,
    SignalingTransport, Subscription, TransportError, TransportLifecycle,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// State shared between the handle and the supervisor task
struct Shared {
    connected: AtomicBool,
    outbound: mpsc::Sender<Message>,
    handlers: HandlerRegistry<SignalHandler>,
    lifecycle: HandlerRegistry<LifecycleHandler>,
}

impl Shared {
    fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            outbound,
            handlers: HandlerRegistry::new(),
            lifecycle: HandlerRegistry::new(),
        }
    }

    fn go_online(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn go_offline(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn notify(&self, event: TransportLifecycle) {
        for handler in self.lifecycle.handlers(LIFECYCLE_KEY) {
            handler(&event);
        }
    }

    fn dispatch(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed signaling frame");
                return;
            },
        };

        let handlers = self.handlers.handlers(&frame.event);
        if handlers.is_empty() {
            tracing::trace!(event = %frame.event, "No handler for signaling event");
            return;
        }
        for handler in handlers {
            handler(frame.data.clone());
        }
    }
}

const LIFECYCLE_KEY: &str = "lifecycle";

/// Reconnection parameters taken from [`SignalingConfig`]
#[derive(Debug, Clone)]
struct ReconnectPlan {
    policy: RetryPolicy,
    attempt_timeout: Duration,
    outbound_buffer: usize,
}

impl ReconnectPlan {
    fn from_config(config: &SignalingConfig) -> Self {
        Self {
            policy: RetryPolicy::new(config.max_reconnect_attempts).with_backoff(
                config.reconnect_initial_backoff(),
                config.reconnect_max_backoff(),
            ),
            attempt_timeout: config.reconnect_attempt_timeout(),
            outbound_buffer: config.outbound_buffer,
        }
    }
}

/// `SignalingTransport` over a reconnecting WebSocket
pub struct WsSignalingTransport {
    url: String,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsSignalingTransport {
    /// Connect to the signaling backend
    ///
    /// The initial connection gets the same retry budget as reconnection.
    pub async fn connect(config: &SignalingConfig) -> Result<Self, TransportError> {
        let plan = ReconnectPlan::from_config(config);
        let url = config.url.clone();

        let connected = retry_with_backoff(
            &plan.policy.with_attempt_timeout(plan.attempt_timeout),
            |attempt| {
                tracing::debug!(url = %url, attempt, "Connecting to signaling server");
                open(&url)
            },
        )
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tracing::info!(url = %url, attempts = connected.attempts, "Signaling connected");
        Ok(Self::start(url, plan, connected.value))
    }

    /// Hand an open socket to a new supervisor task
    fn start(url: String, plan: ReconnectPlan, ws: WsStream) -> Self {
        let (tx, rx) = mpsc::channel(plan.outbound_buffer);
        let shared = Arc::new(Shared::new(tx));
        let (shutdown, shutdown_rx) = watch::channel(false);
        shared.go_online();

        let task = tokio::spawn(supervise(
            url.clone(),
            plan,
            Arc::clone(&shared),
            (ws, rx),
            shutdown_rx,
        ));

        let transport = Self {
            url,
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        };
        transport.shared.notify(TransportLifecycle::Connected);
        transport
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Close the socket and stop reconnecting
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!(url = %self.url, "Signaling transport closed");
    }
}

impl Drop for WsSignalingTransport {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl SignalingTransport for WsSignalingTransport {
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&Frame {
            event: event.to_string(),
            data: payload,
        })
        .map_err(|e| TransportError::Encode(e.to_string()))?;

        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.shared
            .outbound
            .try_send(Message::Text(frame.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Internal("outbound buffer full".to_string())
                },
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    fn on(&self, event: &str, handler: SignalHandler) -> Subscription {
        self.shared.handlers.register(event, handler)
    }

    fn on_lifecycle(&self, handler: LifecycleHandler) -> Subscription {
        self.shared.lifecycle.register(LIFECYCLE_KEY, handler)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

async fn open(url: &str) -> Result<WsStream, TransportError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    Ok(ws)
}

/// Resolves once shutdown was requested or the handle is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn supervise(
    url: String,
    plan: ReconnectPlan,
    shared: Arc<Shared>,
    first: (WsStream, mpsc::Receiver<Message>),
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut ws, mut outbound) = first;
    let mut unsent = None;
    loop {
        let reason = pump(ws, &mut outbound, &mut unsent, &shared, &mut shutdown).await;
        shared.go_offline();

        let Some(reason) = reason else {
            break;
        };
        tracing::warn!(url = %url, reason = %reason, "Signaling connection lost");
        shared.notify(TransportLifecycle::Disconnected { reason });

        let reconnected = tokio::select! {
            result = reconnect(&url, &plan, &shared) => result,
            _ = shutdown_requested(&mut shutdown) => break,
        };

        match reconnected {
            Ok((stream, attempt)) => {
                tracing::info!(url = %url, attempt, "Signaling reconnected");
                shared.go_online();
                ws = stream;
                shared.notify(TransportLifecycle::Reconnected { attempt });
            },
            Err(e) => {
                tracing::error!(url = %url, error = %e, "Giving up on signaling reconnection");
                shared.notify(TransportLifecycle::Closed {
                    reason: e.to_string(),
                });
                break;
            },
        }
    }
}

/// One bounded reconnection round; every failed attempt is reported
async fn reconnect(
    url: &str,
    plan: &ReconnectPlan,
    shared: &Arc<Shared>,
) -> Result<(WsStream, u32), TransportError> {
    let limit = plan.attempt_timeout;
    let retried = retry_with_backoff(&plan.policy, |attempt| {
        let shared = Arc::clone(shared);
        async move {
            let outcome = match tokio::time::timeout(limit, open(url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectionFailed(format!(
                    "timed out after {}ms",
                    limit.as_millis()
                ))),
            };
            if outcome.is_err() {
                shared.notify(TransportLifecycle::ReconnectFailed { attempt });
            }
            outcome
        }
    })
    .await
    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    Ok((retried.value, retried.attempts))
}

/// Move frames until the socket drops; `None` means shutdown was requested
///
/// A frame whose write failed is left in `unsent` and written first on
/// the next socket.
async fn pump(
    ws: WsStream,
    outbound: &mut mpsc::Receiver<Message>,
    unsent: &mut Option<Message>,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<String> {
    let (mut sink, mut stream) = ws.split();

    if let Some(msg) = unsent.take() {
        if let Err(e) = sink.send(msg.clone()).await {
            *unsent = Some(msg);
            return Some(format!("write failed: {}", e));
        }
    }

    loop {
        tokio::select! {
            _ = shutdown_requested(shutdown) => {
                let _ = sink.send(Message::Close(None)).await;
                return None;
            }
            Some(msg) = outbound.recv() => {
                if let Err(e) = sink.send(msg.clone()).await {
                    *unsent = Some(msg);
                    return Some(format!("write failed: {}", e));
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                },
                Some(Ok(Message::Close(frame))) => {
                    return Some(
                        frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string()),
                    );
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => return Some(e.to_string()),
                None => return Some("stream ended".to_string()),
            }
        }
    }
}
