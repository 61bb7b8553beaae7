//! Call session manager
//!
//! [`CallManager`] is a handle to a single driver task that owns the active
//! [`CallSession`]. User commands, signaling messages, transport lifecycle
//! changes, peer connection events and timers all arrive on channels and
//! are handled one at a time in the driver's `select!` loop, so two
//! transitions never race on the same session.
//!
//! The active call owns every resource it acquires (local audio, peer
//! connection, relay, handler subscriptions, timers). Ending the call
//! releases them all before [`CallEvent::Ended`] is published.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep};

use voice_call_config::constants;
use voice_call_config::Settings;
use voice_call_core::{
    retry_with_backoff, AudioConstraints, LocalAudioStream, MediaCapabilityProvider, MediaMode,
    PeerConnectionState, PeerEvent, RemoteStream, RetryPolicy, SessionDescription,
    SignalingTransport, SubscriptionSet, TransportError, TransportLifecycle,
};

use crate::negotiation::{MediaNegotiator, NegotiationConfig, TaggedPeerEvent};
use crate::relay::{FallbackRelay, RelayConfig};
use crate::session::{CallSession, CallSnapshot};
use crate::signaling::{
    events, CallControlPayload, IceCandidatePayload, InboundSignal, IncomingCallPayload,
    OutboundSignal, SendOutcome, SignalingClient, StartCallPayload,
};
use crate::state::{transition, CallState, InvalidTransition, Role, Trigger};
use crate::CallError;

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 32;
/// Ended call ids remembered to drop their late signals
const RECENT_CALL_IDS: usize = 16;

/// Incoming call details for the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub call_id: String,
    pub caller_id: String,
    pub caller_name: Option<String>,
    pub call_type: Option<String>,
}

impl From<&IncomingCallPayload> for IncomingCall {
    fn from(payload: &IncomingCallPayload) -> Self {
        Self {
            call_id: payload.call_id.clone(),
            caller_id: payload.caller_id.clone(),
            caller_name: payload.caller_name.clone(),
            call_type: payload.call_type.clone(),
        }
    }
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    LocalDecline,
    RemoteDecline,
    RemoteHangup,
    /// Ring timer expired
    NoAnswer,
    Failed(String),
    /// Manager shut down with the call still active
    Shutdown,
}

/// Events published to observers of the manager
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    IncomingCall(IncomingCall),
    StateChanged { old: CallState, new: CallState },
    /// Remote audio is available (real-time mode only)
    RemoteStream(RemoteStream),
    /// Published every second while connected
    DurationTick { seconds: u64 },
    Ended {
        call_id: Option<String>,
        duration_secs: u64,
        reason: EndReason,
    },
    Error { message: String },
    /// Signaling gave up reconnecting; no further calls are possible
    SignalingLost { reason: String },
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    StartCall {
        peer_id: String,
        reply: Reply<Result<(), CallError>>,
    },
    AcceptCall {
        reply: Reply<Result<(), CallError>>,
    },
    DeclineCall {
        reply: Reply<Result<(), CallError>>,
    },
    EndCall {
        reply: Reply<Result<(), CallError>>,
    },
    SetMuted {
        muted: bool,
        reply: Reply<Result<(), CallError>>,
    },
    SetSpeaker {
        enabled: bool,
        reply: Reply<Result<(), CallError>>,
    },
    Snapshot {
        reply: Reply<Option<CallSnapshot>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Tunables the driver reads from [`Settings`]
#[derive(Debug, Clone)]
struct ManagerConfig {
    max_connection_retries: u32,
    connection_timeout: Duration,
    ring_timeout: Duration,
    recovery_backoff: Duration,
    tolerate_not_found: bool,
    audio_constraints: AudioConstraints,
    negotiation: NegotiationConfig,
    relay: RelayConfig,
}

impl ManagerConfig {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            max_connection_retries: settings.call.max_connection_retries,
            connection_timeout: settings.call.connection_timeout(),
            ring_timeout: settings.call.ring_timeout(),
            recovery_backoff: settings.call.recovery_backoff(),
            tolerate_not_found: settings.call.tolerate_not_found_while_connecting,
            audio_constraints: settings.media.audio_constraints(),
            negotiation: NegotiationConfig::from_settings(settings),
            relay: RelayConfig::from_settings(settings),
        }
    }
}

/// Handle to the call driver
///
/// One instance per logical client. Dropping the handle shuts the driver
/// down and ends any active call.
pub struct CallManager {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    /// Spawn the driver; must be called inside a tokio runtime
    pub fn new(
        settings: &Settings,
        transport: Arc<dyn SignalingTransport>,
        media: MediaCapabilityProvider,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let signaling = Arc::new(SignalingClient::new(
            transport,
            settings.signaling.max_reconnect_attempts,
        ));

        let mut subscriptions = SubscriptionSet::new();
        subscriptions.push(signaling.subscribe(events::INCOMING_CALL, signals_tx.clone()));
        subscriptions.push(signaling.on_lifecycle(Arc::new(move |event: &TransportLifecycle| {
            let _ = lifecycle_tx.send(event.clone());
        })));

        tracing::info!(media = ?media, "Call manager started");

        let driver = Driver {
            config: ManagerConfig::from_settings(settings),
            signaling,
            media,
            events: events.clone(),
            signals_tx,
            peer_tx,
            active: None,
            recent_call_ids: VecDeque::with_capacity(RECENT_CALL_IDS),
            _subscriptions: subscriptions,
        };
        let handle = tokio::spawn(driver.run(commands_rx, signals_rx, lifecycle_rx, peer_rx));

        Self {
            commands: commands_tx,
            events,
            driver: Mutex::new(Some(handle)),
        }
    }

    /// Receive every [`CallEvent`] published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Place a call to `peer_id`
    ///
    /// A no-op while another call is active.
    pub async fn start_call(&self, peer_id: impl Into<String>) -> Result<(), CallError> {
        let peer_id = peer_id.into();
        self.request(|reply| Command::StartCall { peer_id, reply })
            .await?
    }

    /// Accept the ringing incoming call
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::AcceptCall { reply }).await?
    }

    /// Decline the ringing incoming call
    pub async fn decline_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::DeclineCall { reply }).await?
    }

    /// Hang up; a no-op without an active call
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply })
            .await?
    }

    pub async fn set_speaker(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetSpeaker { enabled, reply })
            .await?
    }

    /// Observable state of the active call, `None` when idle
    pub async fn snapshot(&self) -> Result<Option<CallSnapshot>, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// End any active call and stop the driver
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let result = self.request(|reply| Command::Shutdown { reply }).await;

        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        result
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CallError::ManagerStopped)?;
        rx.await.map_err(|_| CallError::ManagerStopped)
    }
}

type SharedNegotiator = Arc<tokio::sync::Mutex<MediaNegotiator>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutKind {
    /// Nobody answered
    Ring,
    /// Media did not reach Connected
    Connection,
}

struct Deadline {
    kind: TimeoutKind,
    sleep: Pin<Box<Sleep>>,
}

enum Timer {
    Expired(TimeoutKind),
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Connection failed: renegotiate with fresh ICE credentials
    IceRestart,
    /// Connection dropped: replace the peer connection
    Rebuild,
}

/// The session plus everything it owns
struct ActiveCall {
    session: CallSession,
    subscriptions: SubscriptionSet,
    negotiator: Option<SharedNegotiator>,
    local_audio: Option<Arc<dyn LocalAudioStream>>,
    relay: Option<FallbackRelay>,
    muted: Arc<AtomicBool>,
    deadline: Option<Deadline>,
    ticker: Option<Interval>,
}

impl ActiveCall {
    fn new(session: CallSession, subscriptions: SubscriptionSet) -> Self {
        Self {
            session,
            subscriptions,
            negotiator: None,
            local_audio: None,
            relay: None,
            muted: Arc::new(AtomicBool::new(false)),
            deadline: None,
            ticker: None,
        }
    }

    fn arm(&mut self, kind: TimeoutKind, after: Duration) {
        self.deadline = Some(Deadline {
            kind,
            sleep: Box::pin(tokio::time::sleep(after)),
        });
    }

    fn start_ticker(&mut self) {
        if self.ticker.is_none() {
            let period = Duration::from_secs(1);
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);
        }
    }

    /// Release every resource; repeated calls find nothing left to release
    async fn cleanup(&mut self) {
        self.deadline = None;
        self.ticker = None;

        if let Some(mut relay) = self.relay.take() {
            relay.stop();
        }
        if let Some(negotiator) = self.negotiator.take() {
            negotiator.lock().await.close().await;
        }
        if let Some(stream) = self.local_audio.take() {
            stream.stop();
        }
        let released = self.subscriptions.dispose_all();
        if released > 0 {
            tracing::debug!(released, "Session subscriptions disposed");
        }
    }
}

async fn next_timer(active: &mut Option<ActiveCall>) -> Timer {
    let Some(call) = active.as_mut() else {
        return std::future::pending().await;
    };

    match (call.deadline.as_mut(), call.ticker.as_mut()) {
        (Some(deadline), Some(ticker)) => {
            let kind = deadline.kind;
            tokio::select! {
                _ = deadline.sleep.as_mut() => Timer::Expired(kind),
                _ = ticker.tick() => Timer::Tick,
            }
        },
        (Some(deadline), None) => {
            deadline.sleep.as_mut().await;
            Timer::Expired(deadline.kind)
        },
        (None, Some(ticker)) => {
            ticker.tick().await;
            Timer::Tick
        },
        (None, None) => std::future::pending().await,
    }
}

struct Driver {
    config: ManagerConfig,
    signaling: Arc<SignalingClient>,
    media: MediaCapabilityProvider,
    events: broadcast::Sender<CallEvent>,
    signals_tx: mpsc::UnboundedSender<InboundSignal>,
    peer_tx: mpsc::UnboundedSender<TaggedPeerEvent>,
    active: Option<ActiveCall>,
    recent_call_ids: VecDeque<String>,
    /// Incoming-call and lifecycle handlers, held for the driver's lifetime
    _subscriptions: SubscriptionSet,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::UnboundedReceiver<InboundSignal>,
        mut lifecycle: mpsc::UnboundedReceiver<TransportLifecycle>,
        mut peer_events: mpsc::UnboundedReceiver<TaggedPeerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    },
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    },
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                Some(event) = lifecycle.recv() => self.handle_lifecycle(event).await,
                Some((generation, event)) = peer_events.recv() => {
                    self.handle_peer_event(generation, event).await
                },
                timer = next_timer(&mut self.active) => self.handle_timer(timer).await,
            }
        }

        tracing::info!("Call manager stopped");
    }

    fn emit(&self, event: CallEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(error = %message, "Call error");
        self.emit(CallEvent::Error { message });
    }

    /// Apply `trigger` to the active session and publish the change
    fn advance(&mut self, trigger: Trigger) -> Result<CallState, InvalidTransition> {
        let Some(call) = self.active.as_mut() else {
            return Err(InvalidTransition {
                from: CallState::Idle,
                trigger,
            });
        };

        let (old, new) = call.session.apply(trigger)?;
        if old != new {
            tracing::info!(
                call_id = call.session.call_id().unwrap_or("-"),
                %old,
                %new,
                %trigger,
                "Call state changed"
            );
            let _ = self.events.send(CallEvent::StateChanged { old, new });
        }
        Ok(new)
    }

    fn active_call_id(&self) -> Option<String> {
        self.active
            .as_ref()
            .and_then(|call| call.session.call_id())
            .map(str::to_string)
    }

    fn send(&self, signal: OutboundSignal) -> Result<SendOutcome, CallError> {
        self.signaling.send(signal)
    }

    // ---- commands ----

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall { peer_id, reply } => {
                let _ = reply.send(self.start_call(peer_id).await);
            },
            Command::AcceptCall { reply } => {
                let _ = reply.send(self.accept_call().await);
            },
            Command::DeclineCall { reply } => {
                let _ = reply.send(self.decline_call().await);
            },
            Command::EndCall { reply } => {
                let _ = reply.send(self.end_call().await);
            },
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_muted(muted));
            },
            Command::SetSpeaker { enabled, reply } => {
                let _ = reply.send(self.set_speaker(enabled));
            },
            Command::Snapshot { reply } => {
                let snapshot = self.active.as_ref().map(|call| call.session.snapshot());
                let _ = reply.send(snapshot);
            },
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            },
        }
    }

    async fn start_call(&mut self, peer_id: String) -> Result<(), CallError> {
        if let Some(call) = &self.active {
            tracing::info!(
                state = %call.session.state(),
                "Call already in progress, ignoring start_call"
            );
            return Ok(());
        }

        let Some(mode) = self.media.media_mode() else {
            let reason = self.unavailable_reason();
            self.report_error(format!("Cannot place call: {}", reason));
            return Err(CallError::CapabilityUnavailable(reason));
        };

        if !self.signaling.is_connected() {
            self.report_error("Cannot place call: signaling is not connected");
            return Err(TransportError::NotConnected.into());
        }

        let local_audio = match self.acquire_local_audio().await {
            Ok(stream) => stream,
            Err(e) => {
                self.report_error(format!("Cannot place call: {}", e));
                return Err(e);
            },
        };

        let outcome = self.send(OutboundSignal::StartCall(StartCallPayload {
            receiver_id: peer_id.clone(),
            call_type: constants::call::CALL_TYPE_VOICE.to_string(),
        }));
        if !matches!(outcome, Ok(SendOutcome::Sent)) {
            if let Some(stream) = &local_audio {
                stream.stop();
            }
            self.report_error("Cannot place call: start-call was not delivered");
            return match outcome {
                Err(e) => Err(e),
                Ok(_) => Err(TransportError::NotConnected.into()),
            };
        }

        let session =
            CallSession::outgoing(peer_id.as_str(), mode, self.config.max_connection_retries);
        let mut call = self.new_active(session, Role::Caller, local_audio);
        call.arm(TimeoutKind::Ring, self.config.ring_timeout);
        self.active = Some(call);
        self.advance(Trigger::StartCall)?;

        tracing::info!(peer_id = %peer_id, mode = ?mode, "Calling");
        Ok(())
    }

    async fn accept_call(&mut self) -> Result<(), CallError> {
        let Some(call) = &self.active else {
            return Err(CallError::NoActiveCall);
        };
        let state = call.session.state();
        transition(state, Trigger::AcceptCall)?;
        let call_id = call.session.call_id().unwrap_or_default().to_string();
        let media_mode = call.session.media_mode();

        if !self.signaling.is_connected() {
            return Err(TransportError::NotConnected.into());
        }

        let local_audio = match self.acquire_local_audio().await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_call(Trigger::Abort, format!("Cannot answer call: {}", e)).await;
                return Err(e);
            },
        };

        let negotiator = self.new_negotiator(Role::Receiver, local_audio.clone());
        if let Some(call) = self.active.as_mut() {
            call.local_audio = local_audio;
            call.negotiator = negotiator;
        }

        let outcome = self.send(OutboundSignal::AcceptCall(CallControlPayload::new(
            call_id.as_str(),
        )));
        if !matches!(outcome, Ok(SendOutcome::Sent)) {
            // Still ringing; release media so a retried accept starts clean
            if let Some(call) = self.active.as_mut() {
                if let Some(stream) = call.local_audio.take() {
                    stream.stop();
                }
                if let Some(negotiator) = call.negotiator.take() {
                    negotiator.lock().await.close().await;
                }
            }
            self.report_error("Cannot answer call: accept-call was not delivered");
            return match outcome {
                Err(e) => Err(e),
                Ok(_) => Err(TransportError::NotConnected.into()),
            };
        }
        self.advance(Trigger::AcceptCall)?;

        match media_mode {
            MediaMode::FullDuplexRealtime => {
                if let Some(call) = self.active.as_mut() {
                    call.arm(TimeoutKind::Connection, self.config.connection_timeout);
                }
            },
            MediaMode::ChunkedRelayFallback => self.enter_connected(),
        }
        Ok(())
    }

    async fn decline_call(&mut self) -> Result<(), CallError> {
        let Some(call) = &self.active else {
            return Err(CallError::NoActiveCall);
        };
        transition(call.session.state(), Trigger::DeclineCall)?;

        if let Some(call_id) = self.active_call_id() {
            self.send(OutboundSignal::DeclineCall(CallControlPayload::new(call_id)))?;
        }
        self.end_session(Trigger::DeclineCall, EndReason::LocalDecline)
            .await;
        Ok(())
    }

    async fn end_call(&mut self) -> Result<(), CallError> {
        let Some(call) = &self.active else {
            tracing::debug!("end_call without an active call");
            return Ok(());
        };

        if let Some(call_id) = call.session.call_id() {
            let duration = call.session.duration_secs();
            let payload = CallControlPayload::new(call_id).with_duration(duration);
            if let Err(e) = self.send(OutboundSignal::EndCall(payload)) {
                tracing::warn!(error = %e, "Failed to send end-call");
            }
        }
        self.end_session(Trigger::EndCall, EndReason::LocalHangup)
            .await;
        Ok(())
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), CallError> {
        let call = self.active.as_mut().ok_or(CallError::NoActiveCall)?;
        call.session.set_muted(muted);
        call.muted.store(muted, Ordering::SeqCst);
        if let Some(stream) = &call.local_audio {
            stream.set_enabled(!muted);
        }
        tracing::info!(muted, "Microphone toggled");
        Ok(())
    }

    fn set_speaker(&mut self, enabled: bool) -> Result<(), CallError> {
        let call = self.active.as_mut().ok_or(CallError::NoActiveCall)?;
        call.session.set_speaker(enabled);
        match &self.media {
            MediaCapabilityProvider::FullDuplex(media) => media.set_speaker(enabled),
            MediaCapabilityProvider::ChunkedFallback(audio) => audio.set_speaker(enabled),
            MediaCapabilityProvider::Unavailable { .. } => {},
        }
        tracing::info!(enabled, "Speaker toggled");
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.active.is_none() {
            return;
        }
        if let Some(call_id) = self.active_call_id() {
            let _ = self.send(OutboundSignal::EndCall(CallControlPayload::new(call_id)));
        }
        self.end_session(Trigger::EndCall, EndReason::Shutdown).await;
    }

    fn unavailable_reason(&self) -> String {
        match &self.media {
            MediaCapabilityProvider::Unavailable { reason } => reason.clone(),
            _ => "no audio capability".to_string(),
        }
    }

    /// Microphone for real-time mode; fallback mode records per chunk
    async fn acquire_local_audio(&self) -> Result<Option<Arc<dyn LocalAudioStream>>, CallError> {
        match &self.media {
            MediaCapabilityProvider::FullDuplex(media) => {
                let stream = media
                    .acquire_local_audio(&self.config.audio_constraints)
                    .await?;
                tracing::debug!(stream_id = stream.id(), "Local audio acquired");
                Ok(Some(stream))
            },
            MediaCapabilityProvider::ChunkedFallback(_) => Ok(None),
            MediaCapabilityProvider::Unavailable { reason } => {
                Err(CallError::CapabilityUnavailable(reason.clone()))
            },
        }
    }

    fn new_active(
        &self,
        session: CallSession,
        role: Role,
        local_audio: Option<Arc<dyn LocalAudioStream>>,
    ) -> ActiveCall {
        let mut subscriptions = SubscriptionSet::new();
        subscriptions.extend(self.signaling.subscribe_session(&self.signals_tx));

        let mut call = ActiveCall::new(session, subscriptions);
        // The receiver negotiates only once it accepts
        if role == Role::Caller {
            call.negotiator = self.new_negotiator(role, local_audio.clone());
        }
        call.local_audio = local_audio;
        call
    }

    fn new_negotiator(
        &self,
        role: Role,
        local_audio: Option<Arc<dyn LocalAudioStream>>,
    ) -> Option<SharedNegotiator> {
        let MediaCapabilityProvider::FullDuplex(media) = &self.media else {
            return None;
        };
        let negotiator = MediaNegotiator::new(
            Arc::clone(media),
            Arc::clone(&self.signaling),
            self.config.negotiation.clone(),
            role,
            local_audio,
            self.peer_tx.clone(),
        );
        Some(Arc::new(tokio::sync::Mutex::new(negotiator)))
    }

    // ---- signaling ----

    async fn handle_signal(&mut self, signal: InboundSignal) {
        if let Some(call_id) = signal.call_id() {
            if self.recent_call_ids.iter().any(|ended| ended == call_id) {
                tracing::debug!(call_id, "Signal for an ended call ignored");
                return;
            }
        }

        if let InboundSignal::IncomingCall(payload) = signal {
            self.on_incoming_call(payload);
            return;
        }

        let Some(call) = &self.active else {
            tracing::debug!(call_id = ?signal.call_id(), "Signal without an active call ignored");
            return;
        };
        if !call.session.matches(signal.call_id()) {
            tracing::debug!(call_id = ?signal.call_id(), "Signal for another call ignored");
            return;
        }
        // Until call-accepted assigns the id only call control can concern us
        if call.session.call_id().is_none() && !signal.is_call_control() {
            tracing::debug!(call_id = ?signal.call_id(), "Signal before the call id ignored");
            return;
        }

        match signal {
            InboundSignal::CallAccepted(payload) => self.on_call_accepted(payload).await,
            InboundSignal::CallDeclined(_) => {
                self.end_session(Trigger::PeerDeclined, EndReason::RemoteDecline)
                    .await
            },
            InboundSignal::CallEnded(_) => {
                self.end_session(Trigger::PeerEnded, EndReason::RemoteHangup)
                    .await
            },
            InboundSignal::Offer(payload) => self.on_offer(payload.call_id, payload.offer).await,
            InboundSignal::Answer(payload) => {
                let Some(negotiator) = self.negotiator() else {
                    return;
                };
                let result = negotiator.lock().await.handle_answer(payload.answer).await;
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to apply answer");
                }
            },
            InboundSignal::IceCandidate(payload) => {
                let Some(negotiator) = self.negotiator() else {
                    return;
                };
                let mut guard = negotiator.lock().await;
                guard.handle_ice_candidate(payload.candidate).await;
            },
            InboundSignal::Error(payload) => self.on_server_error(payload.error).await,
            InboundSignal::AudioChunk(payload) => {
                match self.active.as_ref().and_then(|call| call.relay.as_ref()) {
                    Some(relay) => relay.play(payload.audio_uri),
                    None => tracing::debug!("Audio chunk outside a relayed call ignored"),
                }
            },
            InboundSignal::IncomingCall(_) => {},
        }
    }

    fn negotiator(&self) -> Option<SharedNegotiator> {
        self.active
            .as_ref()
            .and_then(|call| call.negotiator.clone())
    }

    fn on_incoming_call(&mut self, payload: IncomingCallPayload) {
        if let Some(call) = &self.active {
            if call.session.call_id() == Some(payload.call_id.as_str()) {
                tracing::debug!(call_id = %payload.call_id, "Duplicate incoming call ignored");
            } else {
                tracing::info!(
                    call_id = %payload.call_id,
                    caller_id = %payload.caller_id,
                    "Busy, ignoring incoming call"
                );
            }
            return;
        }

        let Some(mode) = self.media.media_mode() else {
            let reason = self.unavailable_reason();
            self.report_error(format!("Cannot receive call: {}", reason));
            let _ = self.send(OutboundSignal::DeclineCall(CallControlPayload::new(
                payload.call_id.as_str(),
            )));
            return;
        };

        tracing::info!(
            call_id = %payload.call_id,
            caller_id = %payload.caller_id,
            "Incoming call"
        );

        let session = CallSession::incoming(
            payload.call_id.as_str(),
            payload.caller_id.as_str(),
            payload.caller_name.clone(),
            mode,
            self.config.max_connection_retries,
        );
        let mut call = self.new_active(session, Role::Receiver, None);
        call.arm(TimeoutKind::Ring, self.config.ring_timeout);
        self.active = Some(call);

        if let Err(e) = self.advance(Trigger::IncomingCall) {
            tracing::warn!(error = %e, "Incoming call rejected");
            self.active = None;
            return;
        }
        self.emit(CallEvent::IncomingCall(IncomingCall::from(&payload)));
    }

    async fn on_call_accepted(&mut self, payload: CallControlPayload) {
        let Some(call) = self.active.as_mut() else {
            return;
        };
        if call.session.role() != Role::Caller || call.session.state() != CallState::Calling {
            tracing::debug!(state = %call.session.state(), "call-accepted ignored");
            return;
        }

        if let Some(call_id) = payload.call_id.as_deref() {
            if call.session.adopt_call_id(call_id) {
                tracing::info!(call_id, "Call id assigned");
            }
        }
        let Some(call_id) = call.session.call_id().map(str::to_string) else {
            self.fail_call(Trigger::Abort, "call-accepted without a call id").await;
            return;
        };
        let media_mode = call.session.media_mode();

        if self.advance(Trigger::CallAccepted).is_err() {
            return;
        }

        match media_mode {
            MediaMode::ChunkedRelayFallback => self.enter_connected(),
            MediaMode::FullDuplexRealtime => {
                if let Some(call) = self.active.as_mut() {
                    call.arm(TimeoutKind::Connection, self.config.connection_timeout);
                }
                let Some(negotiator) = self.negotiator() else {
                    return;
                };
                let result = negotiator.lock().await.create_offer(&call_id, false).await;
                if let Err(e) = result {
                    self.fail_call(Trigger::Abort, format!("Failed to create offer: {}", e)).await;
                }
            },
        }
    }

    async fn on_offer(&mut self, call_id: String, offer: SessionDescription) {
        let role = self.active.as_ref().map(|call| call.session.role());
        if role != Some(Role::Receiver) {
            // The caller always offers; glare is not resolved
            tracing::debug!(call_id = %call_id, "Offer received as caller ignored");
            return;
        }
        if let Err(e) = self.advance(Trigger::RemoteOffer) {
            tracing::warn!(error = %e, "Offer ignored");
            return;
        }
        let Some(negotiator) = self.negotiator() else {
            tracing::debug!("Offer without real-time media ignored");
            return;
        };

        let result = negotiator.lock().await.handle_offer(&call_id, offer).await;
        if let Err(e) = result {
            self.fail_call(Trigger::Abort, format!("Failed to answer offer: {}", e)).await;
        }
    }

    async fn on_server_error(&mut self, message: String) {
        let connecting = self
            .active
            .as_ref()
            .map(|call| call.session.state() == CallState::Connecting)
            .unwrap_or(false);

        if connecting
            && self.config.tolerate_not_found
            && message.to_lowercase().contains("not found")
        {
            tracing::warn!(
                error = %message,
                "Server reported not found while connecting, continuing"
            );
            return;
        }

        self.fail_call(Trigger::Abort, message).await;
    }

    // ---- transport lifecycle ----

    async fn handle_lifecycle(&mut self, event: TransportLifecycle) {
        match event {
            TransportLifecycle::Connected => tracing::debug!("Signaling connected"),
            TransportLifecycle::Disconnected { reason } => {
                tracing::warn!(reason = %reason, "Signaling disconnected");
            },
            TransportLifecycle::Reconnected { attempt } => {
                tracing::info!(attempt, "Signaling reconnected");
                if let Err(e) = self.signaling.on_reconnect() {
                    tracing::warn!(error = %e, "Failed to resend pending signal");
                }
            },
            TransportLifecycle::ReconnectFailed { attempt } => {
                let failures = self.signaling.record_reconnect_failure();
                tracing::warn!(attempt, failures, "Signaling reconnect failed");

                if self.active.is_some() && self.signaling.reconnect_budget_exhausted() {
                    self.fail_call(Trigger::Abort, "Connection lost").await;
                }
            },
            TransportLifecycle::Closed { reason } => {
                tracing::error!(reason = %reason, "Signaling closed for good");
                if self.active.is_some() {
                    self.fail_call(Trigger::Abort, "Connection lost").await;
                }
                self.report_error(format!("Signaling closed: {}", reason));
                self.emit(CallEvent::SignalingLost { reason });
            },
        }
    }

    // ---- peer connection ----

    async fn handle_peer_event(&mut self, generation: u64, event: PeerEvent) {
        let Some(negotiator) = self.negotiator() else {
            tracing::debug!(generation, "Peer event without negotiation ignored");
            return;
        };
        if !negotiator.lock().await.is_current(generation) {
            tracing::debug!(generation, "Stale peer event ignored");
            return;
        }

        match event {
            PeerEvent::IceCandidate(candidate) => {
                let Some(call_id) = self.active_call_id() else {
                    return;
                };
                if let Err(e) = self.send(OutboundSignal::IceCandidate(IceCandidatePayload {
                    call_id,
                    candidate,
                })) {
                    tracing::debug!(error = %e, "Failed to send ICE candidate");
                }
            },
            PeerEvent::Track(stream) => {
                tracing::info!(stream_id = %stream.stream_id, "Remote audio received");
                self.emit(CallEvent::RemoteStream(stream));
            },
            PeerEvent::IceGatheringStateChange(state) => {
                tracing::debug!(?state, "ICE gathering state changed");
            },
            PeerEvent::ConnectionStateChange(state) => {
                negotiator.lock().await.set_connection_state(state);
                tracing::info!(%state, generation, "Peer connection state changed");

                match state {
                    PeerConnectionState::Connected => self.enter_connected(),
                    PeerConnectionState::Failed => self.recover(Recovery::IceRestart).await,
                    PeerConnectionState::Disconnected => self.recover(Recovery::Rebuild).await,
                    _ => {},
                }
            },
        }
    }

    /// Media is flowing: stop the setup timer, start the clock and relay
    fn enter_connected(&mut self) {
        if let Err(e) = self.advance(Trigger::MediaConnected) {
            tracing::debug!(error = %e, "Media connected outside a live call");
            return;
        }

        let Some(call) = self.active.as_mut() else {
            return;
        };
        call.deadline = None;
        call.start_ticker();

        if call.relay.is_some() {
            return;
        }
        let (MediaCapabilityProvider::ChunkedFallback(audio), Some(call_id)) =
            (&self.media, call.session.call_id())
        else {
            return;
        };
        call.relay = Some(FallbackRelay::start(
            Arc::clone(audio),
            Arc::clone(&self.signaling),
            call_id.to_string(),
            self.config.relay,
            Arc::clone(&call.muted),
        ));
    }

    async fn recover(&mut self, kind: Recovery) {
        let Some(call) = self.active.as_mut() else {
            return;
        };
        let remaining = call.session.remaining_retries();
        if remaining == 0 {
            let retries = call.session.retry_count();
            self.fail_call(
                Trigger::MediaFailed,
                format!("Media connection failed after {} recovery attempts", retries),
            )
            .await;
            return;
        }

        let role = call.session.role();
        let call_id = call.session.call_id().map(str::to_string);

        // The caller owns renegotiation; the receiver waits for its restart offer
        if role == Role::Receiver && kind == Recovery::IceRestart {
            call.session.record_retries(1);
            call.arm(TimeoutKind::Connection, self.config.connection_timeout);
            tracing::info!(
                retry = call.session.retry_count(),
                "Waiting for the caller to restart ICE"
            );
            return;
        }

        let Some(negotiator) = call.negotiator.clone() else {
            return;
        };

        let policy = RetryPolicy::new(remaining).with_backoff(
            self.config.recovery_backoff,
            self.config.recovery_backoff.saturating_mul(8),
        );
        tracing::info!(?kind, remaining, "Recovering media connection");

        let result = retry_with_backoff(&policy, |attempt| {
            let negotiator = Arc::clone(&negotiator);
            let call_id = call_id.clone();
            async move {
                tracing::debug!(attempt, ?kind, "Recovery attempt");
                let mut negotiator = negotiator.lock().await;
                match (kind, call_id.as_deref()) {
                    (Recovery::IceRestart, Some(call_id)) => {
                        negotiator.restart_ice(call_id).await.map(|_| ())
                    },
                    (Recovery::IceRestart, None) => {
                        Err(CallError::Protocol("ICE restart without a call id".to_string()))
                    },
                    (Recovery::Rebuild, call_id) => negotiator.rebuild(call_id).await.map(|_| ()),
                }
            }
        })
        .await;

        let Some(call) = self.active.as_mut() else {
            return;
        };
        match result {
            Ok(retried) => {
                call.session.record_retries(retried.attempts);
                call.arm(TimeoutKind::Connection, self.config.connection_timeout);
                tracing::info!(
                    attempts = retried.attempts,
                    retry = call.session.retry_count(),
                    "Recovery started, waiting for media"
                );
            },
            Err(e) => {
                call.session.record_retries(e.attempts());
                self.fail_call(Trigger::MediaFailed, format!("Media recovery failed: {}", e)).await;
            },
        }
    }

    // ---- timers ----

    async fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Tick => {
                if let Some(call) = &self.active {
                    let seconds = call.session.duration_secs();
                    self.emit(CallEvent::DurationTick { seconds });
                }
            },
            Timer::Expired(kind) => {
                if let Some(call) = self.active.as_mut() {
                    call.deadline = None;
                }
                match kind {
                    TimeoutKind::Ring => self.on_ring_timeout().await,
                    TimeoutKind::Connection => {
                        self.fail_call(Trigger::Timeout, "Connection timed out").await;
                    },
                }
            },
        }
    }

    async fn on_ring_timeout(&mut self) {
        let Some(call) = &self.active else {
            return;
        };
        tracing::info!(state = %call.session.state(), "Ring timeout");

        if call.session.role() == Role::Caller {
            if let Some(call_id) = call.session.call_id() {
                let _ = self.send(OutboundSignal::EndCall(CallControlPayload::new(call_id)));
            }
        }
        self.end_session(Trigger::Timeout, EndReason::NoAnswer).await;
    }

    // ---- teardown ----

    /// Tell the peer the call is over and end it with an error
    async fn fail_call(&mut self, trigger: Trigger, message: impl Into<String>) {
        if let Some(call_id) = self.active_call_id() {
            let _ = self.send(OutboundSignal::EndCall(CallControlPayload::new(call_id)));
        }
        self.end_session(trigger, EndReason::Failed(message.into()))
            .await;
    }

    fn remember_ended(&mut self, call_id: String) {
        if self.recent_call_ids.len() == RECENT_CALL_IDS {
            self.recent_call_ids.pop_front();
        }
        self.recent_call_ids.push_back(call_id);
    }

    /// Move the session to Ended, release everything and publish the end
    async fn end_session(&mut self, trigger: Trigger, reason: EndReason) {
        let Some(mut call) = self.active.take() else {
            return;
        };

        let old = call.session.state();
        let new = match call.session.apply(trigger) {
            Ok((_, new)) => new,
            Err(e) => {
                tracing::debug!(error = %e, "Ending with Abort instead");
                call.session
                    .apply(Trigger::Abort)
                    .map(|(_, new)| new)
                    .unwrap_or(CallState::Ended)
            },
        };
        let call_id = call.session.call_id().map(str::to_string);
        let duration_secs = call.session.duration_secs();

        call.cleanup().await;
        if let Some(call_id) = &call_id {
            self.remember_ended(call_id.clone());
        }
        self.signaling.clear_pending();

        tracing::info!(
            call_id = call_id.as_deref().unwrap_or("-"),
            %old,
            %new,
            duration_secs,
            reason = ?reason,
            "Call ended"
        );

        if old != new {
            self.emit(CallEvent::StateChanged { old, new });
        }
        if let EndReason::Failed(message) = &reason {
            self.emit(CallEvent::Error {
                message: message.clone(),
            });
        }
        self.emit(CallEvent::Ended {
            call_id,
            duration_secs,
            reason,
        });
    }
}
