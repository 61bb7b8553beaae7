//! In-memory doubles for driving a `CallManager` in tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use voice_call_client::{CallEvent, CallManager};
use voice_call_config::Settings;
use voice_call_core::{
    AudioChunk, AudioConstraints, ChunkedAudio, HandlerRegistry, IceCandidate, IceServer,
    LifecycleHandler, LocalAudioStream, MediaCapabilityProvider, MediaError, PeerConnection,
    PeerConnectionState, PeerEvent, RealtimeMedia, SessionDescription, SignalHandler,
    SignalingTransport, Subscription, TransportError, TransportLifecycle,
};

/// Let the driver process whatever is queued
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Everything published so far
pub fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub fn ended_reason(events: &[CallEvent]) -> Option<voice_call_client::EndReason> {
    events.iter().find_map(|event| match event {
        CallEvent::Ended { reason, .. } => Some(reason.clone()),
        _ => None,
    })
}

pub fn errors(events: &[CallEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            CallEvent::Error { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn manager(
    transport: &Arc<MockTransport>,
    media: MediaCapabilityProvider,
) -> (CallManager, broadcast::Receiver<CallEvent>) {
    manager_with(&Settings::default(), transport, media)
}

pub fn manager_with(
    settings: &Settings,
    transport: &Arc<MockTransport>,
    media: MediaCapabilityProvider,
) -> (CallManager, broadcast::Receiver<CallEvent>) {
    let manager = CallManager::new(settings, transport.clone(), media);
    let events = manager.subscribe();
    (manager, events)
}

// ---- signaling ----

/// Records every emitted frame and lets tests inject inbound ones
pub struct MockTransport {
    connected: AtomicBool,
    rejecting: AtomicBool,
    sent: Mutex<Vec<(String, Value)>>,
    handlers: HandlerRegistry<SignalHandler>,
    lifecycle: HandlerRegistry<LifecycleHandler>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            rejecting: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            handlers: HandlerRegistry::new(),
            lifecycle: HandlerRegistry::new(),
        })
    }

    /// Dispatch an inbound frame to every handler registered for `event`
    pub fn deliver(&self, event: &str, data: Value) {
        for handler in self.handlers.handlers(event) {
            handler(data.clone());
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail every emit while still reporting connected, as a socket that
    /// died before the client noticed
    pub fn reject_emits(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn fire_lifecycle(&self, event: TransportLifecycle) {
        for handler in self.lifecycle.handlers("lifecycle") {
            handler(&event);
        }
    }

    /// Payloads emitted for `event`, oldest first
    pub fn sent(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.sent(event).len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.handler_count(event)
    }
}

impl SignalingTransport for MockTransport {
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push((event.to_string(), payload));
        Ok(())
    }

    fn on(&self, event: &str, handler: SignalHandler) -> Subscription {
        self.handlers.register(event, handler)
    }

    fn on_lifecycle(&self, handler: LifecycleHandler) -> Subscription {
        self.lifecycle.register("lifecycle", handler)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ---- real-time media ----

pub struct MockAudio {
    id: String,
    enabled: AtomicBool,
    live: AtomicBool,
    stops: AtomicUsize,
}

impl MockAudio {
    fn new(id: String) -> Self {
        Self {
            id,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LocalAudioStream for MockAudio {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Peer connection that does what tests tell it to
pub struct ScriptedPeer {
    events: mpsc::UnboundedSender<PeerEvent>,
    gathered: AtomicBool,
    offers: Mutex<Vec<bool>>,
    remote: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    attached: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedPeer {
    /// Raise a connection state change as the media stack would
    pub fn emit_state(&self, state: PeerConnectionState) {
        self.emit(PeerEvent::ConnectionStateChange(state));
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    /// `ice_restart` flag of every offer created, oldest first
    pub fn offers(&self) -> Vec<bool> {
        self.offers.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn attached_streams(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for ScriptedPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        self.offers.lock().push(ice_restart);
        Ok(SessionDescription::offer(format!("v=0 offer restart={}", ice_restart)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), MediaError> {
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.remote.lock().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        if self.remote.lock().is_empty() {
            return Err(MediaError::IceCandidate("no remote description".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_local_audio(&self, _stream: Arc<dyn LocalAudioStream>) -> Result<(), MediaError> {
        self.attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        None
    }

    fn ice_gathering_complete(&self) -> bool {
        self.gathered.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct ScriptedMedia {
    gathering_completes: bool,
    streams: Mutex<Vec<Arc<MockAudio>>>,
    peers: Mutex<Vec<Arc<ScriptedPeer>>>,
}

impl ScriptedMedia {
    /// ICE gathering completes as soon as a peer exists
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gathering_completes: true,
            streams: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
        })
    }

    /// ICE gathering never completes
    pub fn never_gathers() -> Arc<Self> {
        Arc::new(Self {
            gathering_completes: false,
            streams: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn provider(self: &Arc<Self>) -> MediaCapabilityProvider {
        MediaCapabilityProvider::FullDuplex(self.clone())
    }

    pub fn acquire_count(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn stream(&self, index: usize) -> Arc<MockAudio> {
        Arc::clone(&self.streams.lock()[index])
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer(&self, index: usize) -> Arc<ScriptedPeer> {
        Arc::clone(&self.peers.lock()[index])
    }

    pub fn latest_peer(&self) -> Arc<ScriptedPeer> {
        let peers = self.peers.lock();
        Arc::clone(peers.last().expect("no peer connection created"))
    }
}

#[async_trait]
impl RealtimeMedia for ScriptedMedia {
    async fn acquire_local_audio(
        &self,
        _constraints: &AudioConstraints,
    ) -> Result<Arc<dyn LocalAudioStream>, MediaError> {
        let mut streams = self.streams.lock();
        let stream = Arc::new(MockAudio::new(format!("mic-{}", streams.len())));
        streams.push(Arc::clone(&stream));
        Ok(stream)
    }

    async fn create_peer_connection(
        &self,
        _ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let peer = Arc::new(ScriptedPeer {
            events,
            gathered: AtomicBool::new(self.gathering_completes),
            offers: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            attached: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ---- fallback ----

/// Chunked audio that "records" for the requested time
#[derive(Default)]
pub struct ChunkRecorder {
    recorded: AtomicUsize,
    played: Mutex<Vec<String>>,
    speaker: AtomicBool,
}

impl ChunkRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn provider(self: &Arc<Self>) -> MediaCapabilityProvider {
        MediaCapabilityProvider::ChunkedFallback(self.clone())
    }

    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::SeqCst)
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().clone()
    }

    pub fn speaker_on(&self) -> bool {
        self.speaker.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkedAudio for ChunkRecorder {
    async fn record_chunk(&self, duration: Duration) -> Result<AudioChunk, MediaError> {
        tokio::time::sleep(duration).await;
        let n = self.recorded.fetch_add(1, Ordering::SeqCst);
        Ok(AudioChunk {
            uri: format!("file:///tmp/chunk-{}.m4a", n),
            duration_ms: duration.as_millis() as u64,
        })
    }

    async fn play_chunk(&self, uri: &str) -> Result<(), MediaError> {
        self.played.lock().push(uri.to_string());
        Ok(())
    }

    fn set_speaker(&self, enabled: bool) {
        self.speaker.store(enabled, Ordering::SeqCst);
    }
}
