//! Media negotiation
//!
//! Drives offer/answer/ICE over one peer connection at a time. Every peer
//! connection gets a generation number and its events are tagged with it,
//! so events from a closed or rebuilt connection can be told apart.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use voice_call_config::Settings;
use voice_call_core::{
    IceCandidate, IceServer, LocalAudioStream, MediaError, PeerConnection, PeerConnectionState,
    PeerEvent, RealtimeMedia, SessionDescription,
};

use crate::signaling::{AnswerPayload, OfferPayload, OutboundSignal, SendOutcome, SignalingClient};
use crate::state::Role;
use crate::CallError;

/// Peer event tagged with the generation of the connection that raised it
pub type TaggedPeerEvent = (u64, PeerEvent);

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub ice_servers: Vec<IceServer>,
    /// Upper bound for the gathering wait after setting a local description
    pub ice_gathering_timeout: Duration,
    pub ice_poll_interval: Duration,
}

impl NegotiationConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ice_servers: settings.media.ice_servers.clone(),
            ice_gathering_timeout: settings.call.ice_gathering_timeout(),
            ice_poll_interval: settings.call.ice_poll_interval(),
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Offer/answer/ICE state for one call session
pub struct MediaNegotiator {
    media: Arc<dyn RealtimeMedia>,
    signaling: Arc<SignalingClient>,
    config: NegotiationConfig,
    role: Role,
    local_audio: Option<Arc<dyn LocalAudioStream>>,
    peer: Option<Arc<dyn PeerConnection>>,
    forwarder: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<TaggedPeerEvent>,
    generation: u64,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    connection_state: PeerConnectionState,
}

impl MediaNegotiator {
    pub fn new(
        media: Arc<dyn RealtimeMedia>,
        signaling: Arc<SignalingClient>,
        config: NegotiationConfig,
        role: Role,
        local_audio: Option<Arc<dyn LocalAudioStream>>,
        events: mpsc::UnboundedSender<TaggedPeerEvent>,
    ) -> Self {
        Self {
            media,
            signaling,
            config,
            role,
            local_audio,
            peer: None,
            forwarder: None,
            events,
            generation: 0,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            connection_state: PeerConnectionState::New,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an event tagged `generation` came from the live connection
    pub fn is_current(&self, generation: u64) -> bool {
        self.peer.is_some() && generation == self.generation
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection_state
    }

    /// Mirror the state reported by the peer connection
    pub fn set_connection_state(&mut self, state: PeerConnectionState) {
        self.connection_state = state;
    }

    pub fn ice_gathering_complete(&self) -> bool {
        self.peer
            .as_ref()
            .map(|peer| peer.ice_gathering_complete())
            .unwrap_or(false)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Create a fresh peer connection and attach local audio
    ///
    /// Closes the previous connection first. Remote description and
    /// buffered candidates belong to the old connection and are discarded.
    /// Candidates buffered before any connection existed are kept.
    pub async fn build(&mut self) -> Result<(), CallError> {
        let early_candidates = match self.peer {
            Some(_) => Vec::new(),
            None => std::mem::take(&mut self.pending_candidates),
        };
        self.close().await;
        self.pending_candidates = early_candidates;
        self.generation += 1;
        let generation = self.generation;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if sink.send((generation, event)).is_err() {
                    break;
                }
            }
        });

        let peer = match self
            .media
            .create_peer_connection(&self.config.ice_servers, tx)
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                forwarder.abort();
                return Err(e.into());
            },
        };

        if let Some(stream) = &self.local_audio {
            if let Err(e) = peer.add_local_audio(Arc::clone(stream)).await {
                peer.close().await;
                forwarder.abort();
                return Err(e.into());
            }
        }

        tracing::debug!(generation, "Peer connection built");
        self.peer = Some(peer);
        self.forwarder = Some(forwarder);
        self.connection_state = PeerConnectionState::New;
        Ok(())
    }

    async fn ensure_peer(&mut self) -> Result<Arc<dyn PeerConnection>, CallError> {
        if self.peer.is_none() {
            self.build().await?;
        }
        self.peer
            .clone()
            .ok_or(CallError::Media(MediaError::Closed))
    }

    /// Create and send an offer
    ///
    /// Waits for ICE gathering up to the configured bound, then sends
    /// whatever candidates the local description holds by then.
    pub async fn create_offer(
        &mut self,
        call_id: &str,
        ice_restart: bool,
    ) -> Result<SendOutcome, CallError> {
        let peer = self.ensure_peer().await?;

        let offer = peer.create_offer(ice_restart).await?;
        peer.set_local_description(offer.clone()).await?;
        self.wait_for_ice().await;
        let offer = peer.local_description().await.unwrap_or(offer);

        tracing::info!(call_id, ice_restart, "Sending offer");
        self.signaling.send(OutboundSignal::Offer(OfferPayload {
            call_id: call_id.to_string(),
            offer,
            ice_restart,
        }))
    }

    /// Apply a remote offer and send the answer
    pub async fn handle_offer(
        &mut self,
        call_id: &str,
        offer: SessionDescription,
    ) -> Result<SendOutcome, CallError> {
        let peer = self.ensure_peer().await?;

        peer.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_candidates(&peer).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.wait_for_ice().await;
        let answer = peer.local_description().await.unwrap_or(answer);

        tracing::info!(call_id, "Sending answer");
        self.signaling.send(OutboundSignal::Answer(AnswerPayload {
            call_id: call_id.to_string(),
            answer,
        }))
    }

    /// Apply the remote answer
    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        let peer = self
            .peer
            .clone()
            .ok_or(CallError::Media(MediaError::Closed))?;

        peer.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.flush_candidates(&peer).await;
        Ok(())
    }

    /// Add a remote candidate, buffering it until a remote description exists
    ///
    /// Failures are logged and swallowed.
    pub async fn handle_ice_candidate(&mut self, candidate: IceCandidate) {
        match &self.peer {
            Some(peer) if self.remote_description_set => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    tracing::warn!(error = %e, "Ignoring rejected ICE candidate");
                }
            },
            _ => {
                tracing::debug!("Buffering ICE candidate until remote description is set");
                self.pending_candidates.push(candidate);
            },
        }
    }

    async fn flush_candidates(&mut self, peer: &Arc<dyn PeerConnection>) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if pending.is_empty() {
            return;
        }

        tracing::debug!(count = pending.len(), "Applying buffered ICE candidates");
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Ignoring rejected ICE candidate");
            }
        }
    }

    /// Renegotiate with fresh ICE credentials on the current connection
    pub async fn restart_ice(&mut self, call_id: &str) -> Result<SendOutcome, CallError> {
        tracing::info!(call_id, "Restarting ICE");
        self.create_offer(call_id, true).await
    }

    /// Replace the peer connection from scratch
    ///
    /// The caller re-offers on the new connection; the receiver waits for
    /// the peer's next offer. Returns the offer outcome when one was sent.
    pub async fn rebuild(&mut self, call_id: Option<&str>) -> Result<Option<SendOutcome>, CallError> {
        tracing::info!(generation = self.generation + 1, "Rebuilding peer connection");
        self.build().await?;

        match (self.role, call_id) {
            (Role::Caller, Some(call_id)) => Ok(Some(self.create_offer(call_id, false).await?)),
            _ => Ok(None),
        }
    }

    /// Poll the gathering flag until it is set or the timeout elapses
    ///
    /// Returns whether gathering completed.
    pub async fn wait_for_ice(&self) -> bool {
        let Some(peer) = &self.peer else {
            return false;
        };

        let deadline = Instant::now() + self.config.ice_gathering_timeout;
        loop {
            if peer.ice_gathering_complete() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    timeout_ms = self.config.ice_gathering_timeout.as_millis() as u64,
                    "ICE gathering incomplete, proceeding with partial candidates"
                );
                return false;
            }
            tokio::time::sleep(self.config.ice_poll_interval.min(deadline - now)).await;
        }
    }

    /// Close the peer connection; safe to call repeatedly
    pub async fn close(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.close().await;
            tracing::debug!(generation = self.generation, "Peer connection closed");
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.remote_description_set = false;
        self.pending_candidates.clear();
        self.connection_state = PeerConnectionState::Closed;
    }
}

impl Drop for MediaNegotiator {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
