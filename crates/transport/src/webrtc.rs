//! WebRTC media implementation
//!
//! Full-duplex audio over the `webrtc` crate.
//!
//! Features:
//! - ICE/STUN/TURN support
//! - Opus audio codec
//! - Trickle ICE with gathering-state mirroring
//! - ICE restart offers
//!
//! The local "microphone" is a stream of Opus frames supplied by the host
//! through a broadcast channel. Without one, the track carries silence.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use voice_call_config::constants::webrtc::{
    ICE_DISCONNECTED_TIMEOUT_SECS, ICE_FAILED_TIMEOUT_SECS, ICE_KEEPALIVE_INTERVAL_SECS,
    OPUS_CHANNELS, OPUS_CLOCK_RATE, OPUS_FRAME_MS,
};
use voice_call_core::{
    AudioConstraints, IceCandidate, IceGatheringState, IceServer, LocalAudioStream, MediaError,
    PeerConnection, PeerConnectionState, PeerEvent, RealtimeMedia, RemoteStream, SdpType,
    SessionDescription,
};

/// Opus DTX silence frame
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

const OPUS_PAYLOAD_TYPE: u8 = 111;

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: OPUS_CLOCK_RATE,
        channels: OPUS_CHANNELS,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

type TrackMap = Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;

/// `RealtimeMedia` backed by the `webrtc` crate
pub struct WebRtcMedia {
    /// Opus frames from the host's capture device
    capture: Option<broadcast::Sender<Bytes>>,
    /// Where remote Opus payloads are delivered
    playback: Option<mpsc::Sender<Bytes>>,
    /// Local tracks by stream id, so peers can attach streams acquired here
    tracks: TrackMap,
    speaker_on: AtomicBool,
}

impl WebRtcMedia {
    pub fn new() -> Self {
        Self {
            capture: None,
            playback: None,
            tracks: Arc::new(Mutex::new(HashMap::new())),
            speaker_on: AtomicBool::new(false),
        }
    }

    /// Feed local audio from a capture source
    pub fn with_capture(mut self, capture: broadcast::Sender<Bytes>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Deliver remote Opus payloads to a playback sink
    pub fn with_playback(mut self, playback: mpsc::Sender<Bytes>) -> Self {
        self.playback = Some(playback);
        self
    }

    pub fn speaker_on(&self) -> bool {
        self.speaker_on.load(Ordering::Relaxed)
    }

    /// Create WebRTC API with media engine
    fn create_api(&self) -> Result<API, MediaError> {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: OPUS_PAYLOAD_TYPE,
                    stats_id: String::new(),
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| MediaError::PeerConnection(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::PeerConnection(e.to_string()))?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_timeouts(
            Some(Duration::from_secs(ICE_DISCONNECTED_TIMEOUT_SECS)),
            Some(Duration::from_secs(ICE_FAILED_TIMEOUT_SECS)),
            Some(Duration::from_secs(ICE_KEEPALIVE_INTERVAL_SECS)),
        );

        Ok(webrtc::api::APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }
}

impl Default for WebRtcMedia {
    fn default() -> Self {
        Self::new()
    }
}

fn rtc_configuration(ice_servers: &[IceServer]) -> RTCConfiguration {
    let ice_servers: Vec<RTCIceServer> = ice_servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

#[async_trait]
impl RealtimeMedia for WebRtcMedia {
    async fn acquire_local_audio(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Arc<dyn LocalAudioStream>, MediaError> {
        let stream_id = format!("local-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_string(),
            stream_id.clone(),
        ));

        let audio = WebRtcLocalAudio::start(
            stream_id.clone(),
            Arc::clone(&track),
            self.capture.as_ref().map(|tx| tx.subscribe()),
            Arc::clone(&self.tracks),
        );
        self.tracks.lock().insert(stream_id.clone(), track);

        tracing::info!(
            stream_id = %stream_id,
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            captured = self.capture.is_some(),
            "Local audio acquired"
        );

        Ok(Arc::new(audio))
    }

    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let api = self.create_api()?;
        let pc = api
            .new_peer_connection(rtc_configuration(ice_servers))
            .await
            .map_err(|e| MediaError::PeerConnection(e.to_string()))?;

        let peer = WebRtcPeer::wire(Arc::new(pc), events, self.playback.clone(), Arc::clone(&self.tracks));
        Ok(Arc::new(peer))
    }

    fn set_speaker(&self, enabled: bool) {
        self.speaker_on.store(enabled, Ordering::Relaxed);
        tracing::debug!(enabled, "Speaker routing changed");
    }
}

/// Local audio track fed by the capture source
pub struct WebRtcLocalAudio {
    id: String,
    enabled: Arc<AtomicBool>,
    live: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
    tracks: TrackMap,
}

impl WebRtcLocalAudio {
    fn start(
        id: String,
        track: Arc<TrackLocalStaticSample>,
        capture: Option<broadcast::Receiver<Bytes>>,
        tracks: TrackMap,
    ) -> Self {
        let enabled = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump_samples(track, capture, Arc::clone(&enabled)));

        Self {
            id,
            enabled,
            live: AtomicBool::new(true),
            pump: Mutex::new(Some(pump)),
            tracks,
        }
    }
}

/// Write one Opus frame per frame period; silence while muted or idle
async fn pump_samples(
    track: Arc<TrackLocalStaticSample>,
    mut capture: Option<broadcast::Receiver<Bytes>>,
    enabled: Arc<AtomicBool>,
) {
    let frame = Duration::from_millis(OPUS_FRAME_MS);
    let mut ticker = tokio::time::interval(frame);

    loop {
        ticker.tick().await;

        let captured = match capture.as_mut() {
            Some(rx) => match rx.try_recv() {
                Ok(data) => Some(data),
                Err(broadcast::error::TryRecvError::Empty) => None,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Capture lagged, dropping frames");
                    None
                },
                Err(broadcast::error::TryRecvError::Closed) => {
                    capture = None;
                    None
                },
            },
            None => None,
        };

        let data = match captured {
            Some(data) if enabled.load(Ordering::Relaxed) => data,
            _ => Bytes::from_static(&OPUS_SILENCE),
        };

        let sample = Sample {
            data,
            duration: frame,
            ..Default::default()
        };

        if let Err(e) = track.write_sample(&sample).await {
            tracing::debug!(error = %e, "Failed to write sample");
        }
    }
}

impl LocalAudioStream for WebRtcLocalAudio {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn stop(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.tracks.lock().remove(&self.id);
        tracing::debug!(stream_id = %self.id, "Local audio stopped");
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for WebRtcLocalAudio {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One `RTCPeerConnection`
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    gathering_complete: Arc<AtomicBool>,
    tracks: TrackMap,
}

impl WebRtcPeer {
    /// Register every callback and forward it as a [`PeerEvent`]
    fn wire(
        pc: Arc<RTCPeerConnection>,
        events: mpsc::UnboundedSender<PeerEvent>,
        playback: Option<mpsc::Sender<Bytes>>,
        tracks: TrackMap,
    ) -> Self {
        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = match s {
                RTCPeerConnectionState::New => PeerConnectionState::New,
                RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                _ => return Box::pin(async {}),
            };
            let _ = state_tx.send(PeerEvent::ConnectionStateChange(state));
            Box::pin(async {})
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let remote = RemoteStream {
                stream_id: track.stream_id(),
                track_id: track.id(),
            };
            tracing::info!(stream_id = %remote.stream_id, kind = %track.kind(), "Remote track received");
            let _ = track_tx.send(PeerEvent::Track(remote));

            let playback = playback.clone();
            Box::pin(async move {
                // Reading keeps the interceptors running even without a sink
                while let Ok((rtp_packet, _)) = track.read_rtp().await {
                    if rtp_packet.payload.is_empty() {
                        continue;
                    }
                    if let Some(sink) = &playback {
                        if sink.try_send(rtp_packet.payload.clone()).is_err() {
                            tracing::trace!("Playback sink full, dropping packet");
                        }
                    }
                }
                tracing::debug!("Remote track ended");
            })
        }));

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    },
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let gathering_complete = Arc::new(AtomicBool::new(false));
        let gathering_flag = Arc::clone(&gathering_complete);
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let mirrored = match state {
                RTCIceGathererState::Gathering => IceGatheringState::Gathering,
                RTCIceGathererState::Complete => IceGatheringState::Complete,
                _ => IceGatheringState::New,
            };
            gathering_flag.store(mirrored == IceGatheringState::Complete, Ordering::SeqCst);
            tracing::debug!(state = ?mirrored, "ICE gathering state changed");
            let _ = events.send(PeerEvent::IceGatheringStateChange(mirrored));
            Box::pin(async {})
        }));

        Self {
            pc,
            gathering_complete,
            tracks,
        }
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| MediaError::Description(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(MediaError::Description(format!(
            "Unsupported description type: {}",
            other
        ))),
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| MediaError::Description(format!("Failed to create offer: {}", e)))?;

        if ice_restart {
            tracing::info!("ICE restart offer created");
        }
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Description(format!("Failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        // A new local description starts a new gathering round
        self.gathering_complete.store(false, Ordering::SeqCst);
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| MediaError::Description(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| MediaError::Description(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::IceCandidate(e.to_string()))
    }

    async fn add_local_audio(&self, stream: Arc<dyn LocalAudioStream>) -> Result<(), MediaError> {
        let track = self.tracks.lock().get(stream.id()).cloned().ok_or_else(|| {
            MediaError::PeerConnection(format!(
                "Local stream {} is not live on this media engine",
                stream.id()
            ))
        })?;

        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::PeerConnection(format!("Failed to add audio track: {}", e)))?;

        // Drain RTCP so the interceptors keep working
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc(desc).ok()
    }

    fn ice_gathering_complete(&self) -> bool {
        self.gathering_complete.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "Error closing peer connection");
        }
    }
}
