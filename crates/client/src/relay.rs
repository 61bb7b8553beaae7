//! Fallback relay
//!
//! Audio for platforms without real-time media: record a short segment on
//! every tick and relay it as `voice:audio-chunk`, play remote segments as
//! they arrive. Recording windows start every `chunk_interval` and last
//! `chunk_duration`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use voice_call_config::Settings;
use voice_call_core::ChunkedAudio;

use crate::signaling::{AudioChunkPayload, OutboundSignal, SignalingClient};

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub chunk_duration: Duration,
    pub chunk_interval: Duration,
}

impl RelayConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            chunk_duration: settings.fallback.chunk_duration(),
            chunk_interval: settings.fallback.chunk_interval(),
        }
    }
}

/// Running relay for one connected call
pub struct FallbackRelay {
    audio: Arc<dyn ChunkedAudio>,
    /// Held while a chunk is sent so `stop` cannot interleave with a send
    stopped: Arc<Mutex<bool>>,
    task: Option<JoinHandle<()>>,
}

impl FallbackRelay {
    /// Start recording and relaying chunks for `call_id`
    ///
    /// While `muted` is set, ticks pass without recording.
    pub fn start(
        audio: Arc<dyn ChunkedAudio>,
        signaling: Arc<SignalingClient>,
        call_id: String,
        config: RelayConfig,
        muted: Arc<AtomicBool>,
    ) -> Self {
        let stopped = Arc::new(Mutex::new(false));

        let task = tokio::spawn(run(
            Arc::clone(&audio),
            signaling,
            call_id,
            config,
            muted,
            Arc::clone(&stopped),
        ));

        Self {
            audio,
            stopped,
            task: Some(task),
        }
    }

    /// Play a remote segment without blocking the caller
    pub fn play(&self, uri: String) {
        if self.is_stopped() {
            return;
        }
        let audio = Arc::clone(&self.audio);
        tokio::spawn(async move {
            if let Err(e) = audio.play_chunk(&uri).await {
                tracing::warn!(error = %e, "Failed to play remote chunk");
            }
        });
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Stop relaying; no chunk is sent once this returns
    pub fn stop(&mut self) {
        *self.stopped.lock() = true;
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Fallback relay stopped");
        }
    }
}

impl Drop for FallbackRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    audio: Arc<dyn ChunkedAudio>,
    signaling: Arc<SignalingClient>,
    call_id: String,
    config: RelayConfig,
    muted: Arc<AtomicBool>,
    stopped: Arc<Mutex<bool>>,
) {
    tracing::info!(call_id = %call_id, "Fallback relay started");

    let mut ticker = interval_at(Instant::now(), config.chunk_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if muted.load(Ordering::SeqCst) {
            continue;
        }

        let chunk = match audio.record_chunk(config.chunk_duration).await {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to record chunk");
                continue;
            },
        };

        let guard = stopped.lock();
        if *guard {
            break;
        }

        let signal = OutboundSignal::AudioChunk(AudioChunkPayload {
            call_id: call_id.clone(),
            audio_uri: chunk.uri,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        if let Err(e) = signaling.send(signal) {
            tracing::warn!(error = %e, "Failed to relay chunk");
        }
        drop(guard);
    }
}
