//! Command-line softphone
//!
//! `voice-call call <peer-id>` places a call; `voice-call listen` waits for
//! an incoming call and answers it. Call events are logged until the call
//! ends or the process is interrupted.

use anyhow::{bail, Context};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voice_call_client::{CallEvent, CallManager};
use voice_call_config::{load_settings, Settings};
use voice_call_core::MediaCapabilityProvider;
use voice_call_transport::{WebRtcMedia, WsSignalingTransport};

enum Mode {
    Call { peer_id: String },
    Listen,
}

fn parse_args() -> anyhow::Result<Mode> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("call") => {
            let peer_id = args.next().context("usage: voice-call call <peer-id>")?;
            Ok(Mode::Call { peer_id })
        },
        Some("listen") => Ok(Mode::Listen),
        _ => bail!("usage: voice-call call <peer-id> | voice-call listen"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = parse_args()?;

    // Priority: env vars > config/{env} > config/default > defaults
    let env = std::env::var("VOICE_CALL_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing is not initialized yet
            eprintln!("Warning: Failed to load config: {}. Using defaults.", e);
            Settings::default()
        },
    };

    init_tracing(&settings);

    tracing::info!("Starting voice-call v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environment = ?settings.environment,
        config = env.as_deref().unwrap_or("default"),
        url = %settings.signaling.url,
        "Configuration loaded"
    );

    let transport = Arc::new(
        WsSignalingTransport::connect(&settings.signaling)
            .await
            .context("failed to connect to the signaling server")?,
    );
    let media = MediaCapabilityProvider::FullDuplex(Arc::new(WebRtcMedia::new()));
    let manager = CallManager::new(&settings, transport.clone(), media);
    let mut events = manager.subscribe();

    match &mode {
        Mode::Call { peer_id } => manager.start_call(peer_id.as_str()).await?,
        Mode::Listen => tracing::info!("Waiting for an incoming call"),
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lost = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(CallEvent::IncomingCall(call)) => {
                    tracing::info!(
                        call_id = %call.call_id,
                        caller = %call.caller_name.as_deref().unwrap_or(&call.caller_id),
                        "Incoming call, answering"
                    );
                    if let Err(e) = manager.accept_call().await {
                        tracing::error!(error = %e, "Failed to answer");
                    }
                },
                Ok(CallEvent::StateChanged { old, new }) => {
                    tracing::info!(%old, %new, "Call state");
                },
                Ok(CallEvent::RemoteStream(stream)) => {
                    tracing::info!(stream_id = %stream.stream_id, "Remote audio playing");
                },
                Ok(CallEvent::DurationTick { seconds }) => {
                    tracing::debug!(seconds, "In call");
                },
                Ok(CallEvent::Error { message }) => {
                    tracing::error!(error = %message, "Call error");
                },
                Ok(CallEvent::Ended { call_id, duration_secs, reason }) => {
                    tracing::info!(?call_id, duration_secs, ?reason, "Call ended");
                    if matches!(mode, Mode::Call { .. }) {
                        break;
                    }
                },
                Ok(CallEvent::SignalingLost { reason }) => {
                    lost = Some(reason);
                    break;
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped call events");
                },
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.shutdown().await?;
    transport.close().await;
    tracing::info!("Shutdown complete");
    if let Some(reason) = lost {
        bail!("signaling connection lost: {}", reason);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, hanging up...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, hanging up...");
        }
    }
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &settings.observability.log_level;
        format!("voice_call={level},voice_call_client={level},voice_call_transport={level},webrtc=warn")
            .into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
