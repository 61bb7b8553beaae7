//! Chunked relay calls on platforms without real-time media

mod support;

use serde_json::json;
use std::time::Duration;

use support::{drain, manager, settle, ChunkRecorder, MockTransport};
use voice_call_client::{CallEvent, CallState};

#[tokio::test(start_paused = true)]
async fn test_caller_relays_chunks_until_hangup() {
    let transport = MockTransport::new();
    let audio = ChunkRecorder::new();
    let (manager, mut events) = manager(&transport, audio.provider());

    manager.start_call("bob").await.unwrap();
    transport.deliver("voice:call-accepted", json!({ "callId": "c9" }));
    settle().await;

    let states: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            CallEvent::StateChanged { new, .. } => Some(new),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![CallState::Calling, CallState::Connecting, CallState::Connected]
    );

    // First window closes 2s after connecting
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let chunks = transport.sent("voice:audio-chunk");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["callId"], "c9");
    assert_eq!(chunks[0]["audioUri"], "file:///tmp/chunk-0.m4a");
    assert!(chunks[0]["timestamp"].as_i64().unwrap() > 0);

    // Hang up while the second window is recording
    tokio::time::sleep(Duration::from_secs(1)).await;
    manager.end_call().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(transport.count("voice:audio-chunk"), 1);
    assert_eq!(audio.recorded(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_receiver_accept_connects_without_negotiation() {
    let transport = MockTransport::new();
    let audio = ChunkRecorder::new();
    let (manager, _events) = manager(&transport, audio.provider());

    transport.deliver(
        "voice:incoming-call",
        json!({ "callId": "c4", "callerId": "alice" }),
    );
    settle().await;
    manager.accept_call().await.unwrap();

    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Connected);
    assert_eq!(transport.count("voice:accept-call"), 1);

    tokio::time::sleep(Duration::from_millis(5500)).await;
    let chunks = transport.sent("voice:audio-chunk");
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|chunk| chunk["callId"] == "c4"));
    assert_eq!(transport.count("voice:offer"), 0);
    assert_eq!(transport.count("voice:answer"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_chunks_played() {
    let transport = MockTransport::new();
    let audio = ChunkRecorder::new();
    let (manager, _events) = manager(&transport, audio.provider());

    manager.start_call("bob").await.unwrap();
    // Not relaying yet
    transport.deliver(
        "voice:audio-chunk",
        json!({ "callId": "c9", "audioUri": "file:///early.m4a", "timestamp": 1 }),
    );
    settle().await;
    assert!(audio.played().is_empty());

    transport.deliver("voice:call-accepted", json!({ "callId": "c9" }));
    settle().await;
    transport.deliver(
        "voice:audio-chunk",
        json!({ "callId": "c9", "audioUri": "file:///remote-0.m4a", "timestamp": 2 }),
    );
    transport.deliver(
        "voice:audio-chunk",
        json!({ "callId": "other", "audioUri": "file:///stray.m4a", "timestamp": 3 }),
    );
    settle().await;

    assert_eq!(audio.played(), vec!["file:///remote-0.m4a".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_muted_relay_records_nothing() {
    let transport = MockTransport::new();
    let audio = ChunkRecorder::new();
    let (manager, _events) = manager(&transport, audio.provider());

    manager.start_call("bob").await.unwrap();
    manager.set_muted(true).await.unwrap();
    transport.deliver("voice:call-accepted", json!({ "callId": "c9" }));
    settle().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(audio.recorded(), 0);
    assert_eq!(transport.count("voice:audio-chunk"), 0);

    manager.set_muted(false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.count("voice:audio-chunk"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_speaker_routes_to_chunk_player() {
    let transport = MockTransport::new();
    let audio = ChunkRecorder::new();
    let (manager, _events) = manager(&transport, audio.provider());

    manager.start_call("bob").await.unwrap();
    manager.set_speaker(true).await.unwrap();
    assert!(audio.speaker_on());
    assert!(manager.snapshot().await.unwrap().unwrap().speaker_on);
}
