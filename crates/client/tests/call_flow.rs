//! Call setup and teardown through the public `CallManager` API

mod support;

use serde_json::json;
use std::time::Duration;

use support::{drain, ended_reason, errors, manager, settle, MockTransport, ScriptedMedia};
use voice_call_client::{CallError, CallEvent, CallState, EndReason, Role};
use voice_call_core::{MediaCapabilityProvider, PeerConnectionState, PeerEvent, RemoteStream};

fn incoming(call_id: &str) -> serde_json::Value {
    json!({
        "callId": call_id,
        "callerId": "alice",
        "callerName": "Alice",
        "callType": "voice",
    })
}

#[tokio::test(start_paused = true)]
async fn test_caller_happy_path() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    manager.start_call("bob").await.unwrap();
    let start = transport.sent("voice:start-call");
    assert_eq!(start, vec![json!({ "receiverId": "bob", "callType": "voice" })]);
    assert_eq!(media.acquire_count(), 1);

    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Calling);
    assert_eq!(snapshot.call_id, None);

    transport.deliver("voice:call-accepted", json!({ "callId": "c1" }));
    settle().await;

    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.call_id.as_deref(), Some("c1"));
    assert_eq!(snapshot.state, CallState::Connecting);

    let offers = transport.sent("voice:offer");
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0]["callId"], "c1");
    assert_eq!(offers[0]["offer"]["type"], "offer");
    assert_eq!(media.latest_peer().attached_streams(), 1);

    transport.deliver(
        "voice:answer",
        json!({ "callId": "c1", "answer": { "type": "answer", "sdp": "v=0" } }),
    );
    settle().await;
    assert_eq!(media.latest_peer().remote_descriptions().len(), 1);

    media
        .latest_peer()
        .emit_state(PeerConnectionState::Connected);
    settle().await;

    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Connected);
    assert!(snapshot.connected_at.is_some());

    tokio::time::sleep(Duration::from_secs(5)).await;
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.duration_secs, 5);

    let seen = drain(&mut events);
    let states: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            CallEvent::StateChanged { new, .. } => Some(*new),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![CallState::Calling, CallState::Connecting, CallState::Connected]
    );
    assert!(seen
        .iter()
        .any(|event| matches!(event, CallEvent::DurationTick { seconds: 5 })));
}

#[tokio::test(start_paused = true)]
async fn test_receiver_decline_acquires_nothing() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    transport.deliver("voice:incoming-call", incoming("c2"));
    settle().await;

    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Ringing);
    assert_eq!(snapshot.role, Role::Receiver);
    assert_eq!(snapshot.peer_name.as_deref(), Some("Alice"));

    manager.decline_call().await.unwrap();

    assert_eq!(transport.sent("voice:decline-call"), vec![json!({ "callId": "c2" })]);
    assert!(manager.snapshot().await.unwrap().is_none());
    assert_eq!(media.acquire_count(), 0);
    assert_eq!(media.peer_count(), 0);

    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|event| matches!(event, CallEvent::IncomingCall(call) if call.call_id == "c2")));
    assert!(seen.contains(&CallEvent::StateChanged {
        old: CallState::Ringing,
        new: CallState::Ended
    }));
    assert_eq!(ended_reason(&seen), Some(EndReason::LocalDecline));

    // Session handlers are gone; the incoming-call handler stays
    assert_eq!(transport.handler_count("voice:offer"), 0);
    assert_eq!(transport.handler_count("voice:incoming-call"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_receiver_accepts_and_answers() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    transport.deliver("voice:incoming-call", incoming("c3"));
    settle().await;
    manager.accept_call().await.unwrap();

    assert_eq!(transport.sent("voice:accept-call"), vec![json!({ "callId": "c3" })]);
    assert_eq!(media.acquire_count(), 1);
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Connecting);

    transport.deliver(
        "voice:offer",
        json!({ "callId": "c3", "offer": { "type": "offer", "sdp": "v=0" } }),
    );
    settle().await;

    let answers = transport.sent("voice:answer");
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0]["answer"]["type"], "answer");

    let peer = media.latest_peer();
    peer.emit(PeerEvent::Track(RemoteStream {
        stream_id: "remote".to_string(),
        track_id: "audio".to_string(),
    }));
    peer.emit_state(PeerConnectionState::Connected);
    settle().await;

    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|event| matches!(event, CallEvent::RemoteStream(stream) if stream.stream_id == "remote")));
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_second_call_is_ignored() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    manager.start_call("bob").await.unwrap();
    manager.start_call("carol").await.unwrap();
    transport.deliver("voice:incoming-call", incoming("c9"));
    settle().await;

    assert_eq!(transport.count("voice:start-call"), 1);
    assert_eq!(media.acquire_count(), 1);
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.peer_id, "bob");
    assert_eq!(snapshot.role, Role::Caller);

    let seen = drain(&mut events);
    assert!(!seen
        .iter()
        .any(|event| matches!(event, CallEvent::IncomingCall(_))));
    assert!(errors(&seen).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_incoming_call_is_idempotent() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    transport.deliver("voice:incoming-call", incoming("c2"));
    transport.deliver("voice:incoming-call", incoming("c2"));
    settle().await;

    let incoming_events = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, CallEvent::IncomingCall(_)))
        .count();
    assert_eq!(incoming_events, 1);
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Ringing);
}

#[tokio::test(start_paused = true)]
async fn test_nothing_changes_after_end() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    manager.start_call("bob").await.unwrap();
    transport.deliver("voice:call-accepted", json!({ "callId": "c1" }));
    settle().await;
    manager.end_call().await.unwrap();
    drain(&mut events);

    transport.deliver("voice:call-accepted", json!({ "callId": "c1" }));
    transport.deliver(
        "voice:offer",
        json!({ "callId": "c1", "offer": { "type": "offer", "sdp": "v=0" } }),
    );
    media.peer(0).emit_state(PeerConnectionState::Connected);
    settle().await;

    assert!(manager.snapshot().await.unwrap().is_none());
    assert!(drain(&mut events).is_empty());
    assert_eq!(media.acquire_count(), 1);
    assert_eq!(media.peer_count(), 1);
    assert_eq!(transport.count("voice:answer"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_end_of_previous_call_ignored() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    manager.start_call("bob").await.unwrap();
    transport.deliver("voice:call-accepted", json!({ "callId": "c1" }));
    settle().await;
    manager.end_call().await.unwrap();

    manager.start_call("carol").await.unwrap();
    drain(&mut events);
    // Teardown of the first call arrives after the second one started
    transport.deliver("voice:call-ended", json!({ "callId": "c1" }));
    transport.deliver(
        "voice:offer",
        json!({ "callId": "c7", "offer": { "type": "offer", "sdp": "v=0" } }),
    );
    transport.deliver(
        "voice:ice-candidate",
        json!({ "callId": "c7", "candidate": { "candidate": "stray", "sdpMid": "0", "sdpMLineIndex": 0 } }),
    );
    settle().await;

    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Calling);
    assert_eq!(snapshot.peer_id, "carol");
    assert_eq!(snapshot.call_id, None);
    assert_eq!(ended_reason(&drain(&mut events)), None);
    assert_eq!(transport.count("voice:answer"), 0);

    transport.deliver("voice:call-accepted", json!({ "callId": "c2" }));
    settle().await;
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.call_id.as_deref(), Some("c2"));
    assert_eq!(snapshot.state, CallState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_accept_not_delivered_keeps_ringing() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    transport.deliver("voice:incoming-call", incoming("c5"));
    settle().await;
    drain(&mut events);

    transport.reject_emits(true);
    assert!(manager.accept_call().await.is_err());
    assert_eq!(transport.count("voice:accept-call"), 0);
    assert_eq!(media.acquire_count(), 1);
    assert_eq!(media.stream(0).stop_count(), 1);
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Ringing);
    assert_eq!(
        errors(&drain(&mut events)),
        vec!["Cannot answer call: accept-call was not delivered".to_string()]
    );

    transport.reject_emits(false);
    manager.accept_call().await.unwrap();
    assert_eq!(transport.sent("voice:accept-call"), vec![json!({ "callId": "c5" })]);
    assert_eq!(media.acquire_count(), 2);
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_caller_ignores_offers() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, _events) = manager(&transport, media.provider());

    manager.start_call("bob").await.unwrap();
    transport.deliver("voice:call-accepted", json!({ "callId": "c1" }));
    settle().await;
    assert_eq!(media.peer_count(), 1);

    transport.deliver(
        "voice:offer",
        json!({ "callId": "c1", "offer": { "type": "offer", "sdp": "v=0" } }),
    );
    settle().await;

    assert_eq!(transport.count("voice:answer"), 0);
    assert_eq!(media.peer_count(), 1);
    assert!(media.peer(0).remote_descriptions().is_empty());
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_end_call_releases_once() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    manager.start_call("bob").await.unwrap();
    transport.deliver("voice:call-accepted", json!({ "callId": "c1" }));
    settle().await;
    media
        .latest_peer()
        .emit_state(PeerConnectionState::Connected);
    tokio::time::sleep(Duration::from_secs(3)).await;

    manager.end_call().await.unwrap();
    manager.end_call().await.unwrap();

    let end = transport.sent("voice:end-call");
    assert_eq!(end.len(), 1);
    assert_eq!(end[0]["callId"], "c1");
    assert_eq!(end[0]["duration"], 3);

    assert_eq!(media.stream(0).stop_count(), 1);
    assert!(media.latest_peer().is_closed());

    let seen = drain(&mut events);
    let ended = seen
        .iter()
        .filter(|event| matches!(event, CallEvent::Ended { .. }))
        .count();
    assert_eq!(ended, 1);
    assert_eq!(ended_reason(&seen), Some(EndReason::LocalHangup));
}

#[tokio::test(start_paused = true)]
async fn test_remote_hangup_while_ringing() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    transport.deliver("voice:incoming-call", incoming("c4"));
    settle().await;
    transport.deliver("voice:call-ended", json!({ "callId": "c4" }));
    settle().await;

    assert!(manager.snapshot().await.unwrap().is_none());
    assert_eq!(ended_reason(&drain(&mut events)), Some(EndReason::RemoteHangup));
    assert!(matches!(
        manager.accept_call().await,
        Err(CallError::NoActiveCall)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_peer_decline_ends_call() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    manager.start_call("bob").await.unwrap();
    transport.deliver("voice:call-declined", json!({ "callId": "c1" }));
    settle().await;

    assert!(manager.snapshot().await.unwrap().is_none());
    assert_eq!(ended_reason(&drain(&mut events)), Some(EndReason::RemoteDecline));
    assert_eq!(media.stream(0).stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    manager.start_call("bob").await.unwrap();
    tokio::time::sleep(Duration::from_secs(44)).await;
    assert!(manager.snapshot().await.unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(manager.snapshot().await.unwrap().is_none());
    assert_eq!(ended_reason(&drain(&mut events)), Some(EndReason::NoAnswer));
    assert_eq!(media.stream(0).stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ring_timer_cleared_once_accepted() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, _events) = manager(&transport, media.provider());

    manager.start_call("bob").await.unwrap();
    transport.deliver("voice:call-accepted", json!({ "callId": "c1" }));
    settle().await;
    media
        .latest_peer()
        .emit_state(PeerConnectionState::Connected);
    settle().await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_mute_and_speaker() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, _events) = manager(&transport, media.provider());

    assert!(matches!(
        manager.set_muted(true).await,
        Err(CallError::NoActiveCall)
    ));

    manager.start_call("bob").await.unwrap();
    manager.set_muted(true).await.unwrap();
    manager.set_speaker(true).await.unwrap();

    assert!(!media.stream(0).enabled());
    let snapshot = manager.snapshot().await.unwrap().unwrap();
    assert!(snapshot.muted);
    assert!(snapshot.speaker_on);

    manager.set_muted(false).await.unwrap();
    assert!(media.stream(0).enabled());
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_capability() {
    let transport = MockTransport::new();
    let media = MediaCapabilityProvider::Unavailable {
        reason: "no microphone".to_string(),
    };
    let (manager, mut events) = manager(&transport, media);

    let result = manager.start_call("bob").await;
    assert!(matches!(result, Err(CallError::CapabilityUnavailable(_))));
    assert_eq!(transport.count("voice:start-call"), 0);

    transport.deliver("voice:incoming-call", incoming("c6"));
    settle().await;

    assert_eq!(transport.sent("voice:decline-call"), vec![json!({ "callId": "c6" })]);
    assert!(manager.snapshot().await.unwrap().is_none());

    let seen = drain(&mut events);
    let errors = errors(&seen);
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|message| message.contains("no microphone")));
}

#[tokio::test(start_paused = true)]
async fn test_start_call_requires_signaling() {
    let transport = MockTransport::new();
    transport.set_connected(false);
    let media = ScriptedMedia::new();
    let (manager, _events) = manager(&transport, media.provider());

    let result = manager.start_call("bob").await;
    assert!(matches!(result, Err(CallError::Transport(_))));
    assert!(manager.snapshot().await.unwrap().is_none());
    assert_eq!(media.acquire_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_ends_active_call() {
    let transport = MockTransport::new();
    let media = ScriptedMedia::new();
    let (manager, mut events) = manager(&transport, media.provider());

    transport.deliver("voice:incoming-call", incoming("c7"));
    settle().await;
    manager.shutdown().await.unwrap();

    assert_eq!(ended_reason(&drain(&mut events)), Some(EndReason::Shutdown));
    assert!(matches!(
        manager.snapshot().await,
        Err(CallError::ManagerStopped)
    ));
}
