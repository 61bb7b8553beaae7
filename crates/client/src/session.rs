//! Call session entity

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use voice_call_core::MediaMode;

use crate::state::{transition, CallState, InvalidTransition, Role, Trigger};

/// One active or pending call
///
/// Mutated only through [`CallSession::apply`] and the explicit user toggles.
/// Once `Ended` the session is discarded, never reused.
#[derive(Debug)]
pub struct CallSession {
    call_id: Option<String>,
    role: Role,
    state: CallState,
    peer_id: String,
    peer_name: Option<String>,
    media_mode: MediaMode,
    muted: bool,
    speaker_on: bool,
    /// Set on the first transition into Connected
    started_at: Option<Instant>,
    connected_at: Option<DateTime<Utc>>,
    retry_count: u32,
    max_retries: u32,
}

impl CallSession {
    /// Session for a call this client places
    pub fn outgoing(peer_id: impl Into<String>, media_mode: MediaMode, max_retries: u32) -> Self {
        Self::new(None, Role::Caller, peer_id.into(), None, media_mode, max_retries)
    }

    /// Session for a call announced by `voice:incoming-call`
    pub fn incoming(
        call_id: impl Into<String>,
        caller_id: impl Into<String>,
        caller_name: Option<String>,
        media_mode: MediaMode,
        max_retries: u32,
    ) -> Self {
        Self::new(
            Some(call_id.into()),
            Role::Receiver,
            caller_id.into(),
            caller_name,
            media_mode,
            max_retries,
        )
    }

    fn new(
        call_id: Option<String>,
        role: Role,
        peer_id: String,
        peer_name: Option<String>,
        media_mode: MediaMode,
        max_retries: u32,
    ) -> Self {
        Self {
            call_id,
            role,
            state: CallState::Idle,
            peer_id,
            peer_name,
            media_mode,
            muted: false,
            speaker_on: false,
            started_at: None,
            connected_at: None,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn media_mode(&self) -> MediaMode {
        self.media_mode
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn speaker_on(&self) -> bool {
        self.speaker_on
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Adopt the server-assigned id
    ///
    /// Only possible while no id is set. Returns whether the id was adopted.
    pub fn adopt_call_id(&mut self, call_id: &str) -> bool {
        if self.call_id.is_some() {
            return false;
        }
        self.call_id = Some(call_id.to_string());
        true
    }

    /// Whether a signal carrying `call_id` belongs to this session
    pub fn matches(&self, call_id: Option<&str>) -> bool {
        match (self.call_id.as_deref(), call_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    /// Run the state machine; returns `(old, new)`
    pub fn apply(&mut self, trigger: Trigger) -> Result<(CallState, CallState), InvalidTransition> {
        let old = self.state;
        let new = transition(old, trigger)?;
        self.state = new;

        if new == CallState::Connected && self.started_at.is_none() {
            self.started_at = Some(Instant::now());
            self.connected_at = Some(Utc::now());
        }

        Ok((old, new))
    }

    /// Whole seconds since the call connected
    pub fn duration_secs(&self) -> u64 {
        self.started_at
            .map(|started| started.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Recovery attempts left
    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Count recovery attempts; never exceeds the budget
    pub fn record_retries(&mut self, attempts: u32) {
        self.retry_count = self
            .retry_count
            .saturating_add(attempts)
            .min(self.max_retries);
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn set_speaker(&mut self, enabled: bool) {
        self.speaker_on = enabled;
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.clone(),
            role: self.role,
            state: self.state,
            peer_id: self.peer_id.clone(),
            peer_name: self.peer_name.clone(),
            media_mode: self.media_mode,
            muted: self.muted,
            speaker_on: self.speaker_on,
            duration_secs: self.duration_secs(),
            connected_at: self.connected_at,
            retry_count: self.retry_count,
        }
    }
}

/// Observable view of the active session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub call_id: Option<String>,
    pub role: Role,
    pub state: CallState,
    pub peer_id: String,
    pub peer_name: Option<String>,
    pub media_mode: MediaMode,
    pub muted: bool,
    pub speaker_on: bool,
    pub duration_secs: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}
