//! Centralized constants for the voice call client
//!
//! Single source of truth for protocol timings and retry budgets. Settings
//! defaults point here, so a value changed in one place changes everywhere.

/// Call setup and recovery
pub mod call {
    /// Recovery attempts allowed per session (ICE restarts and rebuilds combined)
    pub const MAX_CONNECTION_RETRIES: u32 = 3;

    /// Time allowed for media to reach Connected after setup or recovery starts
    pub const CONNECTION_TIMEOUT_MS: u64 = 15_000;

    /// Time an unanswered call may ring
    pub const RING_TIMEOUT_MS: u64 = 45_000;

    /// First backoff between recovery attempts
    pub const RECOVERY_BACKOFF_MS: u64 = 250;

    /// Call type sent with `voice:start-call`
    pub const CALL_TYPE_VOICE: &str = "voice";
}

/// ICE gathering wait
pub mod ice {
    /// Upper bound on waiting for gathering to complete before sending a description
    pub const GATHERING_TIMEOUT_MS: u64 = 5_000;

    /// How often the gathering-complete flag is polled
    pub const POLL_INTERVAL_MS: u64 = 100;

    /// Default public STUN server
    pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
}

/// Signaling transport
pub mod signaling {
    /// Default backend URL for local development
    pub const DEFAULT_URL: &str = "ws://127.0.0.1:3000/signaling";

    /// Consecutive failed reconnects tolerated before an active call is dropped
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

    /// Timeout for one reconnect attempt
    pub const RECONNECT_ATTEMPT_TIMEOUT_MS: u64 = 5_000;

    pub const RECONNECT_INITIAL_BACKOFF_MS: u64 = 500;
    pub const RECONNECT_MAX_BACKOFF_MS: u64 = 8_000;

    /// Outbound frames queued while the socket writer is busy
    pub const OUTBOUND_BUFFER: usize = 64;
}

/// Chunked relay fallback
pub mod fallback {
    /// Length of each recorded segment
    pub const CHUNK_DURATION_MS: u64 = 2_000;

    /// Period between recordings (overlap masks gaps)
    pub const CHUNK_INTERVAL_MS: u64 = 3_000;
}

/// WebRTC engine settings
pub mod webrtc {
    /// ICE disconnected timeout (seconds) - time before considering peer disconnected
    pub const ICE_DISCONNECTED_TIMEOUT_SECS: u64 = 5;

    /// ICE failed timeout (seconds) - time before declaring connection failed
    pub const ICE_FAILED_TIMEOUT_SECS: u64 = 25;

    /// ICE keep-alive interval (seconds)
    pub const ICE_KEEPALIVE_INTERVAL_SECS: u64 = 2;

    /// Opus sample rate
    pub const OPUS_CLOCK_RATE: u32 = 48_000;

    /// Opus channel count
    pub const OPUS_CHANNELS: u16 = 2;

    /// Duration of one Opus frame written to the local track
    pub const OPUS_FRAME_MS: u64 = 20;
}
