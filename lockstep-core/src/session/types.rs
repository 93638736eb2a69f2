//! Types shared between the session runtime and its caller

use crate::sync::{LinkStatus, SyncRole, SyncState};

/// Errors returned by the session API
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Session has been torn down")]
    TornDown,

    #[error("Not the host")]
    NotHost,

    #[error("Session is not connected to a peer")]
    NotActive,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No tokio runtime to run the session on")]
    NoRuntime,
}

/// Snapshot of the sync session for display
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub role: SyncRole,
    pub state: SyncState,
    pub link: LinkStatus,
    /// Smoothed round trip in milliseconds, `None` until measured
    pub smoothed_rtt_ms: Option<f64>,
    /// One-way latency in milliseconds, `None` until measured
    pub latency_ms: Option<f64>,
    /// How far the remote clock runs ahead of ours
    pub clock_offset_ms: Option<f64>,
    /// Latency the remote peer reported for itself
    pub remote_latency_ms: Option<f64>,
    /// Guest only: local position minus compensated host position at the last beacon
    /// (positive = ahead, negative = behind)
    pub drift_seconds: Option<f64>,
    /// Host only: guest drift as reported by its latest `progress`
    pub peer_drift_seconds: Option<f64>,
    /// Number of corrective seeks issued
    pub corrections: u32,
    pub origin: Option<String>,
    pub remote_voice_enabled: Option<bool>,
}

/// Callback interface for session events
///
/// Every method has an empty default so callers only implement what they show.
/// Callbacks run on the session worker; they may call back into the session,
/// including [`Session::teardown`](super::Session::teardown).
pub trait SessionCallback: Send + Sync {
    fn on_state_changed(&self, _state: SyncState) {}
    fn on_link_status(&self, _status: LinkStatus) {}
    /// Called on the guest after every position beacon is evaluated
    fn on_sync_status(&self, _status: SyncStatus) {}
    /// The host announced a new media source
    fn on_origin_changed(&self, _origin: String) {}
    /// Host only: a guest said hello
    fn on_guest_greeted(&self, _gid: String) {}
    fn on_remote_latency(&self, _latency_ms: f64) {}
    fn on_remote_voice(&self, _enabled: bool) {}
}

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
