//! Sync State Management

use std::fmt;

/// Which side of the link we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncRole {
    /// Timing authority: originates heartbeats and position beacons
    Host,
    /// Follower: corrects local playback toward the host
    Guest,
}

impl SyncRole {
    pub fn is_host(&self) -> bool {
        matches!(self, SyncRole::Host)
    }
}

impl fmt::Display for SyncRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncRole::Host => f.write_str("host"),
            SyncRole::Guest => f.write_str("guest"),
        }
    }
}

/// Lifecycle of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncState {
    /// No peer link, no timers
    #[default]
    Idle,
    /// Transport attached, greeting not yet exchanged
    Negotiating,
    /// Greeting exchanged, sync timer armed
    Active,
    /// Messages flow but local corrections are suppressed
    Restricted,
    /// Terminal
    TornDown,
}

impl SyncState {
    /// Whether the session has completed its greeting (Active or Restricted)
    pub fn is_established(&self) -> bool {
        matches!(self, SyncState::Active | SyncState::Restricted)
    }

    pub fn is_torn_down(&self) -> bool {
        matches!(self, SyncState::TornDown)
    }

    /// Whether a transition to `next` is allowed
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        match (self, next) {
            (TornDown, _) => false,
            (_, TornDown) => true,
            (Idle, Negotiating) => true,
            (Negotiating, Active) | (Negotiating, Restricted) => true,
            (Active, Restricted) | (Restricted, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Negotiating => "negotiating",
            SyncState::Active => "active",
            SyncState::Restricted => "restricted",
            SyncState::TornDown => "torn-down",
        };
        f.write_str(name)
    }
}

/// Health of the inbound message stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkStatus {
    #[default]
    Healthy,
    /// Nothing arrived within the silence window
    Degraded,
}

/// Where the host says playback should be
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackTarget {
    /// Host position in seconds
    pub position_seconds: f64,
    /// Whether the host is playing
    pub is_playing: bool,
    /// Host wall-clock (ms since epoch) at which the position was valid
    pub origin_timestamp_ms: u64,
}

impl PlaybackTarget {
    /// Position compensated for time elapsed since the beacon plus link latency.
    ///
    /// A paused host does not advance, so the reported position is used as-is.
    pub fn compensated_position(&self, now_ms: u64, latency_seconds: f64) -> f64 {
        if !self.is_playing {
            return self.position_seconds;
        }
        let elapsed_seconds = (now_ms as f64 - self.origin_timestamp_ms as f64) / 1000.0;
        self.position_seconds + elapsed_seconds + latency_seconds
    }
}

/// Tracks when we last heard from the remote peer
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkMonitor {
    last_inbound_ms: Option<u64>,
    status: LinkStatus,
}

impl LinkMonitor {
    /// Start the silence clock without having received anything
    pub fn arm(&mut self, now_ms: u64) {
        self.last_inbound_ms = Some(now_ms);
        self.status = LinkStatus::Healthy;
    }

    /// Record an inbound message. Returns the new status if it changed.
    pub fn record_inbound(&mut self, now_ms: u64) -> Option<LinkStatus> {
        self.last_inbound_ms = Some(now_ms);
        self.set(LinkStatus::Healthy)
    }

    /// Check for silence. Returns the new status if it changed.
    pub fn check(&mut self, now_ms: u64, silence_window_ms: u64) -> Option<LinkStatus> {
        let last = self.last_inbound_ms?;
        if now_ms.saturating_sub(last) > silence_window_ms {
            self.set(LinkStatus::Degraded)
        } else {
            None
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn last_inbound_ms(&self) -> Option<u64> {
        self.last_inbound_ms
    }

    fn set(&mut self, status: LinkStatus) -> Option<LinkStatus> {
        if self.status == status {
            return None;
        }
        self.status = status;
        Some(status)
    }
}
