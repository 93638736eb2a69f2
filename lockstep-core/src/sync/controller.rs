//! Sync controller
//!
//! Owns the session state machine, the latency estimator and the link monitor
//! for one peer link. It is driven from a single task: every method takes the
//! current wall-clock time so the controller itself never reads a clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::latency::LatencyEstimator;
use crate::media::Playback;
use crate::network::Transport;
use crate::session::{SessionCallback, SessionError, SyncStatus};

use super::protocol::Command;
use super::state::{LinkMonitor, LinkStatus, SyncRole, SyncState};

pub struct SyncController {
    pub(super) role: SyncRole,
    pub(super) state: SyncState,
    pub(super) config: SyncConfig,
    /// Our peer id, sent as `gid` in the greeting
    pub(super) local_id: String,
    pub(super) estimator: LatencyEstimator,
    pub(super) link: LinkMonitor,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) player: Arc<dyn Playback>,
    pub(super) callback: Option<Arc<dyn SessionCallback>>,
    /// Set by session teardown, possibly from inside a callback we are running.
    /// Once set nothing more is written to the transport or the player.
    pub(super) halted: Arc<AtomicBool>,
    /// Current media source (host: what we announce, guest: what we were told)
    pub(super) origin: Option<String>,
    /// Guest: host play state as last announced
    pub(super) host_playing: bool,
    /// Restriction asked for by the caller, applied once established
    pub(super) restricted_requested: bool,
    /// Guest: play state the host asked for while corrections were suppressed
    pub(super) deferred_playing: Option<bool>,
    pub(super) remote_latency_ms: Option<f64>,
    pub(super) remote_voice: Option<bool>,
    pub(super) drift_seconds: Option<f64>,
    pub(super) peer_drift_seconds: Option<f64>,
    pub(super) corrections: u32,
}

impl SyncController {
    pub fn new(
        role: SyncRole,
        config: SyncConfig,
        local_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        player: Arc<dyn Playback>,
        callback: Option<Arc<dyn SessionCallback>>,
    ) -> Self {
        let estimator = LatencyEstimator::with_max_round_trip(config.max_round_trip_ms);
        Self {
            role,
            state: SyncState::Idle,
            config,
            local_id: local_id.into(),
            estimator,
            link: LinkMonitor::default(),
            transport,
            player,
            callback,
            halted: Arc::new(AtomicBool::new(false)),
            origin: None,
            host_playing: true,
            restricted_requested: false,
            deferred_playing: None,
            remote_latency_ms: None,
            remote_voice: None,
            drift_seconds: None,
            peer_drift_seconds: None,
            corrections: 0,
        }
    }

    /// Share the flag that marks the owning session as torn down
    pub fn with_halt_flag(mut self, halted: Arc<AtomicBool>) -> Self {
        self.halted = halted;
        self
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> SyncRole {
        self.role
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn estimator(&self) -> &LatencyEstimator {
        &self.estimator
    }

    /// The transport is attached: start negotiating. A guest says hello.
    pub fn attach(&mut self, now_ms: u64) {
        if self.state != SyncState::Idle {
            debug!("attach ignored in state {}", self.state);
            return;
        }
        self.estimator.clear();
        self.link.arm(now_ms);
        self.transition(SyncState::Negotiating);

        if !self.role.is_host() {
            info!("Greeting host as {}", self.local_id);
            self.send(Command::Greet {
                gid: self.local_id.clone(),
            });
        }
    }

    /// Sync ticker fired. The host sends a heartbeat and a position beacon.
    pub fn sync_tick(&mut self, now_ms: u64) {
        if !self.role.is_host() || !self.state.is_established() {
            return;
        }
        self.send(Command::Timestamp { atu: now_ms });
        self.send_position_beacon(now_ms);
    }

    /// RTT ticker fired: ping the peer, report our latency, check for silence.
    pub fn rtt_tick(&mut self, now_ms: u64) {
        if matches!(self.state, SyncState::Idle | SyncState::TornDown) {
            return;
        }

        let ts = self.estimator.create_ping(now_ms);
        self.send(Command::RttPing { ts });

        if let Some(lat) = self.estimator.one_way_latency_ms() {
            self.send(Command::Latency { lat });
        }

        if let Some(status) = self.link.check(now_ms, self.config.silence_window_ms) {
            info!(
                "No message from peer for over {}ms, link degraded",
                self.config.silence_window_ms
            );
            self.notify(|cb| cb.on_link_status(status));
        }
    }

    /// Host user pressed play
    pub fn play(&mut self) -> Result<(), SessionError> {
        self.ensure_host()?;
        self.apply_play_state(true);
        if self.state.is_established() {
            self.send(Command::Play);
        }
        Ok(())
    }

    /// Host user pressed pause
    pub fn pause(&mut self) -> Result<(), SessionError> {
        self.ensure_host()?;
        self.apply_play_state(false);
        if self.state.is_established() {
            self.send(Command::Pause);
        }
        Ok(())
    }

    /// Host user moved the playhead
    pub fn seek(&mut self, position_seconds: f64) -> Result<(), SessionError> {
        self.ensure_host()?;
        let time = position_seconds.max(0.0);
        self.seek_player(time);
        if self.state.is_established() {
            self.send(Command::Seek { time });
        }
        Ok(())
    }

    /// Host switched media. Announced now if a guest is connected, otherwise on greeting.
    pub fn set_origin(&mut self, origin: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_host()?;
        let origin = origin.into();
        info!("Media origin set to {}", origin);
        self.origin = Some(origin.clone());
        if self.state.is_established() {
            self.send(Command::Origin { ori: origin });
        }
        Ok(())
    }

    /// Tell the peer whether our microphone is on
    pub fn set_voice_enabled(&mut self, enabled: bool) -> Result<(), SessionError> {
        match self.state {
            SyncState::TornDown => return Err(SessionError::TornDown),
            SyncState::Idle => return Err(SessionError::NotActive),
            _ => {}
        }
        self.send(if enabled {
            Command::VoiceEnabled
        } else {
            Command::VoiceDisabled
        });
        Ok(())
    }

    /// Suppress (or resume) local playback corrections
    pub fn set_restricted(&mut self, restricted: bool) -> Result<(), SessionError> {
        if self.state.is_torn_down() {
            return Err(SessionError::TornDown);
        }
        self.restricted_requested = restricted;

        match (self.state, restricted) {
            (SyncState::Active, true) => {
                info!("Playback corrections suspended");
                self.transition(SyncState::Restricted);
            }
            (SyncState::Restricted, false) => {
                info!("Playback corrections resumed");
                self.transition(SyncState::Active);
                if let Some(playing) = self.deferred_playing.take() {
                    self.apply_play_state(playing);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Enter the terminal state. Later calls do nothing.
    pub fn teardown(&mut self) {
        if self.state.is_torn_down() {
            return;
        }
        self.estimator.clear();
        self.deferred_playing = None;
        self.transition(SyncState::TornDown);
    }

    pub fn status(&self) -> SyncStatus {
        let estimate = self.estimator.state();
        SyncStatus {
            role: self.role,
            state: self.state,
            link: self.link.status(),
            smoothed_rtt_ms: estimate.smoothed_rtt_ms,
            latency_ms: self.estimator.one_way_latency_ms(),
            clock_offset_ms: estimate.clock_offset_ms,
            remote_latency_ms: self.remote_latency_ms,
            drift_seconds: self.drift_seconds,
            peer_drift_seconds: self.peer_drift_seconds,
            corrections: self.corrections,
            origin: self.origin.clone(),
            remote_voice_enabled: self.remote_voice,
        }
    }

    /// Move from Negotiating to Active (or Restricted if that was requested)
    pub(super) fn establish(&mut self) {
        if self.state != SyncState::Negotiating {
            return;
        }
        let next = if self.restricted_requested {
            SyncState::Restricted
        } else {
            SyncState::Active
        };
        self.transition(next);
    }

    pub(super) fn transition(&mut self, next: SyncState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!("Ignoring transition {} -> {}", self.state, next);
            return false;
        }
        info!("Sync state: {} -> {}", self.state, next);
        self.state = next;
        self.notify(|cb| cb.on_state_changed(next));
        true
    }

    pub(super) fn send_position_beacon(&self, now_ms: u64) {
        self.send(Command::Progress {
            cur: self.player.position_seconds(),
            atu: now_ms,
        });
    }

    pub(super) fn apply_play_state(&self, playing: bool) {
        if self.is_halted() {
            return;
        }
        if playing {
            self.player.play();
        } else {
            self.player.pause();
        }
    }

    pub(super) fn seek_player(&self, position_seconds: f64) {
        if self.is_halted() {
            return;
        }
        self.player.seek(position_seconds);
    }

    pub(super) fn send(&self, command: Command) {
        if self.is_halted() {
            debug!("Session torn down, not sending {}", command.kind());
            return;
        }
        self.transport.send(command.encode());
    }

    pub(super) fn notify(&self, f: impl FnOnce(&dyn SessionCallback)) {
        if let Some(cb) = &self.callback {
            f(cb.as_ref());
        }
    }

    pub(super) fn set_link_healthy(&mut self, now_ms: u64) {
        if let Some(status) = self.link.record_inbound(now_ms) {
            if status == LinkStatus::Healthy {
                info!("Link to peer restored");
            }
            self.notify(|cb| cb.on_link_status(status));
        }
    }

    fn ensure_host(&self) -> Result<(), SessionError> {
        if self.state.is_torn_down() {
            return Err(SessionError::TornDown);
        }
        if !self.role.is_host() {
            return Err(SessionError::NotHost);
        }
        Ok(())
    }
}
