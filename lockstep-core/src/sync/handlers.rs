//! Inbound sync message handlers

use tracing::{debug, info, warn};

use super::controller::SyncController;
use super::protocol::{Command, CommandKind};
use super::state::{PlaybackTarget, SyncRole, SyncState};

/// Whether `role` accepts `kind` from its peer
fn accepts(role: SyncRole, kind: CommandKind) -> bool {
    use CommandKind::*;
    match role {
        SyncRole::Host => matches!(
            kind,
            Greet | Progress | Latency | RttPing | RttPong | VoiceEnabled | VoiceDisabled
        ),
        SyncRole::Guest => !matches!(kind, Greet),
    }
}

impl SyncController {
    /// Handle one text message received from the peer
    pub fn handle_text(&mut self, raw: &str, now_ms: u64) {
        match self.state {
            SyncState::TornDown => return,
            SyncState::Idle => {
                debug!("Dropping message received before attach: {}", raw);
                return;
            }
            _ => {}
        }
        if self.is_halted() {
            return;
        }

        // Any traffic at all proves the link is alive, even if we cannot parse it
        self.set_link_healthy(now_ms);

        let command = match Command::decode(raw) {
            Ok(command) => command,
            Err(e) => {
                warn!("Dropping malformed message {:?}: {}", raw, e);
                return;
            }
        };

        if !accepts(self.role, command.kind()) {
            warn!("Ignoring {} sent to {}", command.kind(), self.role);
            return;
        }

        match command {
            Command::RttPing { ts } => {
                self.send(Command::RttPong { ts, ts2: now_ms });
            }
            Command::RttPong { ts, ts2 } => {
                self.estimator.handle_pong(ts, ts2, now_ms);
            }
            Command::Greet { gid } => self.handle_greet(gid, now_ms),
            Command::Timestamp { atu } => self.handle_timestamp(atu, now_ms),
            Command::Origin { ori } => self.handle_origin(ori),
            Command::Progress { cur, atu } => {
                if self.role.is_host() {
                    self.handle_guest_progress(cur, atu, now_ms);
                } else {
                    self.handle_host_progress(cur, atu, now_ms);
                }
            }
            Command::Play => self.handle_play_state(true),
            Command::Pause => self.handle_play_state(false),
            Command::Seek { time } => self.handle_seek(time),
            Command::Latency { lat } => {
                debug!("Peer reports {:.1}ms latency", lat);
                self.remote_latency_ms = Some(lat);
                self.notify(|cb| cb.on_remote_latency(lat));
            }
            Command::VoiceEnabled => self.handle_voice(true),
            Command::VoiceDisabled => self.handle_voice(false),
        }
    }

    fn handle_greet(&mut self, gid: String, now_ms: u64) {
        info!("Guest {} connected", gid);
        self.establish();

        // Bring the guest up to date: what to play, whether to play, where we are
        if let Some(ori) = self.origin.clone() {
            self.send(Command::Origin { ori });
        }
        self.send(if self.player.is_playing() {
            Command::Play
        } else {
            Command::Pause
        });
        self.send(Command::Timestamp { atu: now_ms });
        self.send_position_beacon(now_ms);

        self.notify(|cb| cb.on_guest_greeted(gid));
    }

    fn handle_timestamp(&mut self, atu: u64, now_ms: u64) {
        debug!("Heartbeat from host, {}ms old", now_ms.saturating_sub(atu));
        self.establish();
        // Our own position so the host can see how far behind we are
        self.send_position_beacon(now_ms);
    }

    fn handle_origin(&mut self, ori: String) {
        self.establish();
        if self.origin.as_deref() == Some(ori.as_str()) {
            return;
        }
        info!("Host switched media to {}", ori);
        self.origin = Some(ori.clone());
        self.notify(|cb| cb.on_origin_changed(ori));
    }

    /// Guest: compare our position with the host beacon and seek if too far off
    fn handle_host_progress(&mut self, cur: f64, atu: u64, now_ms: u64) {
        if !self.state.is_established() {
            debug!("Ignoring position beacon before greeting completed");
            return;
        }

        let target = PlaybackTarget {
            position_seconds: cur,
            is_playing: self.host_playing,
            origin_timestamp_ms: atu,
        };
        let latency = self.estimator.compensation_seconds();
        let expected = target.compensated_position(now_ms, latency);
        let current = self.player.position_seconds();
        let drift = current - expected;
        self.drift_seconds = Some(drift);

        debug!(
            "Sync: drift {:+.3}s (expected: {:.3}s, actual: {:.3}s, latency: {:.1}ms)",
            drift,
            expected,
            current,
            latency * 1000.0
        );

        if drift.abs() > self.config.correction_threshold_secs {
            if self.state == SyncState::Restricted {
                debug!("Correction suppressed while restricted");
            } else {
                info!("Drift {:+.3}s exceeds threshold, seeking to {:.3}s", drift, expected);
                self.seek_player(expected.max(0.0));
                self.corrections = self.corrections.saturating_add(1);
            }
        }

        let status = self.status();
        self.notify(|cb| cb.on_sync_status(status));
    }

    /// Host: record how far the guest is from us (informational)
    fn handle_guest_progress(&mut self, cur: f64, atu: u64, now_ms: u64) {
        let target = PlaybackTarget {
            position_seconds: cur,
            is_playing: self.player.is_playing(),
            origin_timestamp_ms: atu,
        };
        let guest_now = target.compensated_position(now_ms, self.estimator.compensation_seconds());
        let drift = guest_now - self.player.position_seconds();
        debug!("Guest drift {:+.3}s", drift);
        self.peer_drift_seconds = Some(drift);
    }

    fn handle_play_state(&mut self, playing: bool) {
        self.host_playing = playing;
        if self.state == SyncState::Restricted {
            debug!("Deferring {} while restricted", if playing { "play" } else { "pause" });
            self.deferred_playing = Some(playing);
            return;
        }
        self.apply_play_state(playing);
    }

    fn handle_seek(&mut self, time: f64) {
        if self.state == SyncState::Restricted {
            debug!("Ignoring seek to {:.3}s while restricted", time);
            return;
        }
        self.seek_player(time.max(0.0));
    }

    fn handle_voice(&mut self, enabled: bool) {
        info!("Peer voice {}", if enabled { "enabled" } else { "disabled" });
        self.remote_voice = Some(enabled);
        self.notify(|cb| cb.on_remote_voice(enabled));
    }
}
