//! Sync configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::latency::DEFAULT_MAX_ROUND_TRIP_MS;
use crate::quality::QualityPreset;
use crate::session::SessionError;

/// How often the host broadcasts heartbeats and position beacons (ms)
const DEFAULT_SYNC_INTERVAL_MS: u64 = 1500;

/// How often each side sends an RTT ping (ms)
const DEFAULT_RTT_INTERVAL_MS: u64 = 2000;

/// Drift tolerated before a guest seeks (seconds)
const DEFAULT_CORRECTION_THRESHOLD_SECS: f64 = 0.5;

/// Silence tolerated before the link is reported degraded (ms)
const DEFAULT_SILENCE_WINDOW_MS: u64 = 10_000;

/// Tunables for a sync session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sync ticker period in milliseconds
    pub sync_interval_ms: u64,
    /// RTT ticker period in milliseconds
    pub rtt_interval_ms: u64,
    /// Deviation (seconds) a guest tolerates before seeking
    pub correction_threshold_secs: f64,
    /// Inbound silence (ms) before the link is reported degraded
    pub silence_window_ms: u64,
    /// Round trips above this (ms) are discarded as implausible
    pub max_round_trip_ms: u64,
    /// Media quality preset applied at connect time
    pub preset: QualityPreset,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            rtt_interval_ms: DEFAULT_RTT_INTERVAL_MS,
            correction_threshold_secs: DEFAULT_CORRECTION_THRESHOLD_SECS,
            silence_window_ms: DEFAULT_SILENCE_WINDOW_MS,
            max_round_trip_ms: DEFAULT_MAX_ROUND_TRIP_MS,
            preset: QualityPreset::default(),
        }
    }
}

impl SyncConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.sync_interval_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "sync_interval_ms must be positive".to_string(),
            ));
        }
        if self.rtt_interval_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "rtt_interval_ms must be positive".to_string(),
            ));
        }
        if !(self.correction_threshold_secs.is_finite() && self.correction_threshold_secs > 0.0) {
            return Err(SessionError::InvalidConfig(
                "correction_threshold_secs must be a positive number".to_string(),
            ));
        }
        if self.silence_window_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "silence_window_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn rtt_interval(&self) -> Duration {
        Duration::from_millis(self.rtt_interval_ms)
    }
}
