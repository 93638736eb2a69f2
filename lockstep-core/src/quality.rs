//! Video quality presets
//!
//! Maps a [`QualityPreset`] to capture constraints, an SDP bandwidth directive
//! and a live encoder bitrate cap. Every operation here degrades to a `false`
//! or `None` result instead of failing: an unsupported platform or a rejected
//! parameter update leaves the session running at whatever quality it has.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::media::{MediaKind, MediaTrack, PeerConnection};

/// Errors from applying quality settings to platform objects
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QualityError {
    #[error("unknown quality preset: {0}")]
    UnknownPreset(String),

    #[error("{0} not supported on this platform")]
    Unsupported(&'static str),

    #[error("platform rejected update: {0}")]
    Rejected(String),
}

/// Named quality level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
    Ultra,
    #[default]
    Unlimited,
}

/// A constrainable numeric property (`{ ideal, max }`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConstrainValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ideal: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl ConstrainValue {
    const fn ideal(ideal: u32) -> Self {
        Self {
            ideal: Some(ideal),
            max: None,
        }
    }

    const fn ideal_max(ideal: u32, max: u32) -> Self {
        Self {
            ideal: Some(ideal),
            max: Some(max),
        }
    }
}

/// Resolution and frame-rate constraints for a video capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<ConstrainValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<ConstrainValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<ConstrainValue>,
}

impl VideoConstraints {
    const fn new(width: u32, height: u32, frame_rate: ConstrainValue) -> Self {
        Self {
            width: Some(ConstrainValue::ideal(width)),
            height: Some(ConstrainValue::ideal(height)),
            frame_rate: Some(frame_rate),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width.is_none() && self.height.is_none() && self.frame_rate.is_none()
    }

    pub fn ideal_frame_rate(&self) -> Option<u32> {
        self.frame_rate.and_then(|f| f.ideal)
    }
}

/// Video part of a display-capture request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayVideoConstraints {
    #[serde(flatten)]
    pub constraints: VideoConstraints,
    pub cursor: String,
}

/// Constraints for a display capture (screen + system audio)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub video: DisplayVideoConstraints,
    pub audio: bool,
}

/// Fixed values behind a preset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetSettings {
    pub label: &'static str,
    /// `None` means unconstrained
    pub video: Option<VideoConstraints>,
    /// Encoder cap in bits per second, 0 = no limit
    pub max_bitrate_bps: u32,
    /// `b=AS` value injected into the SDP in kbps, 0 = none
    pub sdp_bandwidth_kbps: u32,
}

impl QualityPreset {
    /// All presets, lowest first
    pub const ALL: [QualityPreset; 5] = [
        QualityPreset::Low,
        QualityPreset::Medium,
        QualityPreset::High,
        QualityPreset::Ultra,
        QualityPreset::Unlimited,
    ];

    pub const fn settings(&self) -> PresetSettings {
        match self {
            QualityPreset::Low => PresetSettings {
                label: "low",
                video: Some(VideoConstraints::new(854, 480, ConstrainValue::ideal_max(24, 30))),
                max_bitrate_bps: 800_000,
                sdp_bandwidth_kbps: 900,
            },
            QualityPreset::Medium => PresetSettings {
                label: "medium",
                video: Some(VideoConstraints::new(1280, 720, ConstrainValue::ideal_max(30, 30))),
                max_bitrate_bps: 2_500_000,
                sdp_bandwidth_kbps: 2800,
            },
            QualityPreset::High => PresetSettings {
                label: "high",
                video: Some(VideoConstraints::new(1920, 1080, ConstrainValue::ideal_max(30, 60))),
                max_bitrate_bps: 6_000_000,
                sdp_bandwidth_kbps: 6500,
            },
            QualityPreset::Ultra => PresetSettings {
                label: "ultra",
                video: Some(VideoConstraints::new(2560, 1440, ConstrainValue::ideal_max(60, 60))),
                max_bitrate_bps: 12_000_000,
                sdp_bandwidth_kbps: 13000,
            },
            QualityPreset::Unlimited => PresetSettings {
                label: "unlimited",
                video: None,
                max_bitrate_bps: 0,
                sdp_bandwidth_kbps: 0,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.settings().label
    }

    /// Parse a preset name, falling back to the default for unknown names
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|e| {
            debug!("{}, using {}", e, QualityPreset::default());
            QualityPreset::default()
        })
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityPreset {
    type Err = QualityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        QualityPreset::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| QualityError::UnknownPreset(s.to_string()))
    }
}

/// Display-capture constraints for a preset
pub fn constraints_for(preset: QualityPreset) -> CaptureConstraints {
    CaptureConstraints {
        video: DisplayVideoConstraints {
            constraints: preset.settings().video.unwrap_or_default(),
            cursor: "always".to_string(),
        },
        audio: true,
    }
}

/// An SDP rewrite that caps the video bandwidth, or `None` when the preset has no cap
pub fn sdp_transform_for(
    preset: QualityPreset,
) -> Option<impl Fn(&str) -> String + Send + Sync + 'static> {
    let kbps = preset.settings().sdp_bandwidth_kbps;
    if kbps == 0 {
        return None;
    }
    Some(move |sdp: &str| limit_video_bandwidth(sdp, kbps))
}

/// Replace any `b=AS` directive in the video sections with `b=AS:<kbps>` placed
/// right after the section's `c=` line. Other sections are left untouched.
pub fn limit_video_bandwidth(sdp: &str, kbps: u32) -> String {
    let separator = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let directive = format!("b=AS:{}", kbps);

    let mut lines: Vec<&str> = Vec::new();
    let mut in_video = false;
    let mut inserted = false;

    for line in sdp.split(separator) {
        if line.starts_with("m=") {
            in_video = line.starts_with("m=video");
            inserted = false;
            lines.push(line);
            continue;
        }

        if in_video && line.starts_with("b=AS:") {
            continue;
        }

        lines.push(line);

        if in_video && !inserted && line.starts_with("c=") {
            lines.push(&directive);
            inserted = true;
        }
    }

    lines.join(separator)
}

/// Cap the video encoder bitrate on a live connection.
///
/// Returns `false` for the unlimited preset, when there is no video sender, or
/// when the platform rejects the update.
pub fn apply_bitrate_cap(connection: &dyn PeerConnection, preset: QualityPreset) -> bool {
    let settings = preset.settings();
    if settings.max_bitrate_bps == 0 {
        return false;
    }

    let Some(sender) = connection
        .senders()
        .into_iter()
        .find(|s| s.track_kind() == Some(MediaKind::Video))
    else {
        debug!("No video sender on {}, skipping bitrate cap", connection.label());
        return false;
    };

    let mut params = sender.parameters();
    if params.encodings.is_empty() {
        params.encodings.push(Default::default());
    }
    let encoding = &mut params.encodings[0];
    encoding.max_bitrate = Some(settings.max_bitrate_bps);
    if let Some(fps) = settings.video.and_then(|v| v.ideal_frame_rate()) {
        encoding.max_framerate = Some(fps as f64);
    }

    match sender.set_parameters(params) {
        Ok(()) => {
            info!(
                "Applied {} bitrate cap ({} bps) on {}",
                preset,
                settings.max_bitrate_bps,
                connection.label()
            );
            true
        }
        Err(e) => {
            warn!("Failed to apply bitrate limit: {}", e);
            false
        }
    }
}

/// Apply resolution/frame-rate constraints to a capture that started without them
pub fn apply_track_constraints(track: &dyn MediaTrack, preset: QualityPreset) -> bool {
    if track.kind() != MediaKind::Video {
        return false;
    }
    let Some(constraints) = preset.settings().video.filter(|v| !v.is_empty()) else {
        return false;
    };

    match track.apply_constraints(&constraints) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to apply track constraints: {}", e);
            false
        }
    }
}
