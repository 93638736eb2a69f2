//! Media and connection handles
//!
//! Narrow views of the platform objects a session owns. The UI layer wraps its
//! real streams, timers and peer connections in these traits and registers them
//! with the [`ResourceRegistry`](crate::registry::ResourceRegistry).

use std::sync::Arc;

use thiserror::Error;

use crate::quality::{QualityError, VideoConstraints};

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Errors raised by a connection handle
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("failed to close connection: {0}")]
    Close(String),
}

/// A single capture or remote track
pub trait MediaTrack: Send + Sync {
    /// Stable identifier, used to stop tracks shared by several streams only once
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    /// `false` once the track has ended or been stopped
    fn is_live(&self) -> bool;

    fn stop(&self);

    /// Apply resolution/frame-rate constraints to a live capture
    fn apply_constraints(&self, _constraints: &VideoConstraints) -> Result<(), QualityError> {
        Err(QualityError::Unsupported("track constraints"))
    }
}

/// A bundle of tracks
pub trait MediaStream: Send + Sync {
    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>>;
}

/// A periodic timer that can be disarmed
pub trait Timer: Send + Sync {
    /// Stop future fires. Cancelling twice is harmless.
    fn cancel(&self);
}

impl Timer for tokio::task::JoinHandle<()> {
    fn cancel(&self) {
        self.abort();
    }
}

/// Encoder settings for one simulcast layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodingParameters {
    /// Bits per second, `None` for no cap
    pub max_bitrate: Option<u32>,
    pub max_framerate: Option<f64>,
}

/// Parameters of an RTP sender
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendParameters {
    pub encodings: Vec<EncodingParameters>,
}

/// An outgoing RTP sender on a peer connection
pub trait RtpSender: Send + Sync {
    /// Kind of the attached track, `None` if no track is attached
    fn track_kind(&self) -> Option<MediaKind>;

    fn parameters(&self) -> SendParameters;

    fn set_parameters(&self, parameters: SendParameters) -> Result<(), QualityError>;
}

/// A data, video or audio peer connection
pub trait PeerConnection: Send + Sync {
    /// Name used in logs
    fn label(&self) -> String;

    fn is_closed(&self) -> bool;

    fn close(&self) -> Result<(), ConnectionError>;

    fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        Vec::new()
    }
}

/// The local media element being kept in sync
pub trait Playback: Send + Sync {
    /// Current position in seconds
    fn position_seconds(&self) -> f64;

    fn is_playing(&self) -> bool;

    fn play(&self);

    fn pause(&self);

    fn seek(&self, position_seconds: f64);
}
