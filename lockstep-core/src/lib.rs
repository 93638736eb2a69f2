//! Lockstep - Core Library
//!
//! This library keeps video playback on two peers in sync over a direct
//! peer-to-peer data channel: a small text protocol, RTT and clock-offset
//! estimation, host-driven drift correction, video quality presets and
//! deterministic release of every session resource.

pub mod config;
pub mod latency;
pub mod logging;
pub mod media;
pub mod network;
pub mod quality;
pub mod registry;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use config::SyncConfig;
pub use latency::LatencyEstimator;
pub use logging::init_tracing;
pub use network::{PeerId, Transport};
pub use quality::QualityPreset;
pub use registry::{Resource, ResourceRegistry, TeardownReport};
pub use session::{Session, SessionCallback, SessionError, SyncStatus};
pub use sync::{Command, LinkStatus, Message, SyncRole, SyncState};
