//! Sync Engine
//!
//! Keeps follower playback converging on the host over the peer data channel.

mod controller;
mod handlers;
mod protocol;
mod state;

pub use controller::SyncController;
pub use protocol::*;
pub use state::*;
