//! Session runtime
//!
//! The caller-facing handle for one synchronized viewing session.

mod runtime;
mod types;

pub use runtime::*;
pub use types::*;
