//! Synchronous POSIX process spawner.
//!
//! One blocking call creates a child from a [`SpawnConfig`] and returns its
//! pid once the exec succeeded, or a [`SpawnError`] naming the setup step
//! that failed, reported from inside the child over an internal pipe. The
//! code between fork and exec is strictly async-signal-safe, so spawning is
//! sound even under the `vfork` feature.

pub mod config;
pub mod error;
mod error_pipe;
pub mod spawn;
pub mod status;

pub use config::{CStringArray, FdSetup, SpawnConfig};
pub use error::{SpawnError, SpawnErrorKind, SpawnResult};
pub use spawn::spawn;
pub use status::{DecodedStatus, decode_status};
