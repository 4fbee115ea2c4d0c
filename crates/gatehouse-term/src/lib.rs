//! Interactive PTY sessions inside tenant sandboxes.
//!
//! The concrete sandbox is opaque behind [`PtySpawner`]; this crate owns
//! the session registry, per-tenant access control, output fan-out to the
//! originating connection, and the idle reaper.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod local;
pub mod manager;
pub mod spawner;
pub mod testing;

pub use local::LocalPtySpawner;
pub use manager::{Caller, PtySessionInfo, SpawnOptions, TerminalManager};
pub use spawner::{PtyControl, PtySpawner, SpawnError, SpawnSpec, SpawnedPty};
