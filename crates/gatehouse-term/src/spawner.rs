//! The PTY spawner seam.
//!
//! Sandbox wiring (namespace flags, cgroup scopes, image pulls) lives
//! behind [`PtySpawner`]. A spawned PTY is delivered as channels plus a
//! control handle, so exactly one output pump and one exit watcher exist
//! per session — duplicate callback registration is impossible by
//! construction.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Spawn request passed to a [`PtySpawner`].
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Owning tenant; the sandbox mounts this tenant's workspace.
    pub tenant_id: String,
    /// Shell binary to execute.
    pub shell: String,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Working directory for the shell (the tenant workspace).
    pub cwd: Option<PathBuf>,
}

/// Errors from a spawner.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The sandboxed process could not be started.
    #[error("failed to spawn pty: {0}")]
    Spawn(String),
}

/// Control surface of a live PTY.
pub trait PtyControl: Send + Sync {
    /// Forward bytes to the PTY input.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures from the PTY writer.
    fn write(&self, data: &[u8]) -> std::io::Result<()>;

    /// Resize the terminal.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures from the PTY master.
    fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()>;

    /// Terminate the process. Idempotent, best effort.
    fn kill(&self);
}

/// A freshly spawned PTY.
///
/// The output receiver and exit receiver are consumed once by the session
/// manager; the control handle stays with the session record, which is the
/// sole owner of the underlying process.
pub struct SpawnedPty {
    /// OS process id.
    pub pid: u32,
    /// Raw output bytes from the PTY.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Resolves with the exit code when the process ends.
    pub exit: oneshot::Receiver<i32>,
    /// Write/resize/kill handle.
    pub control: std::sync::Arc<dyn PtyControl>,
}

/// Spawner of sandboxed PTYs.
pub trait PtySpawner: Send + Sync {
    /// Spawn a PTY for the given spec.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] when the process cannot be started.
    fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedPty, SpawnError>;
}
