//! Test doubles for the spawner seam.
//!
//! Used by this crate's tests and by gateway integration tests; carries no
//! production behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};

use crate::spawner::{PtyControl, PtySpawner, SpawnError, SpawnSpec, SpawnedPty};

/// Everything a [`FakeSpawner`] recorded about one spawned session.
pub struct FakeHandle {
    /// Bytes written through the control handle.
    pub written: Arc<Mutex<Vec<u8>>>,
    /// Last resize geometry seen.
    pub resized: Arc<Mutex<Option<(u16, u16)>>>,
    /// Whether the session was killed.
    pub killed: Arc<AtomicBool>,
    /// Push output bytes to the session's pump.
    pub output_tx: mpsc::Sender<Vec<u8>>,
    /// The spec the spawner was called with.
    pub spec: SpawnSpec,
}

struct FakeControl {
    written: Arc<Mutex<Vec<u8>>>,
    resized: Arc<Mutex<Option<(u16, u16)>>>,
    killed: Arc<AtomicBool>,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
    fail_writes: bool,
}

impl PtyControl for FakeControl {
    fn write(&self, data: &[u8]) -> std::io::Result<()> {
        if self.fail_writes {
            return Err(std::io::Error::other("pty gone"));
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        *self
            .resized
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((cols, rows));
        Ok(())
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(tx) = self
            .exit_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(-1);
        }
    }
}

/// Spawner returning fully scripted sessions.
#[derive(Default)]
pub struct FakeSpawner {
    handles: Mutex<Vec<Arc<FakeHandle>>>,
    /// When set, `spawn` fails.
    pub fail_spawn: AtomicBool,
    /// When set, writes through spawned controls fail.
    pub fail_writes: AtomicBool,
    next_pid: std::sync::atomic::AtomicU32,
}

impl FakeSpawner {
    /// Create a fake spawner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: std::sync::atomic::AtomicU32::new(1000),
            ..Self::default()
        }
    }

    /// Handles of all sessions spawned so far, in order.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<FakeHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedPty, SpawnError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(SpawnError::Spawn("sandbox unavailable".into()));
        }
        let (output_tx, output_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let resized = Arc::new(Mutex::new(None));
        let killed = Arc::new(AtomicBool::new(false));
        let control = Arc::new(FakeControl {
            written: Arc::clone(&written),
            resized: Arc::clone(&resized),
            killed: Arc::clone(&killed),
            exit_tx: Mutex::new(Some(exit_tx)),
            fail_writes: self.fail_writes.load(Ordering::SeqCst),
        });
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(FakeHandle {
            written,
            resized,
            killed,
            output_tx,
            spec,
        });
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(SpawnedPty {
            pid,
            output: output_rx,
            exit: exit_rx,
            control,
        })
    }
}
