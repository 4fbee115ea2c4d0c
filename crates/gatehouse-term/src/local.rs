//! `portable-pty`-backed spawner.
//!
//! Runs the shell directly on the host. Production deployments substitute
//! a sandboxing spawner behind the same trait; the session manager and
//! access control are identical either way.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::spawner::{PtyControl, PtySpawner, SpawnError, SpawnSpec, SpawnedPty};

/// Output channel depth. A stuck consumer back-pressures the reader
/// thread, not the gateway.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Spawner that runs the shell in a host PTY.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPtySpawner;

struct LocalControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn std::io::Write + Send>>,
    killer: Mutex<Box<dyn portable_pty::ChildKiller + Send + Sync>>,
}

impl PtyControl for LocalControl {
    fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data)?;
        writer.flush()
    }

    fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(std::io::Error::other)
    }

    fn kill(&self) {
        let mut killer = self
            .killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = killer.kill() {
            debug!(error = %e, "pty kill failed (process likely already gone)");
        }
    }
}

impl PtySpawner for LocalPtySpawner {
    fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedPty, SpawnError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.shell);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);
        let killer = child.clone_killer();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        // One blocking thread per session: pump output until EOF, then
        // reap the child and report its exit code.
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            // Session dropped; stop pumping.
                            break;
                        }
                    },
                }
            }
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).unwrap_or(-1),
                Err(e) => {
                    warn!(error = %e, "pty child wait failed");
                    -1
                },
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedPty {
            pid,
            output: output_rx,
            exit: exit_rx,
            control: Arc::new(LocalControl {
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                killer: Mutex::new(killer),
            }),
        })
    }
}
