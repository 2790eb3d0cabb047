//! An interpreter attached to a pseudo terminal.

use std::{
    io::{ErrorKind, Read, Write},
    sync::{Mutex, PoisonError},
};

use portable_pty::{ChildKiller, CommandBuilder, PtySize, native_pty_system};
use tokio::sync::mpsc;

use crate::decode::OutputDecoder;

/// Read buffer size of the pty reader.
const READ_BUFFER: usize = 10 * 1024;

/// Capacity of a pty output channel.
pub const OUTPUT_CAPACITY: usize = 5;

/// PTY error.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to create pty: {0}")]
    Open(String),
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running interpreter attached to a pty.
///
/// Bytes written are delivered in submission order by a dedicated writer;
/// output is decoded by a dedicated reader into the sender given to
/// [`PtySession::spawn`]. The sender is dropped when the pty reaches end of
/// file or fails, after which the device is released.
pub struct PtySession {
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession").finish_non_exhaustive()
    }
}

impl PtySession {
    /// Spawn `program` with `args` on a new pty of `rows` x `cols`, in the
    /// current working directory, decoding its output into `output`.
    ///
    /// Must be called from within a Tokio runtime. On error `output` is
    /// dropped.
    ///
    /// # Errors
    /// Returns error if the pty cannot be allocated or the program cannot be
    /// started.
    pub fn spawn(
        program: &str,
        args: &[String],
        rows: u16,
        cols: u16,
        output: mpsc::Sender<String>,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut command = CommandBuilder::new(program);
        command.args(args);
        command.cwd(std::env::current_dir()?);

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| PtyError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;
        drop(pair.slave);
        let killer = child.clone_killer();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let master = pair.master;

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let program_name = program.to_string();
        tokio::task::spawn_blocking(move || {
            let mut decoder = OutputDecoder::new(true);
            let mut buf = vec![0u8; READ_BUFFER];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(text) = decoder.decode(&buf[..n]) {
                            if output.blocking_send(text).is_err() {
                                break;
                            }
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        tracing::debug!(program = %program_name, ?e, "pty read ended");
                        break;
                    }
                }
            }
            drop(master);
            tracing::debug!(program = %program_name, "pty released");
        });

        tokio::task::spawn_blocking(move || {
            while let Some(bytes) = writer_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                    tracing::warn!(?e, "pty write failed");
                    break;
                }
            }
        });

        tokio::task::spawn_blocking(move || match child.wait() {
            Ok(status) => tracing::debug!(code = status.exit_code(), "pty child exited"),
            Err(e) => tracing::warn!(?e, "failed to wait for pty child"),
        });

        Ok(Self {
            writer_tx,
            killer: Mutex::new(killer),
        })
    }

    /// Queue bytes for the interpreter. Never blocks.
    ///
    /// Returns false once the writer has stopped.
    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.writer_tx.send(bytes.into()).is_ok()
    }

    /// Kill the interpreter. The output closes once the pty drains.
    pub fn kill(&self) {
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = killer.kill() {
            tracing::debug!(?e, "pty child already gone");
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.kill();
    }
}
