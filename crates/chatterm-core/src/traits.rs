//! The executor contract shared by every backend.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Output produced by an executor, one text chunk per item.
///
/// The stream ends when the sender side is dropped.
pub type OutputStream = mpsc::Receiver<String>;

/// Buttons shown for every executor, after the executor's own buttons.
pub const GLOBAL_BUTTONS: &[&str] = &["/history"];

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("no executor of type '{0}' found")]
    UnknownType(String),
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A backend capable of running command lines and producing output.
///
/// Lifecycle: construct, then [`open`](Executor::open), then any number of
/// `exec` / `cancel` / `clear` calls (possibly concurrent), then
/// [`close`](Executor::close).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor name, as configured.
    fn name(&self) -> &str;

    /// Connect to or spawn the backend.
    ///
    /// May take a while. On error the persistent stream (if any) has already
    /// been closed and the executor must not be used again.
    ///
    /// # Errors
    /// Returns error if the backend could not be started.
    async fn open(&self) -> Result<(), ExecutorError>;

    /// Submit one command line.
    ///
    /// Non-raw lines are UTF-8, recorded in history and may be handled as
    /// builtins. Raw lines are passed through byte for byte. Returns a per-call output stream, or `None` when output arrives on the
    /// persistent stream instead (or there is nothing to wait for). Never
    /// blocks.
    fn exec(&self, ctx: &CancellationToken, cmdline: &[u8], is_raw: bool) -> Option<OutputStream>;

    /// Interrupt whatever is currently running. Best effort.
    fn cancel(&self);

    /// Drop command history.
    fn clear(&self);

    /// Terminate the backend. The persistent stream closes asynchronously.
    fn close(&self);

    /// Take the persistent output stream.
    ///
    /// Returns `None` for executors that hand out a stream per `exec` call,
    /// and on every call after the first.
    fn chan(&self) -> Option<OutputStream>;

    /// Command history, most recent last.
    fn history(&self) -> Vec<String>;

    /// Buttons to present alongside replies from this executor.
    ///
    /// An empty string marks a row break.
    fn buttons(&self) -> Vec<String>;
}

/// Compose the button list of an executor.
///
/// Layout: recent history row, row break, mode buttons, global buttons,
/// configured buttons.
#[must_use]
pub fn compose_buttons(recent: Vec<String>, mode: &[&str], configured: Vec<String>) -> Vec<String> {
    let mut buttons = recent;
    buttons.push(String::new());
    buttons.extend(mode.iter().map(|s| (*s).to_string()));
    buttons.extend(GLOBAL_BUTTONS.iter().map(|s| (*s).to_string()));
    buttons.extend(configured);
    buttons
}
