//! Executor backends for chatterm.
//!
//! Provides:
//! - `ShellExecutor` - local interpreter, on a pty or one process per line
//! - `SshExecutor` - remote shell with port forwards
//! - `Registry` - executor constructors by type name
//! - Command building utilities

pub mod command;
pub mod registry;
pub mod shell;
pub mod ssh;

pub use command::{CommandBuildError, CommandParts, ShellCommand, ShellOptions};
pub use registry::{Constructor, RegInfo, Registry};
pub use shell::ShellExecutor;
pub use ssh::{SshError, SshExecutor, SshOptions};
