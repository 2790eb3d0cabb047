//! Pseudo-terminal sessions for chatterm.
//!
//! Provides:
//! - `PtySession` - An interpreter attached to a pty, read and written off the runtime
//! - `OutputDecoder` - Escape stripping and UTF-8 decoding across read boundaries
//! - Interpreter detection utilities

pub mod decode;
pub mod session;
pub mod shell;

pub use decode::{OutputDecoder, Utf8Accumulator};
pub use session::{PtyError, PtySession};
pub use shell::{command_flag, default_interpreter, is_known_shell, resolve_executable_path};
