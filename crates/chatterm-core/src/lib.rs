//! Core abstractions for chatterm.
//!
//! This crate provides the building blocks shared by every other crate:
//! - `Executor` - The backend contract and its errors
//! - `History` - Bounded command history
//! - `CancelSignal` - Best-effort cancel broadcast
//! - `ConfigStore` - Executors, commands and buttons configuration
//! - `workdir` - The shared process working directory

pub mod cancel;
pub mod config;
pub mod constants;
pub mod history;
pub mod text;
pub mod traits;
pub mod workdir;

pub use cancel::{CancelListener, CancelSignal};
pub use config::{CmdConfig, ConfigData, ConfigError, ConfigStore, ExecutorConfig};
pub use history::History;
pub use traits::{Executor, ExecutorError, OutputStream};

/// Conversation identifier.
pub type ChatId = i64;
