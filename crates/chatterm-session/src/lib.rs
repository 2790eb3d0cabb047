//! Session orchestration for chatterm.
//!
//! Provides:
//! - `EventLoop` - The single consumer owning every session
//! - `SessionTable` / `ActiveSessions` - Open executors and per-conversation selection
//! - `MessageSink` - Where replies, listings and documents go
//! - Command routing and the raw input mini-language

pub mod commands;
pub mod dispatch;
pub mod event_loop;
mod files;
mod listing;
pub mod message;
pub mod runner;
pub mod session;
pub mod sink;

pub use event_loop::{EventLoop, LoopHandle};
pub use message::{Attachment, Command, CommandOutput, Message, Origin};
pub use session::{ActiveSessions, Session, SessionError, SessionTable, session_key};
pub use sink::{InlineButton, MenuCommand, MessageSink, SinkError};
