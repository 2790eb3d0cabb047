//! Chat transport for chatterm.
//!
//! Provides:
//! - Wire protocol (JSON, documents base64 encoded)
//! - Connection registry implementing `MessageSink`
//! - WebSocket endpoint (feature: websocket)

pub mod connections;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use connections::Connections;
pub use protocol::{ClientMessage, ServerMessage};

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("expected hello as first message")]
    HelloExpected,
    #[error("chat {0} is not allowed")]
    Unauthorized(i64),
    #[error("invalid message: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("invalid document data: {0}")]
    Document(#[from] base64::DecodeError),
    #[error(transparent)]
    Session(#[from] chatterm_session::SessionError),
}
