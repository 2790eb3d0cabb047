//! Items flowing into the event loop.

use chatterm_core::ChatId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-request reply stream. Replies end when every sender is dropped.
///
/// Bounded: a slow sink holds back the relay and, through it, the executor.
pub type CommandOutput = mpsc::Sender<String>;

/// A user request addressed to the event loop.
#[derive(Debug)]
pub struct Command {
    pub chat: ChatId,
    /// Command name with its leading slash, or `callback` / `document`.
    pub name: String,
    pub payload: String,
    pub ctx: CancellationToken,
    pub attachment: Option<Attachment>,
    pub output: CommandOutput,
}

/// Non-text content carried by a command.
#[derive(Debug, Clone)]
pub enum Attachment {
    /// An inline button press on a listing.
    Callback {
        data: String,
        /// Text of the listing the button belongs to.
        message: String,
    },
    /// An uploaded file. The caption may name a save path.
    Document {
        file_name: String,
        data: Vec<u8>,
        caption: String,
    },
}

/// The executor instance a lifecycle message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub executor: String,
    pub global: bool,
    pub instance: Uuid,
}

/// Lifecycle and output notifications.
#[derive(Debug)]
pub enum Message {
    /// Output of a command, shown with the active executor's buttons.
    Reply { chat: ChatId, text: String },
    /// Text not tied to any session.
    Global { chat: ChatId, text: String },
    /// Output read from a session's persistent stream.
    Data {
        origin: Origin,
        chat: ChatId,
        text: String,
    },
    /// A session's persistent stream ended.
    Closed { origin: Origin, chat: ChatId },
    Opened { origin: Origin, chat: ChatId },
    OpenFailed {
        origin: Origin,
        chat: ChatId,
        error: String,
    },
}
