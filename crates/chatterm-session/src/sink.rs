//! Outbound side of the conversation.

use async_trait::async_trait;
use chatterm_core::ChatId;

/// Sink error.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("conversation {0} is not connected")]
    NotConnected(ChatId),
    #[error("send failed: {0}")]
    Send(String),
}

/// A button attached to a listing. Pressing it sends `data` back as a
/// callback together with the listing text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub data: String,
}

impl InlineButton {
    #[must_use]
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: data.into(),
        }
    }
}

/// One entry of the command menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuCommand {
    pub command: String,
    pub description: String,
}

/// Delivers messages to conversations.
///
/// Texts passed in are already split to the transport limit.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send a text message.
    ///
    /// `keyboard` replaces the reply keyboard when given; an empty string in
    /// it marks a row break and an empty keyboard removes it.
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&[String]>,
    ) -> Result<(), SinkError>;

    /// Send a text with rows of inline buttons.
    async fn send_listing(
        &self,
        chat: ChatId,
        text: &str,
        buttons: &[Vec<InlineButton>],
    ) -> Result<(), SinkError>;

    async fn send_document(
        &self,
        chat: ChatId,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<(), SinkError>;

    /// Replace the command menu of a conversation.
    async fn send_commands(&self, chat: ChatId, commands: &[MenuCommand])
    -> Result<(), SinkError>;

    /// Acknowledge a callback.
    async fn answer_callback(&self, chat: ChatId, text: &str) -> Result<(), SinkError>;
}
