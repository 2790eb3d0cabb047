//! Live client connections, keyed by conversation.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use chatterm_core::ChatId;
use chatterm_session::{InlineButton, MenuCommand, MessageSink, SinkError};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Messages queued per connection before senders wait for the socket.
pub const OUTBOX_CAPACITY: usize = 32;

/// Outbound queue of one connection.
pub type Outbox = mpsc::Sender<ServerMessage>;

struct Connection {
    id: Uuid,
    outbox: Outbox,
}

/// Registry of connected conversations. A newer connection for the same
/// conversation replaces the older one.
#[derive(Default)]
pub struct Connections {
    inner: RwLock<HashMap<ChatId, Connection>>,
}

impl Connections {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `outbox` for `chat` and return the connection id.
    pub fn register(&self, chat: ChatId, outbox: Outbox) -> Uuid {
        let id = Uuid::new_v4();
        let previous = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chat, Connection { id, outbox });
        if previous.is_some() {
            tracing::info!(chat, "Replacing previous connection");
        }
        id
    }

    /// Remove the connection `id` of `chat` unless it was already replaced.
    pub fn unregister(&self, chat: ChatId, id: Uuid) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.get(&chat).is_some_and(|c| c.id == id) {
            inner.remove(&chat);
        }
    }

    #[must_use]
    pub fn is_connected(&self, chat: ChatId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&chat)
    }

    /// Queue `message` for `chat`, waiting while its outbox is full.
    ///
    /// # Errors
    /// Returns error if the conversation has no live connection.
    pub async fn send(&self, chat: ChatId, message: ServerMessage) -> Result<(), SinkError> {
        let outbox = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chat)
            .map(|c| c.outbox.clone())
            .ok_or(SinkError::NotConnected(chat))?;
        outbox
            .send(message)
            .await
            .map_err(|_| SinkError::NotConnected(chat))
    }
}

#[async_trait]
impl MessageSink for Connections {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&[String]>,
    ) -> Result<(), SinkError> {
        self.send(chat, ServerMessage::text(text, keyboard)).await
    }

    async fn send_listing(
        &self,
        chat: ChatId,
        text: &str,
        buttons: &[Vec<InlineButton>],
    ) -> Result<(), SinkError> {
        self.send(chat, ServerMessage::listing(text, buttons)).await
    }

    async fn send_document(
        &self,
        chat: ChatId,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<(), SinkError> {
        self.send(chat, ServerMessage::document(file_name, &data)).await
    }

    async fn send_commands(
        &self,
        chat: ChatId,
        commands: &[MenuCommand],
    ) -> Result<(), SinkError> {
        self.send(chat, ServerMessage::commands(commands)).await
    }

    async fn answer_callback(&self, chat: ChatId, text: &str) -> Result<(), SinkError> {
        self.send(
            chat,
            ServerMessage::CallbackAnswer {
                text: text.to_string(),
            },
        )
        .await
    }
}
