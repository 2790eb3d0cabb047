//! WebSocket transport for chat clients.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use chatterm_core::{ChatId, ConfigStore};
use chatterm_session::{Attachment, LoopHandle, commands};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{
    TransportError,
    connections::{Connections, OUTBOX_CAPACITY, Outbox},
    protocol::{self, ClientMessage, ServerMessage},
};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub handle: LoopHandle,
    pub connections: Arc<Connections>,
}

impl WsState {
    #[must_use]
    pub const fn new(handle: LoopHandle, connections: Arc<Connections>) -> Self {
        Self {
            handle,
            connections,
        }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Check a hello message against the configured token and whitelist.
///
/// # Errors
/// Returns error if `message` is not a hello or is not authorized.
pub fn authenticate(store: &ConfigStore, message: &ClientMessage) -> Result<ChatId, TransportError> {
    let ClientMessage::Hello { chat_id, token } = message else {
        return Err(TransportError::HelloExpected);
    };
    let expected = store.token();
    if expected.is_empty() || *token != expected || !store.is_allowed(*chat_id) {
        return Err(TransportError::Unauthorized(*chat_id));
    }
    Ok(*chat_id)
}

/// Hand one client message to the event loop.
///
/// # Errors
/// Returns error if the message is malformed or the loop has stopped.
pub async fn dispatch(
    handle: &LoopHandle,
    chat: ChatId,
    message: ClientMessage,
    outbox: &Outbox,
) -> Result<(), TransportError> {
    match message {
        ClientMessage::Hello { .. } => {
            tracing::debug!(chat, "Ignoring repeated hello");
        }
        ClientMessage::Ping => {
            let _ = outbox.send(ServerMessage::Pong).await;
        }
        ClientMessage::Text { text } => handle.submit_text(chat, &text).await?,
        ClientMessage::Callback { data, message } => {
            handle
                .submit(chat, "callback", "", Some(Attachment::Callback { data, message }))
                .await?;
        }
        ClientMessage::Document {
            file_name,
            data,
            caption,
        } => {
            let attachment = Attachment::Document {
                file_name,
                data: protocol::decode(&data)?,
                caption,
            };
            handle.submit(chat, "document", "", Some(attachment)).await?;
        }
    }
    Ok(())
}

enum Incoming {
    Text(String),
    Skip,
    Close,
}

fn incoming(message: Result<Message, axum::Error>) -> Incoming {
    match message {
        Ok(Message::Text(text)) => Incoming::Text(text.as_str().to_owned()),
        Ok(Message::Binary(data)) => {
            String::from_utf8(data.to_vec()).map_or(Incoming::Skip, Incoming::Text)
        }
        Ok(Message::Close(_)) => Incoming::Close,
        Ok(_) => Incoming::Skip,
        Err(e) => {
            tracing::error!("WebSocket error: {e}");
            Incoming::Close
        }
    }
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOX_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let store = Arc::clone(state.handle.store());
    let mut chat: Option<(ChatId, uuid::Uuid)> = None;

    while let Some(msg) = receiver.next().await {
        let text = match incoming(msg) {
            Incoming::Text(text) => text,
            Incoming::Skip => continue,
            Incoming::Close => break,
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = tx
                    .send(ServerMessage::Error {
                        message: TransportError::from(e).to_string(),
                    })
                    .await;
                continue;
            }
        };

        let Some((chat_id, _)) = chat else {
            match authenticate(&store, &client_msg) {
                Ok(chat_id) => {
                    let id = state.connections.register(chat_id, tx.clone());
                    chat = Some((chat_id, id));
                    tracing::info!(chat = chat_id, "Client connected");
                    let _ = tx
                        .send(ServerMessage::commands(&commands::menu(&store)))
                        .await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Rejected client: {e}");
                    let _ = tx
                        .send(ServerMessage::Error {
                            message: e.to_string(),
                        })
                        .await;
                    break;
                }
            }
        };

        if let Err(e) = dispatch(&state.handle, chat_id, client_msg, &tx).await {
            tracing::warn!(chat = chat_id, "Dropping client message: {e}");
            let _ = tx
                .send(ServerMessage::Error {
                    message: e.to_string(),
                })
                .await;
            if matches!(e, TransportError::Session(_)) {
                break;
            }
        }
    }

    if let Some((chat_id, id)) = chat {
        state.connections.unregister(chat_id, id);
        tracing::info!(chat = chat_id, "Client disconnected");
    }
    drop(tx);
    // Let queued errors flush before the socket goes away.
    let _ = send_task.await;
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(handle, connections));
/// ```
#[must_use]
pub fn create_ws_router(handle: LoopHandle, connections: Arc<Connections>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(handle, connections))
}
