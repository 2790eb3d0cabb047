//! Wire protocol for client-server communication.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chatterm_core::constants::ROW_BUTTONS;
use chatterm_session::{InlineButton, MenuCommand};
use serde::{Deserialize, Serialize};

/// Message from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the connection. Must come first.
    Hello { chat_id: i64, token: String },
    /// A line typed by the user.
    Text { text: String },
    /// Inline button press; `message` is the text of the listing.
    Callback { data: String, message: String },
    /// Uploaded file (base64 encoded).
    Document {
        file_name: String,
        data: String,
        #[serde(default)]
        caption: String,
    },
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Create a document message from raw bytes.
    #[must_use]
    pub fn document(file_name: &str, data: &[u8], caption: &str) -> Self {
        Self::Document {
            file_name: file_name.to_string(),
            data: BASE64.encode(data),
            caption: caption.to_string(),
        }
    }

    /// Decode document data from base64.
    #[must_use]
    pub fn decode_document(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        if let Self::Document { data, .. } = self {
            Some(decode(data))
        } else {
            None
        }
    }
}

/// Decode a base64 payload.
///
/// # Errors
/// Returns error if `data` is not valid base64.
pub fn decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

/// An inline button on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub data: String,
}

impl From<&InlineButton> for Button {
    fn from(button: &InlineButton) -> Self {
        Self {
            text: button.text.clone(),
            data: button.data.clone(),
        }
    }
}

/// A command menu entry on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub command: String,
    pub description: String,
}

impl From<&MenuCommand> for MenuEntry {
    fn from(command: &MenuCommand) -> Self {
        Self {
            command: command.command.clone(),
            description: command.description.clone(),
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Text output. An absent keyboard leaves the current one in place, an
    /// empty one removes it.
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keyboard: Option<Vec<Vec<String>>>,
    },
    /// Text with rows of inline buttons.
    Listing {
        text: String,
        buttons: Vec<Vec<Button>>,
    },
    /// File download (base64 encoded).
    Document { file_name: String, data: String },
    /// Replacement command menu.
    Commands { commands: Vec<MenuEntry> },
    /// Acknowledgement of a callback.
    CallbackAnswer { text: String },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    #[must_use]
    pub fn text(text: &str, keyboard: Option<&[String]>) -> Self {
        Self::Text {
            text: text.to_string(),
            keyboard: keyboard.map(keyboard_rows),
        }
    }

    #[must_use]
    pub fn listing(text: &str, buttons: &[Vec<InlineButton>]) -> Self {
        Self::Listing {
            text: text.to_string(),
            buttons: buttons
                .iter()
                .map(|row| row.iter().map(Button::from).collect())
                .collect(),
        }
    }

    /// Create a document message from raw bytes.
    #[must_use]
    pub fn document(file_name: &str, data: &[u8]) -> Self {
        Self::Document {
            file_name: file_name.to_string(),
            data: BASE64.encode(data),
        }
    }

    #[must_use]
    pub fn commands(commands: &[MenuCommand]) -> Self {
        Self::Commands {
            commands: commands.iter().map(MenuEntry::from).collect(),
        }
    }

    /// Decode document data from base64.
    #[must_use]
    pub fn decode_document(&self) -> Option<Vec<u8>> {
        if let Self::Document { data, .. } = self {
            decode(data).ok()
        } else {
            None
        }
    }
}

/// Lay out reply keyboard buttons in rows of [`ROW_BUTTONS`]. An empty
/// entry ends the current row early and is not shown.
#[must_use]
pub fn keyboard_rows(buttons: &[String]) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::with_capacity(ROW_BUTTONS);
    for button in buttons {
        if button.is_empty() {
            if !row.is_empty() {
                rows.push(std::mem::take(&mut row));
            }
            continue;
        }
        row.push(button.clone());
        if row.len() >= ROW_BUTTONS {
            rows.push(std::mem::take(&mut row));
        }
    }
    if !row.is_empty() {
        rows.push(row);
    }
    rows
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_keyboard_rows() {
        let buttons = strings(&["a", "b", "c", "d", "e", "f", "", "g", "", "", "h"]);
        assert_eq!(
            keyboard_rows(&buttons),
            [
                strings(&["a", "b", "c", "d", "e"]),
                strings(&["f"]),
                strings(&["g"]),
                strings(&["h"]),
            ]
        );
        assert!(keyboard_rows(&[]).is_empty());
    }

    #[test]
    fn test_keyboard_field_presence() {
        let unchanged = serde_json::to_value(ServerMessage::text("hi", None)).unwrap();
        assert_eq!(unchanged, serde_json::json!({"type": "text", "text": "hi"}));

        let removed = serde_json::to_value(ServerMessage::text("hi", Some(&[][..]))).unwrap();
        assert_eq!(
            removed,
            serde_json::json!({"type": "text", "text": "hi", "keyboard": []})
        );
    }

    #[test]
    fn test_client_messages_parse() {
        let hello: ClientMessage =
            serde_json::from_str(r#"{"type":"hello","chat_id":42,"token":"t"}"#).unwrap();
        assert!(matches!(hello, ClientMessage::Hello { chat_id: 42, ref token } if token == "t"));

        let doc: ClientMessage =
            serde_json::from_str(r#"{"type":"document","file_name":"a.txt","data":"aGk="}"#)
                .unwrap();
        assert_eq!(doc.decode_document().unwrap().unwrap(), b"hi");
        assert!(matches!(doc, ClientMessage::Document { ref caption, .. } if caption.is_empty()));

        let bad = ClientMessage::Document {
            file_name: "a".into(),
            data: "***".into(),
            caption: String::new(),
        };
        assert!(bad.decode_document().unwrap().is_err());
        assert!(ClientMessage::Ping.decode_document().is_none());
    }

    #[test]
    fn test_listing_serialization() {
        let msg = ServerMessage::listing(
            "History (1)",
            &[vec![InlineButton::new("Run 0", "run_0")]],
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "listing");
        assert_eq!(json["buttons"][0][0]["data"], "run_0");

        let doc = ServerMessage::document("out.log", b"data");
        assert_eq!(doc.decode_document().unwrap(), b"data");
    }
}
