//! File transfer between the conversation and the working directory.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chatterm_core::{CancelListener, ChatId, text, workdir};
use tokio::sync::mpsc;

use crate::{listing::FILES_HEADER, message::Message, sink::MessageSink};

/// Width of the flag and size columns before a file name in a listing line.
const NAME_OFFSET: usize = 8;

/// What a file listing button asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    Cd(PathBuf),
    Get(PathBuf),
}

/// Resolve a `cd_<n>` / `get_<n>` callback against the listing it came from.
pub fn listing_action(listing: &str, action: &str, index: &str) -> Option<FileAction> {
    let lines: Vec<&str> = listing.lines().collect();
    let dir = Path::new(lines.first()?.strip_prefix(FILES_HEADER)?);
    if index == "." || index == ".." {
        return (action == "cd").then(|| FileAction::Cd(workdir::clean(&dir.join(index))));
    }
    let info = text::find_line_data_by_first_field(&lines, index)?;
    let name = info.get(NAME_OFFSET..).filter(|name| !name.is_empty())?;
    let path = workdir::clean(&dir.join(name));
    match action {
        "cd" => Some(FileAction::Cd(path)),
        "get" => Some(FileAction::Get(path)),
        _ => None,
    }
}

/// Where an upload goes: the caption path if given, else the working
/// directory. Only the final component of `file_name` is kept.
pub fn save_target(caption: &str, file_name: &str) -> PathBuf {
    let cwd = workdir::current().unwrap_or_else(|_| PathBuf::from("."));
    let caption = caption.trim();
    let dir = if caption.is_empty() {
        cwd
    } else if Path::new(caption).is_absolute() {
        PathBuf::from(caption)
    } else {
        workdir::clean(&cwd.join(caption))
    };
    let name = Path::new(file_name)
        .file_name()
        .map_or_else(|| "upload".into(), ToOwned::to_owned);
    dir.join(name)
}

async fn notify(messages: &mpsc::Sender<Message>, chat: ChatId, text: String) {
    if messages.send(Message::Global { chat, text }).await.is_err() {
        tracing::debug!(chat, "Event loop gone, dropping notice");
    }
}

/// Write an upload to `path`, reporting progress as global messages.
///
/// Aborts when a cancel request arrives before the write completes.
pub async fn save_document(
    messages: mpsc::Sender<Message>,
    mut cancel: CancelListener,
    chat: ChatId,
    path: PathBuf,
    data: Vec<u8>,
) {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    notify(
        &messages,
        chat,
        format!(
            "Saving file '{}' ({}) to '{}' . To cancel, send /cancel",
            path.file_name().unwrap_or_default().to_string_lossy(),
            text::bytes_size(data.len() as u64),
            dir.display()
        ),
    )
    .await;

    let result = tokio::select! {
        () = cancel.cancelled() => Err(std::io::Error::other("cancelled")),
        written = tokio::fs::write(&path, &data) => written,
    };
    match result {
        Ok(()) => {
            tracing::info!(chat, path = %path.display(), "Saved upload");
            notify(&messages, chat, "Successfully saved file to the below path:".into()).await;
            notify(&messages, chat, path.display().to_string()).await;
        }
        Err(e) => {
            tracing::warn!(chat, path = %path.display(), ?e, "Saving upload failed");
            notify(
                &messages,
                chat,
                format!("Failed to save file to '{}': {e}", path.display()),
            )
            .await;
        }
    }
}

/// Send a regular file as a document, preceded by `notice`.
pub async fn send_file(sink: Arc<dyn MessageSink>, chat: ChatId, path: PathBuf, notice: String) {
    if let Err(e) = sink.send_text(chat, &notice, None).await {
        tracing::error!(chat, ?e, "Failed to send notice");
    }
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) => {
            let text = format!("Failed to read '{}': {e}", path.display());
            if let Err(e) = sink.send_text(chat, &text, None).await {
                tracing::error!(chat, ?e, "Failed to send notice");
            }
            return;
        }
    };
    let file_name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned();
    if let Err(e) = sink.send_document(chat, &file_name, data).await {
        tracing::error!(chat, ?e, "Failed to send document");
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const LISTING: &str = "Files - /srv/data\nPrefix: \n- Click '↓' to get\n- To narrow, use /files <prefix>\n\n0  -    5  a.txt\n1  d    -  logs\n";

    #[test]
    fn test_listing_actions() {
        assert_eq!(
            listing_action(LISTING, "get", "0"),
            Some(FileAction::Get("/srv/data/a.txt".into()))
        );
        assert_eq!(
            listing_action(LISTING, "cd", "1"),
            Some(FileAction::Cd("/srv/data/logs".into()))
        );
        assert_eq!(
            listing_action(LISTING, "cd", ".."),
            Some(FileAction::Cd("/srv".into()))
        );
        assert_eq!(listing_action(LISTING, "get", "."), None);
        assert_eq!(listing_action(LISTING, "get", "7"), None);
        assert_eq!(listing_action("History (0)", "cd", "0"), None);
    }

    #[test]
    fn test_save_target() {
        assert_eq!(
            save_target("/tmp/in", "../../etc/passwd"),
            PathBuf::from("/tmp/in/passwd")
        );
        assert_eq!(save_target("/tmp", "a.txt"), PathBuf::from("/tmp/a.txt"));
    }
}
