//! Inline-button listings. Callbacks act on the listing text they came from,
//! so the header and line formats here are parsed back in `files` and the
//! event loop.

use std::{fmt::Write as _, fs, io, path::Path};

use chatterm_core::{
    CmdConfig, ExecutorConfig,
    constants::{FILES_MAX, ROW_BUTTONS, TEXT_LIMIT},
    text::bytes_size_around,
};

use crate::{
    commands::{BUTTONS_TIP, CMDS_TIP, EXECUTORS_TIP, FILES_TIP, HISTORY_TIP},
    sink::InlineButton,
};

/// History entries shown by `/history`.
pub const HISTORY_SHOWN: usize = 20;

pub const HISTORY_HEADER: &str = "History ";
pub const BUTTONS_HEADER: &str = "Buttons ";
pub const CMDS_HEADER: &str = "Commands ";
pub const EXECUTORS_HEADER: &str = "Executors ";
pub const FILES_HEADER: &str = "Files - ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub text: String,
    pub buttons: Vec<Vec<InlineButton>>,
}

fn rows(buttons: Vec<InlineButton>) -> Vec<Vec<InlineButton>> {
    let mut rows = Vec::new();
    let mut row = Vec::with_capacity(ROW_BUTTONS);
    for button in buttons {
        row.push(button);
        if row.len() >= ROW_BUTTONS {
            rows.push(std::mem::take(&mut row));
        }
    }
    if !row.is_empty() {
        rows.push(row);
    }
    rows
}

pub fn executors(executors: &[ExecutorConfig]) -> Listing {
    let mut text = format!(
        "{EXECUTORS_HEADER}({}) (user-defined)\n{EXECUTORS_TIP}\n\n",
        executors.len()
    );
    let mut buttons = Vec::with_capacity(executors.len());
    for (i, executor) in executors.iter().enumerate() {
        let _ = writeln!(text, "{i:<2}  {}  {}", executor.name, executor.desc());
        buttons.push(InlineButton::new(
            format!("Del {i}"),
            format!("del_{}", executor.name),
        ));
    }
    Listing {
        text,
        buttons: rows(buttons),
    }
}

pub fn buttons(executor: &str, configured: &[String]) -> Listing {
    let mut text = format!(
        "{BUTTONS_HEADER}({}) - {executor}\n{BUTTONS_TIP}\n\n",
        configured.len()
    );
    let mut buttons = Vec::with_capacity(configured.len());
    for (i, cmdline) in configured.iter().enumerate() {
        let _ = writeln!(text, "{i}  {cmdline}");
        buttons.push(InlineButton::new(format!("Del {i}"), format!("del_{i}")));
    }
    Listing {
        text,
        buttons: rows(buttons),
    }
}

pub fn cmds(cmds: &[CmdConfig]) -> Listing {
    let mut text = format!("{CMDS_HEADER}({}) - custom\n{CMDS_TIP}\n\n", cmds.len());
    let mut buttons = Vec::with_capacity(cmds.len());
    for (i, cmd) in cmds.iter().enumerate() {
        let _ = writeln!(text, "{i}  {}  {}", cmd.name, cmd.cmd);
        buttons.push(InlineButton::new(
            format!("Del {i}"),
            format!("del_{}", cmd.name),
        ));
    }
    Listing {
        text,
        buttons: rows(buttons),
    }
}

/// The last [`HISTORY_SHOWN`] entries with Run buttons followed by Add buttons.
pub fn history(executor: &str, history: &[String]) -> Listing {
    let history = &history[history.len().saturating_sub(HISTORY_SHOWN)..];
    let mut text = format!(
        "{HISTORY_HEADER}({}) - {executor}\n{HISTORY_TIP}\n\n",
        history.len()
    );
    for (i, cmdline) in history.iter().enumerate() {
        let _ = writeln!(text, "{i}  {cmdline}");
    }
    let run = (0..history.len()).map(|i| InlineButton::new(format!("Run {i}"), format!("run_{i}")));
    let add = (0..history.len()).map(|i| InlineButton::new(format!("Add {i}"), format!("add_{i}")));
    Listing {
        text,
        buttons: rows(run.chain(add).collect()),
    }
}

/// Entries of `cwd` whose name starts with `prefix`, sorted by name.
///
/// Stops before the text would exceed the message limit or after
/// `FILES_MAX + 1` entries. The last row always carries `cd .` and `cd ..`.
///
/// # Errors
/// Returns error if `cwd` cannot be read.
pub fn files(cwd: &Path, prefix: &str) -> io::Result<Listing> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(cwd)?.filter_map(Result::ok).collect();
    entries.sort_by_key(fs::DirEntry::file_name);

    let mut text = format!(
        "{FILES_HEADER}{}\nPrefix: {prefix}\n{FILES_TIP}\n\n",
        cwd.display()
    );
    let mut chars = text.chars().count();
    let mut buttons = Vec::new();
    let mut no = 0usize;
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) {
            if name.as_str() < prefix {
                continue;
            }
            break;
        }
        let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
        let (flag, size) = if is_dir {
            ("d", "-".to_string())
        } else {
            let size = fs::metadata(entry.path())
                .map_or_else(|_| "?".to_string(), |m| bytes_size_around(m.len()));
            ("-", size)
        };
        let line = format!("{no:<2} {flag:1} {size:>4}  {name}\n");
        let line_chars = line.chars().count();
        if chars + line_chars > TEXT_LIMIT {
            break;
        }
        text.push_str(&line);
        chars += line_chars;
        buttons.push(if is_dir {
            InlineButton::new(format!("cd {no}"), format!("cd_{no}"))
        } else {
            InlineButton::new(format!("↓ {no}"), format!("get_{no}"))
        });
        no += 1;
        if no > FILES_MAX {
            break;
        }
    }

    let mut rows = rows(buttons);
    let mut last = match rows.last() {
        Some(row) if row.len() < ROW_BUTTONS => rows.pop().unwrap_or_default(),
        _ => Vec::new(),
    };
    last.push(InlineButton::new("cd .", "cd_."));
    last.push(InlineButton::new("cd ..", "cd_.."));
    rows.push(last);
    Ok(Listing {
        text,
        buttons: rows,
    })
}
