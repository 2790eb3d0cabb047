//! Interpreter detection utilities.

use std::path::{Path, PathBuf};

/// Programs treated as system shells.
pub const KNOWN_SHELLS: &[&str] = &[
    "cmd",
    "powershell",
    "bash",
    "sh",
    "ash",
    "fish",
    "ksh",
    "tcsh",
    "zsh",
    "dash",
];

/// Programs that are not shells but accept a command line after `-c`.
pub const KNOWN_INTERPRETERS: &[&str] = &["python", "python3"];

/// File name of `program` without directory and `.exe` suffix.
fn base_name(program: &str) -> &str {
    let name = program.rsplit(['/', '\\']).next().unwrap_or(program);
    name.strip_suffix(".exe").unwrap_or(name)
}

/// Whether `program` is a known system shell.
#[must_use]
pub fn is_known_shell(program: &str) -> bool {
    KNOWN_SHELLS.contains(&base_name(program))
}

/// Whether `program` is a known non-shell interpreter.
#[must_use]
pub fn is_known_interpreter(program: &str) -> bool {
    KNOWN_INTERPRETERS.contains(&base_name(program))
}

/// The flag that makes `program` run its next argument as a command line.
///
/// Returns `None` for programs that are neither known shells nor known
/// interpreters.
#[must_use]
pub fn command_flag(program: &str) -> Option<&'static str> {
    if is_known_shell(program) {
        Some(if cfg!(windows) { "/C" } else { "-c" })
    } else if is_known_interpreter(program) {
        Some("-c")
    } else {
        None
    }
}

/// The interpreter used when none is configured.
///
/// `cmd` on Windows, otherwise `$SHELL`, falling back to `/bin/bash`.
#[must_use]
pub fn default_interpreter() -> String {
    if cfg!(windows) {
        return "cmd".into();
    }
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => "/bin/bash".into(),
    }
}

/// Resolve an executable by name.
///
/// Explicit paths are accepted when they point to a file; bare names are
/// searched on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
