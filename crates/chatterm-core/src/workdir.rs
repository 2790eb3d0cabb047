//! The process working directory.
//!
//! One value shared by every shell session of every conversation. Changes
//! made from two conversations at once race; the last one wins.

use std::{
    io,
    path::{Path, PathBuf},
};

/// Current working directory.
///
/// # Errors
/// Returns error if the directory is gone or inaccessible.
pub fn current() -> io::Result<PathBuf> {
    std::env::current_dir()
}

/// Resolve `path` against the current working directory.
///
/// # Errors
/// Returns error if the working directory cannot be read.
pub fn resolve(path: &str) -> io::Result<PathBuf> {
    let path = Path::new(path);
    if path.is_absolute() {
        return Ok(clean(path));
    }
    Ok(clean(&current()?.join(path)))
}

/// Lexically normalize `.` and `..` components.
#[must_use]
pub fn clean(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Change the working directory and return the new one.
///
/// `dir` is resolved by the system shell so that variables expand. An empty
/// `dir` means the home directory.
///
/// # Errors
/// Returns error if the shell cannot resolve `dir` or the change fails.
pub async fn cd(dir: &str) -> io::Result<PathBuf> {
    let dir = dir.trim();
    let target = if dir.is_empty() {
        dirs::home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory unknown"))?
    } else {
        let output = if cfg!(windows) {
            tokio::process::Command::new("cmd")
                .args(["/C", &format!("cd {dir} && cd")])
                .output()
                .await?
        } else {
            tokio::process::Command::new("sh")
                .args(["-c", &format!("cd {dir} && pwd")])
                .output()
                .await?
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::other(stderr.trim().to_string()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let resolved = stdout.trim();
        if resolved.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{dir}: no such directory"),
            ));
        }
        PathBuf::from(resolved)
    };
    std::env::set_current_dir(&target)?;
    tracing::debug!(cwd = %target.display(), "Changed working directory");
    Ok(target)
}

/// Change the working directory to `path` as given, without shell expansion.
///
/// # Errors
/// Returns error if `path` is not an accessible directory.
pub fn chdir(path: &Path) -> io::Result<PathBuf> {
    std::env::set_current_dir(path)?;
    tracing::debug!(cwd = %path.display(), "Changed working directory");
    Ok(path.to_path_buf())
}

/// Change to the home directory, used once at startup.
///
/// # Errors
/// Returns error if the home directory is unknown or inaccessible.
pub fn chdir_home() -> io::Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory unknown"))?;
    std::env::set_current_dir(&home)?;
    Ok(home)
}
