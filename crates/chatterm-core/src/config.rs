//! Persistent configuration: user executors, custom commands and buttons.
//!
//! The store is shared behind an `Arc` and every operation is atomic with
//! respect to the others. When backed by a file, every mutation is written
//! back immediately.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the default executor. Its session lives for the whole process.
pub const DEFAULT_EXECUTOR: &str = "shell";

/// Name of the internal pty shell executor.
pub const PTY_EXECUTOR: &str = "pty";

/// File name of the configuration inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Default listen address of the chat transport.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8022";

/// Config store error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("config store is not backed by a file")]
    NotPersistent,
    #[error("'{0}' executor already exists")]
    ExecutorExists(String),
    #[error("'{0}' executor does NOT exist")]
    ExecutorNotFound(String),
    #[error("'{0}' is an internal executor and can NOT be deleted")]
    InternalExecutor(String),
    #[error("'{0}' executor does NOT support secret because it's an internal executor")]
    SecretUnsupported(String),
    #[error("'{0}' cmd already exists")]
    CmdExists(String),
    #[error("'{0}' cmd does NOT exist")]
    CmdNotFound(String),
    #[error("invalid payload '{0}'")]
    InvalidPayload(String),
}

/// A user-defined shortcut command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdConfig {
    pub name: String,
    pub cmd: String,
}

/// Configuration of one executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub config: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub secret: String,
    /// Persistent cmdline shortcuts.
    pub buttons: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(skip)]
    pub internal: bool,
    /// One instance is shared across all conversations.
    pub global: bool,
}

impl ExecutorConfig {
    /// Create a user executor configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>, config: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            config: config.into(),
            ..Self::default()
        }
    }

    /// Type and config combined, with `*` marking user-defined executors.
    #[must_use]
    pub fn desc(&self) -> String {
        let mut desc = self.kind.clone();
        if !self.config.is_empty() {
            desc.push(' ');
            desc.push_str(&self.config);
        }
        if !self.internal {
            desc.push_str(" *");
        }
        desc
    }
}

/// On-disk configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigData {
    /// Interpreter prepended to the config of both internal shell executors.
    pub shell_executor: String,
    pub shell_executor_buttons: Vec<String>,
    /// Token chat clients authenticate with.
    pub token: String,
    /// Conversation ids allowed to connect.
    pub whitelist: Vec<i64>,
    pub listen: String,
    pub cmds: Vec<CmdConfig>,
    pub executors: Vec<ExecutorConfig>,
}

impl ConfigData {
    /// Check the fields required at startup.
    ///
    /// # Errors
    /// Returns error if the token or whitelist is missing, or the whitelist
    /// contains a zero id.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::Invalid("token must be configured".into()));
        }
        if self.whitelist.is_empty() {
            return Err(ConfigError::Invalid("whitelist must be configured".into()));
        }
        if self.whitelist.contains(&0) {
            return Err(ConfigError::Invalid("whitelist id can not be 0".into()));
        }
        Ok(())
    }

    fn internal_executors(&self) -> [ExecutorConfig; 2] {
        let with_shell = |config: &str| {
            if self.shell_executor.is_empty() {
                config.to_string()
            } else {
                format!("{} {config}", self.shell_executor).trim().to_string()
            }
        };
        [
            ExecutorConfig {
                name: DEFAULT_EXECUTOR.into(),
                kind: "shell".into(),
                config: with_shell("--ts-oneshot"),
                buttons: self.shell_executor_buttons.clone(),
                comment: "The default executor. Exec cmdline using system shell. \
                          It's always open and can not be closed."
                    .into(),
                internal: true,
                global: true,
                ..ExecutorConfig::default()
            },
            ExecutorConfig {
                name: PTY_EXECUTOR.into(),
                kind: "shell".into(),
                config: with_shell(""),
                buttons: self.shell_executor_buttons.clone(),
                comment: "The system shell pty (pseudo terminal) executor.".into(),
                internal: true,
                ..ExecutorConfig::default()
            },
        ]
    }
}

fn is_shell_executor(name: &str) -> bool {
    name == DEFAULT_EXECUTOR || name == PTY_EXECUTOR
}

/// Index of the button addressed by `payload`: a numeric index, or the first
/// button equal to the payload or starting with the payload plus a space.
fn button_index(buttons: &[String], payload: &str) -> Result<Option<usize>, ConfigError> {
    if let Ok(index) = payload.parse::<i64>() {
        if index < 0 {
            return Err(ConfigError::InvalidPayload(payload.to_string()));
        }
        let index = usize::try_from(index).ok();
        return Ok(index.filter(|i| *i < buttons.len()));
    }
    let prefix = format!("{payload} ");
    Ok(buttons
        .iter()
        .position(|b| b == payload || b.starts_with(&prefix)))
}

/// Thread-safe configuration store.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    data: RwLock<ConfigData>,
}

impl ConfigStore {
    /// Store that is never persisted.
    #[must_use]
    pub fn in_memory(data: ConfigData) -> Self {
        Self {
            path: None,
            data: RwLock::new(data),
        }
    }

    /// Load `config.json` from `dir`, writing a default file first when
    /// missing.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be created, read or
    /// parsed.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            tracing::info!(path = %path.display(), "Writing default config");
            let data = ConfigData {
                listen: DEFAULT_LISTEN.into(),
                ..ConfigData::default()
            };
            fs::write(&path, serde_json::to_string_pretty(&data)?)?;
        }
        tracing::info!(path = %path.display(), "Reading config");
        let data = read_file(&path)?;
        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file, discarding in-memory state.
    ///
    /// # Errors
    /// Returns error if the store has no file or the file is invalid.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let path = self.path.as_deref().ok_or(ConfigError::NotPersistent)?;
        tracing::info!(path = %path.display(), "Reloading config");
        let data = read_file(path)?;
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data;
        Ok(())
    }

    /// Snapshot of the whole configuration.
    #[must_use]
    pub fn snapshot(&self) -> ConfigData {
        self.read(Clone::clone)
    }

    /// Check the fields required at startup.
    ///
    /// # Errors
    /// See [`ConfigData::validate`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.read(ConfigData::validate)
    }

    #[must_use]
    pub fn token(&self) -> String {
        self.read(|d| d.token.clone())
    }

    /// Whether a conversation may use the system.
    #[must_use]
    pub fn is_allowed(&self, chat_id: i64) -> bool {
        chat_id != 0 && self.read(|d| d.whitelist.contains(&chat_id))
    }

    #[must_use]
    pub fn listen(&self) -> String {
        self.read(|d| {
            if d.listen.is_empty() {
                DEFAULT_LISTEN.to_string()
            } else {
                d.listen.clone()
            }
        })
    }

    /// The built-in executors, default first.
    #[must_use]
    pub fn internal_executors(&self) -> Vec<ExecutorConfig> {
        self.read(|d| d.internal_executors().into())
    }

    /// User-defined executors, sorted by name then config.
    #[must_use]
    pub fn user_executors(&self) -> Vec<ExecutorConfig> {
        self.read(|d| d.executors.clone())
    }

    /// Look up an executor by name, internal ones first.
    #[must_use]
    pub fn get_executor(&self, name: &str) -> Option<ExecutorConfig> {
        self.read(|d| {
            d.internal_executors()
                .into_iter()
                .find(|e| e.name == name)
                .or_else(|| d.executors.iter().find(|e| e.name == name).cloned())
        })
    }

    /// Add a user executor.
    ///
    /// # Errors
    /// Returns error if the name is taken or the file cannot be written.
    pub fn add_executor(&self, executor: ExecutorConfig) -> Result<(), ConfigError> {
        self.write(|d| {
            if is_shell_executor(&executor.name)
                || d.executors.iter().any(|e| e.name == executor.name)
            {
                return Err(ConfigError::ExecutorExists(executor.name));
            }
            d.executors.push(ExecutorConfig {
                internal: false,
                ..executor
            });
            d.executors
                .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.config.cmp(&b.config)));
            Ok(())
        })
    }

    /// Delete a user executor.
    ///
    /// # Errors
    /// Returns error if the executor is missing or internal.
    pub fn del_executor(&self, name: &str) -> Result<(), ConfigError> {
        self.write(|d| {
            if is_shell_executor(name) {
                return Err(ConfigError::InternalExecutor(name.to_string()));
            }
            let before = d.executors.len();
            d.executors.retain(|e| e.name != name);
            if d.executors.len() == before {
                return Err(ConfigError::ExecutorNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    /// Set or clear the secret of a user executor.
    ///
    /// # Errors
    /// Returns error if the executor is missing or internal.
    pub fn set_executor_secret(&self, name: &str, secret: &str) -> Result<(), ConfigError> {
        self.write(|d| {
            if is_shell_executor(name) {
                return Err(ConfigError::SecretUnsupported(name.to_string()));
            }
            let executor = d
                .executors
                .iter_mut()
                .find(|e| e.name == name)
                .ok_or_else(|| ConfigError::ExecutorNotFound(name.to_string()))?;
            executor.secret = secret.to_string();
            Ok(())
        })
    }

    /// Persistent buttons of an executor.
    ///
    /// The two internal shell executors share one list.
    #[must_use]
    pub fn buttons(&self, name: &str) -> Vec<String> {
        self.read(|d| {
            if is_shell_executor(name) {
                d.shell_executor_buttons.clone()
            } else {
                d.executors
                    .iter()
                    .find(|e| e.name == name)
                    .map(|e| e.buttons.clone())
                    .unwrap_or_default()
            }
        })
    }

    /// Add a persistent button. Existing buttons are left as they are.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn add_button(&self, name: &str, button: &str) -> Result<(), ConfigError> {
        self.write(|d| {
            if is_shell_executor(name) {
                if !d.shell_executor_buttons.iter().any(|b| b == button) {
                    d.shell_executor_buttons.push(button.to_string());
                }
            } else if let Some(executor) = d.executors.iter_mut().find(|e| e.name == name) {
                if !executor.buttons.iter().any(|b| b == button) {
                    executor.buttons.push(button.to_string());
                    executor.buttons.sort();
                }
            }
            Ok(())
        })
    }

    /// Remove a persistent button by index or prefix.
    ///
    /// A payload that matches nothing is not an error.
    ///
    /// # Errors
    /// Returns error on a negative index or if the file cannot be written.
    pub fn del_button(&self, name: &str, payload: &str) -> Result<(), ConfigError> {
        self.write(|d| {
            let buttons = if is_shell_executor(name) {
                Some(&mut d.shell_executor_buttons)
            } else {
                d.executors
                    .iter_mut()
                    .find(|e| e.name == name)
                    .map(|e| &mut e.buttons)
            };
            if let Some(buttons) = buttons {
                if let Some(index) = button_index(buttons, payload)? {
                    buttons.remove(index);
                }
            }
            Ok(())
        })
    }

    /// Remove every persistent button of an executor.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn clear_buttons(&self, name: &str) -> Result<(), ConfigError> {
        self.write(|d| {
            if is_shell_executor(name) {
                d.shell_executor_buttons.clear();
            } else if let Some(executor) = d.executors.iter_mut().find(|e| e.name == name) {
                executor.buttons.clear();
            }
            Ok(())
        })
    }

    /// Custom commands, sorted by name then cmdline.
    #[must_use]
    pub fn cmds(&self) -> Vec<CmdConfig> {
        self.read(|d| d.cmds.clone())
    }

    #[must_use]
    pub fn get_cmd(&self, name: &str) -> Option<CmdConfig> {
        self.read(|d| d.cmds.iter().find(|c| c.name == name).cloned())
    }

    /// Add a custom command.
    ///
    /// # Errors
    /// Returns error if the name is taken or the file cannot be written.
    pub fn add_cmd(&self, cmd: CmdConfig) -> Result<(), ConfigError> {
        self.write(|d| {
            if d.cmds.iter().any(|c| c.name == cmd.name) {
                return Err(ConfigError::CmdExists(cmd.name));
            }
            d.cmds.push(cmd);
            d.cmds
                .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.cmd.cmp(&b.cmd)));
            Ok(())
        })
    }

    /// Delete a custom command.
    ///
    /// # Errors
    /// Returns error if the command is missing or the file cannot be written.
    pub fn del_cmd(&self, name: &str) -> Result<(), ConfigError> {
        self.write(|d| {
            let before = d.cmds.len();
            d.cmds.retain(|c| c.name != name);
            if d.cmds.len() == before {
                return Err(ConfigError::CmdNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    fn read<T>(&self, f: impl FnOnce(&ConfigData) -> T) -> T {
        f(&self.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply a mutation and persist it. A failed mutation changes nothing.
    fn write(
        &self,
        f: impl FnOnce(&mut ConfigData) -> Result<(), ConfigError>,
    ) -> Result<(), ConfigError> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        f(&mut next)?;
        if let Some(path) = &self.path {
            fs::write(path, serde_json::to_string_pretty(&next)?)?;
        }
        *guard = next;
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<ConfigData, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut data: ConfigData = serde_json::from_str(&content)?;
    data.executors.retain(|e| !is_shell_executor(&e.name));
    Ok(data)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn store() -> ConfigStore {
        ConfigStore::in_memory(ConfigData {
            token: "t".into(),
            whitelist: vec![42],
            ..ConfigData::default()
        })
    }

    #[test]
    fn test_validate() {
        assert!(store().validate().is_ok());
        assert!(ConfigData::default().validate().is_err());

        let zero = ConfigData {
            token: "t".into(),
            whitelist: vec![1, 0],
            ..ConfigData::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_internal_executors() {
        let store = ConfigStore::in_memory(ConfigData {
            shell_executor: "/bin/zsh".into(),
            ..ConfigData::default()
        });
        let default = store.get_executor(DEFAULT_EXECUTOR).unwrap();
        assert!(default.internal);
        assert!(default.global);
        assert_eq!(default.config, "/bin/zsh --ts-oneshot");
        assert_eq!(default.desc(), "shell /bin/zsh --ts-oneshot");

        let pty = store.get_executor(PTY_EXECUTOR).unwrap();
        assert!(!pty.global);
        assert_eq!(pty.config, "/bin/zsh");
    }

    #[test]
    fn test_add_and_del_executor() {
        let store = store();
        store
            .add_executor(ExecutorConfig::new("b", "ssh", "host"))
            .unwrap();
        store
            .add_executor(ExecutorConfig::new("a", "ssh", "other"))
            .unwrap();
        assert!(matches!(
            store.add_executor(ExecutorConfig::new("a", "ssh", "x")),
            Err(ConfigError::ExecutorExists(_))
        ));
        assert!(matches!(
            store.add_executor(ExecutorConfig::new(DEFAULT_EXECUTOR, "ssh", "x")),
            Err(ConfigError::ExecutorExists(_))
        ));

        let names: Vec<String> = store.user_executors().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(store.get_executor("a").unwrap().desc(), "ssh other *");

        assert!(matches!(
            store.del_executor(DEFAULT_EXECUTOR),
            Err(ConfigError::InternalExecutor(_))
        ));
        assert!(matches!(
            store.del_executor("missing"),
            Err(ConfigError::ExecutorNotFound(_))
        ));
        store.del_executor("a").unwrap();
        assert!(store.get_executor("a").is_none());
    }

    #[test]
    fn test_set_executor_secret() {
        let store = store();
        store
            .add_executor(ExecutorConfig::new("remote", "ssh", "host"))
            .unwrap();
        store.set_executor_secret("remote", "hunter2").unwrap();
        assert_eq!(store.get_executor("remote").unwrap().secret, "hunter2");
        assert!(matches!(
            store.set_executor_secret(PTY_EXECUTOR, "x"),
            Err(ConfigError::SecretUnsupported(_))
        ));
    }

    #[test]
    fn test_shell_buttons_are_shared() {
        let store = store();
        store.add_button(DEFAULT_EXECUTOR, "uptime").unwrap();
        store.add_button(PTY_EXECUTOR, "uptime").unwrap();
        store.add_button(PTY_EXECUTOR, "df -h").unwrap();
        assert_eq!(store.buttons(DEFAULT_EXECUTOR), ["uptime", "df -h"]);
        assert_eq!(store.buttons(PTY_EXECUTOR), ["uptime", "df -h"]);
        assert_eq!(
            store.get_executor(PTY_EXECUTOR).unwrap().buttons,
            ["uptime", "df -h"]
        );

        store.del_button(PTY_EXECUTOR, "df").unwrap();
        assert_eq!(store.buttons(DEFAULT_EXECUTOR), ["uptime"]);

        store.clear_buttons(DEFAULT_EXECUTOR).unwrap();
        assert!(store.buttons(PTY_EXECUTOR).is_empty());
    }

    #[test]
    fn test_executor_buttons_sorted() {
        let store = store();
        store
            .add_executor(ExecutorConfig::new("remote", "ssh", "host"))
            .unwrap();
        store.add_button("remote", "uptime").unwrap();
        store.add_button("remote", "ls -l").unwrap();
        store.add_button("remote", "ls -l").unwrap();
        assert_eq!(store.buttons("remote"), ["ls -l", "uptime"]);

        store.del_button("remote", "1").unwrap();
        assert_eq!(store.buttons("remote"), ["ls -l"]);
        assert!(matches!(
            store.del_button("remote", "-1"),
            Err(ConfigError::InvalidPayload(_))
        ));
        store.del_button("remote", "7").unwrap();
        assert_eq!(store.buttons("remote"), ["ls -l"]);
    }

    #[test]
    fn test_cmds() {
        let store = store();
        store
            .add_cmd(CmdConfig {
                name: "ping".into(),
                cmd: "ping -c 5 8.8.8.8".into(),
            })
            .unwrap();
        store
            .add_cmd(CmdConfig {
                name: "df".into(),
                cmd: "df -h".into(),
            })
            .unwrap();
        let names: Vec<String> = store.cmds().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["df", "ping"]);
        assert!(matches!(
            store.add_cmd(CmdConfig {
                name: "df".into(),
                cmd: "x".into()
            }),
            Err(ConfigError::CmdExists(_))
        ));
        store.del_cmd("df").unwrap();
        assert!(store.get_cmd("df").is_none());
        assert!(matches!(store.del_cmd("df"), Err(ConfigError::CmdNotFound(_))));
    }

    #[test]
    fn test_load_writes_default_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(store.listen(), DEFAULT_LISTEN);

        store
            .add_executor(ExecutorConfig::new("remote", "ssh", "host"))
            .unwrap();
        store.add_button(DEFAULT_EXECUTOR, "uptime").unwrap();

        let reopened = ConfigStore::load(dir.path()).unwrap();
        assert!(reopened.get_executor("remote").is_some());
        assert_eq!(reopened.buttons(PTY_EXECUTOR), ["uptime"]);
    }

    #[test]
    fn test_reload() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::load(dir.path()).unwrap();
        let data = ConfigData {
            token: "secret".into(),
            whitelist: vec![7],
            ..ConfigData::default()
        };
        fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::to_string(&data).unwrap(),
        )
        .unwrap();
        store.reload().unwrap();
        assert_eq!(store.token(), "secret");
        assert!(store.is_allowed(7));
        assert!(!store.is_allowed(8));

        assert!(matches!(
            ConfigStore::in_memory(ConfigData::default()).reload(),
            Err(ConfigError::NotPersistent)
        ));
    }
}
