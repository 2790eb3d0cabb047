//! Open executors and the per-conversation active selection.
//!
//! Both tables are owned by the event loop and never shared.

use std::{collections::HashMap, fmt, sync::Arc};

use chatterm_core::{ChatId, Executor, ExecutorError};
use uuid::Uuid;

use crate::message::Origin;

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("Executor '{0}' not found")]
    NotFound(String),
    #[error("Session '{0}' already exists")]
    Exists(String),
    #[error("the default executor can NOT be closed")]
    DefaultSession,
    #[error("event loop stopped")]
    LoopStopped,
}

/// Key of the session of executor `name` for conversation `chat`.
///
/// Global executors have one session keyed by name alone.
#[must_use]
pub fn session_key(name: &str, global: bool, chat: ChatId) -> String {
    if global {
        name.to_string()
    } else {
        format!("{name}_{chat}")
    }
}

/// A live executor instance.
pub struct Session {
    pub key: String,
    pub name: String,
    pub executor: Arc<dyn Executor>,
    /// Conversation that opened it.
    pub chat: ChatId,
    pub global: bool,
    pub ready: bool,
    /// Distinguishes this instance from later ones under the same key.
    pub instance: Uuid,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("chat", &self.chat)
            .field("ready", &self.ready)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A session that is not ready yet.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, chat: ChatId, global: bool) -> Self {
        let name = executor.name().to_string();
        Self {
            key: session_key(&name, global, chat),
            name,
            executor,
            chat,
            global,
            ready: false,
            instance: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn origin(&self) -> Origin {
        Origin {
            executor: self.name.clone(),
            global: self.global,
            instance: self.instance,
        }
    }
}

/// Every open session. The default session cannot be removed.
#[derive(Debug)]
pub struct SessionTable {
    default: Session,
    others: HashMap<String, Session>,
}

impl SessionTable {
    #[must_use]
    pub fn new(default: Session) -> Self {
        Self {
            default,
            others: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn default_session(&self) -> &Session {
        &self.default
    }

    #[must_use]
    pub fn default_key(&self) -> &str {
        &self.default.key
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Session> {
        if key == self.default.key {
            Some(&self.default)
        } else {
            self.others.get(key)
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// The session under `key` if it is still the given instance.
    pub fn get_instance_mut(&mut self, key: &str, instance: Uuid) -> Option<&mut Session> {
        let session = if key == self.default.key {
            &mut self.default
        } else {
            self.others.get_mut(key)?
        };
        (session.instance == instance).then_some(session)
    }

    /// The session under `key`, falling back to the default session.
    #[must_use]
    pub fn resolve(&self, key: Option<&str>) -> &Session {
        key.and_then(|key| self.get(key)).unwrap_or(&self.default)
    }

    /// Register a new session.
    ///
    /// # Errors
    /// Returns error if the key is taken.
    pub fn insert(&mut self, session: Session) -> Result<(), SessionError> {
        if self.contains(&session.key) {
            return Err(SessionError::Exists(session.key));
        }
        tracing::info!(session = %session.key, chat = session.chat, "Session registered");
        self.others.insert(session.key.clone(), session);
        Ok(())
    }

    /// Remove a session.
    ///
    /// # Errors
    /// Returns error for the default session or an unknown key.
    pub fn remove(&mut self, key: &str) -> Result<Session, SessionError> {
        if key == self.default.key {
            return Err(SessionError::DefaultSession);
        }
        let session = self
            .others
            .remove(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        tracing::info!(session = %key, "Session removed");
        Ok(session)
    }

    /// Remove the session under `key` only if it is the given instance.
    pub fn remove_instance(&mut self, key: &str, instance: Uuid) -> Option<Session> {
        match self.others.get(key) {
            Some(session) if session.instance == instance => self.remove(key).ok(),
            _ => None,
        }
    }

    /// Remove every non-default session that matches.
    pub fn remove_where(&mut self, mut matches: impl FnMut(&Session) -> bool) -> Vec<Session> {
        let keys: Vec<String> = self
            .others
            .values()
            .filter(|session| matches(session))
            .map(|session| session.key.clone())
            .collect();
        keys.iter().filter_map(|key| self.remove(key).ok()).collect()
    }

    /// Every key, default first, the rest sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.others.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys.insert(0, &self.default.key);
        keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        std::iter::once(&self.default).chain(self.others.values())
    }
}

/// Conversation to active session key. Absence means the default executor.
#[derive(Debug, Default)]
pub struct ActiveSessions {
    entries: HashMap<ChatId, String>,
}

impl ActiveSessions {
    #[must_use]
    pub fn get(&self, chat: ChatId) -> Option<&str> {
        self.entries.get(&chat).map(String::as_str)
    }

    /// Active key of `chat`, resolving absence to `default_key`.
    #[must_use]
    pub fn key_or<'a>(&'a self, chat: ChatId, default_key: &'a str) -> &'a str {
        self.get(chat).unwrap_or(default_key)
    }

    #[must_use]
    pub fn is_active(&self, chat: ChatId, key: &str, default_key: &str) -> bool {
        self.key_or(chat, default_key) == key
    }

    /// Conversations whose active session is `key`. Only explicit entries
    /// count, so this never reports conversations on the default executor.
    #[must_use]
    pub fn chats_with(&self, key: &str) -> Vec<ChatId> {
        let mut chats: Vec<ChatId> = self
            .entries
            .iter()
            .filter(|(_, k)| k.as_str() == key)
            .map(|(chat, _)| *chat)
            .collect();
        chats.sort_unstable();
        chats
    }

    pub fn set(&mut self, chat: ChatId, key: String) {
        self.entries.insert(chat, key);
    }

    /// Revert `chat` to the default executor.
    pub fn reset(&mut self, chat: ChatId) -> Option<String> {
        self.entries.remove(&chat)
    }

    /// Revert every conversation whose active key matches, returning them.
    pub fn reset_where(&mut self, mut matches: impl FnMut(&str) -> bool) -> Vec<ChatId> {
        let chats: Vec<ChatId> = self
            .entries
            .iter()
            .filter(|(_, key)| matches(key))
            .map(|(chat, _)| *chat)
            .collect();
        for chat in &chats {
            self.entries.remove(chat);
        }
        chats
    }

    /// Clear every entry, returning the conversations that had one.
    pub fn clear(&mut self) -> Vec<ChatId> {
        self.entries.drain().map(|(chat, _)| chat).collect()
    }
}
