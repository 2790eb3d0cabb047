//! Executor constructors by type name.

use std::{collections::BTreeMap, fmt, sync::Arc};

use chatterm_core::{ConfigStore, Executor, ExecutorConfig, ExecutorError};

use crate::{shell, ssh};

/// Builds an executor from its configuration plus options given on switch.
pub type Constructor = Arc<
    dyn Fn(Arc<ConfigStore>, &ExecutorConfig, &str) -> Result<Arc<dyn Executor>, ExecutorError>
        + Send
        + Sync,
>;

/// A registered executor type.
#[derive(Clone)]
pub struct RegInfo {
    pub name: String,
    pub usage: String,
    pub constructor: Constructor,
}

impl fmt::Debug for RegInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegInfo")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Executor types known to the process, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    types: BTreeMap<String, RegInfo>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `shell` and `ssh` types.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("shell", shell::USAGE, shell::ShellExecutor::create);
        registry.register("ssh", ssh::USAGE, ssh::SshExecutor::create);
        registry
    }

    /// Register (or replace) an executor type.
    pub fn register<F>(&mut self, name: &str, usage: &str, constructor: F)
    where
        F: Fn(Arc<ConfigStore>, &ExecutorConfig, &str) -> Result<Arc<dyn Executor>, ExecutorError>
            + Send
            + Sync
            + 'static,
    {
        tracing::debug!(kind = name, "Registered executor type");
        self.types.insert(
            name.to_string(),
            RegInfo {
                name: name.to_string(),
                usage: usage.to_string(),
                constructor: Arc::new(constructor),
            },
        );
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegInfo> {
        self.types.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Construct an executor of the configured type.
    ///
    /// # Errors
    /// Returns error if the type is unknown or the constructor rejects the
    /// config.
    pub fn create(
        &self,
        store: Arc<ConfigStore>,
        config: &ExecutorConfig,
        extra: &str,
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        let info = self
            .get(&config.kind)
            .ok_or_else(|| ExecutorError::UnknownType(config.kind.clone()))?;
        (info.constructor)(store, config, extra)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegInfo> {
        self.types.values()
    }
}
