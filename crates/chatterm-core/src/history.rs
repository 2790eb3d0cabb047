//! Bounded, recency-ordered command history.

use crate::constants::{MAX_HISTORY, ROW_BUTTONS};

/// Command history, most recent last, without duplicates.
#[derive(Debug, Clone)]
pub struct History {
    entries: Vec<String>,
    cap: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(MAX_HISTORY)
    }
}

impl History {
    /// Create an empty history holding at most `cap` entries.
    #[must_use]
    pub const fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            cap,
        }
    }

    /// Record a command line.
    ///
    /// An existing identical entry is moved to the most recent position.
    /// The oldest entries are dropped past the cap.
    pub fn push(&mut self, cmdline: impl Into<String>) {
        let cmdline = cmdline.into();
        self.entries.retain(|entry| *entry != cmdline);
        self.entries.push(cmdline);
        if self.cap > 0 && self.entries.len() > self.cap {
            let excess = self.entries.len() - self.cap;
            self.entries.drain(..excess);
        }
    }

    /// Entries, most recent last.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The most recent entries that fit in one button row, skipping those
    /// already shown as fixed buttons.
    #[must_use]
    pub fn recent_buttons(&self, exclude: &[&str]) -> Vec<String> {
        let filtered: Vec<&String> = self
            .entries
            .iter()
            .filter(|entry| !exclude.contains(&entry.as_str()))
            .collect();
        let start = filtered.len().saturating_sub(ROW_BUTTONS);
        filtered[start..].iter().map(|s| (*s).clone()).collect()
    }
}
