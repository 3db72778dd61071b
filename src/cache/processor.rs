//! Entry processors.
//!
//! A processor receives a [`MutableEntry`] for one key and may read, set or
//! remove its value. The processor runs on the calling node while the key is
//! locked; its net change is then replicated like any other write. A write to
//! the same key from another node that lands first makes it run again
//! against the newer value.

/// Net change a processor made to its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryChange {
    Untouched,
    Set(String),
    Removed,
}

#[derive(Debug)]
pub struct MutableEntry {
    key: String,
    existed: bool,
    value: Option<String>,
    /// Presence seen by the first `get`, if there was one
    first_read: Option<bool>,
    change: EntryChange,
}

impl MutableEntry {
    pub(crate) fn new(key: &str, current: Option<String>) -> Self {
        Self {
            key: key.to_string(),
            existed: current.is_some(),
            value: current,
            first_read: None,
            change: EntryChange::Untouched,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the entry currently holds a value. Not counted as a read.
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// Current value. The first call counts as a hit or a miss.
    pub fn get(&mut self) -> Option<String> {
        let present = self.value.is_some();
        self.first_read.get_or_insert(present);
        self.value.clone()
    }

    pub fn set(&mut self, value: impl Into<String>) {
        let value = value.into();
        self.value = Some(value.clone());
        self.change = EntryChange::Set(value);
    }

    pub fn remove(&mut self) {
        self.value = None;
        self.change = EntryChange::Removed;
    }

    pub(crate) fn existed(&self) -> bool {
        self.existed
    }

    /// First read outcome and net change.
    pub(crate) fn into_outcome(self) -> (Option<bool>, EntryChange) {
        (self.first_read, self.change)
    }
}
