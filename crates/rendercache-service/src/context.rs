//! Capturing the execution context a renderer runs in.
//!
//! A rendered outcome may depend on more than the renderer itself, e.g. on the current user or
//! the current locale. Renderers declare the names of such context entries, and their values are
//! captured into an immutable [`ContextSnapshot`] before the job is submitted. The snapshot
//! becomes part of the job identity, and is handed to the renderer when it runs.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An immutable snapshot of captured context entries, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSnapshot(BTreeMap<String, String>);

impl ContextSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the captured value of the entry `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Iterates over all entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for ContextSnapshot {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ContextSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// An error capturing the execution context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The requested entry is not known to the context.
    #[error("unknown context entry `{0}`")]
    UnknownEntry(String),
    /// The entry exists, but its value could not be captured.
    #[error("failed to capture context entry `{entry}`: {reason}")]
    Failed { entry: String, reason: String },
}

/// A service capturing named context entries into a [`ContextSnapshot`].
pub trait ContextCapture: Send + Sync {
    /// Captures the current values of all `entries`.
    ///
    /// Capturing fails as a whole if any single entry cannot be captured.
    fn capture(&self, entries: &[&str]) -> Result<ContextSnapshot, CaptureError>;
}

/// A [`ContextCapture`] backed by a map of current values.
///
/// Values can be changed at any time, snapshots taken before are not affected.
#[derive(Debug, Default)]
pub struct ContextStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current value of the entry `name`, returning the previous one.
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into())
    }

    /// Removes the entry `name`, so that capturing it fails.
    pub fn unset(&self, name: &str) -> Option<String> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

impl ContextCapture for ContextStore {
    fn capture(&self, entries: &[&str]) -> Result<ContextSnapshot, CaptureError> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|&entry| match values.get(entry) {
                Some(value) => Ok((entry.to_owned(), value.clone())),
                None => Err(CaptureError::UnknownEntry(entry.to_owned())),
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(ContextSnapshot)
    }
}
