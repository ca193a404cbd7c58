use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::types::DependencyToken;

use super::CacheKey;

/// A reverse index from [`DependencyToken`]s to the [`CacheKey`]s of the outcomes depending on
/// them.
///
/// The index is sharded, operations touching the same token are serialized by the shard lock
/// while different tokens are updated in parallel. Keys are never removed from the index
/// directly by consumers, the [`ResultCache`](super::ResultCache) is its only writer.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    dependents: DashMap<DependencyToken, HashSet<CacheKey>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` as a dependent of each of the given tokens.
    pub(super) fn on_inserted<'a, I>(&self, key: &CacheKey, tokens: I)
    where
        I: IntoIterator<Item = &'a DependencyToken>,
    {
        for token in tokens {
            self.dependents
                .entry(token.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    /// Unregisters `key` from each of the given tokens.
    ///
    /// Tokens without any remaining dependents are dropped from the index.
    pub(super) fn on_removed<'a, I>(&self, key: &CacheKey, tokens: I)
    where
        I: IntoIterator<Item = &'a DependencyToken>,
    {
        for token in tokens {
            if let Entry::Occupied(mut entry) = self.dependents.entry(token.clone()) {
                entry.get_mut().remove(key);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
    }

    /// Returns a snapshot of all keys depending on `token`.
    pub fn keys_for(&self, token: &DependencyToken) -> HashSet<CacheKey> {
        self.dependents
            .get(token)
            .map(|keys| keys.clone())
            .unwrap_or_default()
    }

    /// Returns a snapshot of all indexed tokens matching `predicate`.
    pub fn tokens_matching<F>(&self, mut predicate: F) -> Vec<DependencyToken>
    where
        F: FnMut(&DependencyToken) -> bool,
    {
        self.dependents
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Whether `token` has any dependents.
    pub fn contains(&self, token: &DependencyToken) -> bool {
        self.dependents.contains_key(token)
    }

    /// The number of tokens that currently have dependents.
    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }

    pub(super) fn clear(&self) {
        self.dependents.clear();
    }
}
