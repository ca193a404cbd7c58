use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;

use crate::render::Outcome;

use super::{CacheError, CacheKey, DependencyIndex};

type InMemoryCache = moka::sync::Cache<CacheKey, Arc<Outcome>>;

/// A bounded, in-memory cache of rendered [`Outcome`]s.
///
/// Once the configured capacity is reached, the least recently accessed outcome is evicted as
/// part of the insertion that overflowed the cache.
///
/// The cache is the single writer of its [`DependencyIndex`]: every insertion registers the key
/// under the dependencies of the new outcome, and every removal, whatever its cause, unregisters
/// it again. The index can be inspected through [`ResultCache::dependencies`].
pub struct ResultCache {
    /// The actual cache, or `None` if the cache is disabled.
    inner: Option<Inner>,
    index: DependencyIndex,
    capacity: u64,
}

struct Inner {
    cache: InMemoryCache,
    /// The outcome whose dependencies are registered in the index, per key.
    ///
    /// Holding the entry of a key is what serializes all index updates for that key.
    registered: DashMap<CacheKey, Arc<Outcome>>,
    /// Keys evicted by the cache itself, waiting to be unregistered.
    evicted: Arc<Mutex<Vec<Arc<CacheKey>>>>,
    /// Taken for reading by every mutation, and for writing by [`ResultCache::remove_all`].
    gate: RwLock<()>,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("capacity", &self.capacity)
            .field("enabled", &self.inner.is_some())
            .field("dependency tokens", &self.index.len())
            .finish()
    }
}

fn removal_cause_tag(cause: RemovalCause) -> &'static str {
    match cause {
        RemovalCause::Expired => "expired",
        RemovalCause::Explicit => "explicit",
        RemovalCause::Replaced => "replaced",
        RemovalCause::Size => "size",
    }
}

impl ResultCache {
    /// Creates a new cache holding at most `capacity` outcomes.
    ///
    /// A `capacity` of `0` creates a disabled cache, which never holds any outcome.
    pub fn new(capacity: u64) -> Self {
        let index = DependencyIndex::new();

        let inner = (capacity > 0).then(|| {
            let evicted = Arc::new(Mutex::new(Vec::new()));
            let listener_evicted = Arc::clone(&evicted);
            let cache = InMemoryCache::builder()
                .name("results")
                .max_capacity(capacity)
                .eviction_policy(EvictionPolicy::lru())
                .eviction_listener(move |key: Arc<CacheKey>, _outcome, cause| {
                    // `put` and `remove` update the index themselves
                    if matches!(cause, RemovalCause::Replaced | RemovalCause::Explicit) {
                        return;
                    }
                    metric!(counter("caches.evicted") += 1, "cause" => removal_cause_tag(cause));
                    tracing::trace!(%key, cause = removal_cause_tag(cause), "Evicted outcome");
                    // The listener may run while a key is locked, so unregistering is deferred.
                    listener_evicted
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(key);
                })
                .build();

            Inner {
                cache,
                registered: DashMap::new(),
                evicted,
                gate: RwLock::new(()),
            }
        });

        Self {
            inner,
            index,
            capacity,
        }
    }

    /// The maximum number of outcomes held by this cache.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether this cache can hold any outcomes at all.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// The reverse index of dependencies of the cached outcomes.
    pub fn dependencies(&self) -> &DependencyIndex {
        &self.index
    }

    /// Looks up the outcome stored under `key` and marks it as recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Outcome>> {
        let inner = self.inner.as_ref()?;
        metric!(counter("caches.access") += 1);

        let outcome = inner.cache.get(key);
        if outcome.is_some() {
            metric!(counter("caches.memory.hit") += 1);
            tracing::trace!(%key, "Result cache hit");
        } else {
            metric!(counter("caches.memory.miss") += 1);
        }

        // lookups may run pending evictions as well
        self.unregister_evicted(inner);
        outcome
    }

    /// Whether an outcome is stored under `key`, without marking it as used.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.cache.contains_key(key))
    }

    /// The number of outcomes currently stored.
    pub fn len(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.cache.iter().count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `outcome` under `key`, replacing any previous outcome.
    ///
    /// When replacing, only the dependencies that differ between the previous and the new outcome
    /// are updated in the index. If the insertion exceeds the capacity, the least recently used
    /// outcome is evicted before this returns.
    pub fn put(&self, key: CacheKey, outcome: Arc<Outcome>) -> Result<(), CacheError> {
        let inner = self.inner.as_ref().ok_or(CacheError::Unavailable)?;
        {
            let _gate = inner.gate.read().unwrap_or_else(PoisonError::into_inner);

            // The index is updated first, so an invalidation racing with this insertion finds
            // the key and waits for the entry to remove the new outcome.
            match inner.registered.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let previous = entry.insert(Arc::clone(&outcome));
                    self.index.on_removed(
                        &key,
                        previous.dependencies.difference(&outcome.dependencies),
                    );
                    self.index.on_inserted(
                        &key,
                        outcome.dependencies.difference(&previous.dependencies),
                    );
                    inner.cache.insert(key, outcome);
                }
                Entry::Vacant(entry) => {
                    self.index.on_inserted(&key, &outcome.dependencies);
                    let _registered = entry.insert(Arc::clone(&outcome));
                    inner.cache.insert(key, outcome);
                }
            }
        }

        // evict right away instead of on a later access
        self.run_pending_tasks();

        metric!(counter("caches.put") += 1);
        Ok(())
    }

    /// Removes the outcome stored under `key`, returning it.
    pub fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Outcome>>, CacheError> {
        let inner = self.inner.as_ref().ok_or(CacheError::Unavailable)?;
        let _gate = inner.gate.read().unwrap_or_else(PoisonError::into_inner);

        // Every cached key is registered, so there is nothing to remove without an entry.
        let Entry::Occupied(entry) = inner.registered.entry(key.clone()) else {
            return Ok(None);
        };
        let removed = inner.cache.remove(key);
        let (_, registered) = entry.remove_entry();
        self.index.on_removed(key, &registered.dependencies);

        if removed.is_some() {
            tracing::trace!(%key, "Removed outcome");
        }
        Ok(removed)
    }

    /// Applies pending evictions, and unregisters the evicted keys.
    pub(super) fn run_pending_tasks(&self) {
        if let Some(inner) = &self.inner {
            inner.cache.run_pending_tasks();
            self.unregister_evicted(inner);
        }
    }

    /// Unregisters the keys the cache evicted on its own.
    fn unregister_evicted(&self, inner: &Inner) {
        let evicted = {
            let mut evicted = inner.evicted.lock().unwrap_or_else(PoisonError::into_inner);
            if evicted.is_empty() {
                return;
            }
            std::mem::take(&mut *evicted)
        };

        let _gate = inner.gate.read().unwrap_or_else(PoisonError::into_inner);
        for key in evicted {
            let Entry::Occupied(entry) = inner.registered.entry(CacheKey::clone(&key)) else {
                continue;
            };
            // a new outcome was put after the eviction, and is registered already
            if inner.cache.contains_key(key.as_ref()) {
                continue;
            }
            let (_, registered) = entry.remove_entry();
            self.index.on_removed(&key, &registered.dependencies);
        }
    }

    /// Removes all outcomes and clears the dependency index.
    ///
    /// Concurrent insertions and removals wait until this has finished.
    pub fn remove_all(&self) -> Result<(), CacheError> {
        let inner = self.inner.as_ref().ok_or(CacheError::Unavailable)?;
        let _gate = inner.gate.write().unwrap_or_else(PoisonError::into_inner);

        let keys: Vec<_> = inner.cache.iter().map(|(key, _)| key).collect();
        for key in &keys {
            inner.cache.invalidate(key.as_ref());
        }
        inner.cache.run_pending_tasks();
        inner.registered.clear();
        self.index.clear();
        inner
            .evicted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        tracing::debug!(removed = keys.len(), "Flushed result cache");
        Ok(())
    }
}
