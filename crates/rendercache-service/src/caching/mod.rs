//! # Result caching infrastructure
//!
//! Rendering is expensive, so rendered outcomes are kept in memory and reused as long as
//! nothing they were computed from has changed.
//!
//! ## [`CacheKey`]
//!
//! Outcomes are stored under a [`CacheKey`], which is derived from the identity of the rendering
//! job: the identity tokens of the renderer followed by the captured context the renderer ran
//! in. Tokens are length-prefixed when they are joined, see [`encode_tokens`], so that no two
//! distinct identities ever share a key, whatever characters the tokens contain.
//!
//! **NOTE**: The encoding has to stay stable, as it is also the key external tooling uses to
//! refer to cached outcomes.
//!
//! ## [`ResultCache`]
//!
//! The [`ResultCache`] is a bounded LRU cache. Inserting into a full cache evicts the least
//! recently *accessed* outcome within the same call. A capacity of `0` disables the cache
//! entirely; all its operations then fail with [`CacheError::Unavailable`], which callers log
//! and otherwise treat as a miss.
//!
//! ## [`DependencyIndex`]
//!
//! Every outcome carries the set of [`DependencyToken`](crate::types::DependencyToken)s it was
//! computed from. The cache maintains a reverse index from each token to the keys depending on
//! it, so that invalidating a token only touches the affected outcomes instead of scanning the
//! whole cache. The index is updated together with the cache:
//!
//! - Inserting an outcome registers its key under each of its tokens.
//! - Replacing an outcome diffs the previous and the new token sets and only updates the
//!   difference.
//! - Removing an outcome, be it explicitly, by invalidation, or by LRU eviction, unregisters its
//!   key. Tokens without dependents are dropped.
//!
//! ### Metrics
//!
//! - `caches.access`: All lookups of an enabled cache.
//! - `caches.memory.hit` / `caches.memory.miss`: Lookups served / not served by the cache.
//! - `caches.put`: Outcomes inserted.
//! - `caches.evicted`: Outcomes evicted by the cache itself, tagged by `cause`.
//! - `caches.unavailable`: Operations on a disabled cache, tagged by `operation`.

mod cache_error;
mod cache_key;
mod dependencies;
mod memory;

pub use cache_error::CacheError;
pub use cache_key::{CacheKey, CacheKeyBuilder, decode_tokens, encode_tokens};
pub use dependencies::DependencyIndex;
pub use memory::ResultCache;
