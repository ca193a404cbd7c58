//! Removal of cached outcomes whose dependencies changed.
//!
//! The [`InvalidationListener`] translates [`InvalidationEvent`]s into the
//! [`DependencyToken`]s they affect, looks up the dependent keys in the
//! [`DependencyIndex`](crate::caching::DependencyIndex), and removes them from the cache.
//!
//! Invalidation is not linearizable with running jobs: a job that read an entity before it
//! changed, and finishes after the event was processed, still caches its stale outcome. Such an
//! outcome stays until the entity changes again, or until it is evicted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::caching::ResultCache;
use crate::types::{DependencyToken, EntityReference, WikiId};

/// A notification that something outcomes may depend on changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// An entity was created, updated or deleted.
    EntityChanged { reference: EntityReference },
    /// A wiki was deleted, along with everything in it.
    WikiDeleted { wiki: WikiId },
    /// A component was registered or unregistered.
    ///
    /// Outcomes depending on the role as a whole are invalidated as well as those depending on
    /// the specific `hint`.
    ComponentChanged {
        role: String,
        #[serde(default)]
        hint: Option<String>,
    },
    /// Everything has to be recomputed.
    Flush,
}

impl InvalidationEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::EntityChanged { .. } => "entity_changed",
            Self::WikiDeleted { .. } => "wiki_deleted",
            Self::ComponentChanged { .. } => "component_changed",
            Self::Flush => "flush",
        }
    }
}

/// Removes cached outcomes affected by [`InvalidationEvent`]s.
#[derive(Debug, Clone)]
pub struct InvalidationListener {
    cache: Arc<ResultCache>,
}

impl InvalidationListener {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }

    /// Processes events from `events` until all senders are dropped.
    pub async fn listen(self, mut events: mpsc::Receiver<InvalidationEvent>) {
        tracing::debug!("Listening for invalidation events");
        while let Some(event) = events.recv().await {
            self.on_event(&event);
        }
        tracing::debug!("Invalidation event source closed");
    }

    /// Invalidates everything affected by `event`, returning the number of removed outcomes.
    pub fn on_event(&self, event: &InvalidationEvent) -> usize {
        metric!(counter("invalidation.events") += 1, "kind" => event.kind());

        let removed = match event {
            InvalidationEvent::EntityChanged { reference } => {
                self.invalidate(&DependencyToken::Entity(reference.clone()))
            }
            InvalidationEvent::WikiDeleted { wiki } => self.invalidate_wiki(wiki),
            InvalidationEvent::ComponentChanged { role, hint } => {
                let mut removed = self.invalidate(&DependencyToken::component(role.as_str(), None));
                if let Some(hint) = hint {
                    removed += self.invalidate(&DependencyToken::component(
                        role.as_str(),
                        Some(hint.as_str()),
                    ));
                }
                removed
            }
            InvalidationEvent::Flush => self.flush(),
        };

        tracing::debug!(kind = event.kind(), removed, "Processed invalidation event");
        removed
    }

    /// Removes every outcome depending on `token`.
    pub fn invalidate(&self, token: &DependencyToken) -> usize {
        let mut removed = 0;
        for key in self.cache.dependencies().keys_for(token) {
            match self.cache.remove(&key) {
                Ok(Some(_)) => removed += 1,
                // evicted in the meantime
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        %key,
                        %token,
                        "Failed to invalidate outcome"
                    );
                }
            }
        }

        metric!(counter("invalidation.removed") += removed as i64);
        removed
    }

    /// Removes every outcome depending on anything in `wiki`.
    pub fn invalidate_wiki(&self, wiki: &WikiId) -> usize {
        self.cache
            .dependencies()
            .tokens_matching(|token| token.wiki() == Some(wiki))
            .iter()
            .map(|token| self.invalidate(token))
            .sum()
    }

    fn flush(&self) -> usize {
        if !self.cache.is_enabled() {
            return 0;
        }
        let removed = self.cache.len();
        match self.cache.remove_all() {
            Ok(()) => removed,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to flush result cache"
                );
                0
            }
        }
    }
}
