//! # Cache & Dedup Registry
//!
//! The single source of truth for "is this key's data already being fetched"
//! and "what was the last good value for this key".
//!
//! ## Structure
//!
//! - One typed [`StageTable`] per [`StageId`], created on first use
//! - Each table serializes itself with its own mutex, so `begin_fetch` and
//!   `complete` are atomic with respect to concurrent callers across chains
//! - Entries never expire; `invalidate` is the only way to drop one
//!
//! ## Waiters
//!
//! Every caller of `begin_fetch` (the one that issues the fetch and every
//! caller that attaches to it) receives an [`Attachment`]. `complete`
//! delivers the outcome to all attachments exactly once, in attachment order.

use crate::types::{ChainError, FetchError, Key, StageId, Value};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;

/// Outcome delivered to waiters. Values are shared, never copied.
pub type Outcome<T> = Result<Arc<T>, FetchError>;

// =============================================================================
// CACHE ENTRY
// =============================================================================

/// Last successful result for one key of one stage.
#[derive(Debug)]
pub struct CacheEntry<K, T> {
    /// The key this value was fetched for.
    pub key: K,
    /// The fetched value.
    pub value: Arc<T>,
    /// When the fetch completed.
    pub fetched_at: Instant,
}

impl<K: Clone, T> Clone for CacheEntry<K, T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
        }
    }
}

// =============================================================================
// ATTACHMENT
// =============================================================================

/// A claim on the outcome of an in-flight fetch.
#[derive(Debug)]
pub struct Attachment<T> {
    already_in_flight: bool,
    receiver: oneshot::Receiver<Outcome<T>>,
}

impl<T> Attachment<T> {
    /// `true` if another caller already issued the fetch. The holder must not
    /// call the fetcher again and only waits for the shared outcome.
    #[must_use]
    pub fn already_in_flight(&self) -> bool {
        self.already_in_flight
    }

    /// Wait for the outcome of the fetch.
    ///
    /// A fetch that is dropped without completing (panic, runtime shutdown)
    /// resolves to `FetchError::Unknown`.
    pub async fn wait(self) -> Outcome<T> {
        self.receiver.await.unwrap_or_else(|_| {
            Err(FetchError::Unknown(
                "fetch ended without delivering a result".to_string(),
            ))
        })
    }
}

// =============================================================================
// STAGE TABLE
// =============================================================================

/// Cache entries and in-flight markers for one stage id.
pub struct StageTable<K, T> {
    stage: StageId,
    inner: Mutex<TableInner<K, T>>,
}

struct TableInner<K, T> {
    entries: HashMap<K, CacheEntry<K, T>>,
    in_flight: HashMap<K, Vec<oneshot::Sender<Outcome<T>>>>,
    fetches: u64,
}

impl<K: Key, T: Value> StageTable<K, T> {
    fn new(stage: StageId) -> Self {
        Self {
            stage,
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                fetches: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner<K, T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the cached entry for `key`.
    pub fn get(&self, key: &K) -> Option<CacheEntry<K, T>> {
        self.lock().entries.get(key).cloned()
    }

    /// Register interest in a fetch of `key`.
    pub fn begin_fetch(&self, key: &K) -> Attachment<T> {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.lock();
        let already_in_flight = match inner.in_flight.get_mut(key) {
            Some(waiters) => {
                waiters.push(sender);
                true
            }
            None => {
                inner.in_flight.insert(key.clone(), vec![sender]);
                inner.fetches = inner.fetches.saturating_add(1);
                false
            }
        };
        drop(inner);

        if already_in_flight {
            tracing::debug!(stage = %self.stage, ?key, "attached to in-flight fetch");
        }
        Attachment {
            already_in_flight,
            receiver,
        }
    }

    /// Store a successful outcome, release the in-flight marker and deliver
    /// the outcome to every waiter. Returns the number of waiters notified.
    pub fn complete(&self, key: &K, outcome: Outcome<T>) -> usize {
        let waiters = {
            let mut inner = self.lock();
            if let Ok(value) = &outcome {
                inner.entries.insert(
                    key.clone(),
                    CacheEntry {
                        key: key.clone(),
                        value: Arc::clone(value),
                        fetched_at: Instant::now(),
                    },
                );
            }
            inner.in_flight.remove(key).unwrap_or_default()
        };

        let delivered = waiters.len();
        for waiter in waiters {
            // A dropped receiver only means that waiter lost interest.
            let _ = waiter.send(outcome.clone());
        }
        tracing::trace!(stage = %self.stage, ?key, delivered, ok = outcome.is_ok(), "fetch completed");
        delivered
    }

    /// Drop the cached entry for `key`. In-flight fetches are unaffected.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.lock().entries.remove(key).is_some();
        tracing::debug!(stage = %self.stage, ?key, removed, "cache entry invalidated");
        removed
    }

    /// Check if a fetch for `key` is pending.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().in_flight.contains_key(key)
    }
}

// =============================================================================
// IN-FLIGHT GUARD
// =============================================================================

/// Completes a fetch exactly once, even if the fetching task never returns
/// normally.
pub(crate) struct InFlight<K: Key, T: Value> {
    table: Arc<StageTable<K, T>>,
    key: Option<K>,
}

impl<K: Key, T: Value> InFlight<K, T> {
    pub(crate) fn new(table: Arc<StageTable<K, T>>, key: K) -> Self {
        Self {
            table,
            key: Some(key),
        }
    }

    pub(crate) fn finish(mut self, result: Result<T, FetchError>) {
        if let Some(key) = self.key.take() {
            self.table.complete(&key, result.map(Arc::new));
        }
    }
}

impl<K: Key, T: Value> Drop for InFlight<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            tracing::warn!(stage = %self.table.stage, ?key, "fetch task ended without a result");
            self.table.complete(
                &key,
                Err(FetchError::Unknown("fetch task aborted".to_string())),
            );
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Per-stage counters reported by [`Registry::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Stage id of the table.
    pub stage: StageId,
    /// Number of cached entries.
    pub cached: usize,
    /// Number of keys with a pending fetch.
    pub in_flight: usize,
    /// Fetches issued over the table's lifetime (attachments excluded).
    pub fetches: u64,
}

trait ErasedTable: Send + Sync {
    fn stats(&self) -> TableStats;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K: Key, T: Value> ErasedTable for StageTable<K, T> {
    fn stats(&self) -> TableStats {
        let inner = self.lock();
        TableStats {
            stage: self.stage,
            cached: inner.entries.len(),
            in_flight: inner.in_flight.len(),
            fetches: inner.fetches,
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Shared cache and dedup registry.
///
/// Share one registry (`Arc<Registry>`) between every chain that should
/// deduplicate loads, typically one per application.
#[derive(Default)]
pub struct Registry {
    tables: Mutex<BTreeMap<StageId, Arc<dyn ErasedTable>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("stages", &self.stats().len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the typed table for `stage`.
    ///
    /// Fails with `ChainError::TypeMismatch` if the stage id was first used
    /// with different key or value types.
    pub fn table<K: Key, T: Value>(&self, stage: StageId) -> Result<Arc<StageTable<K, T>>, ChainError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let erased = tables
            .entry(stage)
            .or_insert_with(|| Arc::new(StageTable::<K, T>::new(stage)) as Arc<dyn ErasedTable>);
        Arc::clone(erased)
            .into_any()
            .downcast::<StageTable<K, T>>()
            .map_err(|_| ChainError::TypeMismatch(stage))
    }

    /// Get the cached entry for (`stage`, `key`).
    pub fn get<K: Key, T: Value>(
        &self,
        stage: StageId,
        key: &K,
    ) -> Result<Option<CacheEntry<K, T>>, ChainError> {
        Ok(self.table::<K, T>(stage)?.get(key))
    }

    /// Register interest in a fetch of (`stage`, `key`).
    ///
    /// If the returned attachment reports `already_in_flight`, the caller must
    /// not fetch; otherwise it must fetch and call [`Registry::complete`].
    pub fn begin_fetch<K: Key, T: Value>(
        &self,
        stage: StageId,
        key: &K,
    ) -> Result<Attachment<T>, ChainError> {
        Ok(self.table::<K, T>(stage)?.begin_fetch(key))
    }

    /// Complete a fetch of (`stage`, `key`). Returns the number of waiters
    /// that received the outcome.
    pub fn complete<K: Key, T: Value>(
        &self,
        stage: StageId,
        key: &K,
        result: Result<T, FetchError>,
    ) -> Result<usize, ChainError> {
        Ok(self.table::<K, T>(stage)?.complete(key, result.map(Arc::new)))
    }

    /// Drop the cached entry for (`stage`, `key`), e.g. after a write that
    /// changed the underlying data. Returns whether an entry was removed.
    pub fn invalidate<K: Key, T: Value>(&self, stage: StageId, key: &K) -> Result<bool, ChainError> {
        Ok(self.table::<K, T>(stage)?.invalidate(key))
    }

    /// Counters for every stage table, ordered by stage id.
    pub fn stats(&self) -> Vec<TableStats> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.values().map(|table| table.stats()).collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSES: StageId = StageId::new("classes");

    #[tokio::test]
    async fn second_begin_attaches() {
        let registry = Registry::new();
        let first = registry.begin_fetch::<u64, String>(CLASSES, &10).expect("begin");
        let second = registry.begin_fetch::<u64, String>(CLASSES, &10).expect("begin");
        assert!(!first.already_in_flight());
        assert!(second.already_in_flight());

        let delivered = registry
            .complete::<u64, String>(CLASSES, &10, Ok("A".to_string()))
            .expect("complete");
        assert_eq!(delivered, 2);
        assert_eq!(first.wait().await.expect("ok").as_str(), "A");
        assert_eq!(second.wait().await.expect("ok").as_str(), "A");
    }

    #[tokio::test]
    async fn distinct_keys_do_not_dedup() {
        let registry = Registry::new();
        let a = registry.begin_fetch::<u64, String>(CLASSES, &10).expect("begin");
        let b = registry.begin_fetch::<u64, String>(CLASSES, &11).expect("begin");
        assert!(!a.already_in_flight());
        assert!(!b.already_in_flight());
    }

    #[tokio::test]
    async fn complete_releases_in_flight_marker() {
        let registry = Registry::new();
        let table = registry.table::<u64, String>(CLASSES).expect("table");
        let _a = table.begin_fetch(&10);
        assert!(table.is_in_flight(&10));
        table.complete(&10, Ok(Arc::new("A".to_string())));
        assert!(!table.is_in_flight(&10));

        let again = table.begin_fetch(&10);
        assert!(!again.already_in_flight());
    }

    #[tokio::test]
    async fn waiters_receive_in_attachment_order() {
        let registry = Registry::new();
        let table = registry.table::<u64, u64>(CLASSES).expect("table");
        let attachments: Vec<_> = (0..4).map(|_| table.begin_fetch(&1)).collect();
        table.complete(&1, Ok(Arc::new(99)));
        for attachment in attachments {
            assert_eq!(*attachment.wait().await.expect("ok"), 99);
        }
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let registry = Registry::new();
        let attachment = registry.begin_fetch::<u64, String>(CLASSES, &10).expect("begin");
        registry
            .complete::<u64, String>(
                CLASSES,
                &10,
                Err(FetchError::NetworkFailure("offline".into())),
            )
            .expect("complete");

        assert_eq!(
            attachment.wait().await,
            Err(FetchError::NetworkFailure("offline".into()))
        );
        let cached = registry.get::<u64, String>(CLASSES, &10).expect("get");
        assert!(cached.is_none());
    }

    #[test]
    fn invalidate_drops_entry() {
        let registry = Registry::new();
        let _attachment = registry.begin_fetch::<u64, String>(CLASSES, &10).expect("begin");
        registry
            .complete::<u64, String>(CLASSES, &10, Ok("A".to_string()))
            .expect("complete");
        assert!(registry.get::<u64, String>(CLASSES, &10).expect("get").is_some());

        assert!(registry.invalidate::<u64, String>(CLASSES, &10).expect("invalidate"));
        assert!(!registry.invalidate::<u64, String>(CLASSES, &10).expect("invalidate"));
        assert!(registry.get::<u64, String>(CLASSES, &10).expect("get").is_none());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let registry = Registry::new();
        registry.table::<u64, String>(CLASSES).expect("table");
        let err = registry.table::<String, String>(CLASSES).err();
        assert_eq!(err, Some(ChainError::TypeMismatch(CLASSES)));
    }

    #[tokio::test]
    async fn dropped_guard_fails_waiters() {
        let registry = Registry::new();
        let table = registry.table::<u64, String>(CLASSES).expect("table");
        let attachment = table.begin_fetch(&10);
        drop(InFlight::new(Arc::clone(&table), 10));

        assert!(matches!(attachment.wait().await, Err(FetchError::Unknown(_))));
        assert!(!table.is_in_flight(&10));
    }

    #[test]
    fn stats_count_fetches_not_attachments() {
        let registry = Registry::new();
        let table = registry.table::<u64, String>(CLASSES).expect("table");
        let _a = table.begin_fetch(&10);
        let _b = table.begin_fetch(&10);
        let _c = table.begin_fetch(&11);

        let stats = registry.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].in_flight, 2);
        assert_eq!(stats[0].fetches, 2);
        assert_eq!(stats[0].cached, 0);
    }
}
