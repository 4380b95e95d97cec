//! # Fetcher
//!
//! The seam between the orchestrator and the collaborator that actually
//! loads data (HTTP client, database, fixture).
//!
//! A fetcher must be idempotent for a given key: the orchestrator may call it
//! once per distinct key/version, and results for superseded versions are
//! discarded, never applied.

use crate::types::FetchError;
use async_trait::async_trait;
use std::future::Future;

/// Asynchronous loader for one stage.
///
/// Any `Fn(K) -> impl Future<Output = Result<T, FetchError>>` closure is a
/// fetcher, so most callers never implement this trait by hand.
#[async_trait]
pub trait Fetcher<K, T>: Send + Sync
where
    K: Send + 'static,
    T: Send + 'static,
{
    /// Load the value for `key`.
    async fn fetch(&self, key: K) -> Result<T, FetchError>;
}

#[async_trait]
impl<K, T, F, Fut> Fetcher<K, T> for F
where
    K: Send + 'static,
    T: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    async fn fetch(&self, key: K) -> Result<T, FetchError> {
        (self)(key).await
    }
}

// =============================================================================
// TESTS
// =============================================================================
