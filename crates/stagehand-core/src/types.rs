//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the orchestrator:
//! - Key and value bounds (`Key`, `Value`)
//! - Stage identity (`StageId`)
//! - Per-stage observable state (`Status`, `StageState`)
//! - Error types (`FetchError`, `ChainError`)
//!
//! ## State Guarantees
//!
//! - `version` only ever increases for a given stage
//! - `status == Ready` implies `value` belongs to the current `key`
//! - `value` and `error` may be present at the same time (stale-but-displayable)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// KEY & VALUE BOUNDS
// =============================================================================

/// Identifier parameterizing a stage's fetch (teacher id, class id, ...).
///
/// Blanket-implemented for every type that is comparable, hashable and
/// shareable across tasks.
pub trait Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Result type produced by a stage's fetch.
pub trait Value: Send + Sync + 'static {}

impl<T> Value for T where T: Send + Sync + 'static {}

// =============================================================================
// STAGE IDENTITY
// =============================================================================

/// Name of a stage kind ("classes", "students", ...).
///
/// Stage ids double as cache namespaces: two chains that declare a stage with
/// the same id share cache entries and in-flight fetches through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StageId(&'static str);

impl StageId {
    /// Create a stage id from a static name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Get the stage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.0)
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Lifecycle status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No key, nothing to fetch.
    Idle,
    /// A fetch is pending, or the stage waits for its upstream to settle.
    Loading,
    /// `value` holds the result for the current key.
    Ready,
    /// The last fetch for the current key failed.
    Failed,
}

impl Status {
    /// Check if no fetch is pending (Idle, Ready or Failed).
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Status::Ready | Status::Failed | Status::Idle)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Idle => "idle",
            Status::Loading => "loading",
            Status::Ready => "ready",
            Status::Failed => "failed",
        };
        f.pad(name)
    }
}

// =============================================================================
// STAGE STATE
// =============================================================================

/// Observable state of one stage, published on every transition.
#[derive(Debug, Serialize)]
#[serde(bound(serialize = "K: Serialize, T: Serialize"))]
pub struct StageState<K, T> {
    /// Current key, `None` when nothing is selected.
    pub key: Option<K>,
    /// Lifecycle status.
    pub status: Status,
    /// Last good value. While `Loading` or `Failed` this is stale display data.
    pub value: Option<Arc<T>>,
    /// Error of the last fetch for the current key.
    pub error: Option<FetchError>,
    /// Monotonic counter bumped on every key change or supersession.
    pub version: u64,
}

impl<K, T> StageState<K, T> {
    /// The initial state of every stage.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            key: None,
            status: Status::Idle,
            value: None,
            error: None,
            version: 0,
        }
    }

    /// Check if the stage holds a value for its current key.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == Status::Ready
    }

    /// Check if a value is shown that does not belong to a settled fetch of
    /// the current key (pending re-fetch or failed refresh).
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.value.is_some() && matches!(self.status, Status::Loading | Status::Failed)
    }
}

impl<K, T> Default for StageState<K, T> {
    fn default() -> Self {
        Self::idle()
    }
}

// Manual impl: `T` lives behind an `Arc` and need not be `Clone`.
impl<K: Clone, T> Clone for StageState<K, T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            status: self.status,
            value: self.value.clone(),
            error: self.error.clone(),
            version: self.version,
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Failure reported by a fetcher.
///
/// The orchestrator never interprets these; it only attaches them to the
/// `Failed` state of the stage whose fetch produced them.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FetchError {
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The collaborator could not be reached or timed out.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The caller is not allowed to read the entity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Anything else, including a fetch task that ended without a result.
    #[error("unknown failure: {0}")]
    Unknown(String),
}

/// Errors raised by misuse of the orchestrator itself.
///
/// - The orchestrator has no fatal states; these only reject a call
/// - Fetch failures are never reported here, see [`FetchError`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The chain was disposed; its stages accept no further calls.
    #[error("chain is disposed")]
    Disposed,

    /// Keys of derived stages come from their upstream projection.
    #[error("stage '{0}' derives its key from upstream; set the root key or pin a selection")]
    DerivedKey(StageId),

    /// A second root was requested for the same chain.
    #[error("chain already has a root stage")]
    RootExists,

    /// Stages can only be appended after the current tail of the same chain.
    #[error("stage '{0}' is not the tail of this chain")]
    NotTail(StageId),

    /// The same stage id was registered with different key or value types.
    #[error("stage '{0}' is registered with different key or value types")]
    TypeMismatch(StageId),

    /// Pinning is only possible on stages fed by an auto-select policy.
    #[error("stage '{0}' has no selectable upstream collection")]
    NotSelectable(StageId),

    /// The pinned key is absent from the upstream collection.
    #[error("key is not present in the upstream collection of stage '{0}'")]
    NotInCollection(StageId),

    /// Chains spawn tasks and must be created inside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
}

// =============================================================================
// TESTS
// =============================================================================
