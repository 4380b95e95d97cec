//! # Stagehand Core
//!
//! Keyed, chained asynchronous loads for screens that show related data.
//!
//! A screen declares a [`Chain`] of [`Stage`]s: the root is keyed explicitly
//! (a teacher id), every later stage derives its key from its upstream's value
//! (the selected class, the ids of that class's students). Changing a key
//! reloads exactly the stages that depend on it, in order, and results that
//! arrive for superseded keys are discarded.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  set_key   ┌────────┐ project ┌────────┐ project ┌────────┐
//! │  caller  │ ─────────▶ │ stage0 │ ──────▶ │ stage1 │ ──────▶ │ stage2 │
//! └──────────┘            └───┬────┘         └───┬────┘         └───┬────┘
//!                             │ begin_fetch/complete                │
//!                             ▼                                     ▼
//!                   ┌───────────────────────────────────────────────────┐
//!                   │ Registry: cache + in-flight dedup (shared)        │
//!                   └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`]: keys, states, errors
//! - [`fetcher`]: the collaborator seam
//! - [`registry`]: shared cache and in-flight dedup
//! - [`select`]: default-selection policy with sticky pins
//! - [`bus`]: replay-latest publication per stage
//! - [`stage`]: the per-stage state machine
//! - [`chain`]: composition and per-chain sequencing
//!
//! ## Guarantees
//!
//! - Last key wins: a completion only applies if its version is current
//! - One fetch per (stage id, key) at a time across every chain sharing a
//!   registry
//! - Failures keep the last good value; downstream stages keep working from it
//! - No fatal states: every failure is a `Failed` stage, recoverable by a new
//!   key or a refresh

pub mod bus;
pub mod chain;
pub mod fetcher;
pub mod registry;
pub mod select;
pub mod stage;
pub mod types;

pub use bus::{ChainEvent, DEFAULT_BUS_CAPACITY, EventStream, Subscription};
pub use chain::{Chain, ChainOptions, StageSummary};
pub use fetcher::Fetcher;
pub use registry::{Attachment, CacheEntry, Outcome, Registry, StageTable, TableStats};
pub use select::{AutoSelect, Resolved};
pub use stage::{Stage, StageOptions, StageSpec};
pub use types::{ChainError, FetchError, Key, StageId, StageState, Status, Value};
