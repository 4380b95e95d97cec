//! # Stage
//!
//! One keyed asynchronous load with its own loading/result/error state.
//!
//! ## Transition Rules
//!
//! | Call | Condition | Effect |
//! |------|-----------|--------|
//! | `set_key(k)` | same key, Ready or fetch live | no-op |
//! | `set_key(k)` | otherwise | version+1, Loading (stale value kept), fetch |
//! | `set_key(None)` | | version+1, Idle, value and error cleared |
//! | completion | version mismatch | discarded |
//! | completion | Ok | Ready, error cleared, downstream re-projected |
//! | completion | Err | Failed, value kept, downstream re-projected from it |
//! | upstream failed | re-projected key was Ready before the reload | Ready again, no fetch |
//!
//! Every transition runs inside a sequencer [`Turn`] of the owning chain and
//! is published on the stage's bus before any downstream stage reacts.

use crate::bus::{Channel, Subscription};
use crate::chain::{StageSummary, Turn, Wiring};
use crate::fetcher::Fetcher;
use crate::registry::{Attachment, CacheEntry, InFlight, Outcome, StageTable};
use crate::select::Resolved;
use crate::types::{ChainError, Key, StageId, StageState, Status, Value};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

// =============================================================================
// STAGE DECLARATION
// =============================================================================

/// Per-stage tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOptions {
    /// Serve cache entries younger than this without fetching.
    ///
    /// `None` (the default) always fetches; a cached entry for the requested
    /// key is then only shown as the stale value while the fetch runs.
    pub max_age: Option<Duration>,
}

impl StageOptions {
    /// Options that serve cache entries younger than `max_age` directly.
    #[must_use]
    pub const fn fresh_for(max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
        }
    }
}

/// Declaration of a stage: its id, fetcher and options.
pub struct StageSpec<K, T> {
    pub(crate) id: StageId,
    pub(crate) fetcher: Arc<dyn Fetcher<K, T>>,
    pub(crate) options: StageOptions,
}

impl<K: Key, T: Value> StageSpec<K, T> {
    /// Declare a stage loading values through `fetcher`.
    pub fn new(id: StageId, fetcher: impl Fetcher<K, T> + 'static) -> Self {
        Self {
            id,
            fetcher: Arc::new(fetcher),
            options: StageOptions::default(),
        }
    }

    /// Replace the stage options.
    #[must_use]
    pub fn with_options(mut self, options: StageOptions) -> Self {
        self.options = options;
        self
    }
}

// =============================================================================
// WIRING BETWEEN STAGES
// =============================================================================

/// Reaction of a downstream stage to its upstream's transitions.
pub(crate) trait Downstream<T>: Send + Sync {
    /// Upstream has a usable value (fresh or stale): re-project the key.
    fn upstream_ready(&self, turn: &mut Turn<'_>, value: &Arc<T>);
    /// Upstream failed but kept `stale`: re-project the key, and keep the
    /// previous result if that key was already Ready here.
    fn upstream_failed(&self, turn: &mut Turn<'_>, stale: &Arc<T>);
    /// Upstream is re-loading: supersede whatever is in flight here.
    fn upstream_reset(&self, turn: &mut Turn<'_>);
    /// Upstream has nothing: no key can be derived.
    fn upstream_cleared(&self, turn: &mut Turn<'_>);
}

/// Read access to a stage's current value, used by links.
pub(crate) trait ValueSource<T>: Send + Sync {
    fn current_value(&self) -> Option<Arc<T>>;
}

/// Explicit selection support for a stage fed by an auto-select link.
pub(crate) trait Selector<K>: Send + Sync {
    /// `None` if the upstream has no collection to check against.
    fn contains(&self, key: &K) -> Option<bool>;
    /// Re-run the selection against the upstream's current collection.
    fn reselect(&self, turn: &mut Turn<'_>);
}

pub(crate) type Resolver<T, K> = Box<dyn Fn(&T, Option<&K>) -> Resolved<K> + Send + Sync>;

/// How an upstream value turns into a downstream key.
pub(crate) enum Projection<T, K> {
    /// Pure projection.
    Map(Box<dyn Fn(&T) -> Option<K> + Send + Sync>),
    /// Auto-select over a collection, honoring the target's pin.
    Select(Resolver<T, K>),
}

/// Edge from an upstream stage (value `T`) to a downstream stage (`K`, `U`).
pub(crate) struct Link<T, K: Key, U: Value> {
    projection: Projection<T, K>,
    upstream: Weak<dyn ValueSource<T>>,
    target: Arc<StageCell<K, U>>,
}

impl<T, K: Key, U: Value> Link<T, K, U> {
    pub(crate) fn new(
        projection: Projection<T, K>,
        upstream: Weak<dyn ValueSource<T>>,
        target: Arc<StageCell<K, U>>,
    ) -> Self {
        Self {
            projection,
            upstream,
            target,
        }
    }

    fn upstream_value(&self) -> Option<Arc<T>> {
        self.upstream.upgrade()?.current_value()
    }

    fn project(&self, value: &T) -> Option<K> {
        match &self.projection {
            Projection::Map(project) => project(value),
            Projection::Select(resolve) => {
                let pinned = self.target.pinned();
                let resolved = resolve(value, pinned.as_ref());
                if resolved.released_pin() {
                    tracing::debug!(stage = %self.target.id, ?pinned, "pinned key vanished; auto-select re-applied");
                    self.target.set_pinned(None);
                }
                resolved.into_key()
            }
        }
    }
}

impl<T: Value, K: Key, U: Value> Downstream<T> for Link<T, K, U> {
    fn upstream_ready(&self, turn: &mut Turn<'_>, value: &Arc<T>) {
        let key = self.project(value);
        self.target.apply_key(turn, key);
    }

    fn upstream_failed(&self, turn: &mut Turn<'_>, stale: &Arc<T>) {
        match self.project(stale) {
            Some(key) => self.target.restore(turn, key),
            None => self.target.clear(turn),
        }
    }

    fn upstream_reset(&self, turn: &mut Turn<'_>) {
        self.target.mark_pending(turn);
    }

    fn upstream_cleared(&self, turn: &mut Turn<'_>) {
        self.target.clear(turn);
    }
}

impl<T: Value, K: Key, U: Value> Selector<K> for Link<T, K, U> {
    fn contains(&self, key: &K) -> Option<bool> {
        let Projection::Select(resolve) = &self.projection else {
            return None;
        };
        let value = self.upstream_value()?;
        Some(matches!(resolve(&*value, Some(key)), Resolved::Pinned(_)))
    }

    fn reselect(&self, turn: &mut Turn<'_>) {
        if let Some(value) = self.upstream_value() {
            self.upstream_ready(turn, &value);
        }
    }
}

// =============================================================================
// STAGE CELL
// =============================================================================

struct Slot<K, T> {
    state: StageState<K, T>,
    pinned: Option<K>,
    /// Version whose waiter is attached to a fetch, if any.
    live: Option<u64>,
    waiter: Option<JoinHandle<()>>,
    /// Pending only because the upstream reloaded; `value` is still the
    /// Ready result for `key`.
    restorable: bool,
}

impl<K, T> Slot<K, T> {
    /// Invalidate whatever is in flight and start a new version.
    fn supersede(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            waiter.abort();
        }
        self.live = None;
        self.restorable = false;
        self.state.version = self.state.version.saturating_add(1);
    }

    fn is_pending(&self) -> bool {
        self.state.status == Status::Loading && self.live.is_none()
    }
}

/// Shared state behind a [`Stage`] handle.
pub(crate) struct StageCell<K: Key, T: Value> {
    id: StageId,
    index: usize,
    derived: bool,
    options: StageOptions,
    fetcher: Arc<dyn Fetcher<K, T>>,
    table: Arc<StageTable<K, T>>,
    wiring: Wiring,
    channel: Arc<Channel<K, T>>,
    slot: Mutex<Slot<K, T>>,
    downstream: OnceLock<Arc<dyn Downstream<T>>>,
    selector: OnceLock<Weak<dyn Selector<K>>>,
}

impl<K: Key, T: Value> StageCell<K, T> {
    pub(crate) fn new(
        spec: StageSpec<K, T>,
        index: usize,
        derived: bool,
        table: Arc<StageTable<K, T>>,
        wiring: Wiring,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: spec.id,
            index,
            derived,
            options: spec.options,
            fetcher: spec.fetcher,
            table,
            channel: Arc::new(Channel::new(spec.id, wiring.bus_capacity)),
            wiring,
            slot: Mutex::new(Slot {
                state: StageState::idle(),
                pinned: None,
                live: None,
                waiter: None,
                restorable: false,
            }),
            downstream: OnceLock::new(),
            selector: OnceLock::new(),
        })
    }

    pub(crate) fn id(&self) -> StageId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Slot<K, T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach_downstream(&self, link: Arc<dyn Downstream<T>>) -> Result<(), ChainError> {
        self.downstream
            .set(link)
            .map_err(|_| ChainError::NotTail(self.id))
    }

    pub(crate) fn attach_selector(&self, selector: Weak<dyn Selector<K>>) {
        // A cell is linked exactly once, right after creation.
        let _ = self.selector.set(selector);
    }

    /// Bring a freshly attached link up to date with this stage's state.
    pub(crate) fn replay_into(&self, turn: &mut Turn<'_>, link: &dyn Downstream<T>) {
        let (status, value) = {
            let slot = self.lock();
            (slot.state.status, slot.state.value.clone())
        };
        match (status, value) {
            (Status::Loading, _) => link.upstream_reset(turn),
            (Status::Ready | Status::Failed, Some(value)) => link.upstream_ready(turn, &value),
            _ => {}
        }
    }

    fn publish(&self, turn: &mut Turn<'_>, state: StageState<K, T>) {
        tracing::trace!(stage = %self.id, key = ?state.key, status = %state.status, version = state.version, "transition");
        turn.record(self.id, self.index, state.status, state.version);
        self.channel.publish(state);
    }

    fn pinned(&self) -> Option<K> {
        self.lock().pinned.clone()
    }

    fn set_pinned(&self, key: Option<K>) {
        self.lock().pinned = key;
    }

    fn is_fresh(&self, entry: &CacheEntry<K, T>) -> bool {
        self.options
            .max_age
            .is_some_and(|max_age| entry.fetched_at.elapsed() <= max_age)
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    pub(crate) fn apply_key(self: &Arc<Self>, turn: &mut Turn<'_>, key: Option<K>) {
        match key {
            Some(key) => self.load(turn, key, false),
            None => self.clear(turn),
        }
    }

    fn clear(&self, turn: &mut Turn<'_>) {
        let snapshot = {
            let mut slot = self.lock();
            let state = &slot.state;
            let already_idle = state.status == Status::Idle
                && state.key.is_none()
                && state.value.is_none()
                && state.error.is_none();
            if already_idle {
                None
            } else {
                slot.supersede();
                slot.state.key = None;
                slot.state.status = Status::Idle;
                slot.state.value = None;
                slot.state.error = None;
                Some(slot.state.clone())
            }
        };
        if let Some(state) = snapshot {
            self.publish(turn, state);
        }
        if let Some(next) = self.downstream.get() {
            next.upstream_cleared(turn);
        }
    }

    fn load(self: &Arc<Self>, turn: &mut Turn<'_>, key: K, force: bool) {
        let mut slot = self.lock();
        if !force && slot.state.key.as_ref() == Some(&key) {
            let fetch_live = slot.live == Some(slot.state.version);
            let current = match slot.state.status {
                Status::Ready => true,
                Status::Loading => fetch_live,
                Status::Idle | Status::Failed => false,
            };
            if current {
                tracing::trace!(stage = %self.id, ?key, "key unchanged");
                return;
            }
        }

        slot.supersede();
        if slot.state.key.as_ref() != Some(&key) {
            slot.state.error = None;
        }
        slot.state.key = Some(key.clone());

        if let Some(entry) = self.table.get(&key) {
            if !force && self.is_fresh(&entry) {
                slot.state.status = Status::Ready;
                slot.state.value = Some(Arc::clone(&entry.value));
                slot.state.error = None;
                let state = slot.state.clone();
                drop(slot);
                tracing::debug!(stage = %self.id, ?key, "served from cache");
                self.publish(turn, state);
                if let Some(next) = self.downstream.get() {
                    next.upstream_ready(turn, &entry.value);
                }
                return;
            }
            slot.state.value = Some(entry.value);
        }

        slot.state.status = Status::Loading;
        let version = slot.state.version;
        let attachment = self.table.begin_fetch(&key);
        if !attachment.already_in_flight() {
            self.spawn_fetch(key);
        }
        slot.live = Some(version);
        slot.waiter = Some(self.spawn_waiter(version, attachment));
        let state = slot.state.clone();
        drop(slot);

        self.publish(turn, state);
        if let Some(next) = self.downstream.get() {
            next.upstream_reset(turn);
        }
    }

    fn mark_pending(&self, turn: &mut Turn<'_>) {
        let snapshot = {
            let mut slot = self.lock();
            if slot.is_pending() {
                None
            } else {
                let was_ready = slot.state.status == Status::Ready;
                slot.supersede();
                slot.restorable = was_ready;
                slot.state.status = Status::Loading;
                Some(slot.state.clone())
            }
        };
        if let Some(state) = snapshot {
            self.publish(turn, state);
        }
        if let Some(next) = self.downstream.get() {
            next.upstream_reset(turn);
        }
    }

    /// Go back to Ready with the retained value if this stage was Ready for
    /// `key` before its upstream reloaded; otherwise load `key` as usual.
    fn restore(self: &Arc<Self>, turn: &mut Turn<'_>, key: K) {
        let restored = {
            let mut slot = self.lock();
            let same_key = slot.state.key.as_ref() == Some(&key);
            match slot.state.value.clone() {
                Some(value) if slot.restorable && same_key && slot.is_pending() => {
                    slot.restorable = false;
                    slot.state.status = Status::Ready;
                    slot.state.error = None;
                    Some((slot.state.clone(), value))
                }
                _ => None,
            }
        };
        let Some((state, value)) = restored else {
            self.load(turn, key, false);
            return;
        };
        tracing::debug!(stage = %self.id, key = ?state.key, "upstream failed; previous result kept");
        self.publish(turn, state);
        if let Some(next) = self.downstream.get() {
            next.upstream_failed(turn, &value);
        }
    }

    fn refresh(self: &Arc<Self>, turn: &mut Turn<'_>) {
        let key = {
            let slot = self.lock();
            if self.derived && slot.is_pending() {
                // The upstream will hand down a key when it settles.
                None
            } else {
                slot.state.key.clone()
            }
        };
        if let Some(key) = key {
            self.load(turn, key, true);
        }
    }

    fn on_fetch_complete(&self, turn: &mut Turn<'_>, version: u64, outcome: Outcome<T>) {
        let mut slot = self.lock();
        if slot.state.version != version || slot.live != Some(version) {
            tracing::debug!(stage = %self.id, version, current = slot.state.version, "discarding superseded completion");
            return;
        }
        slot.live = None;
        slot.waiter = None;

        let forward = match outcome {
            Ok(value) => {
                slot.state.status = Status::Ready;
                slot.state.value = Some(Arc::clone(&value));
                slot.state.error = None;
                Some(Ok(value))
            }
            Err(error) => {
                tracing::debug!(stage = %self.id, key = ?slot.state.key, %error, "fetch failed");
                slot.state.status = Status::Failed;
                slot.state.error = Some(error);
                slot.state.value.clone().map(Err)
            }
        };
        let state = slot.state.clone();
        drop(slot);

        self.publish(turn, state);
        if let Some(next) = self.downstream.get() {
            match forward {
                Some(Ok(value)) => next.upstream_ready(turn, &value),
                Some(Err(stale)) => next.upstream_failed(turn, &stale),
                None => next.upstream_cleared(turn),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    /// Issue the fetch. The task is owned by the registry entry, not by this
    /// stage: superseding or disposing never aborts it.
    fn spawn_fetch(&self, key: K) {
        let fetcher = Arc::clone(&self.fetcher);
        let in_flight = InFlight::new(Arc::clone(&self.table), key.clone());
        tracing::debug!(stage = %self.id, ?key, "fetch issued");
        drop(self.wiring.runtime.spawn(async move {
            let result = fetcher.fetch(key).await;
            in_flight.finish(result);
        }));
    }

    fn spawn_waiter(self: &Arc<Self>, version: u64, attachment: Attachment<T>) -> JoinHandle<()> {
        let cell = Arc::clone(self);
        self.wiring.runtime.spawn(async move {
            let outcome = attachment.wait().await;
            cell.settle(version, outcome);
        })
    }

    fn settle(&self, version: u64, outcome: Outcome<T>) {
        match self.wiring.sequencer.turn() {
            Ok(mut turn) => self.on_fetch_complete(&mut turn, version, outcome),
            Err(_) => tracing::debug!(stage = %self.id, version, "chain disposed; completion dropped"),
        }
    }

    // -------------------------------------------------------------------------
    // Chain support
    // -------------------------------------------------------------------------

    pub(crate) fn summary(&self) -> StageSummary {
        let slot = self.lock();
        StageSummary {
            stage: self.id,
            index: self.index,
            status: slot.state.status,
            version: slot.state.version,
            has_value: slot.state.value.is_some(),
            error: slot.state.error.clone(),
            pinned: slot.pinned.is_some(),
        }
    }

    /// Abort the waiter and end every subscription.
    pub(crate) fn shutdown(&self) {
        let mut slot = self.lock();
        if let Some(waiter) = slot.waiter.take() {
            waiter.abort();
        }
        slot.live = None;
        drop(slot);
        self.channel.close();
    }

    pub(crate) fn belongs_to(&self, wiring: &Wiring) -> bool {
        self.wiring.same_chain(wiring)
    }
}

impl<K: Key, T: Value> ValueSource<T> for StageCell<K, T> {
    fn current_value(&self) -> Option<Arc<T>> {
        self.lock().state.value.clone()
    }
}

// =============================================================================
// STAGE HANDLE
// =============================================================================

/// Handle to one stage of a chain.
///
/// Handles are cheap to clone. After the chain is disposed every mutating
/// call fails with `ChainError::Disposed`; reads keep returning the last
/// published state.
pub struct Stage<K: Key, T: Value> {
    pub(crate) cell: Arc<StageCell<K, T>>,
}

impl<K: Key, T: Value> Clone for Stage<K, T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<K: Key, T: Value> std::fmt::Debug for Stage<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.cell.id)
            .field("index", &self.cell.index)
            .finish()
    }
}

impl<K: Key, T: Value> Stage<K, T> {
    pub(crate) fn new(cell: Arc<StageCell<K, T>>) -> Self {
        Self { cell }
    }

    /// Stage id.
    pub fn id(&self) -> StageId {
        self.cell.id()
    }

    /// Position in the chain (0 for the root).
    pub fn index(&self) -> usize {
        self.cell.index
    }

    /// Check if the key comes from an upstream projection.
    pub fn is_derived(&self) -> bool {
        self.cell.derived
    }

    /// The latest published state.
    pub fn state(&self) -> StageState<K, T> {
        self.cell.channel.latest()
    }

    /// Observe this stage: the current state, then every transition.
    pub fn subscribe(&self) -> Subscription<K, T> {
        self.cell.channel.subscribe()
    }

    /// Set the key of the root stage. `None` clears the whole chain to Idle.
    pub fn set_key(&self, key: Option<K>) -> Result<(), ChainError> {
        let mut turn = self.cell.wiring.sequencer.turn()?;
        if self.cell.derived {
            return Err(ChainError::DerivedKey(self.cell.id));
        }
        self.cell.apply_key(&mut turn, key);
        Ok(())
    }

    /// Re-fetch the current key even if it is Ready.
    ///
    /// Use after [`Stage::invalidate`] when a write changed the data. A derived
    /// stage waiting on its upstream is left alone.
    pub fn refresh(&self) -> Result<(), ChainError> {
        let mut turn = self.cell.wiring.sequencer.turn()?;
        self.cell.refresh(&mut turn);
        Ok(())
    }

    /// Pin an explicit selection on a stage fed by an auto-select link.
    ///
    /// The pin survives upstream reloads for as long as the upstream
    /// collection contains `key`.
    pub fn pin(&self, key: K) -> Result<(), ChainError> {
        let mut turn = self.cell.wiring.sequencer.turn()?;
        let selector = self.selector()?;
        if selector.contains(&key) != Some(true) {
            return Err(ChainError::NotInCollection(self.cell.id));
        }
        self.cell.set_pinned(Some(key.clone()));
        self.cell.apply_key(&mut turn, Some(key));
        Ok(())
    }

    /// Release the pin and fall back to the auto-selected default.
    ///
    /// If the upstream has no collection yet, only the pin is released; the
    /// stage keeps its current key until the upstream next settles, and the
    /// default is selected then.
    pub fn unpin(&self) -> Result<(), ChainError> {
        let mut turn = self.cell.wiring.sequencer.turn()?;
        let selector = self.selector()?;
        self.cell.set_pinned(None);
        selector.reselect(&mut turn);
        Ok(())
    }

    /// The pinned key, if any.
    pub fn pinned(&self) -> Option<K> {
        self.cell.pinned()
    }

    /// The registry's cache entry for `key` of this stage.
    pub fn cached(&self, key: &K) -> Option<CacheEntry<K, T>> {
        self.cell.table.get(key)
    }

    /// Drop the registry's cache entry for `key` of this stage.
    pub fn invalidate(&self, key: &K) -> bool {
        self.cell.table.invalidate(key)
    }

    fn selector(&self) -> Result<Arc<dyn Selector<K>>, ChainError> {
        self.cell
            .selector
            .get()
            .and_then(Weak::upgrade)
            .ok_or(ChainError::NotSelectable(self.cell.id))
    }
}
