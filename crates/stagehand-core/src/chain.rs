//! # Chain
//!
//! An ordered list of stages where each non-root stage derives its key from
//! its immediate upstream's value.
//!
//! ## Sequencing
//!
//! Every chain owns one sequencer. Key changes, fetch completions, pins and
//! disposal each take a [`Turn`] on it, so the transitions of one chain are
//! applied and published strictly one after another, and a transition and
//! its downstream cascade are never interleaved with another transition.
//!
//! ## Convergence
//!
//! Once the root key stops changing and every pending fetch completes, every
//! stage is Idle, Ready or Failed, and each derived stage's key equals the
//! projection of its upstream's final value.

use crate::bus::{ChainEvent, DEFAULT_BUS_CAPACITY, EventStream};
use crate::registry::Registry;
use crate::select::AutoSelect;
use crate::stage::{Downstream, Link, Projection, Selector, Stage, StageCell, StageSpec, ValueSource};
use crate::types::{ChainError, FetchError, Key, StageId, Status, Value};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

// =============================================================================
// SEQUENCER
// =============================================================================

pub(crate) struct Sequencer {
    state: Mutex<SequencerState>,
}

struct SequencerState {
    disposed: bool,
    next_seq: u64,
    events: Option<broadcast::Sender<ChainEvent>>,
}

/// Exclusive right to transition the stages of one chain.
pub(crate) struct Turn<'a> {
    state: MutexGuard<'a, SequencerState>,
}

impl Sequencer {
    fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(SequencerState {
                disposed: false,
                next_seq: 0,
                events: Some(events),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SequencerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the chain's turn. Fails once the chain is disposed.
    pub(crate) fn turn(&self) -> Result<Turn<'_>, ChainError> {
        let state = self.lock();
        if state.disposed {
            return Err(ChainError::Disposed);
        }
        Ok(Turn { state })
    }

    fn subscribe(&self) -> EventStream {
        match &self.lock().events {
            Some(events) => EventStream::new(events.subscribe()),
            None => {
                let (_, receiver) = broadcast::channel(1);
                EventStream::new(receiver)
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.lock().disposed
    }
}

impl Turn<'_> {
    /// Stamp a transition with the next sequence number and announce it.
    pub(crate) fn record(&mut self, stage: StageId, index: usize, status: Status, version: u64) {
        let seq = self.state.next_seq;
        self.state.next_seq = seq.saturating_add(1);
        if let Some(events) = &self.state.events {
            // No listeners is fine.
            let _ = events.send(ChainEvent {
                seq,
                stage,
                index,
                status,
                version,
            });
        }
    }

    fn dispose(&mut self) {
        self.state.disposed = true;
        self.state.events = None;
    }
}

/// What every stage of a chain shares with the chain.
#[derive(Clone)]
pub(crate) struct Wiring {
    pub(crate) runtime: Handle,
    pub(crate) sequencer: Arc<Sequencer>,
    pub(crate) bus_capacity: usize,
}

impl Wiring {
    pub(crate) fn same_chain(&self, other: &Wiring) -> bool {
        Arc::ptr_eq(&self.sequencer, &other.sequencer)
    }
}

// =============================================================================
// CHAIN
// =============================================================================

/// Chain-wide tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainOptions {
    /// Per-stage bus capacity; slower subscribers are resynchronized.
    pub bus_capacity: usize,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

/// Point-in-time view of one stage, without its typed key or value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage: StageId,
    pub index: usize,
    pub status: Status,
    pub version: u64,
    pub has_value: bool,
    pub error: Option<FetchError>,
    pub pinned: bool,
}

trait ChainMember: Send + Sync {
    fn summary(&self) -> StageSummary;
    fn shutdown(&self);
}

impl<K: Key, T: Value> ChainMember for StageCell<K, T> {
    fn summary(&self) -> StageSummary {
        StageCell::summary(self)
    }

    fn shutdown(&self) {
        StageCell::shutdown(self);
    }
}

/// A dependent chain of stages.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use stagehand_core::{AutoSelect, Chain, FetchError, Registry, StageId, StageSpec};
/// # async fn demo() -> Result<(), stagehand_core::ChainError> {
/// let registry = Arc::new(Registry::new());
/// let mut chain = Chain::new("roster", registry)?;
/// let classes = chain.root(StageSpec::new(StageId::new("classes"), |teacher: String| async move {
///     Ok::<_, FetchError>(vec![format!("{teacher}-a"), format!("{teacher}-b")])
/// }))?;
/// let students = chain.then_select(
///     &classes,
///     StageSpec::new(StageId::new("students"), |class: String| async move {
///         Ok::<_, FetchError>(vec![format!("{class}/1")])
///     }),
///     AutoSelect::new(|class: &String| class.clone()),
/// )?;
/// classes.set_key(Some("t1".to_string()))?;
/// let ready = students.subscribe().wait_for(|s| s.is_ready()).await;
/// # drop(ready);
/// # Ok(())
/// # }
/// ```
pub struct Chain {
    name: String,
    registry: Arc<Registry>,
    wiring: Wiring,
    stages: Vec<Arc<dyn ChainMember>>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Chain {
    /// Create an empty chain backed by `registry`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, registry: Arc<Registry>) -> Result<Self, ChainError> {
        Self::with_options(name, registry, ChainOptions::default())
    }

    /// Create an empty chain with explicit options.
    pub fn with_options(
        name: impl Into<String>,
        registry: Arc<Registry>,
        options: ChainOptions,
    ) -> Result<Self, ChainError> {
        let runtime = Handle::try_current().map_err(|_| ChainError::NoRuntime)?;
        Ok(Self {
            name: name.into(),
            registry,
            wiring: Wiring {
                runtime,
                sequencer: Arc::new(Sequencer::new(options.bus_capacity)),
                bus_capacity: options.bus_capacity,
            },
            stages: Vec::new(),
        })
    }

    /// Declare the root stage. Its key is set explicitly with `set_key`.
    pub fn root<K: Key, T: Value>(&mut self, spec: StageSpec<K, T>) -> Result<Stage<K, T>, ChainError> {
        let _turn = self.wiring.sequencer.turn()?;
        if !self.stages.is_empty() {
            return Err(ChainError::RootExists);
        }
        let table = self.registry.table::<K, T>(spec.id)?;
        let cell = StageCell::new(spec, 0, false, table, self.wiring.clone());
        self.stages.push(Arc::clone(&cell) as Arc<dyn ChainMember>);
        tracing::debug!(chain = %self.name, stage = %cell.id(), "root declared");
        Ok(Stage::new(cell))
    }

    /// Append a stage whose key is `project(upstream value)`.
    ///
    /// `project` must be pure; returning `None` leaves the stage Idle.
    pub fn then<KU, TU, K, T>(
        &mut self,
        upstream: &Stage<KU, TU>,
        spec: StageSpec<K, T>,
        project: impl Fn(&TU) -> Option<K> + Send + Sync + 'static,
    ) -> Result<Stage<K, T>, ChainError>
    where
        KU: Key,
        TU: Value,
        K: Key,
        T: Value,
    {
        self.append(upstream, spec, Projection::Map(Box::new(project)), false)
    }

    /// Append a stage whose key is auto-selected from the upstream collection.
    ///
    /// The stage accepts [`Stage::pin`] to override the default selection.
    pub fn then_select<KU, TU, I, K, T>(
        &mut self,
        upstream: &Stage<KU, TU>,
        spec: StageSpec<K, T>,
        policy: AutoSelect<I, K>,
    ) -> Result<Stage<K, T>, ChainError>
    where
        KU: Key,
        TU: Value + AsRef<[I]>,
        I: 'static,
        K: Key,
        T: Value,
    {
        let resolve = move |value: &TU, pinned: Option<&K>| {
            policy.resolve(AsRef::<[I]>::as_ref(value), pinned)
        };
        self.append(upstream, spec, Projection::Select(Box::new(resolve)), true)
    }

    fn append<KU, TU, K, T>(
        &mut self,
        upstream: &Stage<KU, TU>,
        spec: StageSpec<K, T>,
        projection: Projection<TU, K>,
        selectable: bool,
    ) -> Result<Stage<K, T>, ChainError>
    where
        KU: Key,
        TU: Value,
        K: Key,
        T: Value,
    {
        let mut turn = self.wiring.sequencer.turn()?;
        let is_tail = upstream.cell.belongs_to(&self.wiring)
            && upstream.index().saturating_add(1) == self.stages.len();
        if !is_tail {
            return Err(ChainError::NotTail(upstream.id()));
        }

        let table = self.registry.table::<K, T>(spec.id)?;
        let index = self.stages.len();
        let cell = StageCell::new(spec, index, true, table, self.wiring.clone());

        let source: Arc<dyn ValueSource<TU>> = Arc::clone(&upstream.cell) as Arc<dyn ValueSource<TU>>;
        let link = Arc::new(Link::new(projection, Arc::downgrade(&source), Arc::clone(&cell)));
        if selectable {
            let selector: Arc<dyn Selector<K>> = Arc::clone(&link) as Arc<dyn Selector<K>>;
            cell.attach_selector(Arc::downgrade(&selector));
        }
        let downstream: Arc<dyn Downstream<TU>> = link;
        upstream.cell.attach_downstream(Arc::clone(&downstream))?;

        self.stages.push(Arc::clone(&cell) as Arc<dyn ChainMember>);
        tracing::debug!(chain = %self.name, upstream = %upstream.id(), stage = %cell.id(), index, "stage linked");

        upstream.cell.replay_into(&mut turn, downstream.as_ref());
        Ok(Stage::new(cell))
    }

    /// Chain name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if no root was declared yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The registry this chain loads through.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Every transition of every stage, in the order the sequencer applied
    /// them. Ends when the chain is disposed.
    pub fn events(&self) -> EventStream {
        self.wiring.sequencer.subscribe()
    }

    /// Status of every stage, root first.
    pub fn snapshot(&self) -> Vec<StageSummary> {
        // Between turns, so no cascade is observed half-applied.
        let _turn = self.wiring.sequencer.turn().ok();
        self.stages.iter().map(|stage| stage.summary()).collect()
    }

    /// Check if no stage has a pending fetch.
    pub fn is_settled(&self) -> bool {
        self.snapshot()
            .iter()
            .all(|summary| summary.status.is_settled())
    }

    /// Stop all activity: pending completions are dropped, subscriptions end,
    /// and further calls on any stage fail with `ChainError::Disposed`.
    ///
    /// Fetches already issued keep running and still populate the registry
    /// for other chains. Idempotent.
    pub fn dispose(&self) {
        let Ok(mut turn) = self.wiring.sequencer.turn() else {
            return;
        };
        turn.dispose();
        for stage in &self.stages {
            stage.shutdown();
        }
        tracing::debug!(chain = %self.name, stages = self.stages.len(), "chain disposed");
    }

    /// Check if [`Chain::dispose`] was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.wiring.sequencer.is_disposed()
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FetchError;
    use std::time::Duration;

    const CLASSES: StageId = StageId::new("classes");
    const STUDENTS: StageId = StageId::new("students");

    fn classes_spec() -> StageSpec<String, Vec<u64>> {
        StageSpec::new(CLASSES, |teacher: String| async move {
            match teacher.as_str() {
                "1" => Ok::<_, FetchError>(vec![10, 11]),
                "2" => Ok(vec![12]),
                other => Err(FetchError::NotFound(format!("teacher {other}"))),
            }
        })
    }

    fn students_spec() -> StageSpec<u64, Vec<u64>> {
        StageSpec::new(STUDENTS, |class: u64| async move {
            Ok::<_, FetchError>(vec![class * 10, class * 10 + 1])
        })
    }

    async fn within<F: std::future::Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn new_chain_requires_runtime_context() {
        let chain = Chain::new("roster", Arc::new(Registry::new())).expect("chain");
        assert!(chain.is_empty());
        assert_eq!(chain.name(), "roster");
    }

    #[test]
    fn new_chain_outside_runtime_fails() {
        let err = Chain::new("roster", Arc::new(Registry::new())).err();
        assert_eq!(err, Some(ChainError::NoRuntime));
    }

    #[tokio::test]
    async fn second_root_is_rejected() {
        let mut chain = Chain::new("roster", Arc::new(Registry::new())).expect("chain");
        chain.root(classes_spec()).expect("root");
        let err = chain.root(classes_spec()).err();
        assert_eq!(err, Some(ChainError::RootExists));
    }

    #[tokio::test]
    async fn append_requires_tail() {
        let mut chain = Chain::new("roster", Arc::new(Registry::new())).expect("chain");
        let classes = chain.root(classes_spec()).expect("root");
        chain
            .then_select(&classes, students_spec(), AutoSelect::new(|id: &u64| *id))
            .expect("students");
        let err = chain
            .then_select(&classes, students_spec(), AutoSelect::new(|id: &u64| *id))
            .err();
        assert_eq!(err, Some(ChainError::NotTail(CLASSES)));
    }

    #[tokio::test]
    async fn append_rejects_foreign_upstream() {
        let registry = Arc::new(Registry::new());
        let mut first = Chain::new("a", Arc::clone(&registry)).expect("chain");
        let mut second = Chain::new("b", registry).expect("chain");
        let classes = first.root(classes_spec()).expect("root");
        second.root(classes_spec()).expect("root");

        let err = second
            .then_select(&classes, students_spec(), AutoSelect::new(|id: &u64| *id))
            .err();
        assert_eq!(err, Some(ChainError::NotTail(CLASSES)));
    }

    #[tokio::test]
    async fn events_are_strictly_sequenced() {
        let mut chain = Chain::new("roster", Arc::new(Registry::new())).expect("chain");
        let classes = chain.root(classes_spec()).expect("root");
        let students = chain
            .then_select(&classes, students_spec(), AutoSelect::new(|id: &u64| *id))
            .expect("students");
        let mut events = chain.events();

        classes.set_key(Some("1".to_string())).expect("set key");
        within(students.subscribe().wait_for(|s| s.is_ready())).await;

        let mut last = None;
        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), events.next()).await
        {
            if let Some(prev) = last {
                assert!(event.seq > prev);
            }
            last = Some(event.seq);
            seen.push((event.stage, event.status));
        }
        assert_eq!(seen.first(), Some(&(CLASSES, Status::Loading)));
        assert_eq!(seen.last(), Some(&(STUDENTS, Status::Ready)));
    }

    #[tokio::test]
    async fn snapshot_reports_every_stage() {
        let mut chain = Chain::new("roster", Arc::new(Registry::new())).expect("chain");
        let classes = chain.root(classes_spec()).expect("root");
        let students = chain
            .then_select(&classes, students_spec(), AutoSelect::new(|id: &u64| *id))
            .expect("students");

        classes.set_key(Some("1".to_string())).expect("set key");
        within(students.subscribe().wait_for(|s| s.is_ready())).await;

        let snapshot = chain.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|s| s.status == Status::Ready && s.has_value));
        assert!(chain.is_settled());
    }

    #[tokio::test]
    async fn dispose_rejects_further_calls() {
        let mut chain = Chain::new("roster", Arc::new(Registry::new())).expect("chain");
        let classes = chain.root(classes_spec()).expect("root");
        chain.dispose();
        chain.dispose();

        assert!(chain.is_disposed());
        assert_eq!(
            classes.set_key(Some("1".to_string())),
            Err(ChainError::Disposed)
        );
        assert_eq!(chain.root(classes_spec()).err(), Some(ChainError::Disposed));
        assert!(chain.events().next().await.is_none());
    }
}
