//! # Subscription/Publication Bus
//!
//! Each stage owns a [`Channel`] that holds its latest state and fans out
//! every transition to subscribers.
//!
//! ## Semantics
//!
//! - Replay-latest: a new [`Subscription`] first yields the current state,
//!   then every later transition, with no gap and no duplicate in between
//! - A subscriber that falls more than the bus capacity behind is
//!   resynchronized to the latest state
//! - Dropping a subscription never touches the fetch it observes; fetches
//!   belong to the registry
//! - Closing the channel (chain disposal) ends every subscription

use crate::types::{StageId, StageState, Status};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};

/// Default per-stage bus capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 64;

// =============================================================================
// CHANNEL
// =============================================================================

pub(crate) struct Channel<K, T> {
    stage: StageId,
    inner: Mutex<ChannelInner<K, T>>,
}

struct ChannelInner<K, T> {
    latest: StageState<K, T>,
    sender: Option<broadcast::Sender<StageState<K, T>>>,
}

impl<K: Clone + Send + Sync + 'static, T: Send + Sync + 'static> Channel<K, T> {
    pub(crate) fn new(stage: StageId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            stage,
            inner: Mutex::new(ChannelInner {
                latest: StageState::idle(),
                sender: Some(sender),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner<K, T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `state` as latest and fan it out.
    pub(crate) fn publish(&self, state: StageState<K, T>) {
        let mut inner = self.lock();
        if let Some(sender) = &inner.sender {
            // No receivers is fine: the state is still kept as latest.
            let _ = sender.send(state.clone());
        }
        inner.latest = state;
    }

    pub(crate) fn latest(&self) -> StageState<K, T> {
        self.lock().latest.clone()
    }

    /// Snapshot and receiver taken atomically with respect to `publish`.
    fn attach(&self) -> (StageState<K, T>, Option<broadcast::Receiver<StageState<K, T>>>) {
        let inner = self.lock();
        let receiver = inner.sender.as_ref().map(broadcast::Sender::subscribe);
        (inner.latest.clone(), receiver)
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription<K, T> {
        let (latest, receiver) = self.attach();
        Subscription {
            channel: Arc::clone(self),
            pending: Some(latest),
            receiver,
        }
    }

    /// End every subscription after its buffered transitions.
    pub(crate) fn close(&self) {
        self.lock().sender = None;
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Lazy, replay-latest sequence of one stage's states.
pub struct Subscription<K, T> {
    channel: Arc<Channel<K, T>>,
    pending: Option<StageState<K, T>>,
    receiver: Option<broadcast::Receiver<StageState<K, T>>>,
}

impl<K: Clone + Send + Sync + 'static, T: Send + Sync + 'static> Subscription<K, T> {
    /// Wait for the next state.
    ///
    /// The first call returns the state current at subscription time.
    /// Returns `None` once the owning chain is disposed.
    pub async fn next(&mut self) -> Option<StageState<K, T>> {
        if let Some(state) = self.pending.take() {
            return Some(state);
        }
        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(state) => Some(state),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(stage = %self.channel.stage, skipped, "subscriber lagged; resyncing to latest");
                let (latest, receiver) = self.channel.attach();
                self.receiver = receiver;
                Some(latest)
            }
            Err(RecvError::Closed) => {
                self.receiver = None;
                None
            }
        }
    }

    /// Wait until a state satisfies `predicate` and return it.
    ///
    /// Returns `None` if the chain is disposed first.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&StageState<K, T>) -> bool,
    ) -> Option<StageState<K, T>> {
        while let Some(state) = self.next().await {
            if predicate(&state) {
                return Some(state);
            }
        }
        None
    }

    /// The stage's latest state, without consuming the sequence.
    pub fn latest(&self) -> StageState<K, T> {
        self.channel.latest()
    }
}

// =============================================================================
// CHAIN EVENTS
// =============================================================================

/// One published transition, as seen on the chain-wide event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainEvent {
    /// Chain-wide sequence number, strictly increasing.
    pub seq: u64,
    /// Stage that transitioned.
    pub stage: StageId,
    /// Position of the stage in the chain.
    pub index: usize,
    /// New status.
    pub status: Status,
    /// New version.
    pub version: u64,
}

/// Stream of every transition of every stage of one chain, in sequencer order.
pub struct EventStream {
    receiver: broadcast::Receiver<ChainEvent>,
}

impl EventStream {
    pub(crate) fn new(receiver: broadcast::Receiver<ChainEvent>) -> Self {
        Self { receiver }
    }

    /// Wait for the next event. Lagging skips ahead; `None` after disposal.
    pub async fn next(&mut self) -> Option<ChainEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "chain event stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const STUDENTS: StageId = StageId::new("students");

    fn state(version: u64, status: Status) -> StageState<u64, String> {
        StageState {
            key: Some(10),
            status,
            value: None,
            error: None,
            version,
        }
    }

    #[tokio::test]
    async fn new_subscriber_receives_latest_first() {
        let channel = Arc::new(Channel::<u64, String>::new(STUDENTS, 8));
        channel.publish(state(1, Status::Loading));

        let mut sub = channel.subscribe();
        let first = sub.next().await.expect("replay");
        assert_eq!(first.version, 1);

        channel.publish(state(1, Status::Ready));
        let second = sub.next().await.expect("transition");
        assert_eq!(second.status, Status::Ready);
    }

    #[tokio::test]
    async fn every_transition_is_delivered_in_order() {
        let channel = Arc::new(Channel::<u64, String>::new(STUDENTS, 8));
        let mut sub = channel.subscribe();
        for version in 1..=3 {
            channel.publish(state(version, Status::Loading));
        }

        let versions: Vec<u64> = [
            sub.next().await,
            sub.next().await,
            sub.next().await,
            sub.next().await,
        ]
        .into_iter()
        .flatten()
        .map(|s| s.version)
        .collect();
        assert_eq!(versions, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn lagged_subscriber_resyncs_to_latest() {
        let channel = Arc::new(Channel::<u64, String>::new(STUDENTS, 2));
        let mut sub = channel.subscribe();
        assert_eq!(sub.next().await.expect("replay").version, 0);

        for version in 1..=10 {
            channel.publish(state(version, Status::Loading));
        }
        let resynced = sub.next().await.expect("resync");
        assert_eq!(resynced.version, 10);
    }

    #[tokio::test]
    async fn close_ends_subscription() {
        let channel = Arc::new(Channel::<u64, String>::new(STUDENTS, 8));
        let mut sub = channel.subscribe();
        channel.close();

        assert!(sub.next().await.is_some(), "replay is still delivered");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_after_close_replays_then_ends() {
        let channel = Arc::new(Channel::<u64, String>::new(STUDENTS, 8));
        channel.publish(state(4, Status::Ready));
        channel.close();

        let mut sub = channel.subscribe();
        assert_eq!(sub.next().await.expect("replay").version, 4);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn wait_for_skips_until_match() {
        let channel = Arc::new(Channel::<u64, String>::new(STUDENTS, 8));
        let mut sub = channel.subscribe();
        channel.publish(state(1, Status::Loading));
        channel.publish(state(1, Status::Ready));

        let ready = sub.wait_for(|s| s.is_ready()).await.expect("ready");
        assert_eq!(ready.version, 1);
    }
}
