//! Shared helpers for chain integration tests.
//!
//! [`Script`] is a fetcher whose calls block until the test resolves them, so
//! tests control exactly when and in which order fetches complete.

#![allow(dead_code)]

use stagehand_core::{FetchError, Fetcher, Key, StageState, Subscription, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Fail the test if `future` does not finish within [`TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("timed out waiting for the chain")
}

/// Wait until the subscription yields a state matching `predicate`.
pub async fn settle<K: Key, T: Value>(
    sub: &mut Subscription<K, T>,
    predicate: impl FnMut(&StageState<K, T>) -> bool,
) -> StageState<K, T> {
    within(sub.wait_for(predicate))
        .await
        .expect("chain disposed while waiting")
}

type Responder<T> = oneshot::Sender<Result<T, FetchError>>;

struct ScriptInner<K, T> {
    calls: Vec<K>,
    pending: HashMap<K, VecDeque<Responder<T>>>,
}

/// A fetcher driven by the test.
pub struct Script<K, T> {
    inner: Arc<Mutex<ScriptInner<K, T>>>,
}

impl<K, T> Clone for Script<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Key, T: Value> Script<K, T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptInner {
                calls: Vec::new(),
                pending: HashMap::new(),
            })),
        }
    }

    /// A fetcher that records the call and waits for [`Script::resolve`].
    pub fn fetcher(&self) -> impl Fetcher<K, T> + 'static {
        let inner = Arc::clone(&self.inner);
        move |key: K| {
            let (sender, receiver) = oneshot::channel();
            {
                let mut inner = inner.lock().expect("script lock");
                inner.calls.push(key.clone());
                inner.pending.entry(key).or_default().push_back(sender);
            }
            async move {
                receiver
                    .await
                    .unwrap_or_else(|_| Err(FetchError::Unknown("script dropped".into())))
            }
        }
    }

    /// Every key the fetcher was called with, in call order.
    pub fn calls(&self) -> Vec<K> {
        self.inner.lock().expect("script lock").calls.clone()
    }

    /// Number of calls for `key`.
    pub fn call_count(&self, key: &K) -> usize {
        self.calls().iter().filter(|k| *k == key).count()
    }

    fn has_pending(&self, key: &K) -> bool {
        self.inner
            .lock()
            .expect("script lock")
            .pending
            .get(key)
            .is_some_and(|queue| !queue.is_empty())
    }

    /// Wait until the fetcher has been called for `key` and not yet resolved.
    pub async fn requested(&self, key: &K) {
        within(async {
            while !self.has_pending(key) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
    }

    /// Wait for the oldest pending call for `key`, then complete it.
    pub async fn resolve(&self, key: &K, result: Result<T, FetchError>) {
        self.requested(key).await;
        let responder = self
            .inner
            .lock()
            .expect("script lock")
            .pending
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .expect("pending call");
        // The fetch task may have been dropped with its runtime; nothing to do.
        let _ = responder.send(result);
    }
}
