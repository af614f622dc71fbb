//! State-changing operations.
//!
//! A mutation runs its body exactly once per call. Nothing is cached or
//! deduplicated, and nothing is invalidated automatically: the call site
//! knows which queries depend on the write and refreshes them itself.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::cache::{QueryCache, Rollback};
use crate::error::SyncError;
use crate::key::{MutationKey, QueryKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Failure,
}

/// Outcome of the most recent call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState<R> {
    Idle,
    Pending,
    Success(R),
    Failure(SyncError),
}

impl<R> MutationState<R> {
    pub fn status(&self) -> MutationStatus {
        match self {
            MutationState::Idle => MutationStatus::Idle,
            MutationState::Pending => MutationStatus::Pending,
            MutationState::Success(_) => MutationStatus::Success,
            MutationState::Failure(_) => MutationStatus::Failure,
        }
    }
}

/// Cache edits applied before a mutation runs and undone if it fails.
#[derive(Default)]
pub struct Optimistic {
    cache: Option<QueryCache>,
    rollbacks: Vec<Rollback>,
}

impl Optimistic {
    pub fn new(cache: &QueryCache) -> Self {
        Self {
            cache: Some(cache.clone()),
            rollbacks: Vec::new(),
        }
    }

    /// Rewrite the cached value at `key`; see [`QueryCache::set_query_data`].
    pub fn set<T, F>(&mut self, key: &QueryKey, update: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<&T>) -> Option<T>,
    {
        if let Some(cache) = &self.cache
            && let Some(rollback) = cache.set_query_data(key, update)
        {
            self.rollbacks.push(rollback);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rollbacks.is_empty()
    }

    fn restore(self) {
        let Some(cache) = self.cache else {
            return;
        };
        // Newest edit first, so overlapping edits unwind to the original.
        for rollback in self.rollbacks.into_iter().rev() {
            cache.restore_query_data(rollback);
        }
    }
}

type Operation<V, R> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<R, SyncError>> + Send + Sync>;

pub struct MutationController<V, R> {
    key: MutationKey,
    operation: Operation<V, R>,
    tx: watch::Sender<MutationState<R>>,
    /// Id of the latest call; only it may publish a final state.
    latest: AtomicU64,
}

impl<V, R> MutationController<V, R>
where
    V: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(key: MutationKey, operation: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, SyncError>> + Send + 'static,
    {
        let (tx, _) = watch::channel(MutationState::Idle);
        Self {
            key,
            operation: Arc::new(move |v| Box::pin(operation(v))),
            tx,
            latest: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &MutationKey {
        &self.key
    }

    pub fn state(&self) -> MutationState<R> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationState<R>> {
        self.tx.subscribe()
    }

    /// Back to `Idle` (e.g. after the UI has shown a failure).
    pub fn reset(&self) {
        self.tx.send_replace(MutationState::Idle);
    }

    pub async fn mutate(&self, variable: V) -> Result<R, SyncError> {
        self.run(variable, Optimistic::default()).await
    }

    /// Like [`mutate`](Self::mutate), but first let `on_mutate` apply
    /// optimistic cache edits. They are rolled back if the body fails or the
    /// call is abandoned.
    pub async fn mutate_with<O>(&self, variable: V, on_mutate: O) -> Result<R, SyncError>
    where
        O: FnOnce(&V) -> Optimistic,
    {
        let optimistic = on_mutate(&variable);
        self.run(variable, optimistic).await
    }

    async fn run(&self, variable: V, optimistic: Optimistic) -> Result<R, SyncError> {
        let id = self.latest.fetch_add(1, Ordering::AcqRel) + 1;
        self.tx.send_replace(MutationState::Pending);
        tracing::debug!(key = %self.key, "mutation started");

        let mut guard = PendingGuard {
            controller: self,
            id,
            optimistic: Some(optimistic),
        };
        let result = (self.operation)(variable).await;

        match &result {
            Ok(value) => {
                guard.optimistic = None;
                self.publish(id, MutationState::Success(value.clone()));
                tracing::debug!(key = %self.key, "mutation succeeded");
            }
            Err(error) => {
                if let Some(optimistic) = guard.optimistic.take() {
                    optimistic.restore();
                }
                self.publish(id, MutationState::Failure(error.clone()));
                tracing::warn!(key = %self.key, error = %error, "mutation failed");
            }
        }
        drop(guard);
        result
    }

    fn publish(&self, id: u64, state: MutationState<R>) {
        if self.latest.load(Ordering::Acquire) == id {
            self.tx.send_replace(state);
        }
    }
}

/// Unwinds an abandoned call: restores optimistic edits and leaves `Pending`.
struct PendingGuard<'a, V, R> {
    controller: &'a MutationController<V, R>,
    id: u64,
    optimistic: Option<Optimistic>,
}

impl<V, R> Drop for PendingGuard<'_, V, R> {
    fn drop(&mut self) {
        let Some(optimistic) = self.optimistic.take() else {
            return;
        };
        optimistic.restore();
        if self.controller.latest.load(Ordering::Acquire) == self.id {
            self.controller.tx.send_if_modified(|state| {
                if matches!(state, MutationState::Pending) {
                    *state = MutationState::Idle;
                    true
                } else {
                    false
                }
            });
        }
    }
}

impl<V, R> std::fmt::Debug for MutationController<V, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationController")
            .field("key", &self.key)
            .field("status", &self.tx.borrow().status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, MutationController<u32, u32>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let ctl = MutationController::new(MutationKey::new("double"), move |v: u32| {
            c.fetch_add(1, Ordering::SeqCst);
            async move {
                if v == 0 {
                    Err(SyncError::LocalStore("zero".into()))
                } else {
                    Ok(v * 2)
                }
            }
        });
        (calls, ctl)
    }

    #[tokio::test]
    async fn every_call_runs_the_body() {
        let (calls, ctl) = counter();
        assert_eq!(ctl.state(), MutationState::Idle);
        assert_eq!(ctl.mutate(2).await, Ok(4));
        assert_eq!(ctl.mutate(2).await, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctl.state(), MutationState::Success(4));
    }

    #[tokio::test]
    async fn failure_is_published() {
        let (_, ctl) = counter();
        let err = ctl.mutate(0).await.unwrap_err();
        assert!(err.is_local());
        assert_eq!(ctl.state().status(), MutationStatus::Failure);
        ctl.reset();
        assert_eq!(ctl.state(), MutationState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_is_observable() {
        let ctl = Arc::new(MutationController::new(MutationKey::new("slow"), |v: u32| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, SyncError>(v)
        }));
        let mut rx = ctl.subscribe();
        let task = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.mutate(7).await })
        };
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().status(), MutationStatus::Pending);
        assert_eq!(task.await.unwrap(), Ok(7));
        assert_eq!(ctl.state(), MutationState::Success(7));
    }

    #[tokio::test]
    async fn optimistic_edit_rolls_back_on_failure() {
        let cache = QueryCache::default();
        let key = QueryKey::new("numbers");
        let mut obs = cache.get(key.clone(), || async { Ok(vec![1u32]) });
        obs.settled().await;

        let (_, ctl) = counter();
        let apply = |v: &u32| {
            let mut edits = Optimistic::new(&cache);
            let v = *v;
            edits.set::<Vec<u32>, _>(&key, |cur| {
                let mut next = cur.cloned().unwrap_or_default();
                next.push(v);
                Some(next)
            });
            edits
        };

        assert_eq!(ctl.mutate_with(5, apply).await, Ok(10));
        assert_eq!(obs.current().data.as_deref(), Some(&vec![1, 5]));

        assert!(ctl.mutate_with(0, apply).await.is_err());
        assert_eq!(obs.current().data.as_deref(), Some(&vec![1, 5]));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_unwinds() {
        let cache = QueryCache::default();
        let key = QueryKey::new("flag");
        let mut obs = cache.get(key.clone(), || async { Ok(false) });
        obs.settled().await;

        let ctl = MutationController::new(MutationKey::new("hang"), |_: ()| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, SyncError>(())
        });
        let call = ctl.mutate_with((), |_| {
            let mut edits = Optimistic::new(&cache);
            edits.set::<bool, _>(&key, |_| Some(true));
            edits
        });
        let _ = tokio::time::timeout(Duration::from_secs(1), call).await;

        assert_eq!(obs.current().data.as_deref(), Some(&false));
        assert_eq!(ctl.state(), MutationState::Idle);
    }
}
