//! Process-wide cache of keyed queries and subscriptions.
//!
//! Every entry lives in one [`DashMap`] keyed by [`QueryKey`]. An entry is fed
//! either by a **fetcher** (a closure producing a one-shot future, used for
//! catalog pages) or by a **source** (a closure producing a long-lived stream,
//! used for the favorites store). Consumers cannot tell the two apart: both
//! hand out a [`QueryObserver`] whose [`QueryResult`] carries the same
//! `data` / `error` / `state` shape.
//!
//! Values are stored type-erased so one cache holds every data type; typed
//! observers downcast on read.
//!
//! Policy:
//! - At most one fetch per key is in flight. Callers arriving while it runs
//!   share it.
//! - Data older than `stale_time` is refetched on the next [`get`](QueryCache::get).
//! - An entry nobody observes is kept for `gc_time`, then dropped.
//! - A failed fetch never clears data that was already there.
//! - A cancelled fetch writes nothing and reports nothing.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::key::QueryKey;

/// How long fetched data counts as fresh: 30 seconds.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);

/// How long an unobserved entry is kept: 10 minutes.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(10 * 60);

type Erased = Arc<dyn Any + Send + Sync>;
type ErasedFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Erased, SyncError>> + Send + Sync>;
type ErasedSource = Arc<dyn Fn() -> BoxStream<'static, Result<Erased, SyncError>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub stale_time: Duration,
    pub gc_time: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            gc_time: DEFAULT_GC_TIME,
        }
    }
}

/// Externally visible lifecycle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Never loaded (or the only load was cancelled).
    Idle,
    Fetching,
    Fresh,
    /// Data present but older than `stale_time`, or explicitly invalidated.
    Stale,
    /// The last load failed and there is no data to fall back on.
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Fetching,
    Settled,
}

#[derive(Clone)]
enum Origin {
    Fetch(ErasedFetcher),
    Source(ErasedSource),
}

#[derive(Clone)]
struct Snapshot {
    data: Option<Erased>,
    error: Option<SyncError>,
    refetch_error: Option<SyncError>,
    phase: Phase,
    fetched_at: Option<Instant>,
    invalidated: bool,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            data: None,
            error: None,
            refetch_error: None,
            phase: Phase::Idle,
            fetched_at: None,
            invalidated: false,
        }
    }

    fn is_stale(&self, stale_time: Duration) -> bool {
        self.invalidated
            || self
                .fetched_at
                .is_none_or(|at| at.elapsed() >= stale_time)
    }

    fn state(&self, stale_time: Duration) -> FetchState {
        match self.phase {
            Phase::Fetching => FetchState::Fetching,
            _ if self.data.is_some() => {
                if self.is_stale(stale_time) {
                    FetchState::Stale
                } else {
                    FetchState::Fresh
                }
            }
            _ if self.error.is_some() => FetchState::Error,
            _ => FetchState::Idle,
        }
    }

    /// Phase to fall back to when a running load is abandoned.
    fn settle_back(&mut self) {
        self.phase = if self.data.is_some() || self.error.is_some() {
            Phase::Settled
        } else {
            Phase::Idle
        };
    }

    fn apply_success(&mut self, value: Erased) {
        self.data = Some(value);
        self.error = None;
        self.refetch_error = None;
        self.phase = Phase::Settled;
        self.fetched_at = Some(Instant::now());
        self.invalidated = false;
    }

    fn apply_failure(&mut self, error: SyncError) {
        self.phase = Phase::Settled;
        if self.data.is_some() {
            // Kept data is no longer current.
            self.refetch_error = Some(error);
            self.invalidated = true;
        } else {
            self.error = Some(error);
        }
    }
}

/// A running fetch or subscription driver.
struct Task {
    id: u64,
    cancel: CancellationToken,
}

struct Entry {
    key: QueryKey,
    /// `Duration::MAX` for subscriptions: live data never goes stale.
    stale_time: Duration,
    tx: watch::Sender<Snapshot>,
    origin: Mutex<Option<Origin>>,
    task: Mutex<Option<Task>>,
    subscribers: AtomicUsize,
    /// Bumped on every subscribe so a pending eviction can tell it was outlived.
    epoch: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Entry {
    fn new(key: QueryKey, stale_time: Duration) -> Self {
        let (tx, _) = watch::channel(Snapshot::empty());
        Self {
            key,
            stale_time,
            tx,
            origin: Mutex::new(None),
            task: Mutex::new(None),
            subscribers: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    fn origin(&self) -> Option<Origin> {
        lock(&self.origin).clone()
    }

    fn set_origin(&self, origin: Origin) {
        *lock(&self.origin) = Some(origin);
    }

    fn is_subscription(&self) -> bool {
        matches!(self.origin(), Some(Origin::Source(_)))
    }

    /// Abort whatever is running and fall back to the last settled phase.
    /// Caller holds the task slot.
    fn abort_locked(&self, slot: &mut Option<Task>) -> bool {
        match slot.take() {
            Some(task) => {
                task.cancel.cancel();
                self.tx.send_modify(Snapshot::settle_back);
                true
            }
            None => false,
        }
    }

    fn finish_fetch(&self, id: u64, outcome: Option<Result<Erased, SyncError>>) {
        let mut slot = lock(&self.task);
        // A different id means this fetch was cancelled and possibly replaced;
        // its result must not touch the entry.
        if !matches!(slot.as_ref(), Some(task) if task.id == id) {
            return;
        }
        *slot = None;

        match outcome {
            None => {
                tracing::debug!(key = %self.key, "fetch cancelled");
                self.tx.send_modify(Snapshot::settle_back);
            }
            Some(Ok(value)) => {
                tracing::debug!(key = %self.key, "fetch succeeded");
                self.tx.send_modify(|s| s.apply_success(value));
            }
            Some(Err(error)) => {
                tracing::warn!(key = %self.key, error = %error, "fetch failed");
                self.tx.send_modify(|s| s.apply_failure(error));
            }
        }
    }

    fn apply_emission(&self, id: u64, item: Result<Erased, SyncError>) {
        let slot = lock(&self.task);
        if !matches!(slot.as_ref(), Some(task) if task.id == id) {
            return;
        }
        match item {
            Ok(value) => {
                tracing::trace!(key = %self.key, "subscription emitted");
                self.tx.send_modify(|s| s.apply_success(value));
            }
            Err(error) => {
                tracing::warn!(key = %self.key, error = %error, "subscription source failed");
                self.tx.send_modify(|s| s.apply_failure(error));
            }
        }
    }

    fn finish_source(&self, id: u64) {
        let mut slot = lock(&self.task);
        if !matches!(slot.as_ref(), Some(task) if task.id == id) {
            return;
        }
        *slot = None;
        self.tx.send_modify(|s| {
            if s.phase == Phase::Fetching {
                s.settle_back();
            }
        });
    }
}

struct Inner {
    entries: DashMap<QueryKey, Arc<Entry>>,
    config: CacheConfig,
    root: CancellationToken,
    next_task_id: AtomicU64,
    fetches: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Handle to the shared cache. Cloning is cheap and every clone sees the
/// same entries.
///
/// Methods that start work spawn Tokio tasks and must be called from inside
/// a Tokio runtime.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                config,
                root: CancellationToken::new(),
                next_task_id: AtomicU64::new(1),
                fetches: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.config
    }

    /// Observe the query at `key`, fetching with `fetcher` when the entry is
    /// new, was never loaded, or holds stale data and nothing is in flight.
    ///
    /// Returns immediately; the observer reflects the current state and
    /// follows the fetch as it resolves. The latest `fetcher` is remembered
    /// for [`refresh`](Self::refresh) and [`invalidate`](Self::invalidate).
    pub fn get<T, F, Fut>(&self, key: QueryKey, fetcher: F) -> QueryObserver<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let fetcher: ErasedFetcher = Arc::new(move || {
            let fut = fetcher();
            Box::pin(async move { fut.await.map(|v| Arc::new(v) as Erased) })
        });

        let entry = self.acquire(key, self.inner.config.stale_time);
        entry.set_origin(Origin::Fetch(fetcher));
        let mut observer = QueryObserver::new(self.clone(), Arc::clone(&entry));

        if self.needs_fetch(&entry) {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            self.start_fetch(&entry);
        } else {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %entry.key, "cache hit");
        }
        observer.mark_seen();
        observer
    }

    /// [`get`](Self::get), wait for the load to settle, and return the data.
    ///
    /// Unlike `get`, an entry sitting in [`FetchState::Error`] is retried.
    /// `Ok(None)` means the load was cancelled before producing anything.
    pub async fn fetch<T, F, Fut>(&self, key: QueryKey, fetcher: F) -> Result<Option<Arc<T>>, SyncError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let mut observer = self.get(key, fetcher);
        if observer.current().state == FetchState::Error {
            self.start_fetch(&observer.entry);
            observer.mark_seen();
        }
        let result = observer.settled().await;
        match (result.data, result.error) {
            (Some(data), _) => Ok(Some(data)),
            (None, Some(error)) => Err(error),
            (None, None) => Ok(None),
        }
    }

    /// Observe a live source under `key`.
    ///
    /// The first observer starts the stream; every item replaces `data` and
    /// clears `error`. The stream keeps running while the entry is cached and
    /// stops when the entry is evicted, [`reset`](Self::reset), or the cache
    /// shuts down.
    pub fn subscribe<T, F, S>(&self, key: QueryKey, source: F) -> QueryObserver<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, SyncError>> + Send + 'static,
    {
        let source: ErasedSource = Arc::new(move || {
            source()
                .map(|item| item.map(|v| Arc::new(v) as Erased))
                .boxed()
        });

        let entry = self.acquire(key, Duration::MAX);
        entry.set_origin(Origin::Source(source));
        let mut observer = QueryObserver::new(self.clone(), Arc::clone(&entry));
        self.start_source(&entry);
        observer.mark_seen();
        observer
    }

    /// Load again now, regardless of staleness. Joins a fetch already in
    /// flight. Subscriptions are re-established instead.
    pub fn refresh(&self, key: &QueryKey) {
        let Some(entry) = self.lookup(key) else {
            return;
        };
        match entry.origin() {
            Some(Origin::Fetch(_)) => self.start_fetch(&entry),
            Some(Origin::Source(_)) => self.reset(key),
            None => {}
        }
    }

    /// Clear the error and start over: cancel what is running, then refetch
    /// (queries) or re-subscribe from scratch (subscriptions).
    pub fn reset(&self, key: &QueryKey) {
        let Some(entry) = self.lookup(key) else {
            return;
        };
        {
            let mut slot = lock(&entry.task);
            entry.abort_locked(&mut slot);
            entry.tx.send_modify(|s| {
                s.error = None;
                s.refetch_error = None;
                s.settle_back();
            });
        }
        match entry.origin() {
            Some(Origin::Fetch(_)) => self.start_fetch(&entry),
            Some(Origin::Source(_)) => self.start_source(&entry),
            None => {}
        }
    }

    /// Abort the in-flight fetch for `key`, if any. Nothing is written.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        let Some(entry) = self.lookup(key) else {
            return false;
        };
        let mut slot = lock(&entry.task);
        let cancelled = entry.abort_locked(&mut slot);
        if cancelled {
            tracing::debug!(key = %key, "fetch cancelled");
        }
        cancelled
    }

    /// Mark the query at `key` stale and refetch it if anyone is watching.
    /// Subscriptions are live already and are left alone.
    pub fn invalidate(&self, key: &QueryKey) {
        if let Some(entry) = self.lookup(key) {
            self.invalidate_entry(&entry);
        }
    }

    /// [`invalidate`](Self::invalidate) every entry whose key starts with `prefix`.
    /// Returns how many entries matched.
    pub fn invalidate_matching(&self, prefix: &QueryKey) -> usize {
        let matching: Vec<Arc<Entry>> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| Arc::clone(e.value()))
            .collect();
        for entry in &matching {
            self.invalidate_entry(entry);
        }
        matching.len()
    }

    /// Replace the data at `key` in place (optimistic update).
    ///
    /// `update` sees the current value and returns the new one, or `None` to
    /// leave the entry untouched. Returns a [`Rollback`] restoring the previous
    /// value, or `None` when nothing changed or the key is not cached.
    pub fn set_query_data<T, F>(&self, key: &QueryKey, update: F) -> Option<Rollback>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<&T>) -> Option<T>,
    {
        let entry = self.lookup(key)?;
        let _slot = lock(&entry.task);
        let mut rollback = None;
        entry.tx.send_if_modified(|s| {
            let current = s.data.as_ref().and_then(|d| (**d).downcast_ref::<T>());
            match update(current) {
                Some(next) => {
                    rollback = Some(Rollback {
                        key: key.clone(),
                        data: s.data.clone(),
                    });
                    s.data = Some(Arc::new(next));
                    s.error = None;
                    if s.phase == Phase::Idle {
                        s.phase = Phase::Settled;
                    }
                    if s.fetched_at.is_none() {
                        s.fetched_at = Some(Instant::now());
                    }
                    true
                }
                None => false,
            }
        });
        rollback
    }

    /// Undo a [`set_query_data`](Self::set_query_data). No-op if the entry is gone.
    pub fn restore_query_data(&self, rollback: Rollback) {
        let Some(entry) = self.lookup(&rollback.key) else {
            return;
        };
        let _slot = lock(&entry.task);
        entry.tx.send_modify(|s| {
            s.data = rollback.data;
            if s.data.is_none() {
                s.settle_back();
            }
        });
    }

    /// Cancel every running fetch and subscription. Entries stay readable.
    pub fn shutdown(&self) {
        tracing::debug!(entries = self.len(), "query cache shutting down");
        self.inner.root.cancel();
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Live observers of `key` (0 when not cached).
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.lookup(key)
            .map(|e| e.subscribers.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Current state of `key`, `None` when not cached.
    pub fn state(&self, key: &QueryKey) -> Option<FetchState> {
        self.lookup(key)
            .map(|e| e.tx.borrow().state(e.stale_time))
    }

    /// Fetcher executions since creation.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::Relaxed)
    }

    /// `get` calls served without starting a fetch.
    pub fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    /// `get` calls that started a fetch.
    pub fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    fn lookup(&self, key: &QueryKey) -> Option<Arc<Entry>> {
        self.inner.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Fetch-or-create the entry and register one subscriber, both under the
    /// shard lock so a concurrent eviction cannot orphan the entry.
    fn acquire(&self, key: QueryKey, stale_time: Duration) -> Arc<Entry> {
        let slot = self
            .inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Entry::new(key, stale_time)));
        slot.subscribers.fetch_add(1, Ordering::AcqRel);
        slot.epoch.fetch_add(1, Ordering::AcqRel);
        Arc::clone(slot.value())
    }

    fn needs_fetch(&self, entry: &Entry) -> bool {
        let slot = lock(&entry.task);
        if slot.is_some() {
            return false;
        }
        let snapshot = entry.tx.borrow();
        match snapshot.phase {
            Phase::Idle => true,
            Phase::Fetching => false,
            Phase::Settled => snapshot.data.is_some() && snapshot.is_stale(entry.stale_time),
        }
    }

    fn start_fetch(&self, entry: &Arc<Entry>) {
        let Some(Origin::Fetch(fetcher)) = entry.origin() else {
            return;
        };
        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.root.child_token();
        {
            let mut slot = lock(&entry.task);
            if slot.is_some() {
                tracing::trace!(key = %entry.key, "joining in-flight fetch");
                return;
            }
            *slot = Some(Task {
                id,
                cancel: cancel.clone(),
            });
            entry.tx.send_modify(|s| s.phase = Phase::Fetching);
        }

        self.inner.fetches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %entry.key, "fetch started");
        let fut = fetcher();
        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = fut => Some(result),
            };
            entry.finish_fetch(id, outcome);
        });
    }

    fn start_source(&self, entry: &Arc<Entry>) {
        let Some(Origin::Source(source)) = entry.origin() else {
            return;
        };
        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.root.child_token();
        {
            let mut slot = lock(&entry.task);
            if slot.is_some() {
                return;
            }
            *slot = Some(Task {
                id,
                cancel: cancel.clone(),
            });
            entry.tx.send_modify(|s| s.phase = Phase::Fetching);
        }

        tracing::debug!(key = %entry.key, "subscription started");
        let mut stream = source();
        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = stream.next() => item,
                };
                match item {
                    Some(item) => entry.apply_emission(id, item),
                    None => break,
                }
            }
            entry.finish_source(id);
        });
    }

    fn invalidate_entry(&self, entry: &Arc<Entry>) {
        if entry.is_subscription() {
            return;
        }
        entry.tx.send_modify(|s| s.invalidated = true);
        if entry.subscribers.load(Ordering::Acquire) > 0 {
            self.start_fetch(entry);
        }
    }

    /// Called when an observer drops.
    fn release(&self, entry: &Arc<Entry>) {
        if entry.subscribers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // Nobody is left to see a query result: stop paying for it.
        if !entry.is_subscription() {
            let mut slot = lock(&entry.task);
            if entry.abort_locked(&mut slot) {
                tracing::debug!(key = %entry.key, "fetch cancelled, no observers left");
            }
        }

        self.schedule_gc(entry);
    }

    fn schedule_gc(&self, entry: &Arc<Entry>) {
        // Observers can be dropped after the runtime is gone; nothing to collect then.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let epoch = entry.epoch.load(Ordering::Acquire);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let entry = Arc::clone(entry);
        let gc_time = self.inner.config.gc_time;

        handle.spawn(async move {
            tokio::time::sleep(gc_time).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let removed = inner.entries.remove_if(&entry.key, |_, current| {
                Arc::ptr_eq(current, &entry)
                    && current.subscribers.load(Ordering::Acquire) == 0
                    && current.epoch.load(Ordering::Acquire) == epoch
            });
            if removed.is_some() {
                let mut slot = lock(&entry.task);
                if let Some(task) = slot.take() {
                    task.cancel.cancel();
                }
                tracing::trace!(key = %entry.key, "evicted unobserved entry");
            }
        });
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("fetches", &self.fetch_count())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .field("stale_time", &self.inner.config.stale_time)
            .field("gc_time", &self.inner.config.gc_time)
            .finish()
    }
}

/// Token that restores the value replaced by an optimistic update.
#[derive(Clone)]
pub struct Rollback {
    key: QueryKey,
    data: Option<Erased>,
}

impl Rollback {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rollback")
            .field("key", &self.key)
            .field("had_data", &self.data.is_some())
            .finish()
    }
}

/// Typed snapshot of a cache entry.
///
/// `error` is only set when there is no data to show. When a refetch fails
/// while older data is still valid, the data stays and the failure is in
/// `refetch_error`.
#[derive(Debug)]
pub struct QueryResult<T> {
    pub data: Option<Arc<T>>,
    pub error: Option<SyncError>,
    pub refetch_error: Option<SyncError>,
    pub state: FetchState,
    pub fetched_at: Option<Instant>,
}

impl<T> Clone for QueryResult<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            refetch_error: self.refetch_error.clone(),
            state: self.state,
            fetched_at: self.fetched_at,
        }
    }
}

impl<T: Send + Sync + 'static> QueryResult<T> {
    fn from_snapshot(snapshot: &Snapshot, stale_time: Duration) -> Self {
        let data = snapshot.data.clone().and_then(|d| match d.downcast::<T>() {
            Ok(data) => Some(data),
            Err(_) => {
                tracing::error!(
                    expected = std::any::type_name::<T>(),
                    "cached value has a different type"
                );
                None
            }
        });
        Self {
            data,
            error: snapshot.error.clone(),
            refetch_error: snapshot.refetch_error.clone(),
            state: snapshot.state(stale_time),
            fetched_at: snapshot.fetched_at,
        }
    }
}

impl<T> QueryResult<T> {
    /// First load in progress: nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.state == FetchState::Fetching && self.data.is_none()
    }

    pub fn is_fetching(&self) -> bool {
        self.state == FetchState::Fetching
    }

    /// The failure worth showing in a banner, if any.
    pub fn banner_error(&self) -> Option<&SyncError> {
        self.error.as_ref().or(self.refetch_error.as_ref())
    }
}

/// One subscription to a cache entry. Dropping it releases the subscription;
/// the last release starts the entry's garbage-collection timer.
pub struct QueryObserver<T> {
    cache: QueryCache,
    entry: Arc<Entry>,
    rx: watch::Receiver<Snapshot>,
    _type: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> QueryObserver<T> {
    fn new(cache: QueryCache, entry: Arc<Entry>) -> Self {
        let rx = entry.tx.subscribe();
        Self {
            cache,
            entry,
            rx,
            _type: PhantomData,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.entry.key
    }

    pub fn current(&self) -> QueryResult<T> {
        QueryResult::from_snapshot(&self.rx.borrow(), self.entry.stale_time)
    }

    /// The state as of now counts as seen: `changed` waits for the next one.
    fn mark_seen(&mut self) {
        self.rx.mark_unchanged();
    }

    /// Wait for the next change to the entry and return the new state.
    pub async fn changed(&mut self) -> QueryResult<T> {
        // The sender lives in the entry we hold, so this cannot fail.
        let _ = self.rx.changed().await;
        QueryResult::from_snapshot(&self.rx.borrow_and_update(), self.entry.stale_time)
    }

    /// Wait until no load is running and return the settled state.
    pub async fn settled(&mut self) -> QueryResult<T> {
        let _ = self.rx.wait_for(|s| s.phase != Phase::Fetching).await;
        self.current()
    }

    pub fn refresh(&self) {
        self.cache.refresh(&self.entry.key);
    }

    pub fn reset(&self) {
        self.cache.reset(&self.entry.key);
    }

    /// Stream of states, starting with the current one. The stream keeps the
    /// subscription alive until it is dropped.
    pub fn into_stream(self) -> BoxStream<'static, QueryResult<T>> {
        let stale_time = self.entry.stale_time;
        let rx = self.rx.clone();
        WatchStream::new(rx)
            .map(move |snapshot| {
                let _subscription = &self;
                QueryResult::from_snapshot(&snapshot, stale_time)
            })
            .boxed()
    }
}

impl<T> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        self.cache.release(&self.entry);
    }
}

impl<T> std::fmt::Debug for QueryObserver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.entry.key)
            .finish()
    }
}
