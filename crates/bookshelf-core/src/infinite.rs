//! Forward pagination on top of [`QueryCache`].
//!
//! A sequence is identified by a base [`QueryKey`] (query text, sort, ...).
//! Each page is an ordinary cache entry under `base + "page=N"`, so pages are
//! deduplicated and garbage-collected like any other query. The controller
//! only tracks which pages belong to which sequence, in order.
//!
//! Changing any parameter other than the page number means a new base key and
//! therefore a new, empty sequence. The old one is [`discard`]ed and its page
//! entries age out of the cache on their own.
//!
//! [`discard`]: InfiniteQueryController::discard

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::{FetchState, QueryCache, QueryObserver};
use crate::error::SyncError;
use crate::key::QueryKey;

/// First page number of every sequence.
pub const FIRST_PAGE: u32 = 1;

/// One fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfinitePage<T> {
    pub items: Vec<T>,
    pub page_param: u32,
    /// No page follows this one.
    pub is_end: bool,
    /// Size of the whole result set, when the source reports it.
    pub total_count: Option<u64>,
}

/// Accumulated state of one sequence.
#[derive(Debug)]
pub struct InfiniteData<T> {
    pub pages: Vec<Arc<InfinitePage<T>>>,
    pub is_loading: bool,
    /// Failure of the most recent `load_more`; cleared by the next attempt.
    pub error: Option<SyncError>,
}

impl<T> Clone for InfiniteData<T> {
    fn clone(&self) -> Self {
        Self {
            pages: self.pages.clone(),
            is_loading: self.is_loading,
            error: self.error.clone(),
        }
    }
}

impl<T> Default for InfiniteData<T> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            is_loading: false,
            error: None,
        }
    }
}

impl<T> InfiniteData<T> {
    /// Every item across pages, in page order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|p| p.items.iter())
    }

    pub fn item_count(&self) -> usize {
        self.pages.iter().map(|p| p.items.len()).sum()
    }

    /// Result-set size reported by the most recent page.
    pub fn total_count(&self) -> Option<u64> {
        self.pages.last().and_then(|p| p.total_count)
    }

    /// The last page reported end of results.
    pub fn is_end(&self) -> bool {
        self.pages.last().is_some_and(|p| p.is_end)
    }

    /// Page to fetch next, or `None` once the end was reached.
    pub fn next_page_param(&self) -> Option<u32> {
        match self.pages.last() {
            None => Some(FIRST_PAGE),
            Some(last) if last.is_end => None,
            Some(last) => Some(last.page_param + 1),
        }
    }
}

/// What a [`load_more`](InfiniteQueryController::load_more) call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadMore {
    Appended { page: u32, items: usize },
    /// The sequence already ended; nothing was fetched.
    EndReached,
    /// A load for the next page is already running; nothing was fetched.
    AlreadyLoading,
    /// The sequence was discarded while loading.
    Cancelled,
    Failed(SyncError),
}

struct Sequence<T> {
    tx: watch::Sender<InfiniteData<T>>,
    loading: AtomicBool,
    cancel: CancellationToken,
    /// Keep the page entries alive (and out of GC) while the sequence exists.
    pages: Mutex<Vec<QueryObserver<InfinitePage<T>>>>,
}

impl<T> Sequence<T> {
    fn new() -> Self {
        let (tx, _) = watch::channel(InfiniteData::default());
        Self {
            tx,
            loading: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            pages: Mutex::new(Vec::new()),
        }
    }
}

/// Clears the loading flag however `load_more` exits, including when its
/// future is dropped mid-fetch.
struct LoadingGuard<'a, T>(&'a Sequence<T>);

impl<T> Drop for LoadingGuard<'_, T> {
    fn drop(&mut self) {
        self.0.loading.store(false, Ordering::Release);
        self.0.tx.send_if_modified(|d| std::mem::replace(&mut d.is_loading, false));
    }
}

pub struct InfiniteQueryController<T> {
    cache: QueryCache,
    sequences: DashMap<QueryKey, Arc<Sequence<T>>>,
}

impl<T: Send + Sync + 'static> InfiniteQueryController<T> {
    pub fn new(cache: QueryCache) -> Self {
        Self {
            cache,
            sequences: DashMap::new(),
        }
    }

    fn sequence(&self, base: &QueryKey) -> Arc<Sequence<T>> {
        Arc::clone(
            self.sequences
                .entry(base.clone())
                .or_insert_with(|| Arc::new(Sequence::new()))
                .value(),
        )
    }

    /// Watch the accumulated pages of `base`, creating an empty sequence if
    /// there is none yet.
    pub fn observe(&self, base: &QueryKey) -> watch::Receiver<InfiniteData<T>> {
        self.sequence(base).tx.subscribe()
    }

    /// Snapshot of the sequence for `base` (empty if none).
    pub fn data(&self, base: &QueryKey) -> InfiniteData<T> {
        self.sequences
            .get(base)
            .map(|s| s.tx.borrow().clone())
            .unwrap_or_default()
    }

    /// Fetch the next page of `base` with `fetch_page(page)` and append it.
    ///
    /// Starts at page 1 on an empty sequence. Does nothing when the sequence
    /// has ended or a load is already running.
    pub async fn load_more<F, Fut>(&self, base: &QueryKey, fetch_page: F) -> LoadMore
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<InfinitePage<T>, SyncError>> + Send + 'static,
    {
        let seq = self.sequence(base);
        if seq.loading.swap(true, Ordering::AcqRel) {
            tracing::trace!(key = %base, "load_more ignored, already loading");
            return LoadMore::AlreadyLoading;
        }
        let _guard = LoadingGuard(&seq);

        let Some(page) = seq.tx.borrow().next_page_param() else {
            tracing::trace!(key = %base, "load_more ignored, end reached");
            return LoadMore::EndReached;
        };
        seq.tx.send_modify(|d| {
            d.is_loading = true;
            d.error = None;
        });

        let key = base.with_tag(format!("page={page}"));
        let mut observer = self.cache.get(key, move || fetch_page(page));
        if observer.current().state == FetchState::Error {
            observer.refresh();
        }

        let result = tokio::select! {
            biased;
            _ = seq.cancel.cancelled() => return LoadMore::Cancelled,
            result = observer.settled() => result,
        };

        match (result.data, result.error) {
            (Some(fetched), _) => {
                let items = fetched.items.len();
                seq.tx.send_modify(|d| d.pages.push(fetched));
                seq.pages
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(observer);
                tracing::debug!(key = %base, page, items, "page appended");
                LoadMore::Appended { page, items }
            }
            (None, Some(error)) => {
                seq.tx.send_modify(|d| d.error = Some(error.clone()));
                LoadMore::Failed(error)
            }
            (None, None) => LoadMore::Cancelled,
        }
    }

    /// Drop the sequence for `base`. A load in progress is abandoned and its
    /// fetch cancelled; the page entries become eligible for GC.
    pub fn discard(&self, base: &QueryKey) {
        if let Some((_, seq)) = self.sequences.remove(base) {
            seq.cancel.cancel();
            tracing::debug!(key = %base, "sequence discarded");
        }
    }

    /// Start `base` over from page 1, refetching the pages (pull-to-refresh).
    pub fn restart(&self, base: &QueryKey) {
        self.discard(base);
        self.cache.invalidate_matching(base);
    }

    /// Number of live sequences.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn page(page_param: u32, items: std::ops::Range<u32>, is_end: bool) -> InfinitePage<u32> {
        InfinitePage {
            items: items.collect(),
            page_param,
            is_end,
            total_count: None,
        }
    }

    /// Two pages: 0..3 then 3..5 (end).
    fn two_pages(calls: Arc<AtomicUsize>) -> impl Fn(u32) -> std::future::Ready<Result<InfinitePage<u32>, SyncError>> + Send + Sync + 'static {
        move |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(match n {
                1 => page(1, 0..3, false),
                _ => page(n, 3..5, true),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn appends_in_order_then_stops_at_end() {
        let ctl = InfiniteQueryController::new(QueryCache::default());
        let base = QueryKey::new("numbers").tag("all");
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(
            ctl.load_more(&base, two_pages(calls.clone())).await,
            LoadMore::Appended { page: 1, items: 3 }
        );
        assert_eq!(
            ctl.load_more(&base, two_pages(calls.clone())).await,
            LoadMore::Appended { page: 2, items: 2 }
        );
        assert_eq!(ctl.load_more(&base, two_pages(calls.clone())).await, LoadMore::EndReached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let data = ctl.data(&base);
        assert_eq!(data.items().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(data.is_end());
        assert!(!data.is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_first_page_is_terminal() {
        let ctl = InfiniteQueryController::new(QueryCache::default());
        let base = QueryKey::new("numbers").tag("none");
        let outcome = ctl
            .load_more(&base, |n| async move { Ok(page(n, 0..0, true)) })
            .await;
        assert_eq!(outcome, LoadMore::Appended { page: 1, items: 0 });
        let again = ctl
            .load_more(&base, |n| async move { Ok(page(n, 0..0, true)) })
            .await;
        assert_eq!(again, LoadMore::EndReached);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_load_more_fetches_once() {
        let ctl = InfiniteQueryController::new(QueryCache::default());
        let base = QueryKey::new("numbers").tag("slow");
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = {
            let calls = calls.clone();
            move |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(page(n, 0..2, false))
                }
            }
        };

        let (a, b) = tokio::join!(ctl.load_more(&base, slow.clone()), ctl.load_more(&base, slow));
        assert_eq!(a, LoadMore::Appended { page: 1, items: 2 });
        assert_eq!(b, LoadMore::AlreadyLoading);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.data(&base).pages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_recorded_and_retry_refetches_same_page() {
        let ctl = InfiniteQueryController::new(QueryCache::default());
        let base = QueryKey::new("numbers").tag("flaky");
        let calls = Arc::new(AtomicUsize::new(0));
        let flaky = {
            let calls = calls.clone();
            move |n| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(SyncError::TransientNetwork("timed out".into()))
                    } else {
                        Ok(page(n, 0..1, true))
                    }
                }
            }
        };

        let outcome = ctl.load_more(&base, flaky.clone()).await;
        assert!(matches!(outcome, LoadMore::Failed(SyncError::TransientNetwork(_))));
        assert!(ctl.data(&base).error.is_some());
        assert!(ctl.data(&base).pages.is_empty());

        let outcome = ctl.load_more(&base, flaky).await;
        assert_eq!(outcome, LoadMore::Appended { page: 1, items: 1 });
        assert!(ctl.data(&base).error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn new_identity_starts_at_page_one() {
        let ctl = InfiniteQueryController::new(QueryCache::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let by_accuracy = QueryKey::new("numbers").tag("accuracy");
        ctl.load_more(&by_accuracy, two_pages(calls.clone())).await;

        ctl.discard(&by_accuracy);
        let by_latest = QueryKey::new("numbers").tag("latest");
        let outcome = ctl.load_more(&by_latest, two_pages(calls.clone())).await;
        assert_eq!(outcome, LoadMore::Appended { page: 1, items: 3 });
        assert!(ctl.data(&by_accuracy).pages.is_empty());
        assert_eq!(ctl.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_cancels_in_flight_load() {
        let ctl = Arc::new(InfiniteQueryController::new(QueryCache::default()));
        let base = QueryKey::new("numbers").tag("slow");
        let task = {
            let ctl = ctl.clone();
            let base = base.clone();
            tokio::spawn(async move {
                ctl.load_more(&base, |n| async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(page(n, 0..1, false))
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctl.discard(&base);
        assert_eq!(task.await.unwrap(), LoadMore::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_refetches_from_first_page() {
        let cache = QueryCache::default();
        let ctl = InfiniteQueryController::new(cache.clone());
        let base = QueryKey::new("numbers").tag("all");
        let calls = Arc::new(AtomicUsize::new(0));
        ctl.load_more(&base, two_pages(calls.clone())).await;
        ctl.load_more(&base, two_pages(calls.clone())).await;

        ctl.restart(&base);
        let outcome = ctl.load_more(&base, two_pages(calls.clone())).await;
        assert_eq!(outcome, LoadMore::Appended { page: 1, items: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctl.data(&base).pages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_pages_arrive() {
        let ctl = InfiniteQueryController::new(QueryCache::default());
        let base = QueryKey::new("numbers").tag("all");
        let mut rx = ctl.observe(&base);
        assert!(rx.borrow().pages.is_empty());

        ctl.load_more(&base, two_pages(Arc::new(AtomicUsize::new(0)))).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().item_count(), 3);
    }
}
