//! Screen-level state for the presentation layer.
//!
//! Each screen publishes one read-only UI-state record through a
//! [`watch::Receiver`] and takes user intents through `dispatch`. The UI
//! never touches cache entries; it renders whatever the latest state says.
//!
//! UI state is derived, never edited by hand: every upstream change (a page
//! appended, the favorites set emitting) re-runs one render function over the
//! current inputs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::cache::{QueryCache, QueryObserver, QueryResult};
use crate::catalog::CatalogBackend;
use crate::error::SyncError;
use crate::favorites::{
    FavoriteToggle, FavoritesFilter, FavoritesReader, FavoritesSort, favorite_books, favorite_isbns,
};
use crate::infinite::{InfinitePage, InfiniteQueryController, LoadMore};
use crate::key::{FAVORITE_ISBNS, QueryKey, SEARCH_BOOKS};
use crate::merge::annotate_isbns;
use crate::model::{Book, SearchRequest, SortOrder};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Store failures are shown as a passing notice; everything else is a
/// screen error with a retry affordance.
fn split_error(error: Option<&SyncError>) -> (Option<SyncError>, Option<String>) {
    match error {
        Some(e) if e.is_local() => (None, Some(e.user_message())),
        Some(e) => (Some(e.clone()), None),
        None => (None, None),
    }
}

/// Cache key of a search sequence. Page numbers are appended per page.
pub fn search_key(query: &str, sort: SortOrder, size: u32) -> QueryKey {
    QueryKey::new(SEARCH_BOOKS)
        .tag(query)
        .tag(sort.token())
        .tag(format!("size={size}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchAction {
    Search { query: String },
    ChangeSort(SortOrder),
    LoadMore,
    ToggleFavorite { isbn: String },
    Retry,
    DismissNotice,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchUiState {
    pub query: String,
    pub sort: SortOrder,
    /// Every loaded page, annotated with favorite status.
    pub books: Vec<Book>,
    pub total_count: u64,
    pub is_loading: bool,
    pub is_end: bool,
    pub error: Option<SyncError>,
    /// Short-lived message (e.g. a failed favorite toggle).
    pub notice: Option<String>,
}

#[derive(Debug, Clone)]
struct ActiveSearch {
    base: QueryKey,
    query: String,
    sort: SortOrder,
}

struct SearchInner {
    cache: QueryCache,
    catalog: Arc<dyn CatalogBackend>,
    pages: InfiniteQueryController<Book>,
    toggle: Arc<FavoriteToggle>,
    page_size: u32,
    active: Mutex<Option<ActiveSearch>>,
    favorites: Mutex<QueryResult<HashSet<String>>>,
    state: watch::Sender<SearchUiState>,
}

impl SearchInner {
    fn render(&self) {
        let active = lock(&self.active).clone();
        let favorites = lock(&self.favorites).clone();
        let (_, favorites_notice) = split_error(favorites.banner_error());
        let isbns = favorites.data.unwrap_or_default();

        let data = active
            .as_ref()
            .map(|a| self.pages.data(&a.base))
            .unwrap_or_default();
        let (error, load_notice) = split_error(data.error.as_ref());
        let books = annotate_isbns(data.items(), &isbns);

        self.state.send_modify(|s| {
            if let Some(a) = &active {
                s.query = a.query.clone();
                s.sort = a.sort;
            }
            s.total_count = data.total_count().unwrap_or(books.len() as u64);
            s.books = books;
            s.is_loading = data.is_loading;
            s.is_end = data.is_end();
            s.error = error;
            if let Some(notice) = load_notice.or(favorites_notice) {
                s.notice = Some(notice);
            }
        });
    }

    async fn start(&self, query: String, sort: SortOrder) {
        let query = query.trim().to_string();
        let next = (!query.is_empty()).then(|| ActiveSearch {
            base: search_key(&query, sort, self.page_size),
            query: query.clone(),
            sort,
        });

        let previous = std::mem::replace(&mut *lock(&self.active), next.clone());
        if let Some(prev) = previous {
            if next.as_ref().is_none_or(|n| n.base != prev.base) {
                self.pages.discard(&prev.base);
            } else if self.pages.data(&prev.base).item_count() > 0 {
                // Same search again: keep what is loaded.
                self.render();
                return;
            }
        }

        if next.is_none() {
            self.state.send_modify(|s| {
                s.query = query;
                s.sort = sort;
            });
        }
        self.render();
        if next.is_some() {
            self.load_more().await;
        }
    }

    async fn load_more(&self) {
        let Some(active) = lock(&self.active).clone() else {
            return;
        };

        let catalog = Arc::clone(&self.catalog);
        let (query, sort, size) = (active.query.clone(), active.sort, self.page_size);
        let fetch_page = move |page: u32| {
            let catalog = Arc::clone(&catalog);
            let request = SearchRequest::new(query.clone(), sort, page, size);
            async move {
                let result = catalog.search(&request).await?;
                Ok(InfinitePage {
                    items: result.books,
                    page_param: page,
                    is_end: result.meta.is_end,
                    total_count: Some(result.meta.total_count),
                })
            }
        };

        self.state.send_modify(|s| s.is_loading = true);
        let outcome = self.pages.load_more(&active.base, fetch_page).await;
        tracing::debug!(key = %active.base, ?outcome, "search load_more");
        if outcome != LoadMore::Cancelled {
            self.render();
        }
    }

    async fn toggle_favorite(&self, isbn: &str) {
        let book = self
            .state
            .borrow()
            .books
            .iter()
            .find(|b| b.isbn == isbn)
            .cloned();
        let Some(book) = book else {
            tracing::debug!(isbn, "toggle for a book not on screen");
            return;
        };
        if let Err(e) = self.toggle.toggle(&book).await {
            self.state.send_modify(|s| s.notice = Some(e.user_message()));
        }
    }

    async fn retry(&self) {
        if lock(&self.favorites).error.is_some() {
            self.cache.reset(&QueryKey::new(FAVORITE_ISBNS));
        }
        if self.state.borrow().error.is_some() {
            self.load_more().await;
        }
    }
}

/// Catalog search with infinite scroll.
pub struct SearchScreen {
    inner: Arc<SearchInner>,
    _tasks: DropGuard,
}

impl SearchScreen {
    pub fn new(
        cache: QueryCache,
        catalog: Arc<dyn CatalogBackend>,
        favorites: Arc<dyn FavoritesReader>,
        toggle: Arc<FavoriteToggle>,
        page_size: u32,
    ) -> Self {
        let isbns = favorite_isbns(&cache, favorites);
        let (state, _) = watch::channel(SearchUiState::default());
        let inner = Arc::new(SearchInner {
            pages: InfiniteQueryController::new(cache.clone()),
            cache,
            catalog,
            toggle,
            page_size,
            active: Mutex::new(None),
            favorites: Mutex::new(isbns.current()),
            state,
        });

        let cancel = CancellationToken::new();
        tokio::spawn(follow_favorite_isbns(Arc::downgrade(&inner), isbns, cancel.clone()));
        Self {
            inner,
            _tasks: cancel.drop_guard(),
        }
    }

    pub fn state(&self) -> watch::Receiver<SearchUiState> {
        self.inner.state.subscribe()
    }

    pub fn current(&self) -> SearchUiState {
        self.inner.state.borrow().clone()
    }

    pub async fn dispatch(&self, action: SearchAction) {
        tracing::trace!(?action, "search action");
        let inner = &self.inner;
        match action {
            SearchAction::Search { query } => {
                let sort = inner.state.borrow().sort;
                inner.start(query, sort).await;
            }
            SearchAction::ChangeSort(sort) => {
                let query = inner.state.borrow().query.clone();
                inner.start(query, sort).await;
            }
            SearchAction::LoadMore => inner.load_more().await,
            SearchAction::ToggleFavorite { isbn } => inner.toggle_favorite(&isbn).await,
            SearchAction::Retry => inner.retry().await,
            SearchAction::DismissNotice => inner.state.send_modify(|s| s.notice = None),
        }
    }
}

async fn follow_favorite_isbns(
    inner: Weak<SearchInner>,
    mut isbns: QueryObserver<HashSet<String>>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = isbns.changed() => result,
        };
        let Some(screen) = inner.upgrade() else {
            break;
        };
        *lock(&screen.favorites) = result;
        screen.render();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FavoritesAction {
    SetQuery(String),
    SetSort(FavoritesSort),
    SetPriceOnly(bool),
    ToggleFavorite { isbn: String },
    Retry,
    DismissNotice,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FavoritesUiState {
    pub filter: FavoritesFilter,
    pub books: Vec<Book>,
    pub is_loading: bool,
    pub error: Option<SyncError>,
    pub notice: Option<String>,
}

struct FavoritesInner {
    cache: QueryCache,
    reader: Arc<dyn FavoritesReader>,
    toggle: Arc<FavoriteToggle>,
    state: watch::Sender<FavoritesUiState>,
    /// Stops the task following the current filter's subscription.
    view: Mutex<Option<DropGuard>>,
    /// Bumped per `show`; renders tagged with an older value are dropped.
    generation: Arc<AtomicU64>,
}

impl FavoritesInner {
    fn show(&self, filter: FavoritesFilter) {
        let view = FavoritesView {
            state: self.state.clone(),
            current: Arc::clone(&self.generation),
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
        };
        let observer = favorite_books(&self.cache, Arc::clone(&self.reader), filter.clone());
        self.state.send_modify(|s| s.filter = filter);
        view.render(&observer.current());

        let cancel = CancellationToken::new();
        // Replacing the guard stops the previous view; its entry ages out of the cache.
        *lock(&self.view) = Some(cancel.clone().drop_guard());
        tokio::spawn(follow_favorites(view, observer, cancel));
    }

    async fn toggle_favorite(&self, isbn: &str) {
        let book = self
            .state
            .borrow()
            .books
            .iter()
            .find(|b| b.isbn == isbn)
            .cloned();
        let Some(book) = book else {
            return;
        };
        if let Err(e) = self.toggle.toggle(&book).await {
            self.state.send_modify(|s| s.notice = Some(e.user_message()));
        }
    }
}

/// Render target for one filter. A view replaced by a later `show` stops
/// writing, even with a render already under way.
struct FavoritesView {
    state: watch::Sender<FavoritesUiState>,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl FavoritesView {
    fn render(&self, result: &QueryResult<Vec<Book>>) -> bool {
        let (error, notice) = split_error(result.banner_error());
        self.state.send_if_modified(|s| {
            // Checked under the channel lock so a newer view cannot be overwritten.
            if self.current.load(Ordering::Acquire) != self.generation {
                return false;
            }
            s.books = result.data.as_deref().cloned().unwrap_or_default();
            s.is_loading = result.is_loading();
            s.error = error;
            if notice.is_some() {
                s.notice = notice;
            }
            true
        })
    }
}

async fn follow_favorites(view: FavoritesView, mut observer: QueryObserver<Vec<Book>>, cancel: CancellationToken) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = observer.changed() => result,
        };
        if !view.render(&result) {
            break;
        }
    }
}

/// Live favorites list with filter and sort controls.
pub struct FavoritesScreen {
    inner: FavoritesInner,
}

impl FavoritesScreen {
    pub fn new(cache: QueryCache, reader: Arc<dyn FavoritesReader>, toggle: Arc<FavoriteToggle>) -> Self {
        let (state, _) = watch::channel(FavoritesUiState::default());
        let inner = FavoritesInner {
            cache,
            reader,
            toggle,
            state,
            view: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        };
        inner.show(FavoritesFilter::default());
        Self { inner }
    }

    pub fn state(&self) -> watch::Receiver<FavoritesUiState> {
        self.inner.state.subscribe()
    }

    pub fn current(&self) -> FavoritesUiState {
        self.inner.state.borrow().clone()
    }

    pub async fn dispatch(&self, action: FavoritesAction) {
        tracing::trace!(?action, "favorites action");
        let inner = &self.inner;
        let mut filter = inner.state.borrow().filter.clone();
        match action {
            FavoritesAction::SetQuery(query) => {
                filter.query = query;
                inner.show(filter);
            }
            FavoritesAction::SetSort(sort) => {
                filter.sort = sort;
                inner.show(filter);
            }
            FavoritesAction::SetPriceOnly(price_only) => {
                filter.price_only = price_only;
                inner.show(filter);
            }
            FavoritesAction::ToggleFavorite { isbn } => inner.toggle_favorite(&isbn).await,
            FavoritesAction::Retry => inner.cache.reset(&filter.key()),
            FavoritesAction::DismissNotice => inner.state.send_modify(|s| s.notice = None),
        }
    }
}
