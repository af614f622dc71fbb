//! Favorites: the narrow store interfaces the sync layer depends on, the
//! toggle mutation, and the filtered live views.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use bookshelf_store::{FavoriteBookRecord, FavoritesStore};
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::watch;

use crate::cache::{QueryCache, QueryObserver};
use crate::error::SyncError;
use crate::key::{FAVORITE_BOOKS, FAVORITE_ISBNS, MutationKey, QueryKey, TOGGLE_FAVORITE};
use crate::model::Book;
use crate::mutation::{MutationController, MutationState, Optimistic};

pub type FavoritesStream = BoxStream<'static, Result<Vec<FavoriteBookRecord>, SyncError>>;

/// Write side of the favorites store, all the toggle needs.
pub trait FavoritesWriter: Send + Sync {
    fn contains<'a>(
        &'a self,
        isbn: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, SyncError>> + Send + 'a>>;

    /// Upsert by ISBN.
    fn insert<'a>(
        &'a self,
        record: FavoriteBookRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send + 'a>>;

    /// Returns the number of rows removed.
    fn delete<'a>(
        &'a self,
        isbn: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, SyncError>> + Send + 'a>>;
}

/// Live read side of the favorites store.
pub trait FavoritesReader: Send + Sync {
    /// Emits the full list now and after every write.
    fn observe_all(&self) -> FavoritesStream;

    /// Like [`observe_all`](Self::observe_all), restricted to titles
    /// containing `text` (case-insensitive).
    fn observe_by_title(&self, text: &str) -> FavoritesStream;
}

impl FavoritesWriter for FavoritesStore {
    fn contains<'a>(
        &'a self,
        isbn: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, SyncError>> + Send + 'a>> {
        Box::pin(async move { Ok(FavoritesStore::contains(self, isbn).await?) })
    }

    fn insert<'a>(
        &'a self,
        record: FavoriteBookRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send + 'a>> {
        Box::pin(async move { Ok(FavoritesStore::insert(self, record).await?) })
    }

    fn delete<'a>(
        &'a self,
        isbn: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, SyncError>> + Send + 'a>> {
        Box::pin(async move { Ok(FavoritesStore::delete(self, isbn).await?) })
    }
}

impl FavoritesReader for FavoritesStore {
    fn observe_all(&self) -> FavoritesStream {
        FavoritesStore::observe_all(self)
            .map(|item| item.map_err(SyncError::from))
            .boxed()
    }

    fn observe_by_title(&self, text: &str) -> FavoritesStream {
        self.observe_by_title_substring(text)
            .map(|item| item.map_err(SyncError::from))
            .boxed()
    }
}

type IsbnLocks = DashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Flip a book's favorite status.
///
/// Toggles on the same ISBN are serialized, so the check-then-write is never
/// interleaved and each caller's returned state is the state it wrote.
/// Toggles on different ISBNs run concurrently.
pub struct FavoriteToggle {
    controller: MutationController<Book, bool>,
    cache: Option<QueryCache>,
}

impl FavoriteToggle {
    pub fn new(writer: Arc<dyn FavoritesWriter>) -> Self {
        let locks: Arc<IsbnLocks> = Arc::default();
        let controller = MutationController::new(MutationKey::new(TOGGLE_FAVORITE), move |book: Book| {
            let writer = Arc::clone(&writer);
            let locks = Arc::clone(&locks);
            async move { toggle(writer.as_ref(), &locks, &book).await }
        });
        Self {
            controller,
            cache: None,
        }
    }

    /// Flip the ISBN in the cached [`favorite_isbns`] set before the write
    /// lands, so annotated lists update at once. Undone if the write fails.
    pub fn with_optimistic_isbns(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Returns the new state: `true` when the book is now a favorite.
    pub async fn toggle(&self, book: &Book) -> Result<bool, SyncError> {
        let Some(cache) = &self.cache else {
            return self.controller.mutate(book.clone()).await;
        };
        self.controller
            .mutate_with(book.clone(), |book| {
                let isbn = book.isbn.clone();
                let mut edits = Optimistic::new(cache);
                edits.set::<HashSet<String>, _>(&QueryKey::new(FAVORITE_ISBNS), move |current| {
                    let mut next = current?.clone();
                    if !next.remove(&isbn) {
                        next.insert(isbn);
                    }
                    Some(next)
                });
                edits
            })
            .await
    }

    pub fn state(&self) -> MutationState<bool> {
        self.controller.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationState<bool>> {
        self.controller.subscribe()
    }
}

async fn toggle(writer: &dyn FavoritesWriter, locks: &IsbnLocks, book: &Book) -> Result<bool, SyncError> {
    let lock = Arc::clone(locks.entry(book.isbn.clone()).or_default().value());
    let now_favorite = {
        let _held = lock.lock().await;
        if writer.contains(&book.isbn).await? {
            writer.delete(&book.isbn).await?;
            false
        } else {
            writer.insert(book.to_record()).await?;
            true
        }
    };
    // Map + our clone: nobody else is waiting on this ISBN.
    locks.remove_if(&book.isbn, |_, l| Arc::strong_count(l) <= 2);
    tracing::debug!(isbn = %book.isbn, now_favorite, "favorite toggled");
    Ok(now_favorite)
}

/// Sort modes of the favorites list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FavoritesSort {
    /// Newest publication first.
    #[default]
    RecencyDesc,
    RecencyAsc,
    PriceAsc,
    PriceDesc,
}

impl FavoritesSort {
    pub fn token(self) -> &'static str {
        match self {
            FavoritesSort::RecencyDesc => "recency_desc",
            FavoritesSort::RecencyAsc => "recency_asc",
            FavoritesSort::PriceAsc => "price_asc",
            FavoritesSort::PriceDesc => "price_desc",
        }
    }
}

impl FromStr for FavoritesSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "recency_desc" | "recency" | "newest" => Ok(FavoritesSort::RecencyDesc),
            "recency_asc" | "oldest" => Ok(FavoritesSort::RecencyAsc),
            "price_asc" | "price" | "cheapest" => Ok(FavoritesSort::PriceAsc),
            "price_desc" => Ok(FavoritesSort::PriceDesc),
            other => Err(format!(
                "unknown favorites sort '{other}' (expected recency_desc, recency_asc, price_asc or price_desc)"
            )),
        }
    }
}

/// Parameters of a favorites view. Each distinct filter is its own cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FavoritesFilter {
    pub query: String,
    pub sort: FavoritesSort,
    /// Hide books without a positive price.
    pub price_only: bool,
}

impl FavoritesFilter {
    pub fn key(&self) -> QueryKey {
        QueryKey::new(FAVORITE_BOOKS)
            .tag(self.query.trim().to_lowercase())
            .tag(self.sort.token())
            .tag(if self.price_only { "priced" } else { "all" })
    }
}

/// Apply a filter to a full favorites list: title substring, then price,
/// then sort. Ties keep store order.
pub fn filter_favorites(records: &[FavoriteBookRecord], filter: &FavoritesFilter) -> Vec<Book> {
    let needle = filter.query.trim().to_lowercase();
    let mut books: Vec<Book> = records
        .iter()
        .filter(|r| needle.is_empty() || r.title.to_lowercase().contains(&needle))
        .map(Book::from_record)
        .filter(|b| !filter.price_only || b.effective_price() > 0)
        .collect();

    match filter.sort {
        FavoritesSort::RecencyDesc => books.sort_by(|a, b| b.datetime.cmp(&a.datetime)),
        FavoritesSort::RecencyAsc => books.sort_by(|a, b| a.datetime.cmp(&b.datetime)),
        FavoritesSort::PriceAsc => books.sort_by_key(Book::effective_price),
        FavoritesSort::PriceDesc => books.sort_by(|a, b| b.effective_price().cmp(&a.effective_price())),
    }
    books
}

/// Live, filtered favorites list cached under `filter.key()`.
pub fn favorite_books(
    cache: &QueryCache,
    reader: Arc<dyn FavoritesReader>,
    filter: FavoritesFilter,
) -> QueryObserver<Vec<Book>> {
    let key = filter.key();
    cache.subscribe(key, move || {
        let filter = filter.clone();
        let upstream = if filter.query.trim().is_empty() {
            reader.observe_all()
        } else {
            reader.observe_by_title(filter.query.trim())
        };
        upstream.map(move |item| item.map(|records| filter_favorites(&records, &filter)))
    })
}

/// Live set of favorite ISBNs, used to annotate catalog results.
pub fn favorite_isbns(cache: &QueryCache, reader: Arc<dyn FavoritesReader>) -> QueryObserver<HashSet<String>> {
    cache.subscribe(QueryKey::new(FAVORITE_ISBNS), move || {
        reader.observe_all().map(|item| {
            item.map(|records| records.into_iter().map(|r| r.isbn).collect::<HashSet<_>>())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FetchState;
    use crate::model::fixtures::book;
    use std::time::Duration;

    fn record(isbn: &str, title: &str, datetime: &str, price: &str, sale: &str) -> FavoriteBookRecord {
        let mut r = book(isbn, title).to_record();
        r.datetime = datetime.to_string();
        r.price = price.to_string();
        r.sale_price = sale.to_string();
        r
    }

    fn shelf() -> Vec<FavoriteBookRecord> {
        vec![
            record("1", "Dune", "2019-01-01T00:00:00+09:00", "15000", "13500"),
            record("2", "Dune Messiah", "2021-06-01T00:00:00+09:00", "12000", "-1"),
            record("3", "Hyperion", "2020-03-01T00:00:00+09:00", "", ""),
            record("4", "Children of DUNE", "2018-01-01T00:00:00+09:00", "9000", "0"),
        ]
    }

    fn isbns(books: &[Book]) -> Vec<&str> {
        books.iter().map(|b| b.isbn.as_str()).collect()
    }

    #[test]
    fn default_filter_sorts_newest_first() {
        let books = filter_favorites(&shelf(), &FavoritesFilter::default());
        assert_eq!(isbns(&books), vec!["2", "3", "1", "4"]);
        assert!(books.iter().all(|b| b.is_favorite));
    }

    #[test]
    fn title_filter_is_case_insensitive() {
        let filter = FavoritesFilter {
            query: "dune".into(),
            sort: FavoritesSort::RecencyAsc,
            price_only: false,
        };
        assert_eq!(isbns(&filter_favorites(&shelf(), &filter)), vec!["4", "1", "2"]);
    }

    #[test]
    fn price_filter_drops_unpriced() {
        let filter = FavoritesFilter {
            price_only: true,
            sort: FavoritesSort::PriceAsc,
            ..Default::default()
        };
        // Sale price when positive, else list price: 4 -> 9000, 2 -> 12000, 1 -> 13500.
        assert_eq!(isbns(&filter_favorites(&shelf(), &filter)), vec!["4", "2", "1"]);
    }

    #[test]
    fn price_desc_treats_non_numeric_as_zero() {
        let filter = FavoritesFilter {
            sort: FavoritesSort::PriceDesc,
            ..Default::default()
        };
        assert_eq!(isbns(&filter_favorites(&shelf(), &filter)), vec!["1", "2", "4", "3"]);
    }

    #[test]
    fn filters_map_to_distinct_keys() {
        let a = FavoritesFilter::default();
        let b = FavoritesFilter {
            price_only: true,
            ..Default::default()
        };
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().namespace(), FAVORITE_BOOKS);
        assert_eq!("price-desc".parse::<FavoritesSort>(), Ok(FavoritesSort::PriceDesc));
    }

    #[tokio::test]
    async fn toggle_flips_state() {
        let store = FavoritesStore::open_in_memory().unwrap();
        let toggle = FavoriteToggle::new(Arc::new(store.clone()));
        let dune = book("9788982737633", "Dune");

        assert_eq!(toggle.toggle(&dune).await, Ok(true));
        assert!(store.contains(&dune.isbn).await.unwrap());
        assert_eq!(toggle.toggle(&dune).await, Ok(false));
        assert!(!store.contains(&dune.isbn).await.unwrap());
        assert_eq!(toggle.state(), MutationState::Success(false));
    }

    #[tokio::test]
    async fn concurrent_toggles_on_one_isbn_are_serialized() {
        let store = FavoritesStore::open_in_memory().unwrap();
        let toggle = Arc::new(FavoriteToggle::new(Arc::new(store.clone())));
        let dune = book("1", "Dune");

        let (a, b) = tokio::join!(toggle.toggle(&dune), toggle.toggle(&dune));
        let mut results = vec![a.unwrap(), b.unwrap()];
        results.sort();
        assert_eq!(results, vec![false, true]);
        assert!(!store.contains("1").await.unwrap());
    }

    struct BrokenWriter;

    impl FavoritesWriter for BrokenWriter {
        fn contains<'a>(
            &'a self,
            _isbn: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<bool, SyncError>> + Send + 'a>> {
            Box::pin(async { Ok(false) })
        }

        fn insert<'a>(
            &'a self,
            _record: FavoriteBookRecord,
        ) -> Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send + 'a>> {
            Box::pin(async { Err(SyncError::LocalStore("disk I/O error".into())) })
        }

        fn delete<'a>(
            &'a self,
            _isbn: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<usize, SyncError>> + Send + 'a>> {
            Box::pin(async { Ok(0) })
        }
    }

    #[tokio::test]
    async fn failed_toggle_rolls_back_optimistic_flip() {
        let store = FavoritesStore::open_in_memory().unwrap();
        let cache = QueryCache::default();
        let mut ids = favorite_isbns(&cache, Arc::new(store));
        ids.settled().await;

        let toggle = FavoriteToggle::new(Arc::new(BrokenWriter)).with_optimistic_isbns(cache.clone());
        let err = toggle.toggle(&book("9", "Ubik")).await.unwrap_err();
        assert!(err.is_local());
        assert!(!ids.current().data.unwrap().contains("9"));
        assert_eq!(toggle.state().status(), crate::mutation::MutationStatus::Failure);
    }

    #[tokio::test]
    async fn favorites_view_follows_store_writes() {
        let store = FavoritesStore::open_in_memory().unwrap();
        let cache = QueryCache::default();
        let mut view = favorite_books(&cache, Arc::new(store.clone()), FavoritesFilter::default());
        let first = view.settled().await;
        assert_eq!(first.state, FetchState::Fresh);
        assert!(first.data.unwrap().is_empty());

        store.insert(book("1", "Dune").to_record()).await.unwrap();
        let updated = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let r = view.changed().await;
                if r.data.as_ref().is_some_and(|d| !d.is_empty()) {
                    break r;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(isbns(updated.data.as_deref().unwrap()), vec!["1"]);
    }

    #[tokio::test]
    async fn title_query_matches_non_ascii_titles() {
        let store = FavoritesStore::open_in_memory().unwrap();
        store.insert(book("1", "ÖKONOMIE").to_record()).await.unwrap();
        store.insert(book("2", "Dune").to_record()).await.unwrap();
        let cache = QueryCache::default();
        let filter = FavoritesFilter {
            query: "ökonomie".into(),
            ..Default::default()
        };
        let mut view = favorite_books(&cache, Arc::new(store), filter);
        let result = view.settled().await;
        assert_eq!(isbns(result.data.as_deref().unwrap()), vec!["1"]);
    }

    #[tokio::test]
    async fn favorite_isbns_tracks_membership() {
        let store = FavoritesStore::open_in_memory().unwrap();
        store.insert(book("7", "Solaris").to_record()).await.unwrap();
        let cache = QueryCache::default();
        let mut ids = favorite_isbns(&cache, Arc::new(store));
        let result = ids.settled().await;
        assert!(result.data.unwrap().contains("7"));
    }
}
