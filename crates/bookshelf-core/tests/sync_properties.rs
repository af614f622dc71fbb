//! End-to-end properties of the sync layer, driven through the public API
//! with a scripted catalog and an in-memory favorites store.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bookshelf_core::favorites::{FavoritesReader, favorite_isbns};
use bookshelf_core::infinite::InfinitePage;
use bookshelf_core::key::SEARCH_BOOKS;
use bookshelf_core::merge::merge;
use bookshelf_core::screens::search_key;
use bookshelf_core::{
    Book, Bookshelf, CacheConfig, CatalogBackend, Config, FavoriteToggle, FetchState,
    InfiniteQueryController, LoadMore, MockCatalog, MockResponse, QueryCache, QueryKey,
    SearchAction, SearchRequest, SortOrder, SyncError,
};
use bookshelf_store::FavoritesStore;
use futures_util::StreamExt;
use tokio::sync::watch;

fn book(isbn: &str, title: &str) -> Book {
    Book {
        title: title.to_string(),
        contents: String::new(),
        url: String::new(),
        isbn: isbn.to_string(),
        datetime: None,
        authors: vec!["Frank Herbert".into()],
        publisher: "Ace".into(),
        translators: vec![],
        price: 15000,
        sale_price: 0,
        thumbnail: String::new(),
        status: String::new(),
        is_favorite: false,
    }
}

fn library(n: usize) -> Vec<Book> {
    (0..n).map(|i| book(&format!("978{i:010}"), &format!("Dune vol. {i}"))).collect()
}

fn page_fetcher(
    catalog: Arc<MockCatalog>,
    query: &'static str,
    sort: SortOrder,
) -> impl Fn(u32) -> std::pin::Pin<Box<dyn Future<Output = Result<InfinitePage<Book>, SyncError>> + Send>>
+ Send
+ Sync
+ 'static {
    move |page| {
        let catalog = Arc::clone(&catalog);
        Box::pin(async move {
            let result = catalog.search(&SearchRequest::new(query, sort, page, 20)).await?;
            Ok(InfinitePage {
                items: result.books,
                page_param: page,
                is_end: result.meta.is_end,
                total_count: Some(result.meta.total_count),
            })
        })
    }
}

fn session(catalog: Arc<MockCatalog>) -> Bookshelf {
    let config = Config {
        db_path: None,
        ..Config::default()
    };
    let store = FavoritesStore::open_in_memory().unwrap();
    Bookshelf::with_parts(&config, catalog, store)
}

#[tokio::test(start_paused = true)]
async fn concurrent_gets_share_one_fetch() {
    let cache = QueryCache::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = QueryKey::new(SEARCH_BOOKS).tag("dune");

    let observers: Vec<_> = (0..8)
        .map(|_| {
            let calls = Arc::clone(&calls);
            cache.get(key.clone(), move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, SyncError>(vec![book("1", "Dune")])
                }
            })
        })
        .collect();

    for mut observer in observers {
        assert_eq!(observer.settled().await.data.unwrap().len(), 1);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_entry_refetches_exactly_once() {
    let cache = QueryCache::new(CacheConfig {
        stale_time: Duration::from_secs(30),
        ..CacheConfig::default()
    });
    let key = QueryKey::new(SEARCH_BOOKS).tag("dune");
    let fetcher = || async { Ok::<_, SyncError>(1u32) };

    let mut first = cache.get(key.clone(), fetcher);
    first.settled().await;
    assert_eq!(first.current().state, FetchState::Fresh);

    tokio::time::advance(Duration::from_secs(29)).await;
    let _hit = cache.get(key.clone(), fetcher);
    assert_eq!(cache.fetch_count(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(first.current().state, FetchState::Stale);
    let mut a = cache.get(key.clone(), fetcher);
    let _b = cache.get(key.clone(), fetcher);
    a.settled().await;
    assert_eq!(cache.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn pages_append_until_end() {
    let cache = QueryCache::default();
    let catalog = Arc::new(MockCatalog::with_library(library(30)));
    let pages = InfiniteQueryController::new(cache);
    let base = search_key("dune", SortOrder::Accuracy, 20);
    let fetch = page_fetcher(Arc::clone(&catalog), "dune", SortOrder::Accuracy);

    assert_eq!(
        pages.load_more(&base, fetch).await,
        LoadMore::Appended { page: 1, items: 20 }
    );
    let fetch = page_fetcher(Arc::clone(&catalog), "dune", SortOrder::Accuracy);
    assert_eq!(
        pages.load_more(&base, fetch).await,
        LoadMore::Appended { page: 2, items: 10 }
    );
    let fetch = page_fetcher(Arc::clone(&catalog), "dune", SortOrder::Accuracy);
    assert_eq!(pages.load_more(&base, fetch).await, LoadMore::EndReached);

    let data = pages.data(&base);
    let isbns: Vec<_> = data.items().map(|b| b.isbn.clone()).collect();
    let expected: Vec<_> = library(30).into_iter().map(|b| b.isbn).collect();
    assert_eq!(isbns, expected);
    assert_eq!(catalog.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn new_sort_starts_from_page_one() {
    let cache = QueryCache::default();
    let catalog = Arc::new(MockCatalog::with_library(library(60)));
    let pages = InfiniteQueryController::new(cache);

    let accuracy = search_key("dune", SortOrder::Accuracy, 20);
    for _ in 0..2 {
        let fetch = page_fetcher(Arc::clone(&catalog), "dune", SortOrder::Accuracy);
        pages.load_more(&accuracy, fetch).await;
    }
    pages.discard(&accuracy);

    let latest = search_key("dune", SortOrder::Latest, 20);
    let fetch = page_fetcher(Arc::clone(&catalog), "dune", SortOrder::Latest);
    assert_eq!(
        pages.load_more(&latest, fetch).await,
        LoadMore::Appended { page: 1, items: 20 }
    );
    let last = catalog.requests().pop().unwrap();
    assert_eq!((last.page, last.sort), (1, SortOrder::Latest));
    assert_eq!(pages.data(&latest).item_count(), 20);
}

#[tokio::test]
async fn double_toggle_matches_store() {
    let store = FavoritesStore::open_in_memory().unwrap();
    let toggle = FavoriteToggle::new(Arc::new(store.clone()));
    let dune = book("9780441013593", "Dune");

    assert!(toggle.toggle(&dune).await.unwrap());
    let second = toggle.toggle(&dune).await.unwrap();
    assert!(!second);
    assert_eq!(store.contains(&dune.isbn).await.unwrap(), second);
}

#[tokio::test]
async fn concurrent_toggles_agree_with_store() {
    let store = FavoritesStore::open_in_memory().unwrap();
    let toggle = Arc::new(FavoriteToggle::new(Arc::new(store.clone())));
    let dune = book("9780441013593", "Dune");

    let (a, b) = tokio::join!(toggle.toggle(&dune), toggle.toggle(&dune));
    let mut results = vec![a.unwrap(), b.unwrap()];
    results.sort();
    assert_eq!(results, vec![false, true]);
    assert!(!store.contains(&dune.isbn).await.unwrap());
}

#[tokio::test]
async fn favorites_change_re_annotates_without_refetch() {
    let store = FavoritesStore::open_in_memory().unwrap();
    let a = book("1", "A");
    let b = book("2", "B");
    store.insert(a.to_record()).await.unwrap();

    let (books_tx, books_rx) = watch::channel(vec![a.clone(), b.clone()]);
    let books = tokio_stream::wrappers::WatchStream::new(books_rx);
    let favorites = store.observe_all().filter_map(|r| async move { r.ok() });
    let mut merged = merge(books, favorites);

    let flags = |books: Vec<Book>| books.iter().map(|b| b.is_favorite).collect::<Vec<_>>();
    assert_eq!(flags(merged.next().await.unwrap()), vec![true, false]);

    store.insert(b.to_record()).await.unwrap();
    assert_eq!(flags(merged.next().await.unwrap()), vec![true, true]);
    drop(books_tx);
}

#[tokio::test]
async fn dune_search_shows_fifteen_unfavorited_books() {
    let catalog = Arc::new(MockCatalog::with_library(library(15)));
    let shelf = session(Arc::clone(&catalog));
    let screen = shelf.search_screen();

    screen.dispatch(SearchAction::Search { query: "dune".into() }).await;
    let state = screen.current();
    assert_eq!(state.books.len(), 15);
    assert!(state.is_end);
    assert!(state.books.iter().all(|b| !b.is_favorite));

    let request = catalog.requests()[0].clone();
    assert_eq!(
        request,
        SearchRequest::new("dune", SortOrder::Accuracy, 1, 20)
    );

    screen.dispatch(SearchAction::LoadMore).await;
    assert_eq!(catalog.call_count(), 1);
    assert_eq!(screen.current().books.len(), 15);
}

#[tokio::test]
async fn favorited_search_result_is_the_only_favorite() {
    let catalog = Arc::new(MockCatalog::with_library(library(15)));
    let shelf = session(catalog);
    let search = shelf.search_screen();
    search.dispatch(SearchAction::Search { query: "dune".into() }).await;
    let pick = search.current().books[3].isbn.clone();

    search.dispatch(SearchAction::ToggleFavorite { isbn: pick.clone() }).await;

    let favorites = shelf.favorites_screen();
    let mut rx = favorites.state();
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.books.is_empty()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(state.books.len(), 1);
    assert_eq!(state.books[0].isbn, pick);
    assert!(state.books[0].is_favorite);
}

#[tokio::test(start_paused = true)]
async fn timed_out_refetch_keeps_data_and_retries_once() {
    let cache = QueryCache::default();
    let key = QueryKey::new(SEARCH_BOOKS).tag("dune");
    let attempts = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let attempts = Arc::clone(&attempts);
        move || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                let slow = async {
                    if attempt == 2 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    vec![book("1", "Dune")]
                };
                tokio::time::timeout(Duration::from_secs(15), slow)
                    .await
                    .map_err(|_| SyncError::TransientNetwork("request timed out".into()))
            }
        }
    };

    let mut observer = cache.get(key.clone(), fetcher);
    assert!(observer.settled().await.data.is_some());

    observer.refresh();
    let result = observer.settled().await;
    assert_eq!(result.data.as_deref().map(Vec::len), Some(1));
    let banner = result.banner_error().cloned().unwrap();
    assert!(banner.is_retryable());

    let before = cache.fetch_count();
    observer.refresh();
    let result = observer.settled().await;
    assert_eq!(cache.fetch_count(), before + 1);
    assert!(result.banner_error().is_none());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limited_search_surfaces_rejection() {
    let catalog = Arc::new(MockCatalog::new(MockResponse::Fail(SyncError::rejection(
        429,
        Some(Duration::from_secs(3)),
    ))));
    let shelf = session(catalog);
    let screen = shelf.search_screen();
    screen.dispatch(SearchAction::Search { query: "dune".into() }).await;

    let state = screen.current();
    let error = state.error.unwrap();
    assert!(!error.is_retryable());
    assert_eq!(error.user_message(), "Too many requests. Try again shortly.");
    assert!(state.books.is_empty());
}

#[tokio::test]
async fn favorite_isbns_follow_the_store() {
    let store = FavoritesStore::open_in_memory().unwrap();
    let cache = QueryCache::default();
    let reader: Arc<dyn FavoritesReader> = Arc::new(store.clone());
    let mut ids = favorite_isbns(&cache, reader)
        .into_stream()
        .filter_map(|result| async move { result.data })
        .boxed();

    assert_eq!(*ids.next().await.unwrap(), HashSet::new());

    store.insert(book("7", "Seven").to_record()).await.unwrap();
    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(set) = ids.next().await {
            if set.contains("7") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(seen);
}
