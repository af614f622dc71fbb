//! Async, observable wrapper around [`FavoritesDatabase`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::{FavoriteBookRecord, FavoritesDatabase, StoreError};

/// Stream of full snapshots, re-read after every write to the store.
pub type RecordStream = BoxStream<'static, Result<Vec<FavoriteBookRecord>, StoreError>>;

/// Shared favorites store.
///
/// Cloning is cheap; all clones see the same connection and the same change
/// counter. Writes are serialized by the connection mutex, which is the only
/// write ordering this layer provides.
#[derive(Clone)]
pub struct FavoritesStore {
    db: Arc<Mutex<FavoritesDatabase>>,
    changes: Arc<watch::Sender<u64>>,
}

impl FavoritesStore {
    pub fn new(db: FavoritesDatabase) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            db: Arc::new(Mutex::new(db)),
            changes: Arc::new(changes),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = FavoritesDatabase::open(path)?;
        tracing::info!(path = %path.display(), "opened favorites store");
        Ok(Self::new(db))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(FavoritesDatabase::open_in_memory()?))
    }

    /// Upsert by ISBN.
    pub async fn insert(&self, record: FavoriteBookRecord) -> Result<(), StoreError> {
        let isbn = record.isbn.clone();
        self.with_db(move |db| db.insert(&record)).await?;
        tracing::debug!(isbn, "favorite inserted");
        self.notify();
        Ok(())
    }

    /// Returns the number of rows removed (0 or 1).
    pub async fn delete(&self, isbn: &str) -> Result<usize, StoreError> {
        let key = isbn.to_string();
        let removed = self.with_db(move |db| db.delete(&key)).await?;
        tracing::debug!(isbn, removed, "favorite deleted");
        if removed > 0 {
            self.notify();
        }
        Ok(removed)
    }

    pub async fn get(&self, isbn: &str) -> Result<Option<FavoriteBookRecord>, StoreError> {
        let key = isbn.to_string();
        self.with_db(move |db| db.get(&key)).await
    }

    pub async fn contains(&self, isbn: &str) -> Result<bool, StoreError> {
        let key = isbn.to_string();
        self.with_db(move |db| db.contains(&key)).await
    }

    pub async fn get_all(&self) -> Result<Vec<FavoriteBookRecord>, StoreError> {
        self.with_db(|db| db.get_all()).await
    }

    pub async fn search_by_title(&self, text: &str) -> Result<Vec<FavoriteBookRecord>, StoreError> {
        let text = text.to_string();
        self.with_db(move |db| db.search_by_title(&text)).await
    }

    /// Live view of every favorite. Emits the current rows immediately, then
    /// again after each write. Bursts of writes may be coalesced into one
    /// emission, which always reflects the latest state.
    pub fn observe_all(&self) -> RecordStream {
        self.observe(None)
    }

    /// Live view of favorites whose title contains `text` (ASCII case-insensitive).
    pub fn observe_by_title_substring(&self, text: &str) -> RecordStream {
        self.observe(Some(text.to_string()))
    }

    /// Number of writes observed since the store was created.
    pub fn version(&self) -> u64 {
        *self.changes.borrow()
    }

    fn observe(&self, title: Option<String>) -> RecordStream {
        let store = self.clone();
        WatchStream::new(self.changes.subscribe())
            .then(move |_| {
                let store = store.clone();
                let title = title.clone();
                async move {
                    match title {
                        Some(text) => store.search_by_title(&text).await,
                        None => store.get_all().await,
                    }
                }
            })
            .boxed()
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v += 1);
    }

    async fn with_db<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&FavoritesDatabase) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let db = db.lock().map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&db)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for FavoritesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FavoritesStore")
            .field("version", &self.version())
            .finish()
    }
}
