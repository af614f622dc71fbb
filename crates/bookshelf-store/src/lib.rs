//! Durable favorites storage.
//!
//! [`FavoritesDatabase`] is a synchronous handle on one SQLite connection;
//! [`FavoritesStore`] wraps it for async callers, runs every statement on the
//! blocking pool, and publishes a change counter so readers can observe the
//! table as a stream of snapshots.

mod db;
mod store;

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use thiserror::Error;

pub use store::{FavoritesStore, RecordStream};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned: {0}")]
    Poisoned(String),
    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Persisted form of a favorited book, keyed by ISBN.
///
/// Presence of a row is what makes a book a favorite; there is no flag column.
/// Prices are kept as the text the catalog reported so that rows written by
/// older builds (which stored formatted strings) still load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FavoriteBookRecord {
    pub isbn: String,
    pub title: String,
    pub contents: String,
    pub url: String,
    /// Publication timestamp, RFC 3339.
    pub datetime: String,
    pub authors: Vec<String>,
    pub publisher: String,
    pub translators: Vec<String>,
    pub price: String,
    pub sale_price: String,
    pub thumbnail: String,
    pub status: String,
}

/// Handle to an opened favorites database.
pub struct FavoritesDatabase {
    conn: Connection,
    path: Option<PathBuf>,
}

impl FavoritesDatabase {
    /// Open (creating if needed) the favorites database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        db::init_database(&conn, true)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database. Contents vanish with the handle.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        db::init_database(&conn, false)?;
        Ok(Self { conn, path: None })
    }

    /// Insert a record, replacing any existing row with the same ISBN.
    pub fn insert(&self, record: &FavoriteBookRecord) -> Result<(), StoreError> {
        db::upsert(&self.conn, record)
    }

    /// Delete the row for `isbn`. Returns the number of rows removed.
    pub fn delete(&self, isbn: &str) -> Result<usize, StoreError> {
        db::delete(&self.conn, isbn)
    }

    pub fn get(&self, isbn: &str) -> Result<Option<FavoriteBookRecord>, StoreError> {
        db::get(&self.conn, isbn)
    }

    pub fn contains(&self, isbn: &str) -> Result<bool, StoreError> {
        db::contains(&self.conn, isbn)
    }

    /// All favorites in insertion order.
    pub fn get_all(&self) -> Result<Vec<FavoriteBookRecord>, StoreError> {
        db::select_all(&self.conn)
    }

    /// Favorites whose title contains `text`, ignoring ASCII case.
    pub fn search_by_title(&self, text: &str) -> Result<Vec<FavoriteBookRecord>, StoreError> {
        db::select_by_title(&self.conn, text)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        db::count(&self.conn)
    }

    /// Path of the backing file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl std::fmt::Debug for FavoritesDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FavoritesDatabase")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::FavoriteBookRecord;

    pub fn record(isbn: &str, title: &str) -> FavoriteBookRecord {
        FavoriteBookRecord {
            isbn: isbn.to_string(),
            title: title.to_string(),
            contents: String::new(),
            url: format!("https://example.org/books/{isbn}"),
            datetime: "2021-03-01T00:00:00.000+09:00".to_string(),
            authors: vec!["Frank Herbert".to_string()],
            publisher: "Ace".to_string(),
            translators: vec![],
            price: "12000".to_string(),
            sale_price: "10800".to_string(),
            thumbnail: String::new(),
            status: "정상판매".to_string(),
        }
    }
}
