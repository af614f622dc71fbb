//! Domain records shared by the catalog client, the cache and the screens.

use std::str::FromStr;

use bookshelf_store::FavoriteBookRecord;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;

/// Default number of results per catalog page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;
/// Largest page size the catalog accepts.
pub const MAX_PAGE_SIZE: u32 = 50;
/// Largest page number the catalog serves.
pub const MAX_PAGE: u32 = 50;

/// A book as shown to the user.
///
/// `is_favorite` is never part of a fetched page: it is filled in at read time
/// by joining against the favorites store (see [`crate::merge`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Book {
    pub title: String,
    pub contents: String,
    pub url: String,
    pub isbn: String,
    pub datetime: Option<DateTime<FixedOffset>>,
    pub authors: Vec<String>,
    pub publisher: String,
    pub translators: Vec<String>,
    pub price: i64,
    pub sale_price: i64,
    pub thumbnail: String,
    pub status: String,
    pub is_favorite: bool,
}

impl Book {
    /// Price a buyer pays: the sale price when one is set, else the list price.
    pub fn effective_price(&self) -> i64 {
        if self.sale_price > 0 {
            self.sale_price
        } else {
            self.price
        }
    }

    /// Persisted form for the favorites store.
    pub fn to_record(&self) -> FavoriteBookRecord {
        FavoriteBookRecord {
            isbn: self.isbn.clone(),
            title: self.title.clone(),
            contents: self.contents.clone(),
            url: self.url.clone(),
            datetime: self.datetime.map(|d| d.to_rfc3339()).unwrap_or_default(),
            authors: self.authors.clone(),
            publisher: self.publisher.clone(),
            translators: self.translators.clone(),
            price: self.price.to_string(),
            sale_price: self.sale_price.to_string(),
            thumbnail: self.thumbnail.clone(),
            status: self.status.clone(),
        }
    }

    /// Rebuild a book from a stored favorite. Unparseable prices read as 0.
    pub fn from_record(record: &FavoriteBookRecord) -> Self {
        Self {
            title: record.title.clone(),
            contents: record.contents.clone(),
            url: record.url.clone(),
            isbn: record.isbn.clone(),
            datetime: DateTime::parse_from_rfc3339(&record.datetime).ok(),
            authors: record.authors.clone(),
            publisher: record.publisher.clone(),
            translators: record.translators.clone(),
            price: parse_price(&record.price),
            sale_price: parse_price(&record.sale_price),
            thumbnail: record.thumbnail.clone(),
            status: record.status.clone(),
            is_favorite: true,
        }
    }
}

/// Numeric value of a stored price; anything non-numeric counts as 0.
pub fn parse_price(text: &str) -> i64 {
    let digits: String = text
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '원' | ' '))
        .collect();
    digits.parse().unwrap_or(0)
}

/// Catalog result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum SortOrder {
    #[default]
    Accuracy,
    Latest,
}

impl SortOrder {
    /// Token sent to the catalog and used in cache keys.
    pub fn token(self) -> &'static str {
        match self {
            SortOrder::Accuracy => "accuracy",
            SortOrder::Latest => "latest",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accuracy" => Ok(SortOrder::Accuracy),
            "latest" | "recency" => Ok(SortOrder::Latest),
            other => Err(format!("unknown sort order '{other}' (expected accuracy or latest)")),
        }
    }
}

/// One catalog search call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub sort: SortOrder,
    /// 1-based.
    pub page: u32,
    pub size: u32,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, sort: SortOrder, page: u32, size: u32) -> Self {
        Self {
            query: query.into(),
            sort,
            page: page.clamp(1, MAX_PAGE),
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

/// Pagination metadata reported with every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PageMeta {
    pub total_count: u64,
    pub pageable_count: u64,
    pub is_end: bool,
}

/// One page of catalog results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookPage {
    pub meta: PageMeta,
    pub books: Vec<Book>,
}
