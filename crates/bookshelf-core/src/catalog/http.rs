//! Kakao book search over HTTP.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::CatalogBackend;
use crate::error::SyncError;
use crate::model::{Book, BookPage, PageMeta, SearchRequest, parse_price};

pub const DEFAULT_API_URL: &str = "https://dapi.kakao.com/v3/search/book";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fallback wait when a 429 carries a `Retry-After` we cannot read as seconds
/// or as an HTTP date.
const RETRY_AFTER_FALLBACK: Duration = Duration::from_secs(5);

pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCatalog {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        // `timeout` bounds each phase on its own: connecting, then every read.
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(concat!("bookshelf/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::TransientNetwork(e.to_string()))?;
        Ok(Self::with_client(client, api_key, base_url))
    }

    /// Use a preconfigured client; its timeouts apply as they are.
    pub fn with_client(client: reqwest::Client, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn search_url(&self, request: &SearchRequest) -> String {
        format!(
            "{}?query={}&sort={}&page={}&size={}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&request.query),
            request.sort.token(),
            request.page,
            request.size,
        )
    }

    async fn fetch_page(&self, request: &SearchRequest) -> Result<BookPage, SyncError> {
        let url = self.search_url(request);
        tracing::debug!(query = %request.query, page = request.page, "catalog request");

        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, format!("KakaoAK {}", self.api_key))
            .send()
            .await?;

        check_status(&resp)?;

        let body = resp.text().await?;
        let page = decode_page(&body)?;
        tracing::debug!(
            query = %request.query,
            page = request.page,
            books = page.books.len(),
            is_end = page.meta.is_end,
            "catalog response"
        );
        Ok(page)
    }
}

impl std::fmt::Debug for HttpCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCatalog")
            .field("base_url", &self.base_url)
            .field("api_key", &"[redacted]")
            .finish()
    }
}

impl CatalogBackend for HttpCatalog {
    fn name(&self) -> &str {
        "kakao"
    }

    fn search<'a>(
        &'a self,
        request: &'a SearchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BookPage, SyncError>> + Send + 'a>> {
        Box::pin(self.fetch_page(request))
    }
}

/// Map a non-success status to [`SyncError::RemoteRejection`].
pub fn check_status(resp: &reqwest::Response) -> Result<(), SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let retry_after = if status.as_u16() == 429 {
        resp.headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after)
    } else {
        None
    };
    tracing::warn!(status = status.as_u16(), ?retry_after, "catalog rejected request");
    Err(SyncError::rejection(status.as_u16(), retry_after))
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(at) = DateTime::parse_from_rfc2822(value) {
        let wait = at.with_timezone(&Utc) - Utc::now();
        return Some(wait.to_std().unwrap_or(Duration::ZERO));
    }
    if value.contains(',') || value.contains("GMT") {
        return Some(RETRY_AFTER_FALLBACK);
    }
    None
}

#[derive(Deserialize)]
struct SearchResponse {
    meta: MetaDto,
    #[serde(default)]
    documents: Vec<DocumentDto>,
}

#[derive(Deserialize)]
struct MetaDto {
    total_count: u64,
    pageable_count: u64,
    is_end: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DocumentDto {
    title: Option<String>,
    contents: Option<String>,
    url: Option<String>,
    isbn: Option<String>,
    datetime: Option<String>,
    authors: Option<Vec<String>>,
    publisher: Option<String>,
    translators: Option<Vec<String>>,
    price: Option<serde_json::Value>,
    sale_price: Option<serde_json::Value>,
    thumbnail: Option<String>,
    status: Option<String>,
}

impl DocumentDto {
    fn into_book(self) -> Book {
        Book {
            title: self.title.unwrap_or_default(),
            contents: self.contents.unwrap_or_default(),
            url: self.url.unwrap_or_default(),
            isbn: primary_isbn(self.isbn.as_deref().unwrap_or_default()),
            datetime: self
                .datetime
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok()),
            authors: self.authors.unwrap_or_default(),
            publisher: self.publisher.unwrap_or_default(),
            translators: self.translators.unwrap_or_default(),
            price: price_value(self.price.as_ref()),
            sale_price: price_value(self.sale_price.as_ref()),
            thumbnail: self.thumbnail.unwrap_or_default(),
            status: self.status.unwrap_or_default(),
            is_favorite: false,
        }
    }
}

/// Prices arrive as numbers, but tolerate numeric strings too.
fn price_value(value: Option<&serde_json::Value>) -> i64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => parse_price(s),
        _ => 0,
    }
}

/// The `isbn` field holds "ISBN10 ISBN13" (either may be empty); the last
/// non-empty token identifies the book.
pub fn primary_isbn(raw: &str) -> String {
    raw.split_whitespace()
        .last()
        .map(str::to_string)
        .unwrap_or_default()
}

/// Decode a search response body.
pub fn decode_page(body: &str) -> Result<BookPage, SyncError> {
    let response: SearchResponse = serde_json::from_str(body).map_err(|e| {
        tracing::warn!(error = %e, "malformed catalog response");
        SyncError::Deserialization(e.to_string())
    })?;
    Ok(BookPage {
        meta: PageMeta {
            total_count: response.meta.total_count,
            pageable_count: response.meta.pageable_count,
            is_end: response.meta.is_end,
        },
        books: response
            .documents
            .into_iter()
            .map(DocumentDto::into_book)
            .collect(),
    })
}
