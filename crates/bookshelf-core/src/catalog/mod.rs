//! Remote book catalog: the search call the cache fetchers wrap.

pub mod http;
pub mod mock;

use std::future::Future;
use std::pin::Pin;

use crate::error::SyncError;
use crate::model::{BookPage, SearchRequest};

pub use http::HttpCatalog;
pub use mock::{MockCatalog, MockResponse};

/// A catalog that can serve one page of search results.
pub trait CatalogBackend: Send + Sync {
    /// Short name for logs (e.g. "kakao", "mock").
    fn name(&self) -> &str;

    /// Fetch the page described by `request`.
    fn search<'a>(
        &'a self,
        request: &'a SearchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BookPage, SyncError>> + Send + 'a>>;
}
