//! In-memory catalog for tests and offline runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::CatalogBackend;
use crate::error::SyncError;
use crate::model::{Book, BookPage, PageMeta, SearchRequest};

/// A scripted response for [`MockCatalog`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    Page(BookPage),
    Fail(SyncError),
}

enum Responder {
    /// Pop one response per call, repeating `fallback` once exhausted.
    Sequence {
        responses: Mutex<Vec<MockResponse>>,
        fallback: MockResponse,
    },
    /// Serve slices of a fixed result set, honouring page and size.
    Library(Vec<Book>),
}

/// Hand-rolled [`CatalogBackend`] double.
///
/// Supports:
/// - A fixed response, or a sequence of responses (one per call, the last
///   repeated when exhausted).
/// - A "library" of books paged like the real catalog, so `is_end` and
///   `total_count` come out right for any page size.
/// - Optional per-call latency.
/// - Call counting and a log of received requests.
pub struct MockCatalog {
    responder: Responder,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<SearchRequest>>,
}

impl MockCatalog {
    /// Always answer with `response`.
    pub fn new(response: MockResponse) -> Self {
        Self::with_sequence(vec![response])
    }

    /// Answer with `responses` in order, repeating the last one.
    pub fn with_sequence(mut responses: Vec<MockResponse>) -> Self {
        // Reversed so `pop()` yields the front; the first element is now the
        // last scripted response, which becomes the fallback.
        responses.reverse();
        let fallback = responses
            .first()
            .cloned()
            .unwrap_or(MockResponse::Page(BookPage {
                meta: PageMeta {
                    is_end: true,
                    ..PageMeta::default()
                },
                books: Vec::new(),
            }));
        Self::from_responder(Responder::Sequence {
            responses: Mutex::new(responses),
            fallback,
        })
    }

    /// Page through `books` for every query.
    pub fn with_library(books: Vec<Book>) -> Self {
        Self::from_responder(Responder::Library(books))
    }

    fn from_responder(responder: Responder) -> Self {
        Self {
            responder,
            delay: None,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Set simulated network latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `search()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every request received, oldest first.
    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_response(&self, request: &SearchRequest) -> MockResponse {
        match &self.responder {
            Responder::Sequence {
                responses,
                fallback,
            } => {
                let mut seq = responses.lock().unwrap_or_else(PoisonError::into_inner);
                seq.pop().unwrap_or_else(|| fallback.clone())
            }
            Responder::Library(books) => MockResponse::Page(library_page(books, request)),
        }
    }
}

fn library_page(books: &[Book], request: &SearchRequest) -> BookPage {
    let size = request.size as usize;
    let start = (request.page.max(1) as usize - 1) * size;
    let page: Vec<Book> = books.iter().skip(start).take(size).cloned().collect();
    BookPage {
        meta: PageMeta {
            total_count: books.len() as u64,
            pageable_count: books.len() as u64,
            is_end: start + page.len() >= books.len(),
        },
        books: page,
    }
}

impl CatalogBackend for MockCatalog {
    fn name(&self) -> &str {
        "mock"
    }

    fn search<'a>(
        &'a self,
        request: &'a SearchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BookPage, SyncError>> + Send + 'a>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let response = self.next_response(request);
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            match response {
                MockResponse::Page(page) => Ok(page),
                MockResponse::Fail(error) => Err(error),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SortOrder;
    use crate::model::fixtures::books;

    #[tokio::test]
    async fn sequence_repeats_last() {
        let mock = MockCatalog::with_sequence(vec![
            MockResponse::Fail(SyncError::TransientNetwork("down".into())),
            MockResponse::Page(BookPage {
                meta: PageMeta::default(),
                books: books(0..2),
            }),
        ]);
        let req = SearchRequest::new("x", SortOrder::Accuracy, 1, 20);
        assert!(mock.search(&req).await.is_err());
        assert_eq!(mock.search(&req).await.unwrap().books.len(), 2);
        assert_eq!(mock.search(&req).await.unwrap().books.len(), 2);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn library_pages_like_the_catalog() {
        let mock = MockCatalog::with_library(books(0..25));
        let first = mock
            .search(&SearchRequest::new("x", SortOrder::Accuracy, 1, 20))
            .await
            .unwrap();
        assert_eq!(first.books.len(), 20);
        assert!(!first.meta.is_end);
        assert_eq!(first.meta.total_count, 25);

        let second = mock
            .search(&SearchRequest::new("x", SortOrder::Accuracy, 2, 20))
            .await
            .unwrap();
        assert_eq!(second.books.len(), 5);
        assert!(second.meta.is_end);
        assert_eq!(mock.requests()[1].page, 2);
    }

    #[tokio::test]
    async fn empty_library_is_a_terminal_first_page() {
        let mock = MockCatalog::with_library(Vec::new());
        let page = mock
            .search(&SearchRequest::new("nothing", SortOrder::Accuracy, 1, 20))
            .await
            .unwrap();
        assert!(page.books.is_empty());
        assert!(page.meta.is_end);
    }
}
