//! Joining catalog results with the favorites store.
//!
//! `is_favorite` is never fetched; it is recomputed here whenever either side
//! changes.

use std::collections::HashSet;

use bookshelf_store::FavoriteBookRecord;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt, future};

use crate::model::Book;

/// Copy of `books` with `is_favorite` set from `favorites`.
pub fn annotate(books: &[Book], favorites: &[FavoriteBookRecord]) -> Vec<Book> {
    let isbns: HashSet<&str> = favorites.iter().map(|f| f.isbn.as_str()).collect();
    mark(books, |isbn| isbns.contains(isbn))
}

/// [`annotate`] against a prebuilt ISBN set.
pub fn annotate_isbns<'a>(books: impl IntoIterator<Item = &'a Book>, isbns: &HashSet<String>) -> Vec<Book> {
    mark(books, |isbn| isbns.contains(isbn))
}

fn mark<'a>(books: impl IntoIterator<Item = &'a Book>, is_favorite: impl Fn(&str) -> bool) -> Vec<Book> {
    books
        .into_iter()
        .map(|book| Book {
            is_favorite: !book.isbn.is_empty() && is_favorite(&book.isbn),
            ..book.clone()
        })
        .collect()
}

enum Side {
    Books(Vec<Book>),
    Favorites(Vec<FavoriteBookRecord>),
}

/// Combine the latest book list with the latest favorites list.
///
/// Emits once both inputs have produced a value, then again on every
/// emission of either input. Ends when both inputs end.
pub fn merge<B, F>(books: B, favorites: F) -> BoxStream<'static, Vec<Book>>
where
    B: Stream<Item = Vec<Book>> + Send + 'static,
    F: Stream<Item = Vec<FavoriteBookRecord>> + Send + 'static,
{
    let sides = stream::select(books.map(Side::Books), favorites.map(Side::Favorites));
    sides
        .scan(
            (None::<Vec<Book>>, None::<HashSet<String>>),
            |(latest_books, latest_isbns), side| {
                match side {
                    Side::Books(books) => *latest_books = Some(books),
                    Side::Favorites(records) => {
                        *latest_isbns = Some(records.into_iter().map(|r| r.isbn).collect());
                    }
                }
                let out = match (latest_books.as_deref(), latest_isbns.as_ref()) {
                    (Some(books), Some(isbns)) => Some(annotate_isbns(books, isbns)),
                    _ => None,
                };
                future::ready(Some(out))
            },
        )
        .filter_map(future::ready)
        .boxed()
}
