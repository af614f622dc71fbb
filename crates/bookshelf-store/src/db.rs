//! SQLite statements for the favorites table.

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{FavoriteBookRecord, StoreError};

const COLUMNS: &str = "isbn, title, contents, url, datetime, authors, publisher, \
                       translators, price, sale_price, thumbnail, status";

/// Create the schema. File-backed databases also get WAL mode.
pub fn init_database(conn: &Connection, on_disk: bool) -> Result<(), StoreError> {
    if on_disk {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS favorite_books (
            isbn        TEXT PRIMARY KEY NOT NULL,
            title       TEXT NOT NULL,
            contents    TEXT NOT NULL,
            url         TEXT NOT NULL,
            datetime    TEXT NOT NULL,
            authors     TEXT NOT NULL,
            publisher   TEXT NOT NULL,
            translators TEXT NOT NULL,
            price       TEXT NOT NULL,
            sale_price  TEXT NOT NULL,
            thumbnail   TEXT NOT NULL,
            status      TEXT NOT NULL
        );
        "#,
    )?;

    Ok(())
}

pub fn upsert(conn: &Connection, record: &FavoriteBookRecord) -> Result<(), StoreError> {
    let authors = serde_json::to_string(&record.authors).unwrap_or_else(|_| "[]".into());
    let translators = serde_json::to_string(&record.translators).unwrap_or_else(|_| "[]".into());

    let mut stmt = conn.prepare_cached(
        "INSERT INTO favorite_books
             (isbn, title, contents, url, datetime, authors, publisher,
              translators, price, sale_price, thumbnail, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(isbn) DO UPDATE SET
             title = excluded.title,
             contents = excluded.contents,
             url = excluded.url,
             datetime = excluded.datetime,
             authors = excluded.authors,
             publisher = excluded.publisher,
             translators = excluded.translators,
             price = excluded.price,
             sale_price = excluded.sale_price,
             thumbnail = excluded.thumbnail,
             status = excluded.status",
    )?;
    stmt.execute(params![
        record.isbn,
        record.title,
        record.contents,
        record.url,
        record.datetime,
        authors,
        record.publisher,
        translators,
        record.price,
        record.sale_price,
        record.thumbnail,
        record.status,
    ])?;
    Ok(())
}

pub fn delete(conn: &Connection, isbn: &str) -> Result<usize, StoreError> {
    let removed = conn.execute("DELETE FROM favorite_books WHERE isbn = ?1", params![isbn])?;
    Ok(removed)
}

pub fn get(conn: &Connection, isbn: &str) -> Result<Option<FavoriteBookRecord>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM favorite_books WHERE isbn = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    let record = stmt.query_row(params![isbn], read_record).optional()?;
    Ok(record)
}

pub fn contains(conn: &Connection, isbn: &str) -> Result<bool, StoreError> {
    let found: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM favorite_books WHERE isbn = ?1",
        params![isbn],
        |row| row.get(0),
    )?;
    Ok(found)
}

pub fn count(conn: &Connection) -> Result<usize, StoreError> {
    let n: usize = conn.query_row("SELECT COUNT(*) FROM favorite_books", [], |row| row.get(0))?;
    Ok(n)
}

pub fn select_all(conn: &Connection) -> Result<Vec<FavoriteBookRecord>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM favorite_books ORDER BY rowid");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([], read_record)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Case-insensitive title substring match. SQLite's `LIKE` only folds
/// ASCII, so titles are compared after Unicode lowercasing.
pub fn select_by_title(conn: &Connection, text: &str) -> Result<Vec<FavoriteBookRecord>, StoreError> {
    let needle = text.to_lowercase();
    let mut rows = select_all(conn)?;
    rows.retain(|r| title_matches(&r.title, &needle));
    Ok(rows)
}

fn title_matches(title: &str, lowered_needle: &str) -> bool {
    title.to_lowercase().contains(lowered_needle)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<FavoriteBookRecord> {
    let authors: String = row.get(5)?;
    let translators: String = row.get(7)?;
    Ok(FavoriteBookRecord {
        isbn: row.get(0)?,
        title: row.get(1)?,
        contents: row.get(2)?,
        url: row.get(3)?,
        datetime: row.get(4)?,
        // A damaged list column should not hide the row.
        authors: serde_json::from_str(&authors).unwrap_or_default(),
        publisher: row.get(6)?,
        translators: serde_json::from_str(&translators).unwrap_or_default(),
        price: row.get(8)?,
        sale_price: row.get(9)?,
        thumbnail: row.get(10)?,
        status: row.get(11)?,
    })
}
