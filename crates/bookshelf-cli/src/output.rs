use std::io::Write;

use bookshelf_core::Book;
use bookshelf_core::screens::{FavoritesUiState, SearchUiState};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

fn price_label(book: &Book) -> String {
    match (book.price, book.sale_price) {
        (p, s) if s > 0 && s < p => format!("{s} (list {p})"),
        (p, _) if p > 0 => p.to_string(),
        _ => "-".to_string(),
    }
}

/// One line per book: marker, title, authors, price, ISBN.
pub fn print_book(w: &mut dyn Write, index: usize, book: &Book, color: ColorMode) -> std::io::Result<()> {
    let marker = if book.is_favorite { "*" } else { " " };
    let title = truncate(&book.title, 60);
    let authors = book.authors.join(", ");
    let isbn = if book.isbn.is_empty() { "no isbn" } else { book.isbn.as_str() };

    if color.enabled() {
        writeln!(
            w,
            "{:>3}. {} {} {} {} {}",
            index + 1,
            marker.yellow().bold(),
            title.bold(),
            authors.dimmed(),
            price_label(book).green(),
            format!("[{isbn}]").dimmed()
        )
    } else {
        writeln!(
            w,
            "{:>3}. {} {} {} {} [{}]",
            index + 1,
            marker,
            title,
            authors,
            price_label(book),
            isbn
        )
    }
}

fn print_banner(w: &mut dyn Write, text: &str, retryable: bool, color: ColorMode) -> std::io::Result<()> {
    let hint = if retryable { " (type 'retry')" } else { "" };
    if color.enabled() {
        writeln!(w, "{}{}", text.red().bold(), hint.dimmed())
    } else {
        writeln!(w, "{text}{hint}")
    }
}

fn print_notice(w: &mut dyn Write, text: &str, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{}", text.yellow())
    } else {
        writeln!(w, "{text}")
    }
}

pub fn print_search(w: &mut dyn Write, state: &SearchUiState, color: ColorMode) -> std::io::Result<()> {
    if state.query.is_empty() {
        writeln!(w, "Type a query to search the catalog.")?;
        return Ok(());
    }

    let header = format!(
        "\"{}\" by {}: showing {} of {}",
        state.query,
        state.sort.token(),
        state.books.len(),
        state.total_count
    );
    if color.enabled() {
        writeln!(w, "{}", header.cyan())?;
    } else {
        writeln!(w, "{header}")?;
    }

    for (i, book) in state.books.iter().enumerate() {
        print_book(w, i, book, color)?;
    }

    if let Some(error) = &state.error {
        print_banner(w, &error.user_message(), error.is_retryable(), color)?;
    } else if state.is_loading {
        writeln!(w, "Loading...")?;
    } else if state.books.is_empty() {
        writeln!(w, "No books found.")?;
    } else if !state.is_end {
        writeln!(w, "(more results: type 'more')")?;
    }
    if let Some(notice) = &state.notice {
        print_notice(w, notice, color)?;
    }
    Ok(())
}

pub fn print_favorites(w: &mut dyn Write, state: &FavoritesUiState, color: ColorMode) -> std::io::Result<()> {
    let filter = &state.filter;
    let mut header = format!("Favorites ({}, {})", filter.sort.token(), state.books.len());
    if !filter.query.trim().is_empty() {
        header.push_str(&format!(" matching \"{}\"", filter.query.trim()));
    }
    if filter.price_only {
        header.push_str(", priced only");
    }
    if color.enabled() {
        writeln!(w, "{}", header.cyan())?;
    } else {
        writeln!(w, "{header}")?;
    }

    for (i, book) in state.books.iter().enumerate() {
        print_book(w, i, book, color)?;
    }

    if let Some(error) = &state.error {
        print_banner(w, &error.user_message(), error.is_retryable(), color)?;
    } else if state.is_loading {
        writeln!(w, "Loading...")?;
    } else if state.books.is_empty() {
        writeln!(w, "No favorites yet.")?;
    }
    if let Some(notice) = &state.notice {
        print_notice(w, notice, color)?;
    }
    Ok(())
}
