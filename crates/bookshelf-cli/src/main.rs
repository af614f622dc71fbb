use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bookshelf_core::config_file::{self, ConfigFile};
use bookshelf_core::screens::FavoritesUiState;
use bookshelf_core::{
    Book, Bookshelf, Config, FavoritesAction, FavoritesScreen, FavoritesSort, SearchAction,
    SearchScreen, SortOrder,
};
use clap::{Args, Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod output;

use output::ColorMode;

/// How long one-shot commands wait for a live list to load.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bookshelf - search the book catalog and keep a list of favorites
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Catalog REST API key
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Catalog search endpoint
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Path to the favorites database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Keep favorites in memory for this run only
    #[arg(long, global = true)]
    in_memory: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search the catalog
    Search {
        query: String,

        /// accuracy or latest
        #[arg(long, default_value = "accuracy")]
        sort: SortOrder,

        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        pages: u32,

        /// Print the books as JSON
        #[arg(long)]
        json: bool,
    },

    /// List favorites
    Favorites {
        /// Only titles containing this text (case-insensitive)
        #[arg(long, default_value = "")]
        query: String,

        /// recency_desc, recency_asc, price_asc or price_desc
        #[arg(long, default_value = "recency_desc")]
        sort: FavoritesSort,

        /// Hide books without a price
        #[arg(long)]
        price_only: bool,

        /// Print the books as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add or remove a favorite by ISBN
    Toggle { isbn: String },

    /// Interactive session over both screens
    Shell,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.global.log_file.as_deref())?;

    let config = resolve_config(&cli.global)?;
    tracing::debug!(?config, "resolved configuration");
    let color = ColorMode(!cli.global.no_color);

    let shelf = Bookshelf::open(&config).context("failed to open bookshelf")?;
    // Keeps the favorite ISBN set loaded for the whole run.
    let mut favorite_isbns = shelf.favorite_isbns();
    favorite_isbns.settled().await;

    let result = match cli.command {
        Command::Search {
            query,
            sort,
            pages,
            json,
        } => search(&shelf, query, sort, pages, json, color).await,
        Command::Favorites {
            query,
            sort,
            price_only,
            json,
        } => favorites(&shelf, query, sort, price_only, json, color).await,
        Command::Toggle { isbn } => toggle(&shelf, &isbn, color).await,
        Command::Shell => shell(&shelf, color).await,
    };

    shelf.shutdown();
    result
}

/// Log to stderr, or to `log_file` through a background writer. `RUST_LOG`
/// overrides the default `warn` level.
fn init_logging(log_file: Option<&Path>) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
        return Ok(None);
    };

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("--log-file {} has no file name", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(Some(guard))
}

/// CLI flags > env vars > config file > defaults.
fn resolve_config(args: &GlobalArgs) -> anyhow::Result<Config> {
    let file: ConfigFile = config_file::load_config()?;
    let mut config = Config::from_file(&file)?;

    if let Some(key) = args.api_key.clone().or_else(|| std::env::var("BOOKSHELF_API_KEY").ok()) {
        config.api_key = Some(key);
    }
    if let Some(url) = args.api_url.clone().or_else(|| std::env::var("BOOKSHELF_API_URL").ok()) {
        config.api_url = url;
    }
    if let Some(db) = args
        .db
        .clone()
        .or_else(|| std::env::var("BOOKSHELF_DB").ok().map(PathBuf::from))
    {
        config.db_path = Some(db);
    }
    if args.in_memory {
        config.db_path = None;
    }

    if config.api_key.is_none() {
        tracing::warn!("no catalog API key configured; searches will be rejected");
    }
    Ok(config)
}

async fn wait_for<S>(rx: &mut watch::Receiver<S>, ready: impl Fn(&S) -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(SETTLE_TIMEOUT, rx.wait_for(|s| ready(s)))
        .await
        .context("timed out waiting for results")?
        .context("screen closed")?;
    Ok(())
}

fn print_json(books: &[Book]) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(books)?;
    println!("{text}");
    Ok(())
}

async fn search(
    shelf: &Bookshelf,
    query: String,
    sort: SortOrder,
    pages: u32,
    json: bool,
    color: ColorMode,
) -> anyhow::Result<()> {
    let screen = shelf.search_screen();
    screen.dispatch(SearchAction::ChangeSort(sort)).await;
    screen.dispatch(SearchAction::Search { query }).await;
    for _ in 1..pages {
        let state = screen.current();
        if state.is_end || state.error.is_some() {
            break;
        }
        screen.dispatch(SearchAction::LoadMore).await;
    }

    let state = screen.current();
    if json {
        print_json(&state.books)?;
    } else {
        output::print_search(&mut std::io::stdout(), &state, color)?;
    }
    match state.error {
        Some(error) => Err(anyhow::anyhow!(error)),
        None => Ok(()),
    }
}

async fn favorites(
    shelf: &Bookshelf,
    query: String,
    sort: FavoritesSort,
    price_only: bool,
    json: bool,
    color: ColorMode,
) -> anyhow::Result<()> {
    let screen = shelf.favorites_screen();
    screen.dispatch(FavoritesAction::SetQuery(query)).await;
    screen.dispatch(FavoritesAction::SetSort(sort)).await;
    screen.dispatch(FavoritesAction::SetPriceOnly(price_only)).await;

    let mut rx = screen.state();
    wait_for(&mut rx, |s: &FavoritesUiState| !s.is_loading).await?;
    let state = screen.current();
    if json {
        print_json(&state.books)
    } else {
        output::print_favorites(&mut std::io::stdout(), &state, color)?;
        Ok(())
    }
}

/// Find the book to toggle: the stored copy when it is already a favorite,
/// otherwise the catalog's record for the ISBN.
async fn find_book(shelf: &Bookshelf, isbn: &str) -> anyhow::Result<Book> {
    if let Some(record) = shelf.store().get(isbn).await? {
        return Ok(Book::from_record(&record));
    }

    let screen = shelf.search_screen();
    screen
        .dispatch(SearchAction::Search {
            query: isbn.to_string(),
        })
        .await;
    let state = screen.current();
    if let Some(error) = state.error {
        return Err(anyhow::anyhow!(error).context(format!("failed to look up {isbn}")));
    }
    state
        .books
        .into_iter()
        .find(|b| b.isbn == isbn)
        .with_context(|| format!("no book with ISBN {isbn} in the catalog"))
}

async fn toggle(shelf: &Bookshelf, isbn: &str, color: ColorMode) -> anyhow::Result<()> {
    let book = find_book(shelf, isbn).await?;
    let now_favorite = shelf.toggle().toggle(&book).await?;
    let verb = if now_favorite { "Added" } else { "Removed" };
    let line = format!("{verb} \"{}\" ({isbn})", book.title);
    if color.enabled() {
        use owo_colors::OwoColorize;
        println!("{}", line.green());
    } else {
        println!("{line}");
    }
    Ok(())
}

const SHELL_HELP: &str = "\
commands:
  search <query>        search the catalog
  sort <accuracy|latest>
  more                  load the next page
  fav <isbn>            toggle a search result
  favs [query]          show favorites (optionally filtered by title)
  fsort <mode>          recency_desc, recency_asc, price_asc, price_desc
  priced <on|off>       only favorites with a price
  unfav <isbn>          toggle a listed favorite
  retry                 retry the failed load
  help, quit";

#[derive(Clone, Copy, PartialEq, Eq)]
enum View {
    Search,
    Favorites,
}

struct Shell {
    search: SearchScreen,
    favorites: FavoritesScreen,
    view: View,
    color: ColorMode,
}

impl Shell {
    fn render(&self) -> std::io::Result<()> {
        let mut out = std::io::stdout();
        match self.view {
            View::Search => output::print_search(&mut out, &self.search.current(), self.color)?,
            View::Favorites => output::print_favorites(&mut out, &self.favorites.current(), self.color)?,
        }
        out.flush()
    }

    async fn settle_favorites(&self) {
        let mut rx = self.favorites.state();
        if let Err(e) = wait_for(&mut rx, |s: &FavoritesUiState| !s.is_loading).await {
            tracing::warn!(error = %e, "favorites did not load");
        }
    }

    /// Run one command line. Returns false on quit.
    async fn run(&mut self, line: &str) -> bool {
        let (command, arg) = match line.trim().split_once(char::is_whitespace) {
            Some((c, a)) => (c, a.trim()),
            None => (line.trim(), ""),
        };

        match command {
            "" => return true,
            "quit" | "exit" | "q" => return false,
            "help" | "?" => {
                println!("{SHELL_HELP}");
                return true;
            }
            "search" | "s" => {
                self.view = View::Search;
                self.search
                    .dispatch(SearchAction::Search { query: arg.to_string() })
                    .await;
            }
            "sort" => match arg.parse::<SortOrder>() {
                Ok(sort) => {
                    self.view = View::Search;
                    self.search.dispatch(SearchAction::ChangeSort(sort)).await;
                }
                Err(e) => {
                    println!("{e}");
                    return true;
                }
            },
            "more" | "m" => {
                self.view = View::Search;
                self.search.dispatch(SearchAction::LoadMore).await;
            }
            "fav" => {
                self.search
                    .dispatch(SearchAction::ToggleFavorite { isbn: arg.to_string() })
                    .await;
                // Annotation catches up once the store emits.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            "favs" => {
                self.view = View::Favorites;
                self.favorites
                    .dispatch(FavoritesAction::SetQuery(arg.to_string()))
                    .await;
                self.settle_favorites().await;
            }
            "fsort" => match arg.parse::<FavoritesSort>() {
                Ok(sort) => {
                    self.view = View::Favorites;
                    self.favorites.dispatch(FavoritesAction::SetSort(sort)).await;
                    self.settle_favorites().await;
                }
                Err(e) => {
                    println!("{e}");
                    return true;
                }
            },
            "priced" => {
                self.view = View::Favorites;
                let on = matches!(arg, "on" | "yes" | "true" | "1");
                self.favorites.dispatch(FavoritesAction::SetPriceOnly(on)).await;
                self.settle_favorites().await;
            }
            "unfav" => {
                self.view = View::Favorites;
                self.favorites
                    .dispatch(FavoritesAction::ToggleFavorite { isbn: arg.to_string() })
                    .await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            "retry" => match self.view {
                View::Search => self.search.dispatch(SearchAction::Retry).await,
                View::Favorites => {
                    self.favorites.dispatch(FavoritesAction::Retry).await;
                    self.settle_favorites().await;
                }
            },
            other => {
                println!("unknown command '{other}' (type 'help')");
                return true;
            }
        }

        if let Err(e) = self.render() {
            tracing::warn!(error = %e, "failed to write output");
        }
        match self.view {
            View::Search => self.search.dispatch(SearchAction::DismissNotice).await,
            View::Favorites => self.favorites.dispatch(FavoritesAction::DismissNotice).await,
        }
        true
    }
}

async fn shell(shelf: &Bookshelf, color: ColorMode) -> anyhow::Result<()> {
    let mut shell = Shell {
        search: shelf.search_screen(),
        favorites: shelf.favorites_screen(),
        view: View::Search,
        color,
    };

    // Stdin is read on its own thread; lines arrive over a channel.
    let (tx, mut lines) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    println!("{SHELL_HELP}");
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else { break };
        if !shell.run(&line).await {
            break;
        }
    }
    Ok(())
}
