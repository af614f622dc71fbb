use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod cache;
pub mod catalog;
pub mod config_file;
pub mod error;
pub mod favorites;
pub mod infinite;
pub mod key;
pub mod merge;
pub mod model;
pub mod mutation;
pub mod screens;

// Re-export for convenience
pub use bookshelf_store::{FavoriteBookRecord, FavoritesStore};
pub use cache::{CacheConfig, FetchState, QueryCache, QueryObserver, QueryResult};
pub use catalog::{CatalogBackend, HttpCatalog, MockCatalog, MockResponse};
pub use config_file::ConfigError;
pub use error::{RejectionKind, SyncError};
pub use favorites::{FavoriteToggle, FavoritesFilter, FavoritesSort};
pub use infinite::{InfiniteData, InfinitePage, InfiniteQueryController, LoadMore};
pub use key::{MutationKey, QueryKey};
pub use model::{Book, BookPage, PageMeta, SearchRequest, SortOrder};
pub use mutation::{MutationController, MutationState, MutationStatus};
pub use screens::{FavoritesAction, FavoritesScreen, SearchAction, SearchScreen};

/// Runtime configuration for a bookshelf session.
#[derive(Clone)]
pub struct Config {
    /// Catalog REST key, sent as `Authorization: KakaoAK <key>`.
    pub api_key: Option<String>,
    pub api_url: String,
    pub timeout: Duration,
    /// Results per catalog page (clamped to 1..=50 per request).
    pub page_size: u32,
    /// Favorites database file. `None` keeps favorites in memory.
    pub db_path: Option<PathBuf>,
    pub cache: CacheConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("api_url", &self.api_url)
            .field("timeout", &self.timeout)
            .field("page_size", &self.page_size)
            .field("db_path", &self.db_path)
            .field("cache", &self.cache)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: catalog::http::DEFAULT_API_URL.to_string(),
            timeout: catalog::http::DEFAULT_TIMEOUT,
            page_size: model::DEFAULT_PAGE_SIZE,
            db_path: config_file::default_db_path(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Defaults overlaid with whatever `file` sets.
    pub fn from_file(file: &config_file::ConfigFile) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(catalog) = &file.catalog {
            if let Some(key) = &catalog.api_key {
                config.api_key = Some(key.clone());
            }
            if let Some(url) = &catalog.api_url {
                config.api_url = url.clone();
            }
            if let Some(secs) = catalog.timeout_secs {
                config.timeout = Duration::from_secs(positive(secs, "catalog.timeout_secs")?);
            }
            if let Some(size) = catalog.page_size {
                config.page_size = positive(size.into(), "catalog.page_size")? as u32;
            }
        }
        if let Some(path) = file.storage.as_ref().and_then(|s| s.db_path.as_ref()) {
            config.db_path = Some(PathBuf::from(path));
        }
        if let Some(cache) = &file.cache {
            if let Some(secs) = cache.stale_time_secs {
                config.cache.stale_time = Duration::from_secs(secs);
            }
            if let Some(secs) = cache.gc_time_secs {
                config.cache.gc_time = Duration::from_secs(positive(secs, "cache.gc_time_secs")?);
            }
        }
        Ok(config)
    }
}

fn positive(value: u64, field: &'static str) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive(field));
    }
    Ok(value)
}

/// One wired-up session: a process-wide cache, the catalog, the favorites
/// store and the shared favorite toggle. Screens are built from it.
pub struct Bookshelf {
    cache: QueryCache,
    catalog: Arc<dyn CatalogBackend>,
    store: FavoritesStore,
    toggle: Arc<FavoriteToggle>,
    page_size: u32,
}

impl Bookshelf {
    /// Open the favorites store and build the HTTP catalog from `config`.
    pub fn open(config: &Config) -> Result<Self, SyncError> {
        let store = match &config.db_path {
            Some(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| SyncError::LocalStore(format!("{}: {e}", parent.display())))?;
                }
                FavoritesStore::open(path)?
            }
            None => FavoritesStore::open_in_memory()?,
        };
        let catalog = HttpCatalog::new(
            config.api_key.clone().unwrap_or_default(),
            config.api_url.clone(),
            config.timeout,
        )?;
        Ok(Self::with_parts(config, Arc::new(catalog), store))
    }

    /// Wire a session from explicit parts (tests, offline runs).
    pub fn with_parts(config: &Config, catalog: Arc<dyn CatalogBackend>, store: FavoritesStore) -> Self {
        let cache = QueryCache::new(config.cache);
        let toggle = Arc::new(FavoriteToggle::new(Arc::new(store.clone())).with_optimistic_isbns(cache.clone()));
        tracing::debug!(catalog = catalog.name(), ?config, "bookshelf wired");
        Self {
            cache,
            catalog,
            store,
            toggle,
            page_size: config.page_size,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn store(&self) -> &FavoritesStore {
        &self.store
    }

    pub fn toggle(&self) -> &Arc<FavoriteToggle> {
        &self.toggle
    }

    /// Live favorite ISBNs. Holding the observer keeps the set loaded for
    /// every screen built from this session.
    pub fn favorite_isbns(&self) -> QueryObserver<HashSet<String>> {
        favorites::favorite_isbns(&self.cache, Arc::new(self.store.clone()))
    }

    pub fn search_screen(&self) -> SearchScreen {
        SearchScreen::new(
            self.cache.clone(),
            Arc::clone(&self.catalog),
            Arc::new(self.store.clone()),
            Arc::clone(&self.toggle),
            self.page_size,
        )
    }

    pub fn favorites_screen(&self) -> FavoritesScreen {
        FavoritesScreen::new(self.cache.clone(), Arc::new(self.store.clone()), Arc::clone(&self.toggle))
    }

    /// Cancel every in-flight fetch and subscription.
    pub fn shutdown(&self) {
        self.cache.shutdown();
    }
}
