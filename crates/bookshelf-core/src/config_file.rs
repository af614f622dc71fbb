use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the per-directory override file.
pub const LOCAL_CONFIG_FILE: &str = ".bookshelf.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub catalog: Option<CatalogConfig>,
    pub storage: Option<StorageConfig>,
    pub cache: Option<CacheSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub stale_time_secs: Option<u64>,
    pub gc_time_secs: Option<u64>,
}

/// Platform config directory path: `<config_dir>/bookshelf/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bookshelf").join("config.toml"))
}

/// Default favorites database: `<data_dir>/bookshelf/favorites.db`.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("bookshelf").join("favorites.db"))
}

/// Load config by cascading CWD `.bookshelf.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> Result<ConfigFile, ConfigError> {
    let platform = match config_path() {
        Some(p) => load_from_path(&p)?,
        None => None,
    };
    let cwd = load_from_path(Path::new(LOCAL_CONFIG_FILE))?;

    Ok(match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    })
}

/// Load a config from a specific path. A missing file is `Ok(None)`; an
/// unreadable or malformed one is an error.
pub fn load_from_path(path: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let parsed = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(Some(parsed))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let base_catalog = base.catalog.unwrap_or_default();
    let base_storage = base.storage.unwrap_or_default();
    let base_cache = base.cache.unwrap_or_default();
    let catalog = overlay.catalog.unwrap_or_default();
    let storage = overlay.storage.unwrap_or_default();
    let cache = overlay.cache.unwrap_or_default();

    ConfigFile {
        catalog: Some(CatalogConfig {
            api_key: catalog.api_key.or(base_catalog.api_key),
            api_url: catalog.api_url.or(base_catalog.api_url),
            timeout_secs: catalog.timeout_secs.or(base_catalog.timeout_secs),
            page_size: catalog.page_size.or(base_catalog.page_size),
        }),
        storage: Some(StorageConfig {
            db_path: storage.db_path.or(base_storage.db_path),
        }),
        cache: Some(CacheSettings {
            stale_time_secs: cache.stale_time_secs.or(base_cache.stale_time_secs),
            gc_time_secs: cache.gc_time_secs.or(base_cache.gc_time_secs),
        }),
    }
}
