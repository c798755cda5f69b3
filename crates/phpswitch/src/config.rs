use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use phpswitch_core::{CatalogSource, DEFAULT_LISTING_URL, DEFAULT_PROBE_URLS, RefreshPolicy};
use phpswitch_model::{Registry, RegistryStore, StoreError};
use phpswitch_platform::AppPaths;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_true")]
    pub first_run: bool,

    #[serde(flatten)]
    pub registry: Registry,

    #[serde(default)]
    pub link_path: Option<PathBuf>,

    #[serde(default)]
    pub debug_logging: bool,

    /// Refresh the catalog on every start and keep a copy of the raw listing.
    #[serde(default)]
    pub dev_mode: bool,

    #[serde(default = "default_catalog_max_age_days")]
    pub catalog_max_age_days: u32,

    #[serde(default = "default_listing_url")]
    pub listing_url: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_catalog_max_age_days() -> u32 {
    7
}

fn default_listing_url() -> String {
    DEFAULT_LISTING_URL.to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_http_timeout() -> u64 {
    300
}

fn default_verify_timeout() -> u64 {
    15
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            first_run: true,
            registry: Registry::default(),
            link_path: None,
            debug_logging: false,
            dev_mode: false,
            catalog_max_age_days: default_catalog_max_age_days(),
            listing_url: default_listing_url(),
            probe_timeout_secs: default_probe_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            http_timeout_secs: default_http_timeout(),
            verify_timeout_secs: default_verify_timeout(),
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl AppConfig {
    #[must_use]
    pub fn link_path(&self, paths: &AppPaths) -> PathBuf {
        self.link_path
            .clone()
            .unwrap_or_else(|| paths.default_link_path())
    }

    #[must_use]
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            force: self.dev_mode,
            ..RefreshPolicy::with_max_age_days(self.catalog_max_age_days)
        }
    }

    #[must_use]
    pub fn catalog_source(&self, paths: &AppPaths) -> CatalogSource {
        CatalogSource {
            listing_url: self.listing_url.clone(),
            probe_urls: DEFAULT_PROBE_URLS.iter().map(ToString::to_string).collect(),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            dump_path: self.dev_mode.then(|| paths.listing_dump_file()),
        }
    }
}

/// Registry store backed by the JSON configuration file.
///
/// Loading is fail-soft. Saving rewrites the whole file atomically.
pub struct JsonConfigStore {
    path: PathBuf,
    config: Mutex<AppConfig>,
}

impl JsonConfigStore {
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let config = load_config(&path);
        Self {
            path,
            config: Mutex::new(config),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn settings(&self) -> AppConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the file, dropping anything loaded before another process saved.
    pub fn reload(&self) {
        let fresh = load_config(&self.path);
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Change non-registry settings and persist them.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written.
    pub fn update_settings(&self, f: impl FnOnce(&mut AppConfig)) -> Result<(), StoreError> {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut config);
        self.write(&config)
    }

    fn write(&self, config: &AppConfig) -> Result<(), StoreError> {
        let data =
            serde_json::to_vec_pretty(config).map_err(|error| StoreError::Encode(error.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| StoreError::io("failed to create config directory", error))?;
        }
        write_atomic(&self.path, &data)
            .map_err(|error| StoreError::io("failed to write config file", error))
    }
}

impl RegistryStore for JsonConfigStore {
    fn load(&self) -> Registry {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .registry
            .clone()
    }

    fn save(&self, registry: &Registry) -> Result<(), StoreError> {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        config.registry = registry.clone();
        self.write(&config)
    }
}

fn load_config(path: &Path) -> AppConfig {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            debug!("No config at {}, using defaults", path.display());
            return AppConfig::default();
        }
        Err(error) => {
            warn!("Failed to read {}: {error}; using defaults", path.display());
            return AppConfig::default();
        }
    };
    match serde_json::from_str(&data) {
        Ok(config) => config,
        Err(error) => {
            warn!("Config {} is invalid: {error}; using defaults", path.display());
            AppConfig::default()
        }
    }
}

/// Write through a temp file in the same directory, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "config path has no parent")
    })?;

    let mut file = tempfile::Builder::new()
        .prefix(".config.")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}
