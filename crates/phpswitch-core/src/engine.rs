//! The engine facade: owns the registry and sequences every operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use phpswitch_model::{
    Arch, CatalogEntry, InstalledVersion, PhpVersion, ProgressSink, Registry, RegistryStore,
    StoreError, ThreadSafety, VersionKey,
};
use phpswitch_platform::{SearchPath, inspect_arch, link_state};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::activate::{ActivationError, ActiveStatus, activate, check_active_version};
use crate::catalog::{CatalogError, CatalogSource, fetch_catalog, try_fetch_catalog};
use crate::http::build_client;
use crate::install::{InstallError, install};
use crate::reconcile::{ReconcileReport, reconcile};
use crate::refresh::{BackgroundRefresh, RefreshPolicy};
use crate::remove::{RemoveError, RemoveSummary, remove_version};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error(transparent)]
    Remove(#[from] RemoveError),
    #[error("failed to save registry: {0}")]
    Store(#[from] StoreError),
    #[error("{0} is not installed")]
    NotInstalled(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The system-wide redirection path.
    pub link_path: PathBuf,
    /// Parent for per-install scratch directories.
    pub scratch_dir: PathBuf,
    pub catalog: CatalogSource,
    /// Bounds a whole download.
    pub http_timeout: Duration,
    pub verify_timeout: Duration,
    pub refresh_policy: RefreshPolicy,
}

/// The registry plus its store. Every mutation is saved while the lock is held,
/// so writes are serialized.
pub struct RegistryHandle {
    store: Arc<dyn RegistryStore>,
    registry: Mutex<Registry>,
}

impl RegistryHandle {
    #[must_use]
    pub fn load(store: Arc<dyn RegistryStore>) -> Self {
        let registry = store.load();
        Self {
            store,
            registry: Mutex::new(registry),
        }
    }

    pub async fn snapshot(&self) -> Registry {
        self.registry.lock().await.clone()
    }

    /// Apply `f` and persist the result before releasing the lock.
    ///
    /// # Errors
    /// Returns an error when the registry cannot be saved.
    pub async fn update<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Registry) -> T,
    {
        let mut registry = self.registry.lock().await;
        let value = f(&mut registry);
        self.store.save(&registry)?;
        Ok(value)
    }

    async fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().await
    }

    fn save(&self, registry: &Registry) -> Result<(), StoreError> {
        self.store.save(registry)
    }
}

pub struct Engine {
    config: EngineConfig,
    client: reqwest::Client,
    registry: RegistryHandle,
    search_path: Box<dyn SearchPath>,
    refresh: BackgroundRefresh,
    activation: Mutex<()>,
}

/// What startup did about the catalog.
#[derive(Debug)]
pub enum StartupRefresh {
    NotNeeded,
    /// Ran in the foreground; `true` when a new catalog was stored.
    Completed(bool),
    Background(JoinHandle<bool>),
    AlreadyRunning,
}

impl Engine {
    /// # Errors
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RegistryStore>,
        search_path: Box<dyn SearchPath>,
    ) -> Result<Self, EngineError> {
        let client = build_client(config.http_timeout).map_err(EngineError::Client)?;
        Ok(Self {
            config,
            client,
            registry: RegistryHandle::load(store),
            search_path,
            refresh: BackgroundRefresh::default(),
            activation: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn search_path(&self) -> &dyn SearchPath {
        self.search_path.as_ref()
    }

    pub async fn snapshot(&self) -> Registry {
        self.registry.snapshot().await
    }

    /// Sync the registry with the install root, saving only when it changed.
    ///
    /// # Errors
    /// Returns an error when the registry cannot be saved.
    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let mut registry = self.registry.lock().await;
        let report = reconcile(&mut registry, &self.config.link_path);
        if report.changed() {
            self.registry.save(&registry)?;
        }
        Ok(report)
    }

    /// Point the registry at a new install root and rescan it.
    ///
    /// # Errors
    /// Returns an error when the registry cannot be saved.
    pub async fn set_install_root(&self, root: PathBuf) -> Result<ReconcileReport, EngineError> {
        let mut registry = self.registry.lock().await;
        if registry.install_root != root {
            info!("Install root set to {}", root.display());
            registry.install_root = root;
        }
        let report = reconcile(&mut registry, &self.config.link_path);
        self.registry.save(&registry)?;
        Ok(report)
    }

    pub async fn needs_refresh(&self) -> bool {
        let registry = self.registry.lock().await;
        self.config
            .refresh_policy
            .needs_refresh(&registry, Utc::now())
    }

    /// Fetch the catalog and replace the stored one wholesale.
    ///
    /// Returns `false` when nothing was fetched; the prior catalog is kept.
    pub async fn refresh_catalog(&self) -> bool {
        let Some(entries) = fetch_catalog(&self.client, &self.config.catalog).await else {
            return false;
        };
        let count = entries.len();
        match self
            .registry
            .update(|registry| registry.replace_catalog(entries, Utc::now()))
            .await
        {
            Ok(()) => {
                info!("Catalog updated with {count} entries");
                true
            }
            Err(error) => {
                warn!("Fetched catalog could not be saved: {error}");
                false
            }
        }
    }

    /// Like [`Engine::refresh_catalog`] but reports why a fetch failed.
    ///
    /// # Errors
    /// Returns the fetch error, or a store error when the catalog cannot be saved.
    pub async fn try_refresh_catalog(&self) -> Result<usize, EngineError> {
        let entries = try_fetch_catalog(&self.client, &self.config.catalog).await?;
        let count = entries.len();
        self.registry
            .update(|registry| registry.replace_catalog(entries, Utc::now()))
            .await?;
        info!("Catalog updated with {count} entries");
        Ok(count)
    }

    /// Start a background refresh unless one is already running.
    pub fn spawn_refresh(self: &Arc<Self>) -> Option<JoinHandle<bool>> {
        let slot = self.refresh.try_begin()?;
        let engine = Arc::clone(self);
        let token = self.refresh.token();
        Some(tokio::spawn(async move {
            let _slot = slot;
            tokio::select! {
                () = token.cancelled() => {
                    debug!("Background catalog refresh cancelled");
                    false
                }
                updated = engine.refresh_catalog() => updated,
            }
        }))
    }

    pub fn cancel_refresh(&self) {
        self.refresh.cancel();
    }

    /// Reconcile, then refresh the catalog if the policy asks for it: in the
    /// foreground when there is no cached catalog, otherwise in the background.
    ///
    /// # Errors
    /// Returns an error when reconciliation cannot be saved.
    pub async fn startup(self: &Arc<Self>) -> Result<(ReconcileReport, StartupRefresh), EngineError> {
        let report = self.reconcile().await?;
        if !self.needs_refresh().await {
            return Ok((report, StartupRefresh::NotNeeded));
        }

        let catalog_empty = self.registry.lock().await.available_versions.is_empty();
        if catalog_empty {
            let Some(_slot) = self.refresh.try_begin() else {
                return Ok((report, StartupRefresh::AlreadyRunning));
            };
            return Ok((report, StartupRefresh::Completed(self.refresh_catalog().await)));
        }

        Ok(match self.spawn_refresh() {
            Some(handle) => (report, StartupRefresh::Background(handle)),
            None => (report, StartupRefresh::AlreadyRunning),
        })
    }

    /// Whether a build is installed, falling back to the install root.
    pub async fn is_installed(
        &self,
        version: PhpVersion,
        thread_safety: ThreadSafety,
        arch: Option<Arch>,
    ) -> bool {
        let registry = self.registry.lock().await;
        registry.is_installed(version, thread_safety, arch, inspect_arch)
    }

    /// Download and extract `entry`, then record it.
    ///
    /// # Errors
    /// Returns an error when the install fails or the registry cannot be saved.
    pub async fn install(
        &self,
        entry: &CatalogEntry,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<InstalledVersion, EngineError> {
        let install_root = self.registry.lock().await.install_root.clone();
        let installed = install(
            &self.client,
            entry,
            &install_root,
            &self.config.scratch_dir,
            sink,
        )
        .await?;

        let key = installed.key();
        let state = link_state(&self.config.link_path);
        let recorded = self
            .registry
            .update(|registry| {
                registry.upsert_installed(installed);
                registry.mark_active(state.target());
                registry.find_installed(&key).cloned()
            })
            .await?;

        recorded.ok_or_else(|| EngineError::NotInstalled(entry.display_name()))
    }

    /// Make an installed version the system-wide one.
    ///
    /// # Errors
    /// Returns an error when the version is not installed, any activation stage
    /// fails, or the registry cannot be saved.
    pub async fn activate(&self, key: &VersionKey) -> Result<PhpVersion, EngineError> {
        let _serial = self.activation.lock().await;
        self.reconcile().await?;

        let target = self
            .registry
            .lock()
            .await
            .find_installed(key)
            .cloned()
            .ok_or_else(|| EngineError::NotInstalled(key.to_string()))?;

        let result = activate(
            &target,
            &self.config.link_path,
            self.search_path.as_ref(),
            self.config.verify_timeout,
        )
        .await;

        match result {
            Ok(version) => {
                self.registry
                    .update(|registry| {
                        registry.mark_active(Some(&target.install_path));
                    })
                    .await?;
                Ok(version)
            }
            Err(error) => {
                // The link may have moved before the failing stage.
                if let Err(reconcile_error) = self.reconcile().await {
                    warn!("Reconcile after failed activation failed: {reconcile_error}");
                }
                Err(error.into())
            }
        }
    }

    /// # Errors
    /// Returns an error when the removal fails or the registry cannot be saved.
    pub async fn remove(&self, key: &VersionKey) -> Result<InstalledVersion, EngineError> {
        let _serial = self.activation.lock().await;
        let mut registry = self.registry.lock().await;
        let result = remove_version(&mut registry, key, &self.config.link_path).await;
        if !matches!(result, Err(RemoveError::NotInstalled(_))) {
            self.registry.save(&registry)?;
        }
        Ok(result?)
    }

    /// Remove several versions, continuing past failures.
    pub async fn remove_many(&self, keys: &[VersionKey]) -> RemoveSummary {
        let mut summary = RemoveSummary::default();
        for key in keys {
            match self.remove(key).await {
                Ok(_) => summary.removed += 1,
                Err(error) => {
                    warn!("Failed to remove {key}: {error}");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    pub async fn check_active_version(&self) -> ActiveStatus {
        check_active_version(&self.config.link_path, self.config.verify_timeout).await
    }

    #[must_use]
    pub fn link_path(&self) -> &Path {
        &self.config.link_path
    }
}
