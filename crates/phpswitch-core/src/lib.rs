//! The version management engine.
//!
//! - Catalog discovery from the release archive listing.
//! - Package download and extraction with progress reporting.
//! - Activation through a single system-wide redirection.
//! - Reconciliation of the registry against the install root.

mod activate;
mod catalog;
mod engine;
mod http;
mod install;
mod reconcile;
mod refresh;
mod remove;

pub use activate::{
    ActivationError, ActiveStatus, VerifyError, activate, backup_path, check_active_version,
    parse_version_output, verify_runtime,
};
pub use catalog::{
    CatalogError, CatalogSource, DEFAULT_LISTING_URL, MinorLine, fetch_catalog,
    group_by_minor_line, latest_patches, parse_listing, try_fetch_catalog,
};
pub use engine::{Engine, EngineConfig, EngineError, RegistryHandle, StartupRefresh};
pub use http::{DEFAULT_PROBE_URLS, build_client, probe_connectivity};
pub use install::{InstallError, MIN_PACKAGE_BYTES, download_percent, install};
pub use reconcile::{ReconcileReport, reconcile};
pub use refresh::{BackgroundRefresh, RefreshPolicy, RefreshSlot};
pub use remove::{RemoveError, RemoveSummary, remove_version};
