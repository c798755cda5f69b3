use std::path::{Path, PathBuf};

use log::{info, warn};
use phpswitch_model::{InstalledVersion, Registry, VersionKey, paths_equal};
use phpswitch_platform::{LinkError, link_state, remove_link};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("{0} is not installed")]
    NotInstalled(String),
    #[error("install directory {0} was already gone; dropped the stale entry")]
    MissingDirectory(PathBuf),
    #[error("failed to delete {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove the active link: {0}")]
    Link(#[source] LinkError),
}

/// Delete an installed version's directory and drop it from `registry`.
///
/// The redirection is removed too when it points at that directory. A missing
/// directory still drops the entry but is reported as an error.
///
/// # Errors
/// Returns an error when the version is unknown, its directory was missing, or
/// the link or directory cannot be deleted.
pub async fn remove_version(
    registry: &mut Registry,
    key: &VersionKey,
    link_path: &Path,
) -> Result<InstalledVersion, RemoveError> {
    let entry = registry
        .find_installed(key)
        .cloned()
        .ok_or_else(|| RemoveError::NotInstalled(key.to_string()))?;

    if link_state(link_path)
        .target()
        .is_some_and(|target| paths_equal(target, &entry.install_path))
    {
        info!("Removing active link {}", link_path.display());
        remove_link(link_path).map_err(RemoveError::Link)?;
        registry.mark_active(None);
    }

    if !entry.install_path.is_dir() {
        warn!(
            "{} is already gone; dropping {}",
            entry.install_path.display(),
            entry.display_name()
        );
        registry.remove_installed(key);
        return Err(RemoveError::MissingDirectory(entry.install_path));
    }

    tokio::fs::remove_dir_all(&entry.install_path)
        .await
        .map_err(|source| RemoveError::Delete {
            path: entry.install_path.clone(),
            source,
        })?;

    registry.remove_installed(key);
    info!("Removed {}", entry.display_name());
    Ok(entry)
}

/// Tally of a batch removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveSummary {
    pub removed: usize,
    pub failed: usize,
}
