//! Switching the system-wide redirection to an installed version.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use phpswitch_model::{InstalledVersion, PhpVersion, RUNTIME_EXECUTABLE};
use phpswitch_platform::{
    LinkError, LinkState, ProcessError, SearchPath, SearchPathError, copy_tree, create_dir_link,
    link_state, remove_link, run_captured,
};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("runtime exited unsuccessfully")]
    ExitStatus,
    #[error("runtime reported errors: {0}")]
    Stderr(String),
    #[error("could not find a version in runtime output: {0}")]
    Unparsable(String),
}

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("install directory {0} does not exist")]
    TargetMissing(PathBuf),
    #[error("failed to back up existing directory: {0}")]
    Backup(#[source] LinkError),
    #[error("failed to remove existing entry: {0}")]
    RemoveExisting(#[source] LinkError),
    #[error("failed to create link: {0}")]
    Link(#[source] LinkError),
    #[error("linked, but failed to update the search path: {0}")]
    PathUpdate(#[source] SearchPathError),
    #[error("linked, but the runtime could not be verified: {0}")]
    Verify(#[source] VerifyError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcome of probing the redirection for a working runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveStatus {
    NotActive,
    MissingExecutable,
    Active(PhpVersion),
    Unknown,
}

/// Pull `X.Y.Z` out of `PHP X.Y.Z (cli) ...`.
#[must_use]
pub fn parse_version_output(output: &str) -> Option<PhpVersion> {
    let pattern = Regex::new(r"PHP (\d+\.\d+\.\d+)").ok()?;
    pattern.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Run `<dir>/php -v` and require a clean exit, empty stderr and a version.
///
/// # Errors
/// Returns an error describing which of those checks failed.
pub async fn verify_runtime(dir: &Path, timeout: Duration) -> Result<PhpVersion, VerifyError> {
    let executable = dir.join(RUNTIME_EXECUTABLE);
    let output = run_captured(&executable, ["-v"], timeout).await?;

    if !output.stderr.trim().is_empty() {
        return Err(VerifyError::Stderr(output.stderr.trim().to_string()));
    }
    if !output.success {
        return Err(VerifyError::ExitStatus);
    }
    parse_version_output(&output.stdout)
        .ok_or_else(|| VerifyError::Unparsable(output.stdout.trim().to_string()))
}

/// Report which runtime, if any, the redirection currently serves.
pub async fn check_active_version(link_path: &Path, timeout: Duration) -> ActiveStatus {
    if link_state(link_path) == LinkState::Missing {
        return ActiveStatus::NotActive;
    }
    if !link_path.join(RUNTIME_EXECUTABLE).is_file() {
        return ActiveStatus::MissingExecutable;
    }
    match verify_runtime(link_path, timeout).await {
        Ok(version) => ActiveStatus::Active(version),
        Err(error) => {
            debug!("Active version check failed: {error}");
            ActiveStatus::Unknown
        }
    }
}

/// Sibling path used to preserve a real directory found at the redirection path.
#[must_use]
pub fn backup_path(link_path: &Path, now: DateTime<Local>) -> PathBuf {
    let name = link_path
        .file_name()
        .map_or_else(|| "php".to_string(), |n| n.to_string_lossy().into_owned());
    let stamp = now.format("%Y%m%d_%H%M%S");
    let base = link_path.with_file_name(format!("{name}_backup_{stamp}"));

    let mut candidate = base.clone();
    let mut counter = 1;
    while std::fs::symlink_metadata(&candidate).is_ok() {
        candidate = PathBuf::from(format!("{}_{counter}", base.display()));
        counter += 1;
    }
    candidate
}

async fn back_up_and_clear(link_path: &Path, backup: PathBuf) -> Result<(), ActivationError> {
    let src = link_path.to_path_buf();
    info!(
        "{} is a real directory; backing it up to {}",
        src.display(),
        backup.display()
    );
    tokio::task::spawn_blocking(move || copy_tree(&src, &backup))
        .await?
        .map_err(ActivationError::Backup)?;

    let removal = if link_path.is_dir() {
        tokio::fs::remove_dir_all(link_path).await
    } else {
        tokio::fs::remove_file(link_path).await
    };
    removal.map_err(|source| {
        ActivationError::RemoveExisting(LinkError::Io {
            context: "failed to remove backed-up directory",
            path: link_path.to_path_buf(),
            source,
        })
    })
}

/// Point `link_path` at `target`, make sure it is on the search path, and
/// verify the runtime behind it.
///
/// Callers must serialize activations; the redirection is a single shared entry.
///
/// # Errors
/// Each stage has its own [`ActivationError`] variant. Failures from
/// [`ActivationError::PathUpdate`] onward leave the link pointing at `target`.
pub async fn activate(
    target: &InstalledVersion,
    link_path: &Path,
    search_path: &dyn SearchPath,
    verify_timeout: Duration,
) -> Result<PhpVersion, ActivationError> {
    if !target.install_path.is_dir() {
        return Err(ActivationError::TargetMissing(target.install_path.clone()));
    }

    match link_state(link_path) {
        LinkState::Missing => {}
        LinkState::RealDirectory => {
            let backup = backup_path(link_path, Local::now());
            back_up_and_clear(link_path, backup).await.inspect_err(|error| {
                error!("Activation stopped before linking: {error}");
            })?;
        }
        LinkState::Link(previous) => {
            debug!("Removing previous link to {}", previous.display());
            remove_link(link_path).map_err(|error| {
                error!("Failed to remove previous link: {error}");
                ActivationError::RemoveExisting(error)
            })?;
        }
    }

    create_dir_link(link_path, &target.install_path).map_err(|error| {
        error!("Failed to link {}: {error}", link_path.display());
        ActivationError::Link(error)
    })?;
    info!(
        "Linked {} -> {}",
        link_path.display(),
        target.install_path.display()
    );

    let on_path = search_path
        .contains(link_path)
        .map_err(ActivationError::PathUpdate)?;
    if !on_path {
        search_path.append(link_path).map_err(|error| {
            error!("Failed to add {} to {}: {error}", link_path.display(), search_path.describe());
            ActivationError::PathUpdate(error)
        })?;
    }

    let version = verify_runtime(link_path, verify_timeout)
        .await
        .map_err(|error| {
            error!("Verification of {} failed: {error}", target.display_name());
            ActivationError::Verify(error)
        })?;
    if version != target.version {
        warn!(
            "Runtime reports {version} but {} was activated",
            target.version
        );
    }
    info!("Activated {}", target.display_name());
    Ok(version)
}
