//! Bringing the registry in line with what is on disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use phpswitch_model::{
    InstalledVersion, RUNTIME_EXECUTABLE, Registry, VersionKey, parse_install_dir_name,
    paths_equal,
};
use phpswitch_platform::{inspect_arch, link_state};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub found: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ReconcileReport {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.added > 0 || self.updated > 0 || self.removed > 0
    }
}

struct ScannedInstall {
    key: VersionKey,
    path: PathBuf,
    created: DateTime<Utc>,
}

fn creation_time(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|meta| meta.created().or_else(|_| meta.modified()))
        .map_or_else(|_| Utc::now(), DateTime::<Utc>::from)
}

fn scan_install_root(root: &Path) -> Vec<ScannedInstall> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(error) => {
            warn!("Could not read install root {}: {error}", root.display());
            return Vec::new();
        }
    };

    let mut scanned = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let executable = path.join(RUNTIME_EXECUTABLE);
        if !executable.is_file() {
            debug!("Skipping {}: no {RUNTIME_EXECUTABLE}", path.display());
            continue;
        }
        let name = entry.file_name();
        let Some((version, thread_safety)) = parse_install_dir_name(&name.to_string_lossy())
        else {
            warn!(
                "Skipping {}: directory name is not a recognised version",
                path.display()
            );
            continue;
        };

        scanned.push(ScannedInstall {
            key: VersionKey::new(version, thread_safety, inspect_arch(&executable)),
            created: creation_time(&path),
            path,
        });
    }
    scanned
}

/// Sync `registry` with the install root and re-derive the active flag from
/// the redirection at `link_path`. The caller persists the result.
pub fn reconcile(registry: &mut Registry, link_path: &Path) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let root = registry.install_root.clone();
    if !root.is_dir() {
        debug!("Install root {} does not exist", root.display());
        return report;
    }

    let state = link_state(link_path);
    let link_target = state.target();

    let mut scanned = scan_install_root(&root);
    report.found = scanned.len();
    // Directories already on record win ties, then the lowest path.
    scanned.sort_by_cached_key(|install| {
        let recorded = registry
            .find_installed(&install.key)
            .is_some_and(|existing| paths_equal(&existing.install_path, &install.path));
        (!recorded, install.path.clone())
    });

    let mut claimed: HashSet<VersionKey> = HashSet::new();
    let mut scanned_keys: HashMap<String, VersionKey> = HashMap::new();
    for install in scanned {
        if !claimed.insert(install.key) {
            warn!(
                "Ignoring {}: another directory already holds {}",
                install.path.display(),
                install.key
            );
            continue;
        }
        scanned_keys.insert(
            install.path.to_string_lossy().to_lowercase(),
            install.key,
        );
        match registry.find_installed_mut(&install.key) {
            Some(existing) => {
                if !paths_equal(&existing.install_path, &install.path) {
                    info!(
                        "{} moved to {}",
                        existing.display_name(),
                        install.path.display()
                    );
                    existing.install_path = install.path;
                    report.updated += 1;
                }
            }
            None => {
                let is_active =
                    link_target.is_some_and(|target| paths_equal(target, &install.path));
                info!("Found untracked install at {}", install.path.display());
                registry.installed_versions.push(InstalledVersion {
                    version: install.key.version,
                    thread_safety: install.key.thread_safety,
                    arch: install.key.arch,
                    install_path: install.path,
                    install_date: install.created,
                    is_active,
                });
                report.added += 1;
            }
        }
    }

    let before = registry.installed_versions.len();
    registry.installed_versions.retain(|entry| {
        if !entry.install_path.is_dir() {
            info!(
                "Dropping {}: {} no longer exists",
                entry.display_name(),
                entry.install_path.display()
            );
            return false;
        }
        let scanned_key = scanned_keys.get(&entry.install_path.to_string_lossy().to_lowercase());
        if scanned_key.is_some_and(|key| *key != entry.key()) {
            info!(
                "Dropping {}: directory now holds a different build",
                entry.display_name()
            );
            return false;
        }
        true
    });
    report.removed = before - registry.installed_versions.len();

    if registry.mark_active(link_target) {
        report.updated += 1;
    }
    registry.installed_versions.sort_by(|a, b| {
        b.version
            .cmp(&a.version)
            .then(a.thread_safety.cmp(&b.thread_safety))
            .then(a.arch.as_str().cmp(b.arch.as_str()))
    });

    if report.changed() {
        info!(
            "Reconciled {}: {} found, {} added, {} updated, {} removed",
            root.display(),
            report.found,
            report.added,
            report.updated,
            report.removed
        );
    }
    report
}
