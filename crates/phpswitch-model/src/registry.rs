use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    Arch, CatalogEntry, InstalledVersion, PhpVersion, ThreadSafety, VersionKey, install_dir_name,
};

/// Runtime executable expected inside every install directory.
#[cfg(windows)]
pub const RUNTIME_EXECUTABLE: &str = "php.exe";
#[cfg(not(windows))]
pub const RUNTIME_EXECUTABLE: &str = "php";

/// Compare two filesystem paths ignoring case, separator style and trailing separators.
#[must_use]
pub fn paths_equal(a: &Path, b: &Path) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/").to_lowercase();
    let trimmed = text.trim_end_matches('/');
    if trimmed.is_empty() {
        text
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub install_root: PathBuf,
    #[serde(default)]
    pub installed_versions: Vec<InstalledVersion>,
    #[serde(default)]
    pub available_versions: Vec<CatalogEntry>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Registry {
    #[must_use]
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn find_installed(&self, key: &VersionKey) -> Option<&InstalledVersion> {
        self.installed_versions.iter().find(|v| v.key() == *key)
    }

    pub fn find_installed_mut(&mut self, key: &VersionKey) -> Option<&mut InstalledVersion> {
        self.installed_versions.iter_mut().find(|v| v.key() == *key)
    }

    #[must_use]
    pub fn active(&self) -> Option<&InstalledVersion> {
        self.installed_versions.iter().find(|v| v.is_active)
    }

    /// Insert `entry`, replacing any record with the same key or the same install path.
    pub fn upsert_installed(&mut self, entry: InstalledVersion) {
        let key = entry.key();
        self.installed_versions
            .retain(|v| v.key() != key && !paths_equal(&v.install_path, &entry.install_path));
        if entry.is_active {
            for other in &mut self.installed_versions {
                other.is_active = false;
            }
        }
        self.installed_versions.push(entry);
    }

    pub fn remove_installed(&mut self, key: &VersionKey) -> Option<InstalledVersion> {
        let index = self.installed_versions.iter().position(|v| v.key() == *key)?;
        Some(self.installed_versions.remove(index))
    }

    /// Re-derive every `is_active` flag from the redirection target.
    ///
    /// Returns `true` when any flag changed.
    pub fn mark_active(&mut self, link_target: Option<&Path>) -> bool {
        let mut changed = false;
        for entry in &mut self.installed_versions {
            let active = link_target.is_some_and(|target| paths_equal(&entry.install_path, target));
            if entry.is_active != active {
                entry.is_active = active;
                changed = true;
            }
        }
        changed
    }

    /// Swap in a freshly fetched catalog wholesale.
    pub fn replace_catalog(&mut self, entries: Vec<CatalogEntry>, fetched_at: DateTime<Utc>) {
        self.available_versions = entries;
        self.last_updated = Some(fetched_at);
    }

    #[must_use]
    pub fn install_dir(&self, version: PhpVersion, thread_safety: ThreadSafety) -> PathBuf {
        self.install_root
            .join(install_dir_name(version, thread_safety))
    }

    /// Whether a version is installed, consulting the registry first and the
    /// install root second.
    ///
    /// `inspect` reports the architecture of an executable found on disk and is
    /// only called for the filesystem fallback when `arch` is requested.
    pub fn is_installed<F>(
        &self,
        version: PhpVersion,
        thread_safety: ThreadSafety,
        arch: Option<Arch>,
        inspect: F,
    ) -> bool
    where
        F: FnOnce(&Path) -> Arch,
    {
        let tracked = self.installed_versions.iter().any(|v| {
            v.version == version
                && v.thread_safety == thread_safety
                && arch.is_none_or(|arch| v.arch == arch)
        });
        if tracked {
            return true;
        }

        let executable = self
            .install_dir(version, thread_safety)
            .join(RUNTIME_EXECUTABLE);
        if !executable.is_file() {
            return false;
        }
        match arch {
            Some(arch) => inspect(&executable) == arch,
            None => true,
        }
    }
}
