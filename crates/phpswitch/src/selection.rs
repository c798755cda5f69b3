use std::str::FromStr;

use phpswitch_model::{Arch, CatalogEntry, InstalledVersion, PhpVersion, ThreadSafety};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a version: use X.Y for the newest patch of a line or X.Y.Z")]
pub struct SelectorError(String);

/// A version named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    /// `X.Y`: the newest patch of a minor line.
    Line { major: u32, minor: u32 },
    Exact(PhpVersion),
}

impl FromStr for VersionSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        if let Ok(version) = trimmed.parse::<PhpVersion>() {
            return Ok(Self::Exact(version));
        }
        let (major, minor) = trimmed
            .split_once('.')
            .ok_or_else(|| SelectorError(s.to_string()))?;
        match (major.parse(), minor.parse()) {
            (Ok(major), Ok(minor)) => Ok(Self::Line { major, minor }),
            _ => Err(SelectorError(s.to_string())),
        }
    }
}

impl VersionSelector {
    #[must_use]
    pub fn matches(self, version: PhpVersion) -> bool {
        match self {
            Self::Line { major, minor } => version.minor_line() == (major, minor),
            Self::Exact(exact) => version == exact,
        }
    }
}

/// Build flavour filter from `--nts` / `--x86`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildFilter {
    pub thread_safety: ThreadSafety,
    /// `None` accepts either architecture.
    pub arch: Option<Arch>,
}

impl BuildFilter {
    #[must_use]
    pub fn new(nts: bool, x86: bool) -> Self {
        Self {
            thread_safety: ThreadSafety::from_nts(nts),
            arch: x86.then_some(Arch::X86),
        }
    }

    fn accepts(self, thread_safety: ThreadSafety, arch: Arch) -> bool {
        thread_safety == self.thread_safety && self.arch.is_none_or(|wanted| wanted == arch)
    }
}

/// The newest catalog entry matching `selector`. Without an explicit
/// architecture x64 builds are preferred.
#[must_use]
pub fn resolve_catalog(
    catalog: &[CatalogEntry],
    selector: VersionSelector,
    filter: BuildFilter,
) -> Option<&CatalogEntry> {
    let arch = filter.arch.unwrap_or(Arch::X64);
    let candidates = catalog
        .iter()
        .filter(|entry| selector.matches(entry.version))
        .filter(|entry| entry.thread_safety == filter.thread_safety);

    candidates
        .clone()
        .filter(|entry| entry.arch == arch)
        .max_by_key(|entry| entry.version)
        .or_else(|| {
            if filter.arch.is_some() {
                None
            } else {
                candidates.max_by_key(|entry| entry.version)
            }
        })
}

/// The newest installed version matching `selector`.
#[must_use]
pub fn resolve_installed(
    installed: &[InstalledVersion],
    selector: VersionSelector,
    filter: BuildFilter,
) -> Option<&InstalledVersion> {
    installed
        .iter()
        .filter(|entry| selector.matches(entry.version))
        .filter(|entry| filter.accepts(entry.thread_safety, entry.arch))
        .max_by_key(|entry| entry.version)
}
