use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Directory-name prefix shared by every install directory.
pub const INSTALL_DIR_PREFIX: &str = "php";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhpVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl PhpVersion {
    #[must_use]
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The `major.minor` line this release belongs to.
    #[must_use]
    pub fn minor_line(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    /// Flat numeric key used for descending catalog ordering.
    #[must_use]
    pub fn sort_key(&self) -> u64 {
        u64::from(self.major) * 10_000 + u64::from(self.minor) * 100 + u64::from(self.patch)
    }
}

impl Ord for PhpVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
    }
}

impl PartialOrd for PhpVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PhpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl From<PhpVersion> for String {
    fn from(version: PhpVersion) -> Self {
        version.to_string()
    }
}

impl TryFrom<String> for PhpVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionComponent {
    Major,
    Minor,
    Patch,
}

impl fmt::Display for VersionComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Major => write!(f, "major"),
            Self::Minor => write!(f, "minor"),
            Self::Patch => write!(f, "patch"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum VersionParseError {
    #[error("Expected X.Y.Z format, got: {input}")]
    InvalidFormat { input: String },
    #[error("Invalid {component} version: {value}")]
    InvalidComponent {
        component: VersionComponent,
        value: String,
    },
}

fn parse_component(value: &str, component: VersionComponent) -> Result<u32, VersionParseError> {
    value
        .parse()
        .map_err(|_| VersionParseError::InvalidComponent {
            component,
            value: value.to_string(),
        })
}

impl FromStr for PhpVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || VersionParseError::InvalidFormat {
            input: s.to_string(),
        };

        let mut parts = s.split('.');
        let major = parts.next().ok_or_else(invalid)?;
        let minor = parts.next().ok_or_else(invalid)?;
        let patch = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(PhpVersion::new(
            parse_component(major, VersionComponent::Major)?,
            parse_component(minor, VersionComponent::Minor)?,
            parse_component(patch, VersionComponent::Patch)?,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadSafety {
    Ts,
    Nts,
}

impl ThreadSafety {
    #[must_use]
    pub fn from_nts(is_nts: bool) -> Self {
        if is_nts { Self::Nts } else { Self::Ts }
    }

    #[must_use]
    pub fn is_nts(self) -> bool {
        self == Self::Nts
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Ts => "Thread Safe",
            Self::Nts => "Non-Thread Safe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86,
    X64,
}

impl Arch {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity shared by catalog entries and installed versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionKey {
    pub version: PhpVersion,
    pub thread_safety: ThreadSafety,
    pub arch: Arch,
}

impl VersionKey {
    #[must_use]
    pub fn new(version: PhpVersion, thread_safety: ThreadSafety, arch: Arch) -> Self {
        Self {
            version,
            thread_safety,
            arch,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PHP {} ({}) ({})",
            self.version,
            self.thread_safety.label(),
            self.arch
        )
    }
}

/// Deterministic install directory name, e.g. `php-8.2.3` or `php-8.2.3-nts`.
#[must_use]
pub fn install_dir_name(version: PhpVersion, thread_safety: ThreadSafety) -> String {
    match thread_safety {
        ThreadSafety::Ts => format!("{INSTALL_DIR_PREFIX}-{version}"),
        ThreadSafety::Nts => format!("{INSTALL_DIR_PREFIX}-{version}-nts"),
    }
}

/// Inverse of [`install_dir_name`]. Names with any other shape yield `None`.
#[must_use]
pub fn parse_install_dir_name(name: &str) -> Option<(PhpVersion, ThreadSafety)> {
    let rest = name.strip_prefix(INSTALL_DIR_PREFIX)?.strip_prefix('-')?;
    let (version, thread_safety) = match rest.strip_suffix("-nts") {
        Some(version) => (version, ThreadSafety::Nts),
        None => (rest, ThreadSafety::Ts),
    };
    let version = version.parse().ok()?;
    Some((version, thread_safety))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub version: PhpVersion,
    pub file_name: String,
    pub thread_safety: ThreadSafety,
    pub arch: Arch,
    pub download_url: String,
    #[serde(rename = "last-patch")]
    pub is_latest_patch: bool,
}

impl CatalogEntry {
    #[must_use]
    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.version, self.thread_safety, self.arch)
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.key().to_string()
    }

    #[must_use]
    pub fn install_dir_name(&self) -> String {
        install_dir_name(self.version, self.thread_safety)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub version: PhpVersion,
    pub thread_safety: ThreadSafety,
    pub arch: Arch,
    pub install_path: PathBuf,
    pub install_date: chrono::DateTime<chrono::Utc>,
    pub is_active: bool,
}

impl InstalledVersion {
    #[must_use]
    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.version, self.thread_safety, self.arch)
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.key().to_string()
    }
}
