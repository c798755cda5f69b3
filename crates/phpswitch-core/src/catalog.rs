//! Release catalog discovery from the archive directory listing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info, warn};
use phpswitch_model::{Arch, CatalogEntry, PhpVersion, ThreadSafety, VersionKey};
use regex::Regex;
use thiserror::Error;

use crate::http::{DEFAULT_PROBE_URLS, probe_connectivity};

pub const DEFAULT_LISTING_URL: &str = "https://windows.php.net/downloads/releases/archives/";

const PACKAGE_PATTERN: &str = r"php-(\d+\.\d+\.\d+)(?:-nts)?-Win32(?:-(?:VC\d+|vc\d+|vs\d+|VS\d+))?(?:-(?:x64|x86))?\.zip";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no connectivity probe endpoint answered")]
    Connectivity,
    #[error("failed to fetch release listing from {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("release listing request returned HTTP {status} for {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("release listing request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("release listing was empty")]
    EmptyListing,
    #[error("no packages found in the release listing; the site structure may have changed")]
    StructureChanged,
    #[error("invalid listing pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Where and how the catalog is fetched.
#[derive(Debug, Clone)]
pub struct CatalogSource {
    pub listing_url: String,
    pub probe_urls: Vec<String>,
    pub probe_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Raw listing is written here after a successful fetch (dev mode).
    pub dump_path: Option<PathBuf>,
}

impl Default for CatalogSource {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
            probe_urls: DEFAULT_PROBE_URLS.iter().map(ToString::to_string).collect(),
            probe_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(30),
            dump_path: None,
        }
    }
}

struct PackageMatch<'a> {
    file_name: &'a str,
    version: PhpVersion,
}

fn collect_matches<'a>(body: &'a str, pattern: &Regex) -> Vec<PackageMatch<'a>> {
    pattern
        .captures_iter(body)
        .filter_map(|captures| {
            let file_name = captures.get(1)?.as_str();
            let version = captures.get(2)?.as_str();
            match version.parse() {
                Ok(version) => Some(PackageMatch { file_name, version }),
                Err(error) => {
                    debug!("Skipping {file_name}: {error}");
                    None
                }
            }
        })
        .collect()
}

fn join_url(base: &str, file_name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{file_name}")
    } else {
        format!("{base}/{file_name}")
    }
}

/// Parse package file names out of a directory listing.
///
/// # Errors
/// Returns [`CatalogError::StructureChanged`] when neither the link-text
/// pattern nor the `href` pattern finds any package.
pub fn parse_listing(body: &str, base_url: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
    let primary = Regex::new(&format!(r">\s*({PACKAGE_PATTERN})\s*<"))?;
    let mut matches = collect_matches(body, &primary);

    // Listings that label links with something other than the file name.
    if matches.is_empty() {
        let fallback = Regex::new(&format!(r#"(?i:href)="(?:[^"]*/)?({PACKAGE_PATTERN})""#))?;
        matches = collect_matches(body, &fallback);
        if !matches.is_empty() {
            debug!("Listing parsed with the href pattern");
        }
    }
    if matches.is_empty() {
        return Err(CatalogError::StructureChanged);
    }

    let mut max_patch: HashMap<(u32, u32), u32> = HashMap::new();
    for m in &matches {
        let patch = max_patch.entry(m.version.minor_line()).or_insert(0);
        *patch = (*patch).max(m.version.patch);
    }

    let mut seen: HashSet<VersionKey> = HashSet::new();
    let mut entries: Vec<CatalogEntry> = matches
        .iter()
        .filter_map(|m| {
            let thread_safety = ThreadSafety::from_nts(m.file_name.contains("-nts"));
            let arch = if m.file_name.contains("-x64") {
                Arch::X64
            } else {
                Arch::X86
            };
            let key = VersionKey::new(m.version, thread_safety, arch);
            if !seen.insert(key) {
                return None;
            }
            Some(CatalogEntry {
                version: m.version,
                file_name: m.file_name.to_string(),
                thread_safety,
                arch,
                download_url: join_url(base_url, m.file_name),
                is_latest_patch: max_patch.get(&m.version.minor_line()) == Some(&m.version.patch),
            })
        })
        .collect();

    entries.sort_by(|a, b| b.version.sort_key().cmp(&a.version.sort_key()));
    Ok(entries)
}

fn request_error(url: &str, timeout: Duration, source: reqwest::Error) -> CatalogError {
    if source.is_timeout() {
        CatalogError::Timeout {
            timeout_secs: timeout.as_secs(),
        }
    } else {
        CatalogError::Request {
            url: url.to_string(),
            source,
        }
    }
}

/// Fetch and parse the release listing.
///
/// # Errors
/// Returns an error when no probe endpoint answers, the listing cannot be
/// fetched, or it contains no recognisable packages.
pub async fn try_fetch_catalog(
    client: &reqwest::Client,
    source: &CatalogSource,
) -> Result<Vec<CatalogEntry>, CatalogError> {
    if !probe_connectivity(client, &source.probe_urls, source.probe_timeout).await {
        return Err(CatalogError::Connectivity);
    }

    let url = source.listing_url.as_str();
    info!("Fetching release listing from {url}");
    let response = client
        .get(url)
        .timeout(source.fetch_timeout)
        .send()
        .await
        .map_err(|error| request_error(url, source.fetch_timeout, error))?;

    if !response.status().is_success() {
        return Err(CatalogError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let body = response
        .text()
        .await
        .map_err(|error| request_error(url, source.fetch_timeout, error))?;
    if body.trim().is_empty() {
        return Err(CatalogError::EmptyListing);
    }

    if let Some(dump) = &source.dump_path {
        match tokio::fs::write(dump, &body).await {
            Ok(()) => debug!("Wrote raw listing to {}", dump.display()),
            Err(error) => warn!("Failed to write listing dump {}: {error}", dump.display()),
        }
    }

    let entries = parse_listing(&body, url)?;
    info!("Release listing holds {} packages", entries.len());
    Ok(entries)
}

/// Fetch the catalog, yielding `None` on any failure so the caller keeps its
/// previous catalog.
pub async fn fetch_catalog(
    client: &reqwest::Client,
    source: &CatalogSource,
) -> Option<Vec<CatalogEntry>> {
    match try_fetch_catalog(client, source).await {
        Ok(entries) => Some(entries),
        Err(CatalogError::Connectivity) => {
            warn!("No internet connection, keeping the cached catalog");
            None
        }
        Err(error) => {
            warn!("Catalog fetch failed: {error}");
            None
        }
    }
}

/// Entries flagged as the newest patch of their minor line.
#[must_use]
pub fn latest_patches(catalog: &[CatalogEntry]) -> Vec<&CatalogEntry> {
    catalog.iter().filter(|e| e.is_latest_patch).collect()
}

#[derive(Debug, Clone)]
pub struct MinorLine<'a> {
    pub major: u32,
    pub minor: u32,
    pub entries: Vec<&'a CatalogEntry>,
}

/// Group entries by minor line, newest line first. Within a line entries are
/// ordered newest first with thread-safe builds ahead of non-thread-safe ones.
#[must_use]
pub fn group_by_minor_line<'a>(entries: &[&'a CatalogEntry]) -> Vec<MinorLine<'a>> {
    let mut lines: BTreeMap<(u32, u32), Vec<&'a CatalogEntry>> = BTreeMap::new();
    for entry in entries {
        lines
            .entry(entry.version.minor_line())
            .or_default()
            .push(entry);
    }

    lines
        .into_iter()
        .rev()
        .map(|((major, minor), mut entries)| {
            entries.sort_by(|a, b| {
                b.version
                    .cmp(&a.version)
                    .then(a.thread_safety.cmp(&b.thread_safety))
            });
            MinorLine {
                major,
                minor,
                entries,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://windows.php.net/downloads/releases/archives/";

    fn listing(files: &[&str]) -> String {
        files
            .iter()
            .map(|f| format!("<a href=\"/downloads/releases/archives/{f}\">{f}</a><br>\n"))
            .collect()
    }

    #[test]
    fn latest_patch_is_flagged_per_minor_line() {
        let body = listing(&["php-8.2.1-Win32-vs16-x64.zip", "php-8.2.3-Win32-vs16-x64.zip"]);
        let entries = parse_listing(&body, BASE).unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.arch == Arch::X64));
        assert!(entries.iter().all(|e| e.thread_safety == ThreadSafety::Ts));
        let latest: Vec<_> = entries.iter().filter(|e| e.is_latest_patch).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, PhpVersion::new(8, 2, 3));
    }

    #[test]
    fn variants_are_detected_from_file_name() {
        let body = listing(&[
            "php-7.4.33-nts-Win32-vc15-x86.zip",
            "php-5.2.17-Win32-VC6-x86.zip",
            "php-5.3.0-Win32.zip",
        ]);
        let entries = parse_listing(&body, BASE).unwrap();

        let nts = entries
            .iter()
            .find(|e| e.version == PhpVersion::new(7, 4, 33))
            .unwrap();
        assert_eq!(nts.thread_safety, ThreadSafety::Nts);
        assert_eq!(nts.arch, Arch::X86);

        let bare = entries
            .iter()
            .find(|e| e.version == PhpVersion::new(5, 3, 0))
            .unwrap();
        assert_eq!(bare.arch, Arch::X86);
        assert_eq!(bare.file_name, "php-5.3.0-Win32.zip");
    }

    #[test]
    fn duplicate_links_collapse_to_one_entry() {
        let body = listing(&[
            "php-8.1.0-Win32-vs16-x64.zip",
            "php-8.1.0-Win32-vs16-x64.zip",
            "php-8.1.0-nts-Win32-vs16-x64.zip",
        ]);
        let entries = parse_listing(&body, BASE).unwrap();

        let keys: HashSet<_> = entries.iter().map(CatalogEntry::key).collect();
        assert_eq!(keys.len(), entries.len());
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn entries_sorted_descending() {
        let body = listing(&[
            "php-7.4.1-Win32-vc15-x64.zip",
            "php-8.3.0-Win32-vs16-x64.zip",
            "php-8.2.10-Win32-vs16-x64.zip",
            "php-8.2.9-Win32-vs16-x64.zip",
        ]);
        let entries = parse_listing(&body, BASE).unwrap();
        let versions: Vec<String> = entries.iter().map(|e| e.version.to_string()).collect();
        assert_eq!(versions, ["8.3.0", "8.2.10", "8.2.9", "7.4.1"]);
    }

    #[test]
    fn download_url_joins_base_and_file_name() {
        let body = listing(&["php-8.3.0-Win32-vs16-x64.zip"]);
        let entries = parse_listing(&body, "https://mirror.example/archives").unwrap();
        assert_eq!(
            entries[0].download_url,
            "https://mirror.example/archives/php-8.3.0-Win32-vs16-x64.zip"
        );
    }

    #[test]
    fn href_is_used_when_link_text_is_not_the_file_name() {
        let body = concat!(
            "<A HREF=\"/downloads/releases/archives/php-8.2.3-Win32-vs16-x64.zip\">PHP 8.2.3 x64</A>\n",
            "<a href=\"php-8.2.3-nts-Win32-vs16-x64.zip\">PHP 8.2.3 NTS x64</a>\n",
        );
        let entries = parse_listing(body, BASE).unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.thread_safety == ThreadSafety::Nts));
        assert!(
            entries
                .iter()
                .all(|e| e.download_url.starts_with(BASE) && e.version == PhpVersion::new(8, 2, 3))
        );
    }

    #[test]
    fn link_text_pattern_ignores_file_names_in_prose() {
        let body = format!(
            "<p>Looking for php-5.0.0-Win32.zip? It moved.</p>\n{}",
            listing(&["php-8.3.0-Win32-vs16-x64.zip"])
        );
        let entries = parse_listing(&body, BASE).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, PhpVersion::new(8, 3, 0));
    }

    #[test]
    fn unrelated_markup_is_structure_change() {
        let error = parse_listing("<html><a href=\"x.zip\">x</a></html>", BASE).unwrap_err();
        assert!(matches!(error, CatalogError::StructureChanged));
    }

    #[test]
    fn every_minor_line_has_one_latest_per_variant() {
        let body = listing(&[
            "php-8.2.1-Win32-vs16-x64.zip",
            "php-8.2.3-Win32-vs16-x64.zip",
            "php-8.2.3-nts-Win32-vs16-x64.zip",
            "php-8.2.3-Win32-vs16-x86.zip",
            "php-8.1.5-Win32-vs16-x64.zip",
            "php-8.1.27-Win32-vs16-x64.zip",
        ]);
        let entries = parse_listing(&body, BASE).unwrap();

        let mut max_patch: HashMap<(u32, u32), u32> = HashMap::new();
        for e in &entries {
            let p = max_patch.entry(e.version.minor_line()).or_insert(0);
            *p = (*p).max(e.version.patch);
        }
        let mut flagged: HashMap<(u32, u32, ThreadSafety, Arch), usize> = HashMap::new();
        for e in entries.iter().filter(|e| e.is_latest_patch) {
            assert_eq!(Some(&e.version.patch), max_patch.get(&e.version.minor_line()));
            let (major, minor) = e.version.minor_line();
            *flagged.entry((major, minor, e.thread_safety, e.arch)).or_default() += 1;
        }
        assert!(flagged.values().all(|count| *count == 1));
        for line in max_patch.keys() {
            assert!(flagged.keys().any(|(ma, mi, _, _)| (*ma, *mi) == *line));
        }
    }

    #[test]
    fn group_by_minor_line_orders_lines_and_variants() {
        let body = listing(&[
            "php-8.1.27-nts-Win32-vs16-x64.zip",
            "php-8.1.27-Win32-vs16-x64.zip",
            "php-8.3.0-Win32-vs16-x64.zip",
            "php-7.4.33-Win32-vc15-x64.zip",
            "php-7.4.1-Win32-vc15-x64.zip",
        ]);
        let entries = parse_listing(&body, BASE).unwrap();
        let latest = latest_patches(&entries);
        assert_eq!(latest.len(), 4);

        let lines = group_by_minor_line(&latest);
        let heads: Vec<(u32, u32)> = lines.iter().map(|l| (l.major, l.minor)).collect();
        assert_eq!(heads, [(8, 3), (8, 1), (7, 4)]);
        assert_eq!(lines[1].entries[0].thread_safety, ThreadSafety::Ts);
        assert_eq!(lines[1].entries[1].thread_safety, ThreadSafety::Nts);
    }
}
