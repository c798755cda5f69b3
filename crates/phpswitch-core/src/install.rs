//! Package download and extraction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use phpswitch_model::{
    CatalogEntry, InstallPhase, InstallProgress, InstalledVersion, ProgressSink,
    RUNTIME_EXECUTABLE,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Downloads at or below this size are treated as truncated.
pub const MIN_PACKAGE_BYTES: u64 = 1024 * 1024;

const WRITE_BUFFER_BYTES: usize = 8192;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
const EXTRACT_REPORT_EVERY: usize = 20;
const BYTES_PER_MB: f64 = 1_048_576.0;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{context}: {source}")]
    Request {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("download of {url} failed with HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("downloaded package is only {bytes} bytes; the download is incomplete or corrupt")]
    Undersized { bytes: u64 },
    #[error("downloaded package is not a readable archive: {0}")]
    UnreadableArchive(#[source] zip::result::ZipError),
    #[error("{context}: {source}")]
    Extract {
        context: &'static str,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl InstallError {
    fn request(context: &'static str, source: reqwest::Error) -> Self {
        Self::Request { context, source }
    }

    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

fn megabytes(bytes: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let bytes = bytes as f64;
    bytes / BYTES_PER_MB
}

/// `floor(downloaded / total * 100)`, capped at 100.
#[must_use]
pub fn download_percent(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (u128::from(downloaded) * 100 / u128::from(total)).min(100);
    u8::try_from(percent).unwrap_or(100)
}

fn download_status(downloaded: u64, total: Option<u64>, speed_mbps: f64) -> String {
    match total {
        Some(total) if total > 0 => {
            let remaining = megabytes(total.saturating_sub(downloaded));
            let eta = if speed_mbps > 0.0 {
                format!("{:.0}s", remaining / speed_mbps)
            } else {
                "unknown".to_string()
            };
            format!(
                "Downloading: {:.2} MB / {:.2} MB ({speed_mbps:.2} MB/s, ETA {eta})",
                megabytes(downloaded),
                megabytes(total)
            )
        }
        _ => format!(
            "Downloading: {:.2} MB ({speed_mbps:.2} MB/s)",
            megabytes(downloaded)
        ),
    }
}

fn safe_file_name(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && !n.contains(".."))
        .unwrap_or("php-package.zip")
}

/// Ask the server for the package size without downloading it.
async fn content_length(client: &reqwest::Client, url: &str) -> Option<u64> {
    let response = match client.head(url).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!("HEAD {url} returned {}", response.status());
            return None;
        }
        Err(error) => {
            warn!("HEAD {url} failed: {error}");
            return None;
        }
    };
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

async fn download_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    sink: &dyn ProgressSink,
) -> Result<u64, InstallError> {
    let mut total = content_length(client, url).await;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|error| InstallError::request("download request failed", error))?;
    if !response.status().is_success() {
        return Err(InstallError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }
    if total.is_none() {
        total = response.content_length().filter(|len| *len > 0);
    }

    let file = tokio::fs::File::create(dest)
        .await
        .map_err(|error| InstallError::io("failed to create download file", dest, error))?;
    let mut writer = tokio::io::BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);

    let started = Instant::now();
    let mut last_report = started;
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| InstallError::request("download stream error", error))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|error| InstallError::io("failed to write download data", dest, error))?;
        downloaded += chunk.len() as u64;

        if last_report.elapsed() >= PROGRESS_INTERVAL {
            last_report = Instant::now();
            let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
            let speed = megabytes(downloaded) / elapsed;
            let percent = total.map_or(0, |total| download_percent(downloaded, total));
            sink.report(
                InstallProgress::new(
                    InstallPhase::Downloading,
                    percent,
                    download_status(downloaded, total, speed),
                )
                .with_speed(speed),
            );
        }
    }

    writer
        .flush()
        .await
        .map_err(|error| InstallError::io("failed to flush download file", dest, error))?;

    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
    let speed = megabytes(downloaded) / elapsed;
    sink.report(
        InstallProgress::new(
            InstallPhase::Downloading,
            100,
            download_status(downloaded, total, speed),
        )
        .with_speed(speed),
    );

    info!("Downloaded {downloaded} bytes from {url}");
    Ok(downloaded)
}

fn extract_zip(
    zip_path: &Path,
    dest: &Path,
    sink: &dyn ProgressSink,
) -> Result<usize, InstallError> {
    let file = std::fs::File::open(zip_path)
        .map_err(|error| InstallError::io("failed to open package", zip_path, error))?;
    let mut archive = zip::ZipArchive::new(file).map_err(InstallError::UnreadableArchive)?;

    if dest.exists() {
        info!("Replacing existing install at {}", dest.display());
        std::fs::remove_dir_all(dest)
            .map_err(|error| InstallError::io("failed to remove previous install", dest, error))?;
    }
    std::fs::create_dir_all(dest)
        .map_err(|error| InstallError::io("failed to create install directory", dest, error))?;

    let count = archive.len();
    let mut extracted = 0;
    for i in 0..count {
        let mut entry = archive.by_index(i).map_err(|source| InstallError::Extract {
            context: "failed to read archive entry",
            source,
        })?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry.enclosed_name() else {
            warn!("Skipping archive entry with unsafe path: {}", entry.name());
            continue;
        };
        let out_path = dest.join(name);

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                InstallError::io("failed to create extraction directory", parent, error)
            })?;
        }
        let mut outfile = std::fs::File::create(&out_path)
            .map_err(|error| InstallError::io("failed to create extracted file", &out_path, error))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|error| InstallError::io("failed to extract archive entry", &out_path, error))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
            }
        }

        extracted += 1;
        if (i + 1) % EXTRACT_REPORT_EVERY == 0 {
            let percent = u8::try_from((i + 1) * 100 / count.max(1)).unwrap_or(100);
            sink.report(InstallProgress::new(
                InstallPhase::Extracting,
                percent,
                format!("Extracting: {}/{count} files", i + 1),
            ));
        }
    }

    debug!("Extracted {extracted} files to {}", dest.display());
    Ok(extracted)
}

async fn install_inner(
    client: &reqwest::Client,
    entry: &CatalogEntry,
    install_root: &Path,
    scratch_root: &Path,
    sink: &Arc<dyn ProgressSink>,
) -> Result<InstalledVersion, InstallError> {
    tokio::fs::create_dir_all(scratch_root)
        .await
        .map_err(|error| InstallError::io("failed to create scratch directory", scratch_root, error))?;
    let scratch = tempfile::tempdir_in(scratch_root)
        .map_err(|error| InstallError::io("failed to create scratch directory", scratch_root, error))?;
    let download_path = scratch.path().join(safe_file_name(&entry.file_name));

    info!("Installing {} from {}", entry.display_name(), entry.download_url);
    download_file(client, &entry.download_url, &download_path, sink.as_ref()).await?;

    let size = tokio::fs::metadata(&download_path)
        .await
        .map_err(|error| InstallError::io("failed to inspect download", &download_path, error))?
        .len();
    if size <= MIN_PACKAGE_BYTES {
        return Err(InstallError::Undersized { bytes: size });
    }

    sink.report(InstallProgress::new(
        InstallPhase::Extracting,
        0,
        "Extracting package...",
    ));
    let install_path = install_root.join(entry.install_dir_name());
    let extract_sink = Arc::clone(sink);
    let extract_dest = install_path.clone();
    tokio::task::spawn_blocking(move || {
        extract_zip(&download_path, &extract_dest, extract_sink.as_ref())
    })
    .await??;

    let executable = install_path.join(RUNTIME_EXECUTABLE);
    let arch = if executable.is_file() {
        phpswitch_platform::inspect_arch(&executable)
    } else {
        warn!(
            "{} has no {RUNTIME_EXECUTABLE}; keeping the catalog architecture",
            install_path.display()
        );
        entry.arch
    };

    // Scratch directory and package are removed here.
    drop(scratch);

    Ok(InstalledVersion {
        version: entry.version,
        thread_safety: entry.thread_safety,
        arch,
        install_path,
        install_date: Utc::now(),
        is_active: false,
    })
}

/// Download `entry` and extract it under `install_root`.
///
/// Every failure is logged and reported to `sink` as a terminal
/// [`InstallPhase::Failed`] event before it is returned.
///
/// # Errors
/// Returns an error when the download, the size check or the extraction fails.
pub async fn install(
    client: &reqwest::Client,
    entry: &CatalogEntry,
    install_root: &Path,
    scratch_root: &Path,
    sink: Arc<dyn ProgressSink>,
) -> Result<InstalledVersion, InstallError> {
    sink.report(InstallProgress::new(
        InstallPhase::Starting,
        0,
        format!("Preparing {}", entry.display_name()),
    ));

    match install_inner(client, entry, install_root, scratch_root, &sink).await {
        Ok(installed) => {
            info!(
                "Installed {} to {}",
                installed.display_name(),
                installed.install_path.display()
            );
            sink.report(InstallProgress::new(
                InstallPhase::Completed,
                100,
                format!("Installed {}", entry.display_name()),
            ));
            Ok(installed)
        }
        Err(err) => {
            error!("Install of {} failed: {err}", entry.display_name());
            sink.report(InstallProgress::failed(err.to_string()));
            Err(err)
        }
    }
}
