use std::io::Write as _;

use phpswitch_core::{ActiveStatus, ReconcileReport, group_by_minor_line, latest_patches};
use phpswitch_model::{CatalogEntry, InstallProgress, ProgressSink, Registry};

/// Renders install progress on a single rewritten stderr line.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, progress: InstallProgress) {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K{}", progress_line(&progress));
        if progress.phase.is_terminal() {
            let _ = writeln!(stderr);
        }
        let _ = stderr.flush();
    }
}

fn progress_line(progress: &InstallProgress) -> String {
    format!("[{:>3}%] {}", progress.percent, progress.status)
}

#[must_use]
pub fn installed_lines(registry: &Registry) -> Vec<String> {
    if registry.installed_versions.is_empty() {
        return vec![format!(
            "No versions installed in {}",
            registry.install_root.display()
        )];
    }

    registry
        .installed_versions
        .iter()
        .map(|entry| {
            format!(
                "{} {:<8} {:<16} {:<4} {}  (installed {})",
                if entry.is_active { "*" } else { " " },
                entry.version.to_string(),
                entry.thread_safety.label(),
                entry.arch.as_str(),
                entry.install_path.display(),
                entry.install_date.format("%Y-%m-%d")
            )
        })
        .collect()
}

#[must_use]
pub fn available_lines(registry: &Registry, all: bool) -> Vec<String> {
    if registry.available_versions.is_empty() {
        return vec!["No catalog yet; run `phpswitch refresh`".to_string()];
    }

    let entries: Vec<&CatalogEntry> = if all {
        registry.available_versions.iter().collect()
    } else {
        latest_patches(&registry.available_versions)
    };

    let mut lines = Vec::new();
    for line in group_by_minor_line(&entries) {
        lines.push(format!("PHP {}.{}", line.major, line.minor));
        for entry in line.entries {
            let installed = registry.find_installed(&entry.key()).is_some();
            lines.push(format!(
                "  {:<8} {:<16} {:<4}{}",
                entry.version.to_string(),
                entry.thread_safety.label(),
                entry.arch.as_str(),
                if installed { "  [installed]" } else { "" }
            ));
        }
    }
    if let Some(updated) = registry.last_updated {
        lines.push(format!("Catalog updated {}", updated.format("%Y-%m-%d %H:%M UTC")));
    }
    lines
}

#[must_use]
pub fn report_line(report: &ReconcileReport) -> String {
    format!(
        "Found {} installs: {} added, {} updated, {} removed",
        report.found, report.added, report.updated, report.removed
    )
}

#[must_use]
pub fn status_line(status: &ActiveStatus) -> String {
    match status {
        ActiveStatus::NotActive => "No version is active".to_string(),
        ActiveStatus::MissingExecutable => {
            "The active link exists but holds no PHP executable".to_string()
        }
        ActiveStatus::Active(version) => format!("Active: PHP {version}"),
        ActiveStatus::Unknown => "The active PHP did not report a version".to_string(),
    }
}
