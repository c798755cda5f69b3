//! Directory redirection primitives (symbolic links) and tree copies.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LinkError {
    fn io(context: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::Io { source, .. } => source.kind(),
        }
    }
}

/// What currently sits at a redirection path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Missing,
    /// Anything that is not a link: a real directory, or a stray file.
    RealDirectory,
    Link(PathBuf),
}

impl LinkState {
    #[must_use]
    pub fn target(&self) -> Option<&Path> {
        match self {
            Self::Link(target) => Some(target),
            Self::Missing | Self::RealDirectory => None,
        }
    }
}

/// Classify `path` without following it.
#[must_use]
pub fn link_state(path: &Path) -> LinkState {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return LinkState::Missing;
    };
    if !is_redirection(&metadata) {
        return LinkState::RealDirectory;
    }
    match std::fs::read_link(path) {
        Ok(target) if target.is_relative() => {
            let base = path.parent().unwrap_or_else(|| Path::new(""));
            LinkState::Link(base.join(target))
        }
        Ok(target) => LinkState::Link(strip_verbatim_prefix(target)),
        Err(error) => {
            log::warn!("Could not read link {}: {error}", path.display());
            LinkState::Link(PathBuf::new())
        }
    }
}

/// Symlinks and, on Windows, junctions and other reparse points.
fn is_redirection(metadata: &std::fs::Metadata) -> bool {
    #[cfg(windows)]
    {
        use std::os::windows::fs::MetadataExt;
        use windows_sys::Win32::Storage::FileSystem::FILE_ATTRIBUTE_REPARSE_POINT;

        metadata.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT != 0
    }
    #[cfg(not(windows))]
    {
        metadata.file_type().is_symlink()
    }
}

/// Junction targets read back as `\\?\C:\...`; registry paths never carry that prefix.
fn strip_verbatim_prefix(target: PathBuf) -> PathBuf {
    match target.to_str().and_then(|s| s.strip_prefix(r"\\?\")) {
        Some(rest) if !rest.starts_with("UNC") => PathBuf::from(rest),
        _ => target,
    }
}

/// Create a directory symbolic link at `link` pointing to `target`.
///
/// # Errors
/// Returns an error if the link cannot be created, e.g. because `link` exists
/// or the process lacks the privilege to create symbolic links.
pub fn create_dir_link(link: &Path, target: &Path) -> Result<(), LinkError> {
    if let Some(parent) = link.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| LinkError::io("failed to create link parent", parent, error))?;
    }

    #[cfg(windows)]
    let result = std::os::windows::fs::symlink_dir(target, link);
    #[cfg(unix)]
    let result = std::os::unix::fs::symlink(target, link);

    result.map_err(|error| LinkError::io("failed to create link", link, error))
}

/// Remove the link entry at `link`, leaving its target untouched.
///
/// # Errors
/// Returns an error if the link cannot be removed.
pub fn remove_link(link: &Path) -> Result<(), LinkError> {
    // Directory symlinks are directories to Windows and files to unix.
    #[cfg(windows)]
    let result = std::fs::remove_dir(link).or_else(|_| std::fs::remove_file(link));
    #[cfg(unix)]
    let result = std::fs::remove_file(link);

    result.map_err(|error| LinkError::io("failed to remove link", link, error))
}

/// Copy `src` to `dest` recursively. A plain file is copied as-is.
///
/// # Errors
/// Returns an error if any directory or file cannot be read or written.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<(), LinkError> {
    if !src.is_dir() {
        std::fs::copy(src, dest)
            .map_err(|error| LinkError::io("failed to copy file", src, error))?;
        return Ok(());
    }

    std::fs::create_dir_all(dest)
        .map_err(|error| LinkError::io("failed to create directory", dest, error))?;

    for entry in std::fs::read_dir(src)
        .map_err(|error| LinkError::io("failed to read directory", src, error))?
    {
        let entry = entry.map_err(|error| LinkError::io("failed to read entry in", src, error))?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());

        if src_path.is_dir() {
            copy_tree(&src_path, &dest_path)?;
        } else {
            std::fs::copy(&src_path, &dest_path)
                .map_err(|error| LinkError::io("failed to copy file", &src_path, error))?;
        }
    }
    Ok(())
}
