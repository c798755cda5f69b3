use std::path::PathBuf;
use thiserror::Error;

const APP_DIR: &str = "phpswitch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("Could not determine home directory")]
    HomeDirUnavailable,
    #[error("Could not determine config directory")]
    ConfigDirUnavailable,
    #[error("Could not determine cache directory")]
    CacheDirUnavailable,
    #[error("Could not determine data directory")]
    DataDirUnavailable,
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Build application paths for the current platform.
    ///
    /// # Errors
    /// Returns an error when a required base directory (for example the user
    /// home/config/cache/data directory) cannot be determined.
    pub fn new() -> Result<Self, AppPathsError> {
        #[cfg(target_os = "macos")]
        {
            let home = dirs::home_dir().ok_or(AppPathsError::HomeDirUnavailable)?;
            Ok(Self {
                config_dir: home.join("Library/Application Support").join(APP_DIR),
                cache_dir: home.join("Library/Caches").join(APP_DIR),
                data_dir: home.join("Library/Application Support").join(APP_DIR),
            })
        }

        #[cfg(not(target_os = "macos"))]
        {
            Ok(Self {
                config_dir: dirs::config_dir()
                    .ok_or(AppPathsError::ConfigDirUnavailable)?
                    .join(APP_DIR),
                cache_dir: dirs::cache_dir()
                    .ok_or(AppPathsError::CacheDirUnavailable)?
                    .join(APP_DIR),
                data_dir: dirs::data_dir()
                    .ok_or(AppPathsError::DataDirUnavailable)?
                    .join(APP_DIR),
            })
        }
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Managed shell profile used where there is no machine-wide search path.
    #[must_use]
    pub fn profile_script(&self) -> PathBuf {
        self.config_dir.join("env.sh")
    }

    #[must_use]
    pub fn download_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    #[must_use]
    pub fn listing_dump_file(&self) -> PathBuf {
        self.cache_dir.join("listing.html")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("phpswitch.log")
    }

    #[must_use]
    pub fn operation_lock_file(&self) -> PathBuf {
        self.data_dir.join("operation.lock")
    }

    /// Where versions are installed unless configured otherwise.
    #[must_use]
    pub fn default_install_root(&self) -> PathBuf {
        #[cfg(windows)]
        {
            let drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
            PathBuf::from(format!("{drive}\\php-versions"))
        }

        #[cfg(not(windows))]
        {
            self.data_dir.join("versions")
        }
    }

    /// The system-wide redirection path unless configured otherwise.
    #[must_use]
    pub fn default_link_path(&self) -> PathBuf {
        #[cfg(windows)]
        {
            PathBuf::from(r"C:\php")
        }

        #[cfg(not(windows))]
        {
            self.data_dir.join("current")
        }
    }

    /// Ensure all application directories exist on disk.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::AppPaths;

    fn test_paths(root: &Path) -> AppPaths {
        AppPaths {
            config_dir: root.join("config"),
            cache_dir: root.join("cache"),
            data_dir: root.join("data"),
        }
    }

    #[test]
    fn file_paths_use_expected_filenames() {
        let root = tempfile::tempdir().expect("temp dir should be created");
        let paths = test_paths(root.path());

        assert!(
            paths
                .config_file()
                .ends_with(Path::new("config").join("config.json"))
        );
        assert!(
            paths
                .listing_dump_file()
                .ends_with(Path::new("cache").join("listing.html"))
        );
        assert!(
            paths
                .log_file()
                .ends_with(Path::new("data").join("phpswitch.log"))
        );
        assert!(
            paths
                .operation_lock_file()
                .ends_with(Path::new("data").join("operation.lock"))
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn defaults_live_under_data_dir() {
        let root = tempfile::tempdir().expect("temp dir should be created");
        let paths = test_paths(root.path());

        assert_eq!(paths.default_install_root(), paths.data_dir.join("versions"));
        assert_eq!(paths.default_link_path(), paths.data_dir.join("current"));
    }

    #[test]
    fn ensure_dirs_creates_all_directories() {
        let root = tempfile::tempdir().expect("temp dir should be created");
        let paths = test_paths(root.path());

        paths
            .ensure_dirs()
            .expect("ensure_dirs should create application directories");

        assert!(paths.config_dir.is_dir());
        assert!(paths.cache_dir.is_dir());
        assert!(paths.data_dir.is_dir());
    }
}
