mod progress;
mod registry;
mod store;
mod types;

pub use progress::{InstallPhase, InstallProgress, NoProgress, ProgressSink};
pub use registry::{RUNTIME_EXECUTABLE, Registry, paths_equal};
pub use store::{MemoryStore, RegistryStore, StoreError};
pub use types::{
    Arch, CatalogEntry, INSTALL_DIR_PREFIX, InstalledVersion, PhpVersion, ThreadSafety,
    VersionComponent, VersionKey, VersionParseError, install_dir_name, parse_install_dir_name,
};
