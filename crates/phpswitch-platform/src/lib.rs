mod elevation;
mod link;
mod paths;
mod pe;
mod process;
mod search_path;

pub use elevation::{ElevationError, command_line, is_elevated, restart_elevated};
pub use link::{LinkError, LinkState, copy_tree, create_dir_link, link_state, remove_link};
pub use paths::{AppPaths, AppPathsError};
pub use pe::{inspect_arch, read_machine_type};
pub use process::{CapturedOutput, HideWindow, ProcessError, run_captured};
pub use search_path::{
    ProfileScript, SearchPath, SearchPathError, append_to_path_list, path_list_contains,
};

#[cfg(windows)]
pub use search_path::MachinePath;

/// The search-path backend for this platform.
#[must_use]
pub fn default_search_path(paths: &AppPaths) -> Box<dyn SearchPath> {
    #[cfg(windows)]
    {
        let _ = paths;
        Box::new(MachinePath)
    }

    #[cfg(not(windows))]
    {
        Box::new(ProfileScript::new(paths.profile_script()))
    }
}
