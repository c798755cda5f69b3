//! Membership of a directory in the executable search path.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchPathError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[cfg(windows)]
    #[error("win32 call {api} failed with code {code}")]
    Win32 { api: &'static str, code: u32 },
}

impl SearchPathError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

pub trait SearchPath: Send + Sync {
    /// # Errors
    /// Returns an error when the search path cannot be read.
    fn contains(&self, dir: &Path) -> Result<bool, SearchPathError>;

    /// # Errors
    /// Returns an error when the search path cannot be updated.
    fn append(&self, dir: &Path) -> Result<(), SearchPathError>;

    fn describe(&self) -> String;
}

fn normalize_entry(entry: &str) -> String {
    entry
        .trim()
        .trim_matches('"')
        .trim_end_matches(['\\', '/'])
        .to_lowercase()
}

/// Whether `dir` appears in a separator-delimited path list.
///
/// Comparison ignores case, surrounding quotes and trailing separators.
#[must_use]
pub fn path_list_contains(list: &str, dir: &Path, separator: char) -> bool {
    let wanted = normalize_entry(&dir.to_string_lossy());
    list.split(separator)
        .filter(|entry| !entry.trim().is_empty())
        .any(|entry| normalize_entry(entry) == wanted)
}

/// Append `dir` to a path list, avoiding doubled separators.
#[must_use]
pub fn append_to_path_list(list: &str, dir: &Path, separator: char) -> String {
    let trimmed = list.trim_end_matches(separator);
    if trimmed.is_empty() {
        dir.to_string_lossy().into_owned()
    } else {
        format!("{trimmed}{separator}{}", dir.to_string_lossy())
    }
}

const PROFILE_MARKER: &str = "# phpswitch path";

/// A managed shell profile holding one marked `export PATH` line per directory.
pub struct ProfileScript {
    script: PathBuf,
    live_path: String,
}

impl ProfileScript {
    #[must_use]
    pub fn new(script: PathBuf) -> Self {
        let live_path = std::env::var("PATH").unwrap_or_default();
        Self::with_live_path(script, live_path)
    }

    #[must_use]
    pub fn with_live_path(script: PathBuf, live_path: impl Into<String>) -> Self {
        Self {
            script,
            live_path: live_path.into(),
        }
    }

    fn export_line(dir: &Path) -> String {
        format!("export PATH=\"$PATH:{}\" {PROFILE_MARKER}", dir.display())
    }

    fn read(&self) -> Result<String, SearchPathError> {
        if !self.script.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.script)
            .map_err(|error| SearchPathError::io("failed to read profile script", error))
    }

    fn has_line(content: &str, dir: &Path) -> bool {
        let line = Self::export_line(dir);
        content.lines().any(|existing| existing.trim() == line)
    }
}

impl SearchPath for ProfileScript {
    fn contains(&self, dir: &Path) -> Result<bool, SearchPathError> {
        if path_list_contains(&self.live_path, dir, ':') {
            return Ok(true);
        }
        Ok(Self::has_line(&self.read()?, dir))
    }

    fn append(&self, dir: &Path) -> Result<(), SearchPathError> {
        let mut content = self.read()?;
        if Self::has_line(&content, dir) {
            debug!("{} already exports {}", self.script.display(), dir.display());
            return Ok(());
        }

        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&Self::export_line(dir));
        content.push('\n');

        if let Some(parent) = self.script.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| SearchPathError::io("failed to create profile directory", error))?;
        }
        fs::write(&self.script, content)
            .map_err(|error| SearchPathError::io("failed to write profile script", error))?;
        info!("Added {} to {}", dir.display(), self.script.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("profile script {}", self.script.display())
    }
}

#[cfg(windows)]
pub use machine::MachinePath;

#[cfg(windows)]
mod machine {
    use std::path::Path;
    use std::ptr;

    use log::{info, warn};
    use windows_sys::Win32::Foundation::ERROR_SUCCESS;
    use windows_sys::Win32::System::Registry::{
        HKEY, HKEY_LOCAL_MACHINE, KEY_QUERY_VALUE, KEY_SET_VALUE, REG_EXPAND_SZ, RegCloseKey,
        RegOpenKeyExW, RegQueryValueExW, RegSetValueExW,
    };
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        HWND_BROADCAST, SMTO_ABORTIFHUNG, SendMessageTimeoutW, WM_SETTINGCHANGE,
    };

    use super::{SearchPath, SearchPathError, append_to_path_list, path_list_contains};

    const ENVIRONMENT_KEY: &str =
        "SYSTEM\\CurrentControlSet\\Control\\Session Manager\\Environment";

    fn wide(value: &str) -> Vec<u16> {
        value.encode_utf16().chain(std::iter::once(0)).collect()
    }

    struct KeyGuard(HKEY);

    impl Drop for KeyGuard {
        fn drop(&mut self) {
            // SAFETY: the handle came from a successful RegOpenKeyExW and is closed once.
            unsafe {
                RegCloseKey(self.0);
            }
        }
    }

    fn open_key(access: u32) -> Result<KeyGuard, SearchPathError> {
        let subkey = wide(ENVIRONMENT_KEY);
        let mut hkey: HKEY = ptr::null_mut();
        // SAFETY: subkey is NUL-terminated and hkey is a valid out pointer.
        let status =
            unsafe { RegOpenKeyExW(HKEY_LOCAL_MACHINE, subkey.as_ptr(), 0, access, &raw mut hkey) };
        if status != ERROR_SUCCESS {
            return Err(SearchPathError::Win32 {
                api: "RegOpenKeyExW",
                code: status,
            });
        }
        Ok(KeyGuard(hkey))
    }

    /// The machine-wide `Path` value under the session manager environment key.
    pub struct MachinePath;

    impl MachinePath {
        fn read(&self) -> Result<String, SearchPathError> {
            let key = open_key(KEY_QUERY_VALUE)?;
            let name = wide("Path");
            let mut size: u32 = 0;
            // SAFETY: a null data pointer asks only for the required size.
            let status = unsafe {
                RegQueryValueExW(
                    key.0,
                    name.as_ptr(),
                    ptr::null(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    &raw mut size,
                )
            };
            if status != ERROR_SUCCESS {
                return Err(SearchPathError::Win32 {
                    api: "RegQueryValueExW",
                    code: status,
                });
            }

            let mut buffer = vec![0u16; (size as usize).div_ceil(2)];
            // SAFETY: buffer holds at least `size` bytes.
            let status = unsafe {
                RegQueryValueExW(
                    key.0,
                    name.as_ptr(),
                    ptr::null(),
                    ptr::null_mut(),
                    buffer.as_mut_ptr().cast(),
                    &raw mut size,
                )
            };
            if status != ERROR_SUCCESS {
                return Err(SearchPathError::Win32 {
                    api: "RegQueryValueExW",
                    code: status,
                });
            }

            let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
            Ok(String::from_utf16_lossy(&buffer[..len]))
        }

        fn write(&self, value: &str) -> Result<(), SearchPathError> {
            let key = open_key(KEY_SET_VALUE)?;
            let name = wide("Path");
            let data = wide(value);
            let byte_len = u32::try_from(data.len() * 2).unwrap_or(u32::MAX);
            // SAFETY: data is a NUL-terminated UTF-16 buffer of byte_len bytes.
            let status = unsafe {
                RegSetValueExW(
                    key.0,
                    name.as_ptr(),
                    0,
                    REG_EXPAND_SZ,
                    data.as_ptr().cast(),
                    byte_len,
                )
            };
            if status != ERROR_SUCCESS {
                return Err(SearchPathError::Win32 {
                    api: "RegSetValueExW",
                    code: status,
                });
            }
            Ok(())
        }

        fn broadcast_change() {
            let area = wide("Environment");
            let mut result: usize = 0;
            // SAFETY: area outlives the call; HWND_BROADCAST needs no ownership.
            let sent = unsafe {
                SendMessageTimeoutW(
                    HWND_BROADCAST,
                    WM_SETTINGCHANGE,
                    0,
                    area.as_ptr() as isize,
                    SMTO_ABORTIFHUNG,
                    5000,
                    &raw mut result,
                )
            };
            if sent == 0 {
                warn!("Environment change broadcast did not complete");
            }
        }
    }

    impl SearchPath for MachinePath {
        fn contains(&self, dir: &Path) -> Result<bool, SearchPathError> {
            Ok(path_list_contains(&self.read()?, dir, ';'))
        }

        fn append(&self, dir: &Path) -> Result<(), SearchPathError> {
            let current = self.read()?;
            if path_list_contains(&current, dir, ';') {
                return Ok(());
            }
            self.write(&append_to_path_list(&current, dir, ';'))?;
            Self::broadcast_change();
            info!("Added {} to the machine PATH", dir.display());
            Ok(())
        }

        fn describe(&self) -> String {
            "machine PATH".to_string()
        }
    }
}
