use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElevationError {
    #[error("failed to resolve current executable: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("elevated relaunch was refused or failed (code {0})")]
    Relaunch(isize),
    #[error("administrator rights are required; re-run this command with sudo")]
    Unsupported,
}

/// Whether the current process runs with administrative rights.
#[cfg(windows)]
#[must_use]
pub fn is_elevated() -> bool {
    use std::ffi::c_void;
    use std::ptr;

    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    // SAFETY: the token handle is checked before use and closed exactly once;
    // `elevation` is sized for the TokenElevation information class.
    unsafe {
        let mut token: HANDLE = ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &raw mut token) == 0 {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
        let mut returned: u32 = 0;
        let size = u32::try_from(std::mem::size_of::<TOKEN_ELEVATION>()).unwrap_or(4);
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            (&raw mut elevation).cast::<c_void>(),
            size,
            &raw mut returned,
        );
        CloseHandle(token);

        ok != 0 && elevation.TokenIsElevated != 0
    }
}

/// Whether the current process runs with administrative rights.
#[cfg(not(windows))]
#[must_use]
pub fn is_elevated() -> bool {
    use crate::process::HideWindow;

    std::process::Command::new("id")
        .arg("-u")
        .hide_window()
        .output()
        .ok()
        .filter(|output| output.status.success())
        .is_some_and(|output| String::from_utf8_lossy(&output.stdout).trim() == "0")
}

/// Quote one argument so `CommandLineToArgvW` reads it back unchanged.
///
/// Backslashes are literal except in a run that ends at a quote, where each
/// one must be doubled.
fn quote_windows_command_arg(raw: &str) -> String {
    if !raw.is_empty() && !raw.contains([' ', '\t', '"']) {
        return raw.to_string();
    }

    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for ch in raw.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat_n('\\', backslashes));
                quoted.push(ch);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat_n('\\', backslashes * 2));
    quoted.push('"');
    quoted
}

/// Join arguments into one command line the way the Windows shell expects.
#[must_use]
pub fn command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote_windows_command_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Relaunch the current executable with administrative rights.
///
/// On success the caller should exit; the elevated copy carries on.
///
/// # Errors
/// Returns an error when the relaunch is refused or unsupported on this platform.
#[cfg(windows)]
pub fn restart_elevated(args: &[String]) -> Result<(), ElevationError> {
    use std::ptr;

    use windows_sys::Win32::UI::Shell::ShellExecuteW;
    use windows_sys::Win32::UI::WindowsAndMessaging::SW_SHOWNORMAL;

    fn wide(value: &str) -> Vec<u16> {
        value.encode_utf16().chain(std::iter::once(0)).collect()
    }

    let exe = std::env::current_exe().map_err(ElevationError::CurrentExe)?;
    let verb = wide("runas");
    let file = wide(&exe.to_string_lossy());
    let params = wide(&command_line(args));

    log::info!("Relaunching {} elevated", exe.display());
    // SAFETY: all string buffers are NUL-terminated and outlive the call.
    let result = unsafe {
        ShellExecuteW(
            ptr::null_mut(),
            verb.as_ptr(),
            file.as_ptr(),
            params.as_ptr(),
            ptr::null(),
            SW_SHOWNORMAL,
        )
    };

    let code = result as isize;
    if code <= 32 {
        return Err(ElevationError::Relaunch(code));
    }
    Ok(())
}

/// Relaunch the current executable with administrative rights.
///
/// # Errors
/// Always fails here: the user has to re-run the command with elevated rights.
#[cfg(not(windows))]
pub fn restart_elevated(_args: &[String]) -> Result<(), ElevationError> {
    Err(ElevationError::Unsupported)
}
