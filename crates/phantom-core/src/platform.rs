//! Platform adapter boundary.
//!
//! The core never calls OS-specific APIs directly. Everything it needs from
//! the host (privilege check, folder concealment primitives, raw keystrokes)
//! goes through [`PlatformAdapter`]. One adapter is chosen at compile time
//! ([`NativePlatform`]) and constructed once at startup.

use crate::detector::KeystrokeSink;
use crate::error::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl PlatformKind {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            PlatformKind::Linux
        } else if cfg!(target_os = "macos") {
            PlatformKind::MacOs
        } else if cfg!(windows) {
            PlatformKind::Windows
        } else {
            PlatformKind::Other
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub platform: PlatformKind,
    pub elevated: bool,
    pub folder_hiding: bool,
    pub keyboard_capture: bool,
}

pub trait PlatformAdapter: Send + Sync + 'static {
    fn detect_capabilities(&self) -> Capabilities;

    fn is_elevated(&self) -> bool;

    /// Removes every non-owner access right from `path` and applies the
    /// platform's hidden attribute. Must not alter file contents.
    fn restrict(&self, path: &Path) -> VaultResult<()>;

    /// Reverses [`PlatformAdapter::restrict`], applying `permissions`.
    fn release(&self, path: &Path, permissions: u32) -> VaultResult<()>;

    /// Post-condition probe used after hiding: is anything still reachable at `path`?
    fn is_visible(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    /// Registers the sink that receives hotkey and character events. Adapters
    /// without a keyboard hook return `PlatformUnsupported`; the service then
    /// relies on the IPC password-input channel.
    fn register_keystroke_sink(&self, sink: KeystrokeSink) -> VaultResult<()>;
}

#[cfg(unix)]
pub type NativePlatform = UnixPlatform;
#[cfg(windows)]
pub type NativePlatform = WindowsPlatform;

#[cfg(unix)]
#[derive(Debug, Default)]
pub struct UnixPlatform;

#[cfg(unix)]
impl UnixPlatform {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl PlatformAdapter for UnixPlatform {
    fn detect_capabilities(&self) -> Capabilities {
        let elevated = self.is_elevated();
        Capabilities {
            platform: PlatformKind::current(),
            elevated,
            folder_hiding: elevated,
            keyboard_capture: false,
        }
    }

    fn is_elevated(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn restrict(&self, path: &Path) -> VaultResult<()> {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            return Err(VaultError::InvalidInput("refusing to restrict a symlink".into()));
        }
        let mode = if meta.is_dir() { 0o700 } else { 0o600 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn release(&self, path: &Path, permissions: u32) -> VaultResult<()> {
        crate::crypto::set_permission_bits(path, permissions)
    }

    fn register_keystroke_sink(&self, _sink: KeystrokeSink) -> VaultResult<()> {
        Err(VaultError::PlatformUnsupported(
            "no keyboard hook available on this host".into(),
        ))
    }
}

#[cfg(windows)]
#[derive(Debug, Default)]
pub struct WindowsPlatform;

#[cfg(windows)]
impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }

    fn set_attributes(path: &Path, attributes: u32) -> VaultResult<()> {
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::SetFileAttributesW;
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        // SAFETY: `wide` is a valid NUL-terminated UTF-16 string for the call's duration.
        let ok = unsafe { SetFileAttributesW(wide.as_ptr(), attributes) };
        if ok == 0 {
            return Err(VaultError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(windows)]
impl PlatformAdapter for WindowsPlatform {
    fn detect_capabilities(&self) -> Capabilities {
        let elevated = self.is_elevated();
        Capabilities {
            platform: PlatformKind::Windows,
            elevated,
            folder_hiding: elevated,
            keyboard_capture: false,
        }
    }

    fn is_elevated(&self) -> bool {
        use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
        use windows_sys::Win32::Security::{
            GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
        };
        use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

        let mut token: HANDLE = 0;
        // SAFETY: out-pointers reference live locals; the token is closed below.
        unsafe {
            if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                return false;
            }
            let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
            let mut len = 0u32;
            let ok = GetTokenInformation(
                token,
                TokenElevation,
                &mut elevation as *mut _ as *mut core::ffi::c_void,
                std::mem::size_of::<TOKEN_ELEVATION>() as u32,
                &mut len,
            );
            CloseHandle(token);
            ok != 0 && elevation.TokenIsElevated != 0
        }
    }

    fn restrict(&self, path: &Path) -> VaultResult<()> {
        use windows_sys::Win32::Storage::FileSystem::{
            FILE_ATTRIBUTE_HIDDEN, FILE_ATTRIBUTE_SYSTEM,
        };
        Self::set_attributes(path, FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM)
    }

    fn release(&self, path: &Path, permissions: u32) -> VaultResult<()> {
        use windows_sys::Win32::Storage::FileSystem::FILE_ATTRIBUTE_NORMAL;
        Self::set_attributes(path, FILE_ATTRIBUTE_NORMAL)?;
        crate::crypto::set_permission_bits(path, permissions)
    }

    fn register_keystroke_sink(&self, _sink: KeystrokeSink) -> VaultResult<()> {
        Err(VaultError::PlatformUnsupported(
            "no keyboard hook available on this host".into(),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn restrict_then_release_round_trips_mode() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("docs");
        std::fs::create_dir(&target).unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).unwrap();

        let platform = UnixPlatform::new();
        platform.restrict(&target).unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);

        platform.release(&target, 0o755).unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn capabilities_report_no_keyboard_hook() {
        let caps = UnixPlatform::new().detect_capabilities();
        assert!(!caps.keyboard_capture);
        assert_eq!(caps.folder_hiding, caps.elevated);
    }
}
