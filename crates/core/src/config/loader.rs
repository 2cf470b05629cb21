//! Config path resolution
//!
//! Everything lives next to the injected module:
//!
//! ```text
//! <base>/vrshim.dll
//! <base>/configs/core.toml
//! <base>/profiles/<title>/adapter.json
//! ```
//!
//! `VRSHIM_HOME` overrides the base directory.

use std::path::PathBuf;

use super::{ConfigError, ConfigResult};

/// Environment variable that overrides the base directory
pub const HOME_ENV: &str = "VRSHIM_HOME";

/// Returns the vrshim base directory.
///
/// Resolution order: `VRSHIM_HOME`, then the directory of the module this
/// code was loaded from.
pub fn base_dir() -> ConfigResult<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    module_dir()
}

#[cfg(windows)]
fn module_dir() -> ConfigResult<PathBuf> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    let mut module = HMODULE::default();
    unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            PCWSTR(module_dir as *const u16),
            &mut module,
        )
        .map_err(|_| ConfigError::NoConfigDirectory)?;
    }

    let mut buf = [0u16; 1024];
    let len = unsafe { GetModuleFileNameW(Some(module), &mut buf) } as usize;
    if len == 0 || len >= buf.len() {
        return Err(ConfigError::NoConfigDirectory);
    }

    let path = PathBuf::from(String::from_utf16_lossy(&buf[..len]));
    path.parent()
        .map(PathBuf::from)
        .ok_or(ConfigError::NoConfigDirectory)
}

#[cfg(not(windows))]
fn module_dir() -> ConfigResult<PathBuf> {
    let exe = std::env::current_exe().map_err(ConfigError::IoError)?;
    exe.parent()
        .map(PathBuf::from)
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Returns the configs directory.
///
/// Path: `<base>/configs/`
pub fn configs_dir() -> ConfigResult<PathBuf> {
    Ok(base_dir()?.join("configs"))
}

/// Returns the core config path.
///
/// Path: `<base>/configs/core.toml`
pub fn core_config_path() -> ConfigResult<PathBuf> {
    Ok(configs_dir()?.join("core.toml"))
}

/// Returns the per-title profile path.
///
/// Path: `<base>/profiles/{title}/adapter.json`
pub fn profile_path(title: &str) -> ConfigResult<PathBuf> {
    Ok(profile_path_in(&base_dir()?, title))
}

pub(crate) fn profile_path_in(base: &std::path::Path, title: &str) -> PathBuf {
    base.join("profiles").join(title).join("adapter.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_path_format() {
        let base = PathBuf::from("/games/title/bin");
        let path = profile_path_in(&base, "mygame");
        assert!(path.ends_with("profiles/mygame/adapter.json"));
    }
}
