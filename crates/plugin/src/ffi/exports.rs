//! C-compatible exports called by the injector or an overlay

use std::ffi::c_char;

use tracing::instrument;
use vrshim_core::{AdapterContext, CoreConfig};

// Module metadata - static strings with null terminators for C compatibility
static NAME: &[u8] = b"vrshim\0";
static DESCRIPTION: &[u8] = b"Stereo injection for flat Direct3D 11 games\0";
static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();

/// Camera snapshot as laid out for C callers
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VrCameraMatrices {
    pub view: [f32; 16],
    pub projection: [f32; 16],
    pub left_view: [f32; 16],
    pub right_view: [f32; 16],
    pub left_projection: [f32; 16],
    pub right_projection: [f32; 16],
    pub valid: bool,
    pub frame: u64,
}

/// Called once after the module is injected
///
/// Loads `configs/core.toml`, starts logging and resolves the swapchain
/// entry points. VR stays off until [`vrshim_enable_vr`].
///
/// # Safety
/// - `error` must be a valid pointer to a buffer of at least `maxlen` bytes, or null
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn vrshim_load(error: *mut c_char, maxlen: usize) -> bool {
    let context = AdapterContext::load();
    match &context {
        Ok(context) => crate::logging::init(&context.config),
        Err(_) => crate::logging::init(&CoreConfig::default()),
    }

    tracing::info!(target: "vrshim::plugin", "vrshim loading...");

    let context = match context {
        Ok(context) => context,
        Err(e) => {
            tracing::error!(target: "vrshim::plugin", "Failed to load configuration: {}", e);
            write_error(error, maxlen, &format!("Config error: {}", e));
            return false;
        }
    };

    match install(context) {
        Ok(()) => {
            tracing::info!(target: "vrshim::plugin", "vrshim loaded");
            true
        }
        Err(e) => {
            tracing::error!(target: "vrshim::plugin", "Failed to install runtime: {}", e);
            write_error(error, maxlen, &e);
            false
        }
    }
}

#[cfg(windows)]
fn install(context: AdapterContext) -> Result<(), String> {
    crate::runtime::install(context).map_err(|e| e.to_string())
}

#[cfg(not(windows))]
fn install(_context: AdapterContext) -> Result<(), String> {
    Err("Direct3D 11 is only available on Windows".to_string())
}

/// Called before the module is unloaded; removes every hook
///
/// # Safety
/// - `error` must be a valid pointer to a buffer of at least `maxlen` bytes, or null
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn vrshim_unload(error: *mut c_char, maxlen: usize) -> bool {
    tracing::info!(target: "vrshim::plugin", "vrshim unloading...");

    let result = std::panic::catch_unwind(|| {
        #[cfg(windows)]
        crate::runtime::uninstall();
        crate::shutdown();
    });
    match result {
        Ok(()) => true,
        Err(_) => {
            write_error(error, maxlen, "Panic during shutdown");
            false
        }
    }
}

/// Install the hooks and start stereo rendering
///
/// # Safety
/// - `error` must be a valid pointer to a buffer of at least `maxlen` bytes, or null
#[no_mangle]
pub unsafe extern "C" fn vrshim_enable_vr(error: *mut c_char, maxlen: usize) -> bool {
    #[cfg(windows)]
    let result = crate::runtime::enable_vr().map_err(|e| e.to_string());
    #[cfg(not(windows))]
    let result: Result<(), String> = Err("not supported on this platform".to_string());

    match result {
        Ok(()) => true,
        Err(e) => {
            write_error(error, maxlen, &e);
            false
        }
    }
}

/// Remove the hooks and release stereo targets
#[no_mangle]
pub extern "C" fn vrshim_disable_vr() {
    #[cfg(windows)]
    if let Err(e) = crate::runtime::disable_vr() {
        tracing::warn!(target: "vrshim::plugin", "disable_vr: {}", e);
    }
}

#[no_mangle]
pub extern "C" fn vrshim_is_vr_enabled() -> bool {
    #[cfg(windows)]
    return crate::runtime::is_vr_enabled();
    #[cfg(not(windows))]
    false
}

/// Copy the latest camera snapshot into `out`
///
/// Returns false when nothing is loaded or `out` is null.
///
/// # Safety
/// - `out` must be a valid pointer to a `VrCameraMatrices`, or null
#[no_mangle]
pub unsafe extern "C" fn vrshim_get_camera_matrices(out: *mut VrCameraMatrices) -> bool {
    if out.is_null() {
        return false;
    }
    #[cfg(windows)]
    let camera = crate::runtime::camera_matrices();
    #[cfg(not(windows))]
    let camera: Option<vrshim_core::sdk::CameraMatrices> = None;

    let Some(c) = camera else {
        return false;
    };
    out.write(VrCameraMatrices {
        view: c.view,
        projection: c.projection,
        left_view: c.left_view,
        right_view: c.right_view,
        left_projection: c.left_projection,
        right_projection: c.right_projection,
        valid: c.valid,
        frame: c.frame,
    });
    true
}

// Metadata exports

#[no_mangle]
pub extern "C" fn vrshim_get_name() -> *const c_char {
    NAME.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn vrshim_get_description() -> *const c_char {
    DESCRIPTION.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn vrshim_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

/// Helper to write an error message to a C buffer
///
/// # Safety
/// - `error` must be a valid pointer or null
/// - `maxlen` must accurately reflect the buffer size
unsafe fn write_error(error: *mut c_char, maxlen: usize, msg: &str) {
    if !error.is_null() && maxlen > 0 {
        let bytes = msg.as_bytes();
        let len = bytes.len().min(maxlen - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), error as *mut u8, len);
        *error.add(len) = 0;
    }
}
