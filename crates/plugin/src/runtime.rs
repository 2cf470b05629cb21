//! The process-wide runtime and the swapchain detours
//!
//! Detours are `extern "system"` functions with no user data, so the adapter
//! they drive lives in [`RUNTIME`]. Each detour checks its [`HookGate`]
//! first and always calls the original with the arguments it was given,
//! inside the gate's in-flight guard. The guard is never held while waiting
//! on [`RUNTIME`], since removal waits on the guard with that lock held.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{error, info, warn};
use vrshim_core::hooks::InlineBackend;
use vrshim_core::sdk::{CameraMatrices, HookPoint};
use vrshim_core::{AdapterContext, EngineAdapter, HookGate, HookPlan, HookTarget, VrError, VrResult};
use vrshim_gpu::d3d11::D3D11Device;
use vrshim_gpu::swapchain::{resolve_entry_points, PresentFn, ResizeBuffersFn, DXGI_MODULE};
use vrshim_gpu::RenderDevice;
use windows::core::{Interface, HRESULT};
use windows::Win32::Foundation::E_UNEXPECTED;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT;
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;

/// `DXGI_PRESENT_TEST`: occlusion query, nothing is presented
const PRESENT_TEST: u32 = 0x1;

struct Gates {
    present: HookGate,
    resize_buffers: HookGate,
}

struct Runtime {
    adapter: EngineAdapter<D3D11Device>,
    device: Option<D3D11Device>,
}

// SAFETY: the D3D11 objects inside are only used on the thread that holds
// the RUNTIME lock.
unsafe impl Send for Runtime {}

static GATES: OnceLock<Gates> = OnceLock::new();
static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);

/// Resolve the swapchain entry points and park an adapter in the runtime
pub(crate) fn install(context: AdapterContext) -> VrResult<()> {
    let entry = resolve_entry_points()?;
    let gates = GATES.get_or_init(|| Gates {
        present: HookGate::new(entry.present),
        resize_buffers: HookGate::new(entry.resize_buffers),
    });
    if gates.present.original() != entry.present
        || gates.resize_buffers.original() != entry.resize_buffers
    {
        return Err(VrError::InvalidState(
            "swapchain entry points moved since the first load".to_string(),
        ));
    }

    // SAFETY: the detours below share the native signatures and forward
    // through these gates.
    let plan = unsafe {
        HookPlan::new()
            .with(HookTarget::with_gate(
                HookPoint::Present,
                DXGI_MODULE,
                gates.present.clone(),
                present_detour as usize,
            ))
            .with(HookTarget::with_gate(
                HookPoint::ResizeBuffers,
                DXGI_MODULE,
                gates.resize_buffers.clone(),
                resize_buffers_detour as usize,
            ))
    };

    let adapter = EngineAdapter::new(context.with_plan(plan), Box::new(InlineBackend::new()));
    *RUNTIME.lock() = Some(Runtime {
        adapter,
        device: None,
    });
    info!(
        target: "vrshim::plugin",
        "Runtime ready (Present {:x}, ResizeBuffers {:x})",
        entry.present,
        entry.resize_buffers
    );
    Ok(())
}

/// Disable VR and drop the adapter
pub(crate) fn uninstall() {
    if let Some(mut runtime) = RUNTIME.lock().take() {
        runtime.adapter.disable_vr();
    }
}

fn with_runtime<T>(f: impl FnOnce(&mut Runtime) -> VrResult<T>) -> VrResult<T> {
    let mut guard = RUNTIME.lock();
    let runtime = guard
        .as_mut()
        .ok_or_else(|| VrError::InvalidState("vrshim is not loaded".to_string()))?;
    f(runtime)
}

pub(crate) fn enable_vr() -> VrResult<()> {
    with_runtime(|rt| rt.adapter.enable_vr())
}

pub(crate) fn disable_vr() -> VrResult<()> {
    with_runtime(|rt| {
        rt.adapter.disable_vr();
        Ok(())
    })
}

pub(crate) fn is_vr_enabled() -> bool {
    RUNTIME
        .lock()
        .as_ref()
        .map(|rt| rt.adapter.is_vr_enabled())
        .unwrap_or(false)
}

pub(crate) fn camera_matrices() -> Option<CameraMatrices> {
    RUNTIME.lock().as_ref().map(|rt| rt.adapter.get_camera_matrices())
}

/// The device for the swapchain `this`, rebuilt when the swapchain changes
fn bind_device<'a>(
    slot: &'a mut Option<D3D11Device>,
    adapter: &mut EngineAdapter<D3D11Device>,
    this: *mut c_void,
) -> Option<&'a D3D11Device> {
    let current = slot.as_ref().map(|d| d.swap_chain().as_raw());
    if current != Some(this) {
        // SAFETY: `this` is the swapchain the game is presenting with.
        let swap_chain = unsafe { IDXGISwapChain::from_raw_borrowed(&this) }?;
        match D3D11Device::from_swap_chain(swap_chain) {
            Ok(device) => {
                if current.is_some() {
                    warn!(target: "vrshim::plugin", "Swapchain changed; recreating stereo targets");
                    adapter.release_resources();
                }
                *slot = Some(device);
            }
            Err(e) => {
                warn!(target: "vrshim::plugin", "Cannot wrap swapchain {:?}: {}", this, e);
                return None;
            }
        }
    }
    slot.as_ref()
}

fn guarded(detour: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(target: "vrshim::plugin", "Panic in {} detour; frame passed through", detour);
    }
}

fn on_present(this: *mut c_void) {
    // Enable/disable on another thread holds the lock only briefly; skip
    // this frame rather than stall the game.
    let Some(mut guard) = RUNTIME.try_lock() else {
        return;
    };
    let Some(Runtime { adapter, device }) = guard.as_mut() else {
        return;
    };
    if let Some(device) = bind_device(device, adapter, this) {
        adapter.on_frame(device);
    }
}

fn on_resize(this: *mut c_void) {
    let mut guard = RUNTIME.lock();
    let Some(Runtime { adapter, device }) = guard.as_mut() else {
        return;
    };
    let Some(device) = bind_device(device, adapter, this) else {
        return;
    };
    let (width, height) = match device.back_buffer_size() {
        Ok(size) => size,
        Err(e) => {
            warn!(target: "vrshim::plugin", "Back buffer unavailable after resize: {}", e);
            return;
        }
    };
    // Failure already disabled VR and was logged
    let _ = adapter.on_resize(device, width, height);
}

unsafe extern "system" fn present_detour(this: *mut c_void, sync_interval: u32, flags: u32) -> HRESULT {
    let Some(gates) = GATES.get() else {
        return E_UNEXPECTED;
    };
    if gates.present.should_intercept() && flags & PRESENT_TEST == 0 {
        guarded("Present", || on_present(this));
    }
    let call = gates.present.enter();
    let original: PresentFn = std::mem::transmute(call.forward_target());
    let hr = original(this, sync_interval, flags);
    drop(call);
    hr
}

unsafe extern "system" fn resize_buffers_detour(
    this: *mut c_void,
    buffer_count: u32,
    width: u32,
    height: u32,
    format: DXGI_FORMAT,
    flags: u32,
) -> HRESULT {
    let Some(gates) = GATES.get() else {
        return E_UNEXPECTED;
    };
    let call = gates.resize_buffers.enter();
    let original: ResizeBuffersFn = std::mem::transmute(call.forward_target());
    let hr = original(this, buffer_count, width, height, format, flags);
    drop(call);
    if hr.is_ok() && gates.resize_buffers.should_intercept() {
        guarded("ResizeBuffers", || on_resize(this));
    }
    hr
}
