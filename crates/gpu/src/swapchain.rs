//! Swapchain entry point resolution
//!
//! `Present` and `ResizeBuffers` live in dxgi.dll and are shared by every
//! swapchain in the process, so their addresses can be read from the vtable
//! of a throwaway device/swapchain pair created against a hidden window.

use std::ffi::c_void;

use tracing::debug;
use windows::core::{w, Interface, HRESULT};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDeviceAndSwapChain, ID3D11Device, ID3D11DeviceContext, D3D11_CREATE_DEVICE_FLAG,
    D3D11_SDK_VERSION,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_MODE_DESC, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    IDXGISwapChain, DXGI_SWAP_CHAIN_DESC, DXGI_SWAP_EFFECT_DISCARD,
    DXGI_USAGE_RENDER_TARGET_OUTPUT,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DestroyWindow, WINDOW_EX_STYLE, WS_OVERLAPPEDWINDOW,
};

use crate::error::GpuError;

/// Module that owns the swapchain entry points
pub const DXGI_MODULE: &str = "dxgi.dll";

/// `IDXGISwapChain::Present` vtable slot
pub const PRESENT_VTABLE_INDEX: usize = 8;
/// `IDXGISwapChain::ResizeBuffers` vtable slot
pub const RESIZE_BUFFERS_VTABLE_INDEX: usize = 13;

/// Native `IDXGISwapChain::Present`
pub type PresentFn =
    unsafe extern "system" fn(this: *mut c_void, sync_interval: u32, flags: u32) -> HRESULT;

/// Native `IDXGISwapChain::ResizeBuffers`
pub type ResizeBuffersFn = unsafe extern "system" fn(
    this: *mut c_void,
    buffer_count: u32,
    width: u32,
    height: u32,
    format: DXGI_FORMAT,
    flags: u32,
) -> HRESULT;

/// Addresses of the swapchain functions to detour
#[derive(Debug, Clone, Copy)]
pub struct SwapChainEntryPoints {
    pub present: usize,
    pub resize_buffers: usize,
}

/// Create a dummy swapchain and read its vtable
pub fn resolve_entry_points() -> Result<SwapChainEntryPoints, GpuError> {
    unsafe {
        let hwnd = CreateWindowExW(
            WINDOW_EX_STYLE(0),
            w!("STATIC"),
            w!("vrshim"),
            WS_OVERLAPPEDWINDOW,
            0,
            0,
            64,
            64,
            None,
            None,
            None,
            None,
        )?;

        let desc = DXGI_SWAP_CHAIN_DESC {
            BufferDesc: DXGI_MODE_DESC {
                Width: 64,
                Height: 64,
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                ..Default::default()
            },
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: 1,
            OutputWindow: hwnd,
            Windowed: true.into(),
            SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
            Flags: 0,
        };

        let mut swap_chain: Option<IDXGISwapChain> = None;
        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        let feature_levels = [D3D_FEATURE_LEVEL_11_0];

        let created = D3D11CreateDeviceAndSwapChain(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_FLAG(0),
            Some(&feature_levels),
            D3D11_SDK_VERSION,
            Some(&desc),
            Some(&mut swap_chain),
            Some(&mut device),
            None,
            Some(&mut context),
        );

        let result = created
            .map_err(GpuError::from)
            .and_then(|_| {
                swap_chain.ok_or(GpuError::CreateFailed {
                    resource: "dummy swapchain",
                    reason: "null swapchain".to_string(),
                })
            })
            .map(|sc| {
                let vtable = sc.vtable();
                SwapChainEntryPoints {
                    present: vtable.Present as usize,
                    resize_buffers: vtable.ResizeBuffers as usize,
                }
            });

        drop(context);
        drop(device);
        let _ = DestroyWindow(hwnd);

        let entry_points = result?;
        debug!(
            "Resolved swapchain entry points: Present={:x} ResizeBuffers={:x}",
            entry_points.present, entry_points.resize_buffers
        );
        Ok(entry_points)
    }
}
