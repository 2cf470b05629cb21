//! Direct3D 11 backend
//!
//! Thin translation of [`RenderDevice`] onto an `ID3D11Device`, its immediate
//! context and the game's swapchain. All calls must come from the thread
//! that owns the immediate context, which in practice is the thread calling
//! `Present`.

use std::collections::HashMap;

use parking_lot::Mutex;
use vrshim_sdk::{Eye, ShaderStage, Viewport, CONSTANT_BUFFER_SLOT_COUNT};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC;
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;

use crate::device::{BufferDesc, MappedMemory, RenderDevice};
use crate::error::GpuError;

const MAX_RENDER_TARGETS: usize = D3D11_SIMULTANEOUS_RENDER_TARGET_COUNT as usize;
const MAX_VIEWPORTS: usize = 16;

/// Eye color target
pub struct D3D11RenderTarget {
    texture: ID3D11Texture2D,
    view: ID3D11RenderTargetView,
    width: u32,
    height: u32,
}

/// Eye depth target
pub struct D3D11DepthStencil {
    _texture: ID3D11Texture2D,
    view: ID3D11DepthStencilView,
}

/// Bindings captured before stereo rendering
#[derive(Default)]
pub struct D3D11StateBlock {
    render_targets: [Option<ID3D11RenderTargetView>; MAX_RENDER_TARGETS],
    depth_stencil: Option<ID3D11DepthStencilView>,
    viewports: Vec<D3D11_VIEWPORT>,
    vs_buffers: [Option<ID3D11Buffer>; CONSTANT_BUFFER_SLOT_COUNT as usize],
    ps_buffers: [Option<ID3D11Buffer>; CONSTANT_BUFFER_SLOT_COUNT as usize],
}

/// Render device backed by the game's D3D11 device
pub struct D3D11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    swap_chain: IDXGISwapChain,
    overrides: Mutex<HashMap<(ShaderStage, u32), ID3D11Buffer>>,
    recorded: Mutex<Option<ID3D11CommandList>>,
}

impl D3D11Device {
    /// Build a device from the swapchain passed to `Present`
    pub fn from_swap_chain(swap_chain: &IDXGISwapChain) -> Result<Self, GpuError> {
        unsafe {
            let device: ID3D11Device = swap_chain.GetDevice()?;
            let context = device.GetImmediateContext()?;
            Ok(Self {
                device,
                context,
                swap_chain: swap_chain.clone(),
                overrides: Mutex::new(HashMap::new()),
                recorded: Mutex::new(None),
            })
        }
    }

    pub fn swap_chain(&self) -> &IDXGISwapChain {
        &self.swap_chain
    }

    /// Provide a command list recorded by the host for per-eye replay
    ///
    /// Without one, frames pass through without stereo composition.
    pub fn set_recorded_commands(&self, list: Option<ID3D11CommandList>) {
        *self.recorded.lock() = list;
    }

    fn back_buffer(&self) -> Result<ID3D11Texture2D, GpuError> {
        unsafe {
            self.swap_chain
                .GetBuffer::<ID3D11Texture2D>(0)
                .map_err(|e| GpuError::BackBuffer(e.to_string()))
        }
    }

    fn back_buffer_desc(&self) -> Result<D3D11_TEXTURE2D_DESC, GpuError> {
        let texture = self.back_buffer()?;
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        Ok(desc)
    }

    fn create_texture(
        &self,
        desc: &D3D11_TEXTURE2D_DESC,
        resource: &'static str,
    ) -> Result<ID3D11Texture2D, GpuError> {
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(desc, None, Some(&mut texture)) }.map_err(|e| {
            GpuError::CreateFailed {
                resource,
                reason: e.to_string(),
            }
        })?;
        texture.ok_or(GpuError::CreateFailed {
            resource,
            reason: "null texture".to_string(),
        })
    }

    fn override_buffer(
        &self,
        stage: ShaderStage,
        slot: u32,
        len: usize,
    ) -> Result<ID3D11Buffer, GpuError> {
        // Constant buffers must be a multiple of 16 bytes
        let byte_width = ((len + 15) & !15) as u32;
        let mut overrides = self.overrides.lock();
        if let Some(existing) = overrides.get(&(stage, slot)) {
            let mut desc = D3D11_BUFFER_DESC::default();
            unsafe { existing.GetDesc(&mut desc) };
            if desc.ByteWidth == byte_width {
                return Ok(existing.clone());
            }
        }

        let desc = D3D11_BUFFER_DESC {
            ByteWidth: byte_width,
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
            StructureByteStride: 0,
        };
        let mut buffer: Option<ID3D11Buffer> = None;
        unsafe { self.device.CreateBuffer(&desc, None, Some(&mut buffer)) }.map_err(|e| {
            GpuError::CreateFailed {
                resource: "override constant buffer",
                reason: e.to_string(),
            }
        })?;
        let buffer = buffer.ok_or(GpuError::CreateFailed {
            resource: "override constant buffer",
            reason: "null buffer".to_string(),
        })?;
        overrides.insert((stage, slot), buffer.clone());
        Ok(buffer)
    }
}

impl RenderDevice for D3D11Device {
    type Buffer = ID3D11Buffer;
    type RenderTarget = D3D11RenderTarget;
    type DepthStencil = D3D11DepthStencil;
    type StateBlock = D3D11StateBlock;

    fn constant_buffer(&self, stage: ShaderStage, slot: u32) -> Option<ID3D11Buffer> {
        let mut bound: [Option<ID3D11Buffer>; 1] = [None];
        unsafe {
            match stage {
                ShaderStage::Vertex => self.context.VSGetConstantBuffers(slot, Some(&mut bound)),
                ShaderStage::Pixel => self.context.PSGetConstantBuffers(slot, Some(&mut bound)),
            }
        }
        let [buffer] = bound;
        buffer
    }

    fn buffer_desc(&self, buffer: &ID3D11Buffer) -> BufferDesc {
        let mut desc = D3D11_BUFFER_DESC::default();
        unsafe { buffer.GetDesc(&mut desc) };
        BufferDesc {
            byte_width: desc.ByteWidth,
            usage: desc.Usage.0 as u32,
            bind_flags: desc.BindFlags,
        }
    }

    fn create_staging_buffer(&self, desc: &BufferDesc) -> Result<ID3D11Buffer, GpuError> {
        let staging = D3D11_BUFFER_DESC {
            ByteWidth: desc.byte_width,
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
            StructureByteStride: 0,
        };
        let mut buffer: Option<ID3D11Buffer> = None;
        unsafe { self.device.CreateBuffer(&staging, None, Some(&mut buffer)) }.map_err(|e| {
            GpuError::CreateFailed {
                resource: "staging buffer",
                reason: e.to_string(),
            }
        })?;
        buffer.ok_or(GpuError::CreateFailed {
            resource: "staging buffer",
            reason: "null buffer".to_string(),
        })
    }

    fn copy_buffer(&self, dst: &ID3D11Buffer, src: &ID3D11Buffer) {
        unsafe { self.context.CopyResource(dst, src) };
    }

    fn map_read(&self, buffer: &ID3D11Buffer) -> Result<MappedMemory, GpuError> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(buffer, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| GpuError::MapFailed(e.to_string()))?;
        }
        if mapped.pData.is_null() {
            unsafe { self.context.Unmap(buffer, 0) };
            return Err(GpuError::MapFailed("null data pointer".to_string()));
        }
        Ok(MappedMemory {
            ptr: mapped.pData as *const u8,
            len: self.buffer_desc(buffer).byte_width as usize,
        })
    }

    fn unmap(&self, buffer: &ID3D11Buffer) {
        unsafe { self.context.Unmap(buffer, 0) };
    }

    fn bind_constant_override(
        &self,
        stage: ShaderStage,
        slot: u32,
        contents: &[u8],
    ) -> Result<(), GpuError> {
        let buffer = self.override_buffer(stage, slot, contents.len())?;
        let mut padded = contents.to_vec();
        padded.resize((contents.len() + 15) & !15, 0);
        unsafe {
            self.context
                .UpdateSubresource(&buffer, 0, None, padded.as_ptr() as *const _, 0, 0);
            match stage {
                ShaderStage::Vertex => self.context.VSSetConstantBuffers(slot, Some(&[Some(buffer)])),
                ShaderStage::Pixel => self.context.PSSetConstantBuffers(slot, Some(&[Some(buffer)])),
            }
        }
        Ok(())
    }

    fn back_buffer_size(&self) -> Result<(u32, u32), GpuError> {
        let desc = self.back_buffer_desc()?;
        Ok((desc.Width, desc.Height))
    }

    fn create_render_target(
        &self,
        width: u32,
        height: u32,
    ) -> Result<D3D11RenderTarget, GpuError> {
        let format = self.back_buffer_desc()?.Format;
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let texture = self.create_texture(&desc, "eye render target")?;

        let mut view: Option<ID3D11RenderTargetView> = None;
        unsafe {
            self.device
                .CreateRenderTargetView(&texture, None, Some(&mut view))
                .map_err(|e| GpuError::CreateFailed {
                    resource: "render target view",
                    reason: e.to_string(),
                })?;
        }
        let view = view.ok_or(GpuError::CreateFailed {
            resource: "render target view",
            reason: "null view".to_string(),
        })?;

        Ok(D3D11RenderTarget {
            texture,
            view,
            width,
            height,
        })
    }

    fn create_depth_stencil(
        &self,
        width: u32,
        height: u32,
    ) -> Result<D3D11DepthStencil, GpuError> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_D24_UNORM_S8_UINT,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_DEPTH_STENCIL.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let texture = self.create_texture(&desc, "eye depth stencil")?;

        let mut view: Option<ID3D11DepthStencilView> = None;
        unsafe {
            self.device
                .CreateDepthStencilView(&texture, None, Some(&mut view))
                .map_err(|e| GpuError::CreateFailed {
                    resource: "depth stencil view",
                    reason: e.to_string(),
                })?;
        }
        let view = view.ok_or(GpuError::CreateFailed {
            resource: "depth stencil view",
            reason: "null view".to_string(),
        })?;

        Ok(D3D11DepthStencil {
            _texture: texture,
            view,
        })
    }

    fn save_state(&self) -> D3D11StateBlock {
        let mut state = D3D11StateBlock::default();
        unsafe {
            self.context
                .OMGetRenderTargets(Some(&mut state.render_targets), Some(&mut state.depth_stencil));

            let mut count = MAX_VIEWPORTS as u32;
            let mut viewports = [D3D11_VIEWPORT::default(); MAX_VIEWPORTS];
            self.context
                .RSGetViewports(&mut count, Some(viewports.as_mut_ptr()));
            state.viewports = viewports[..count as usize].to_vec();

            self.context.VSGetConstantBuffers(0, Some(&mut state.vs_buffers));
            self.context.PSGetConstantBuffers(0, Some(&mut state.ps_buffers));
        }
        state
    }

    fn restore_state(&self, state: D3D11StateBlock) {
        unsafe {
            self.context
                .OMSetRenderTargets(Some(&state.render_targets), state.depth_stencil.as_ref());
            if !state.viewports.is_empty() {
                self.context.RSSetViewports(Some(&state.viewports));
            }
            self.context.VSSetConstantBuffers(0, Some(&state.vs_buffers));
            self.context.PSSetConstantBuffers(0, Some(&state.ps_buffers));
        }
    }

    fn bind_targets(&self, target: &D3D11RenderTarget, depth: &D3D11DepthStencil) {
        unsafe {
            self.context
                .OMSetRenderTargets(Some(&[Some(target.view.clone())]), &depth.view);
        }
    }

    fn clear(&self, target: &D3D11RenderTarget, depth: &D3D11DepthStencil, color: [f32; 4]) {
        unsafe {
            self.context.ClearRenderTargetView(&target.view, &color);
            self.context.ClearDepthStencilView(
                &depth.view,
                (D3D11_CLEAR_DEPTH.0 | D3D11_CLEAR_STENCIL.0) as u32,
                1.0,
                0,
            );
        }
    }

    fn set_viewport(&self, viewport: &Viewport) {
        let vp = D3D11_VIEWPORT {
            TopLeftX: viewport.x,
            TopLeftY: viewport.y,
            Width: viewport.width,
            Height: viewport.height,
            MinDepth: viewport.min_depth,
            MaxDepth: viewport.max_depth,
        };
        unsafe { self.context.RSSetViewports(Some(&[vp])) };
    }

    fn has_draw_stream(&self) -> bool {
        self.recorded.lock().is_some()
    }

    fn replay_draws(&self, eye: Eye) -> Result<(), GpuError> {
        let recorded = self.recorded.lock();
        let Some(list) = recorded.as_ref() else {
            return Err(GpuError::Device(format!("no recorded draw stream for {eye} eye")));
        };
        unsafe { self.context.ExecuteCommandList(list, false.into()) };
        Ok(())
    }

    fn copy_to_back_buffer(
        &self,
        target: &D3D11RenderTarget,
        x: u32,
        y: u32,
    ) -> Result<(), GpuError> {
        let back_buffer = self.back_buffer()?;
        let region = D3D11_BOX {
            left: 0,
            top: 0,
            front: 0,
            right: target.width,
            bottom: target.height,
            back: 1,
        };
        unsafe {
            self.context.CopySubresourceRegion(
                &back_buffer,
                0,
                x,
                y,
                0,
                &target.texture,
                0,
                Some(&region),
            );
        }
        Ok(())
    }
}
