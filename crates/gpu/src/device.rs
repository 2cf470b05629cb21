//! The render device seam
//!
//! Everything the stereo core does to the GPU goes through [`RenderDevice`].
//! The operations mirror the Direct3D 11 calls they wrap so the D3D11 backend
//! stays a thin translation layer, while tests drive the same code paths
//! against [`crate::headless::HeadlessDevice`].

use vrshim_sdk::{Eye, ShaderStage, Viewport};

use crate::error::GpuError;

/// Clear color used for eye targets before replay
pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Description of a GPU buffer, enough to create a staging twin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub byte_width: u32,
    /// Backend-specific usage bits, carried through untouched
    pub usage: u32,
    /// Backend-specific bind flags
    pub bind_flags: u32,
}

/// A CPU view of a mapped buffer
///
/// Only valid between the `map_read` that produced it and the matching
/// `unmap` on the same buffer.
#[derive(Debug, Clone, Copy)]
pub struct MappedMemory {
    pub ptr: *const u8,
    pub len: usize,
}

/// Operations the stereo core needs from a graphics device
///
/// Methods take `&self` because the underlying immediate context is itself
/// an interior-mutable COM object. Resource types release their GPU memory
/// on drop.
pub trait RenderDevice {
    /// A buffer: either a game-bound constant buffer or a staging copy
    type Buffer;
    /// A color target together with its view
    type RenderTarget;
    /// A depth-stencil texture together with its view
    type DepthStencil;
    /// Pipeline bindings captured by [`RenderDevice::save_state`]
    type StateBlock;

    // Constant buffers

    /// The constant buffer bound at `slot` of `stage`, if any
    fn constant_buffer(&self, stage: ShaderStage, slot: u32) -> Option<Self::Buffer>;

    /// Description of a buffer
    fn buffer_desc(&self, buffer: &Self::Buffer) -> BufferDesc;

    /// Create a CPU-readable staging buffer with the size of `desc`
    fn create_staging_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, GpuError>;

    /// GPU-side copy of `src` into `dst`
    fn copy_buffer(&self, dst: &Self::Buffer, src: &Self::Buffer);

    /// Map a staging buffer for reading
    fn map_read(&self, buffer: &Self::Buffer) -> Result<MappedMemory, GpuError>;

    /// Undo a successful [`RenderDevice::map_read`]
    fn unmap(&self, buffer: &Self::Buffer);

    /// Bind `contents` as the constant buffer at `stage`/`slot`, replacing
    /// whatever the game bound there until state is restored
    fn bind_constant_override(
        &self,
        stage: ShaderStage,
        slot: u32,
        contents: &[u8],
    ) -> Result<(), GpuError>;

    // Frame targets

    /// Current swapchain back-buffer dimensions
    fn back_buffer_size(&self) -> Result<(u32, u32), GpuError>;

    fn create_render_target(&self, width: u32, height: u32)
        -> Result<Self::RenderTarget, GpuError>;

    fn create_depth_stencil(&self, width: u32, height: u32)
        -> Result<Self::DepthStencil, GpuError>;

    /// Capture render targets, viewports and constant buffer bindings
    fn save_state(&self) -> Self::StateBlock;

    /// Put back everything captured by [`RenderDevice::save_state`]
    fn restore_state(&self, state: Self::StateBlock);

    fn bind_targets(&self, target: &Self::RenderTarget, depth: &Self::DepthStencil);

    fn clear(&self, target: &Self::RenderTarget, depth: &Self::DepthStencil, color: [f32; 4]);

    fn set_viewport(&self, viewport: &Viewport);

    /// Whether a recorded draw stream is available to replay per eye
    ///
    /// Without one nothing can be rendered from the eye cameras and the
    /// game frame must go out as it is.
    fn has_draw_stream(&self) -> bool;

    /// Issue the recorded draw stream for `eye` into the bound target
    fn replay_draws(&self, eye: Eye) -> Result<(), GpuError>;

    /// Copy an eye target into the back buffer at (`x`, `y`)
    fn copy_to_back_buffer(
        &self,
        target: &Self::RenderTarget,
        x: u32,
        y: u32,
    ) -> Result<(), GpuError>;
}
