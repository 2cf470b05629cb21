//! Render pipeline vocabulary

use std::fmt;

/// Number of constant buffer slots addressable per shader stage on D3D11
pub const CONSTANT_BUFFER_SLOT_COUNT: u32 = 14;

/// Shader stage a constant buffer is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    /// Short tag used in log lines
    pub const fn tag(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "VS",
            ShaderStage::Pixel => "PS",
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One of the two stereo eyes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Left = 0,
    Right = 1,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Eye {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eye::Left => f.write_str("left"),
            Eye::Right => f.write_str("right"),
        }
    }
}

/// Rasterizer viewport in pixels
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Native entry points the adapter intercepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// `IDXGISwapChain::Present`
    Present,
    /// `IDXGISwapChain::ResizeBuffers`
    ResizeBuffers,
    /// `ID3D12CommandQueue::ExecuteCommandLists` or another submission call
    ExecuteCommandLists,
}

impl HookPoint {
    pub const fn name(self) -> &'static str {
        match self {
            HookPoint::Present => "Present",
            HookPoint::ResizeBuffers => "ResizeBuffers",
            HookPoint::ExecuteCommandLists => "ExecuteCommandLists",
        }
    }

    /// Whether a call through this point ends a frame
    pub const fn is_frame_boundary(self) -> bool {
        matches!(self, HookPoint::Present | HookPoint::ExecuteCommandLists)
    }
}
