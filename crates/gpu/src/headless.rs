//! CPU-side render device
//!
//! `HeadlessDevice` keeps buffers in host memory, records every call in
//! order and counts live resources. It backs the core's tests and lets the
//! frame pipeline run end to end without a GPU. Individual operations can be
//! made to fail with [`HeadlessDevice::fail_on`] to exercise error paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vrshim_sdk::{Eye, ShaderStage, Viewport};

use crate::device::{BufferDesc, MappedMemory, RenderDevice};
use crate::error::GpuError;

/// Operations that can be forced to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateStaging,
    Map,
    CreateRenderTarget,
    CreateDepthStencil,
    BackBuffer,
    Replay,
}

/// A recorded device call
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    CopyBuffer { dst: u64, src: u64 },
    Map(u64),
    Unmap(u64),
    BindConstantOverride {
        stage: ShaderStage,
        slot: u32,
        contents: Vec<u8>,
    },
    SaveState,
    RestoreState,
    BindTargets { target: u64, depth: u64 },
    Clear { target: u64, depth: u64 },
    SetViewport(Viewport),
    ReplayDraws(Eye),
    CopyToBackBuffer {
        target: u64,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
}

/// Counts a live resource until dropped
#[derive(Debug)]
struct LiveToken(Arc<AtomicUsize>);

impl LiveToken {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Host-memory buffer
#[derive(Debug, Clone)]
pub struct HeadlessBuffer {
    id: u64,
    desc: BufferDesc,
    data: Arc<Mutex<Vec<u8>>>,
    _live: Option<Arc<LiveToken>>,
}

impl HeadlessBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Color target placeholder with its dimensions
#[derive(Debug)]
pub struct HeadlessTarget {
    id: u64,
    width: u32,
    height: u32,
    _live: LiveToken,
}

impl HeadlessTarget {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Depth-stencil placeholder with its dimensions
#[derive(Debug)]
pub struct HeadlessDepth {
    id: u64,
    width: u32,
    height: u32,
    _live: LiveToken,
}

impl HeadlessDepth {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Bindings the game would observe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    pub targets: Option<(u64, u64)>,
    pub viewport: Option<Viewport>,
    pub overrides: HashMap<(ShaderStage, u32), Vec<u8>>,
}

struct Inner {
    next_id: u64,
    bound: HashMap<(ShaderStage, u32), HeadlessBuffer>,
    back_buffer: (u32, u32),
    failures: HashSet<FailPoint>,
    calls: Vec<DeviceCall>,
    state: PipelineState,
    mapped: HashSet<u64>,
    target_sizes: HashMap<u64, (u32, u32)>,
    draw_stream: bool,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Render device that never touches a GPU
pub struct HeadlessDevice {
    inner: Mutex<Inner>,
    live_staging: Arc<AtomicUsize>,
    live_targets: Arc<AtomicUsize>,
    live_depth: Arc<AtomicUsize>,
}

impl HeadlessDevice {
    /// Create a device whose swapchain is `width` x `height`
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                bound: HashMap::new(),
                back_buffer: (width, height),
                failures: HashSet::new(),
                calls: Vec::new(),
                state: PipelineState::default(),
                mapped: HashSet::new(),
                target_sizes: HashMap::new(),
                draw_stream: true,
            }),
            live_staging: Arc::new(AtomicUsize::new(0)),
            live_targets: Arc::new(AtomicUsize::new(0)),
            live_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pretend a draw stream is (or is not) available for replay
    pub fn set_draw_stream(&self, available: bool) {
        self.inner.lock().draw_stream = available;
    }

    /// Bind `bytes` as a game constant buffer
    pub fn bind_constant_buffer(&self, stage: ShaderStage, slot: u32, bytes: Vec<u8>) {
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        let buffer = HeadlessBuffer {
            id,
            desc: BufferDesc {
                byte_width: bytes.len() as u32,
                usage: 0,
                bind_flags: 0,
            },
            data: Arc::new(Mutex::new(bytes)),
            _live: None,
        };
        inner.bound.insert((stage, slot), buffer);
    }

    /// Remove a game constant buffer binding
    pub fn unbind_constant_buffer(&self, stage: ShaderStage, slot: u32) {
        self.inner.lock().bound.remove(&(stage, slot));
    }

    /// Current contents of a game constant buffer
    pub fn constant_buffer_bytes(&self, stage: ShaderStage, slot: u32) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .bound
            .get(&(stage, slot))
            .map(|b| b.data.lock().clone())
    }

    /// Simulate a swapchain resize
    pub fn set_back_buffer_size(&self, width: u32, height: u32) {
        self.inner.lock().back_buffer = (width, height);
    }

    /// Make an operation fail until [`HeadlessDevice::clear_failures`]
    pub fn fail_on(&self, point: FailPoint) {
        self.inner.lock().failures.insert(point);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Recorded calls, oldest first
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// Bindings currently visible to the game
    pub fn pipeline_state(&self) -> PipelineState {
        self.inner.lock().state.clone()
    }

    pub fn live_staging_buffers(&self) -> usize {
        self.live_staging.load(Ordering::SeqCst)
    }

    pub fn live_render_targets(&self) -> usize {
        self.live_targets.load(Ordering::SeqCst)
    }

    pub fn live_depth_stencils(&self) -> usize {
        self.live_depth.load(Ordering::SeqCst)
    }

    /// Number of buffers currently mapped
    pub fn mapped_buffers(&self) -> usize {
        self.inner.lock().mapped.len()
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.inner.lock().failures.contains(&point)
    }

    fn record(&self, call: DeviceCall) {
        self.inner.lock().calls.push(call);
    }
}

impl RenderDevice for HeadlessDevice {
    type Buffer = HeadlessBuffer;
    type RenderTarget = HeadlessTarget;
    type DepthStencil = HeadlessDepth;
    type StateBlock = PipelineState;

    fn constant_buffer(&self, stage: ShaderStage, slot: u32) -> Option<HeadlessBuffer> {
        self.inner.lock().bound.get(&(stage, slot)).cloned()
    }

    fn buffer_desc(&self, buffer: &HeadlessBuffer) -> BufferDesc {
        buffer.desc
    }

    fn create_staging_buffer(&self, desc: &BufferDesc) -> Result<HeadlessBuffer, GpuError> {
        if self.fails(FailPoint::CreateStaging) {
            return Err(GpuError::CreateFailed {
                resource: "staging buffer",
                reason: "injected failure".to_string(),
            });
        }
        let id = self.inner.lock().next_id();
        Ok(HeadlessBuffer {
            id,
            desc: *desc,
            data: Arc::new(Mutex::new(vec![0u8; desc.byte_width as usize])),
            _live: Some(Arc::new(LiveToken::new(&self.live_staging))),
        })
    }

    fn copy_buffer(&self, dst: &HeadlessBuffer, src: &HeadlessBuffer) {
        if !Arc::ptr_eq(&dst.data, &src.data) {
            let bytes = src.data.lock().clone();
            let mut out = dst.data.lock();
            let n = out.len().min(bytes.len());
            out[..n].copy_from_slice(&bytes[..n]);
        }
        self.record(DeviceCall::CopyBuffer {
            dst: dst.id,
            src: src.id,
        });
    }

    fn map_read(&self, buffer: &HeadlessBuffer) -> Result<MappedMemory, GpuError> {
        if self.fails(FailPoint::Map) {
            return Err(GpuError::MapFailed("injected failure".to_string()));
        }
        let (ptr, len) = {
            let data = buffer.data.lock();
            (data.as_ptr(), data.len())
        };
        self.inner.lock().mapped.insert(buffer.id);
        self.record(DeviceCall::Map(buffer.id));
        Ok(MappedMemory { ptr, len })
    }

    fn unmap(&self, buffer: &HeadlessBuffer) {
        self.inner.lock().mapped.remove(&buffer.id);
        self.record(DeviceCall::Unmap(buffer.id));
    }

    fn bind_constant_override(
        &self,
        stage: ShaderStage,
        slot: u32,
        contents: &[u8],
    ) -> Result<(), GpuError> {
        let mut inner = self.inner.lock();
        inner
            .state
            .overrides
            .insert((stage, slot), contents.to_vec());
        inner.calls.push(DeviceCall::BindConstantOverride {
            stage,
            slot,
            contents: contents.to_vec(),
        });
        Ok(())
    }

    fn back_buffer_size(&self) -> Result<(u32, u32), GpuError> {
        if self.fails(FailPoint::BackBuffer) {
            return Err(GpuError::BackBuffer("injected failure".to_string()));
        }
        Ok(self.inner.lock().back_buffer)
    }

    fn create_render_target(&self, width: u32, height: u32) -> Result<HeadlessTarget, GpuError> {
        if self.fails(FailPoint::CreateRenderTarget) {
            return Err(GpuError::CreateFailed {
                resource: "render target",
                reason: "injected failure".to_string(),
            });
        }
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        inner.target_sizes.insert(id, (width, height));
        Ok(HeadlessTarget {
            id,
            width,
            height,
            _live: LiveToken::new(&self.live_targets),
        })
    }

    fn create_depth_stencil(&self, width: u32, height: u32) -> Result<HeadlessDepth, GpuError> {
        if self.fails(FailPoint::CreateDepthStencil) {
            return Err(GpuError::CreateFailed {
                resource: "depth stencil",
                reason: "injected failure".to_string(),
            });
        }
        let id = self.inner.lock().next_id();
        Ok(HeadlessDepth {
            id,
            width,
            height,
            _live: LiveToken::new(&self.live_depth),
        })
    }

    fn save_state(&self) -> PipelineState {
        let mut inner = self.inner.lock();
        inner.calls.push(DeviceCall::SaveState);
        inner.state.clone()
    }

    fn restore_state(&self, state: PipelineState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.calls.push(DeviceCall::RestoreState);
    }

    fn bind_targets(&self, target: &HeadlessTarget, depth: &HeadlessDepth) {
        let mut inner = self.inner.lock();
        inner.state.targets = Some((target.id, depth.id));
        inner.calls.push(DeviceCall::BindTargets {
            target: target.id,
            depth: depth.id,
        });
    }

    fn clear(&self, target: &HeadlessTarget, depth: &HeadlessDepth, _color: [f32; 4]) {
        self.record(DeviceCall::Clear {
            target: target.id,
            depth: depth.id,
        });
    }

    fn set_viewport(&self, viewport: &Viewport) {
        let mut inner = self.inner.lock();
        inner.state.viewport = Some(*viewport);
        inner.calls.push(DeviceCall::SetViewport(*viewport));
    }

    fn has_draw_stream(&self) -> bool {
        self.inner.lock().draw_stream
    }

    fn replay_draws(&self, eye: Eye) -> Result<(), GpuError> {
        if !self.has_draw_stream() {
            return Err(GpuError::Device(format!("no recorded draw stream for {eye} eye")));
        }
        if self.fails(FailPoint::Replay) {
            return Err(GpuError::Device("injected replay failure".to_string()));
        }
        self.record(DeviceCall::ReplayDraws(eye));
        Ok(())
    }

    fn copy_to_back_buffer(&self, target: &HeadlessTarget, x: u32, y: u32) -> Result<(), GpuError> {
        self.record(DeviceCall::CopyToBackBuffer {
            target: target.id,
            x,
            y,
            width: target.width,
            height: target.height,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_buffers_are_counted_until_dropped() {
        let device = HeadlessDevice::new(64, 64);
        let desc = BufferDesc {
            byte_width: 128,
            usage: 0,
            bind_flags: 0,
        };
        let a = device.create_staging_buffer(&desc).unwrap();
        let b = a.clone();
        assert_eq!(device.live_staging_buffers(), 1);
        drop(a);
        assert_eq!(device.live_staging_buffers(), 1);
        drop(b);
        assert_eq!(device.live_staging_buffers(), 0);
    }

    #[test]
    fn test_copy_and_map_expose_bound_bytes() {
        let device = HeadlessDevice::new(64, 64);
        device.bind_constant_buffer(ShaderStage::Vertex, 2, vec![1, 2, 3, 4]);

        let bound = device.constant_buffer(ShaderStage::Vertex, 2).unwrap();
        let staging = device
            .create_staging_buffer(&device.buffer_desc(&bound))
            .unwrap();
        device.copy_buffer(&staging, &bound);

        let mapped = device.map_read(&staging).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(mapped.ptr, mapped.len) };
        assert_eq!(bytes, &[1, 2, 3, 4]);
        assert_eq!(device.mapped_buffers(), 1);

        device.unmap(&staging);
        assert_eq!(device.mapped_buffers(), 0);
    }

    #[test]
    fn test_injected_failures() {
        let device = HeadlessDevice::new(64, 64);
        device.fail_on(FailPoint::CreateRenderTarget);
        assert!(device.create_render_target(32, 32).is_err());
        device.clear_failures();
        let rt = device.create_render_target(32, 32).unwrap();
        assert_eq!(rt.size(), (32, 32));
        assert_eq!(device.live_render_targets(), 1);
    }

    #[test]
    fn test_restore_state_reverts_bindings() {
        let device = HeadlessDevice::new(64, 64);
        let saved = device.save_state();
        device.set_viewport(&Viewport::new(0.0, 0.0, 32.0, 64.0));
        device
            .bind_constant_override(ShaderStage::Vertex, 0, &[0u8; 16])
            .unwrap();
        assert_ne!(device.pipeline_state(), saved);
        device.restore_state(saved.clone());
        assert_eq!(device.pipeline_state(), saved);
    }
}
