//! Per-eye render targets and back-buffer composition
//!
//! The compositor owns one color and depth target per eye. Each eye pass
//! captures the device state, renders into the eye target with the eye's
//! camera bound, and restores the game's bindings before returning.
//!
//! ```text
//! Uninitialized --create--> ResourcesCreated --render_eye--> Rendering
//!       ^                        |      ^                        |
//!       +-------release----------+      +-------(pass ends)------+
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vrshim_gpu::{RenderDevice, CLEAR_COLOR};
use vrshim_sdk::{mat4_to_le_bytes, CameraMatrices, Eye, MatrixMapping, ShaderStage, Viewport, MAT4_SIZE};

use crate::error::{VrError, VrResult};
use crate::matrix::MatrixLocator;
use crate::memory::MemorySafetyManager;

/// Bytes per texel assumed for tracking: 32-bit color, D24S8 depth
const TRACKED_TEXEL_BYTES: usize = 4 + 4;

/// How the two eyes are laid out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StereoLayout {
    /// Each eye gets half the back buffer, left eye on the left
    #[default]
    SideBySide,
    /// Each eye is full size; only the left eye reaches the back buffer
    FullFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorState {
    Uninitialized,
    ResourcesCreated,
    Rendering,
}

/// Targets for one eye
pub struct EyeTarget<D: RenderDevice> {
    pub color: D::RenderTarget,
    pub depth: D::DepthStencil,
    pub viewport: Viewport,
}

/// Left and right eye targets, alive only as a pair
pub struct StereoResources<D: RenderDevice> {
    eyes: [EyeTarget<D>; 2],
    /// Back-buffer size the pair was created for
    back_buffer: (u32, u32),
    eye_size: (u32, u32),
}

impl<D: RenderDevice> StereoResources<D> {
    pub fn eye(&self, eye: Eye) -> &EyeTarget<D> {
        &self.eyes[eye.index()]
    }

    pub fn back_buffer_size(&self) -> (u32, u32) {
        self.back_buffer
    }

    pub fn eye_size(&self) -> (u32, u32) {
        self.eye_size
    }

    /// Approximate GPU memory held by both eyes
    pub fn tracked_bytes(&self) -> usize {
        2 * self.eye_size.0 as usize * self.eye_size.1 as usize * TRACKED_TEXEL_BYTES
    }
}

impl<D: RenderDevice> fmt::Debug for StereoResources<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StereoResources")
            .field("back_buffer", &self.back_buffer)
            .field("eye_size", &self.eye_size)
            .finish()
    }
}

/// The game's camera constant buffers as last read, ready to be re-bound
/// with per-eye matrices patched in
#[derive(Debug, Clone, Default)]
pub struct CameraUpload {
    pub stage: Option<ShaderStage>,
    pub view: Option<MatrixMapping>,
    pub projection: Option<MatrixMapping>,
    /// Buffer contents keyed by slot
    pub buffers: BTreeMap<u32, Vec<u8>>,
}

impl CameraUpload {
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() || (self.view.is_none() && self.projection.is_none())
    }

    /// Slot contents with `view` and `projection` written at their offsets
    pub fn patched(
        &self,
        locator: &MatrixLocator,
        view: &vrshim_sdk::Mat4,
        projection: &vrshim_sdk::Mat4,
    ) -> Vec<(u32, Vec<u8>)> {
        self.buffers
            .iter()
            .map(|(&slot, bytes)| {
                let mut out = bytes.clone();
                if let Some(m) = self.view.filter(|m| m.cb_slot == slot) {
                    write_matrix(&mut out, m.offset_bytes, &locator.to_buffer_layout(view));
                }
                if let Some(m) = self.projection.filter(|m| m.cb_slot == slot) {
                    write_matrix(&mut out, m.offset_bytes, &locator.to_buffer_layout(projection));
                }
                (slot, out)
            })
            .collect()
    }
}

fn write_matrix(bytes: &mut [u8], offset: usize, m: &vrshim_sdk::Mat4) {
    if let Some(dst) = bytes.get_mut(offset..offset + MAT4_SIZE) {
        dst.copy_from_slice(&mat4_to_le_bytes(m));
    }
}

/// Tracking key for a pair: its heap address
fn resource_key<D: RenderDevice>(resources: &StereoResources<D>) -> *const u8 {
    resources as *const StereoResources<D> as *const u8
}

/// Owns the eye targets and drives the per-eye passes
pub struct StereoCompositor<D: RenderDevice> {
    layout: StereoLayout,
    locator: MatrixLocator,
    state: CompositorState,
    resources: Option<Box<StereoResources<D>>>,
    memory: Option<Arc<MemorySafetyManager>>,
}

impl<D: RenderDevice> StereoCompositor<D> {
    pub fn new(layout: StereoLayout, locator: MatrixLocator) -> Self {
        Self {
            layout,
            locator,
            state: CompositorState::Uninitialized,
            resources: None,
            memory: None,
        }
    }

    /// Record eye target allocations with `memory`
    pub fn with_memory(mut self, memory: Arc<MemorySafetyManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn state(&self) -> CompositorState {
        self.state
    }

    pub fn layout(&self) -> StereoLayout {
        self.layout
    }

    pub fn resources(&self) -> Option<&StereoResources<D>> {
        self.resources.as_deref()
    }

    pub fn has_resources(&self) -> bool {
        self.resources.is_some()
    }

    /// Per-eye target size for a `width` x `height` back buffer
    pub fn eye_size(&self, width: u32, height: u32) -> (u32, u32) {
        match self.layout {
            StereoLayout::SideBySide => (width / 2, height),
            StereoLayout::FullFrame => (width, height),
        }
    }

    fn create_eye(device: &D, eye: Eye, width: u32, height: u32) -> VrResult<EyeTarget<D>> {
        let color = device.create_render_target(width, height).map_err(|e| {
            VrError::ResourceAllocationFailed(format!("{eye} eye render target: {e}"))
        })?;
        let depth = device.create_depth_stencil(width, height).map_err(|e| {
            VrError::ResourceAllocationFailed(format!("{eye} eye depth stencil: {e}"))
        })?;
        Ok(EyeTarget {
            color,
            depth,
            viewport: Viewport::new(0.0, 0.0, width as f32, height as f32),
        })
    }

    /// Allocate both eye targets for a `width` x `height` back buffer
    ///
    /// Either both eyes are created or neither is; a failed right eye drops
    /// the left one before returning.
    pub fn create_stereo_resources(&mut self, device: &D, width: u32, height: u32) -> VrResult<()> {
        if self.state == CompositorState::Rendering {
            return Err(VrError::InvalidState("cannot recreate targets mid-pass".to_string()));
        }
        self.release_stereo_resources();

        let (eye_w, eye_h) = self.eye_size(width, height);
        if eye_w == 0 || eye_h == 0 {
            return Err(VrError::ResourceAllocationFailed(format!(
                "back buffer {width}x{height} too small for {:?}",
                self.layout
            )));
        }

        let left = Self::create_eye(device, Eye::Left, eye_w, eye_h)?;
        let right = match Self::create_eye(device, Eye::Right, eye_w, eye_h) {
            Ok(right) => right,
            Err(e) => {
                drop(left);
                warn!(target: "vrshim::compositor", "Stereo target allocation failed: {}", e);
                return Err(e);
            }
        };

        let resources = Box::new(StereoResources {
            eyes: [left, right],
            back_buffer: (width, height),
            eye_size: (eye_w, eye_h),
        });
        if let Some(memory) = &self.memory {
            memory.track_allocation(
                resource_key(&*resources),
                resources.tracked_bytes(),
                &format!("stereo targets {eye_w}x{eye_h}"),
            );
        }
        self.resources = Some(resources);
        self.state = CompositorState::ResourcesCreated;
        info!(
            target: "vrshim::compositor",
            "Created stereo targets {}x{} per eye for {}x{} back buffer",
            eye_w,
            eye_h,
            width,
            height
        );
        Ok(())
    }

    pub fn release_stereo_resources(&mut self) {
        if let Some(resources) = self.resources.take() {
            if let Some(memory) = &self.memory {
                memory.track_deallocation(resource_key(&*resources));
            }
            debug!(target: "vrshim::compositor", "Released stereo targets");
        }
        self.state = CompositorState::Uninitialized;
    }

    /// Recreate the targets for a new back-buffer size
    pub fn resize(&mut self, device: &D, width: u32, height: u32) -> VrResult<()> {
        if let Some(res) = &self.resources {
            if res.back_buffer == (width, height) {
                return Ok(());
            }
            info!(
                target: "vrshim::compositor",
                "Back buffer resized {}x{} -> {}x{}",
                res.back_buffer.0,
                res.back_buffer.1,
                width,
                height
            );
        }
        self.create_stereo_resources(device, width, height)
    }

    /// Render one eye into its target
    ///
    /// Device state is captured before anything is bound and restored on
    /// every path out, including failures.
    pub fn render_eye(
        &mut self,
        device: &D,
        eye: Eye,
        camera: &CameraMatrices,
        upload: Option<&CameraUpload>,
    ) -> VrResult<()> {
        let Some(resources) = &self.resources else {
            return Err(VrError::InvalidState("no stereo resources".to_string()));
        };

        let current = device.back_buffer_size()?;
        if current != resources.back_buffer {
            return Err(VrError::InvalidState(format!(
                "eye targets sized for {}x{}, back buffer is {}x{}",
                resources.back_buffer.0, resources.back_buffer.1, current.0, current.1
            )));
        }

        let saved = device.save_state();
        self.state = CompositorState::Rendering;
        let result = self.eye_pass(device, eye, camera, upload);
        device.restore_state(saved);
        self.state = CompositorState::ResourcesCreated;

        if let Err(e) = &result {
            debug!(target: "vrshim::compositor", "{} eye pass failed: {}", eye, e);
        }
        result
    }

    fn eye_pass(
        &self,
        device: &D,
        eye: Eye,
        camera: &CameraMatrices,
        upload: Option<&CameraUpload>,
    ) -> VrResult<()> {
        let Some(resources) = &self.resources else {
            return Err(VrError::InvalidState("no stereo resources".to_string()));
        };
        let target = resources.eye(eye);

        device.bind_targets(&target.color, &target.depth);
        device.clear(&target.color, &target.depth, CLEAR_COLOR);
        device.set_viewport(&target.viewport);

        if let Some(upload) = upload.filter(|u| !u.is_empty()) {
            let stage = upload.stage.unwrap_or(ShaderStage::Vertex);
            let patched = upload.patched(
                &self.locator,
                camera.eye_view(eye),
                camera.eye_projection(eye),
            );
            for (slot, bytes) in patched {
                device.bind_constant_override(stage, slot, &bytes)?;
            }
        }

        device.replay_draws(eye)?;
        Ok(())
    }

    /// Copy the eye targets into the back buffer
    pub fn composite_stereo_frame(&self, device: &D) -> VrResult<()> {
        let Some(resources) = &self.resources else {
            return Err(VrError::InvalidState("no stereo resources".to_string()));
        };
        let left = resources.eye(Eye::Left);
        device.copy_to_back_buffer(&left.color, 0, 0)?;
        if self.layout == StereoLayout::SideBySide {
            let right = resources.eye(Eye::Right);
            device.copy_to_back_buffer(&right.color, resources.eye_size.0, 0)?;
        }
        Ok(())
    }
}

impl<D: RenderDevice> Drop for StereoCompositor<D> {
    fn drop(&mut self) {
        self.release_stereo_resources();
    }
}
