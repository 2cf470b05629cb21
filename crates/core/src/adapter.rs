//! Engine adapter
//!
//! Ties hooks, constant buffer readback, matrix location, the stereo
//! transform and the compositor into one per-frame pipeline:
//!
//! ```text
//! Present hook -> on_frame -> read cbuffers -> locate matrices
//!              -> per-eye matrices -> render left/right -> composite
//!              -> original Present
//! ```
//!
//! The adapter moves through `Uninitialized -> HooksInstalled -> VRActive`
//! once enabled, and to `Disabled` when VR is turned off or a resize leaves
//! it without targets. A frame whose camera cannot be read renders the last
//! good camera again. Any other failure skips stereo work for that frame
//! only, and the game's own frame goes out untouched.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use vrshim_gpu::RenderDevice;
use vrshim_sdk::{
    CameraMatrices, Eye, HookPoint, Mat4, MatrixMapping, ShaderStage, CONSTANT_BUFFER_SLOT_COUNT,
};

use crate::cbuffer::{ConstantBufferReader, ProbeRecord};
use crate::compositor::{CameraUpload, StereoCompositor};
use crate::config::{base_dir, CoreConfig, Profile, ProfileError};
use crate::error::{VrError, VrResult};
use crate::hooks::{DetourBackend, HookGate, HookInfo, HookSafetyManager};
use crate::matrix::MatrixLocator;
use crate::memory::MemorySafetyManager;
use crate::metrics::PerformanceMetrics;
use crate::stereo::StereoTransformEngine;

/// Probe output file name inside the profile's probe directory
pub const PROBE_LOG_FILE: &str = "cb_probe.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Uninitialized,
    HooksInstalled,
    VRActive,
    Disabled,
}

/// What happened to stereo processing on one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// VR is not enabled
    Inactive,
    /// Something failed; the game frame passes through unmodified
    Skipped,
    /// Both eyes rendered and composited
    Rendered,
}

/// One native entry point to intercept
#[derive(Debug, Clone)]
pub struct HookTarget {
    pub point: HookPoint,
    pub name: String,
    pub module: String,
    pub original: usize,
    pub detour: usize,
    gate: HookGate,
}

impl HookTarget {
    /// # Safety
    /// `original` must be the entry of a function and `detour` a function
    /// with the same signature that forwards through [`HookTarget::gate`].
    pub unsafe fn new(point: HookPoint, module: &str, original: usize, detour: usize) -> Self {
        Self {
            point,
            name: point.name().to_string(),
            module: module.to_string(),
            original,
            detour,
            gate: HookGate::new(original),
        }
    }

    /// Target whose detour already holds `gate`
    ///
    /// Detours are plain functions that live as long as the module, so a
    /// reloaded plan must hand them the same gate again.
    ///
    /// # Safety
    /// As for [`HookTarget::new`], with `gate.original()` as the entry.
    pub unsafe fn with_gate(point: HookPoint, module: &str, gate: HookGate, detour: usize) -> Self {
        Self {
            point,
            name: point.name().to_string(),
            module: module.to_string(),
            original: gate.original(),
            detour,
            gate,
        }
    }

    /// The gate the detour consults
    pub fn gate(&self) -> &HookGate {
        &self.gate
    }
}

/// The set of entry points the adapter hooks when VR is enabled
#[derive(Debug, Clone, Default)]
pub struct HookPlan {
    targets: Vec<HookTarget>,
}

impl HookPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target: HookTarget) {
        self.targets.push(target);
    }

    pub fn with(mut self, target: HookTarget) -> Self {
        self.push(target);
        self
    }

    pub fn targets(&self) -> &[HookTarget] {
        &self.targets
    }

    pub fn target(&self, point: HookPoint) -> Option<&HookTarget> {
        self.targets.iter().find(|t| t.point == point)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Everything the adapter needs from its host
pub struct AdapterContext {
    pub memory: Arc<MemorySafetyManager>,
    pub config: CoreConfig,
    pub profile: Option<Profile>,
    pub plan: HookPlan,
    /// Root for relative paths (probe output)
    pub base_dir: Option<PathBuf>,
}

impl AdapterContext {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            memory: Arc::new(MemorySafetyManager::new(config.safety())),
            config,
            profile: None,
            plan: HookPlan::new(),
            base_dir: None,
        }
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_plan(mut self, plan: HookPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Load `configs/core.toml` and the configured title profile
    ///
    /// A missing profile is not an error; matrices are then located
    /// heuristically. A profile that exists but does not parse is.
    pub fn load() -> VrResult<Self> {
        let config = CoreConfig::load()?;
        let base = base_dir().ok();
        let profile = match config.profile.as_deref() {
            Some(title) => match Profile::load(title) {
                Ok(profile) => Some(profile),
                Err(ProfileError::NotFound(path)) => {
                    debug!(target: "vrshim::config", "No profile at {:?}", path);
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let mut context = Self::new(config);
        context.profile = profile;
        context.base_dir = base;
        Ok(context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatrixKind {
    View,
    Projection,
}

impl MatrixKind {
    fn name(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Projection => "projection",
        }
    }
}

/// Where a matrix was read from
#[derive(Debug, Clone, Copy, PartialEq)]
struct Located {
    stage: ShaderStage,
    mapping: MatrixMapping,
}

struct Captured {
    at: Located,
    bytes: Vec<u8>,
    matrix: Mat4,
}

/// Drives stereo rendering for one device
pub struct EngineAdapter<D: RenderDevice> {
    config: CoreConfig,
    profile: Option<Profile>,
    plan: HookPlan,
    hooks: HookSafetyManager,
    reader: ConstantBufferReader,
    locator: MatrixLocator,
    stereo: StereoTransformEngine,
    compositor: StereoCompositor<D>,
    camera: CameraMatrices,
    state: AdapterState,
    requested: bool,
    installed: Vec<HookInfo>,
    metrics: PerformanceMetrics,
    frame: u64,
    /// Heuristic results, reused until they stop validating
    heuristic: [Option<Located>; 2],
    heuristic_warned: bool,
    stream_warned: bool,
    probe_remaining: u32,
    probe_path: Option<PathBuf>,
    /// Buffers from the last frame with a fresh camera
    last_upload: Option<CameraUpload>,
}

impl<D: RenderDevice> EngineAdapter<D> {
    pub fn new(context: AdapterContext, backend: Box<dyn DetourBackend>) -> Self {
        let AdapterContext {
            memory,
            config,
            profile,
            plan,
            base_dir,
        } = context;

        let layout = profile.as_ref().map(Profile::matrix_layout).unwrap_or_default();
        let locator = MatrixLocator::new(config.heuristics, layout);
        let stereo = StereoTransformEngine::new(config.stereo(profile.as_ref()));
        let probe_path = match (&profile, base_dir.as_deref()) {
            (Some(p), Some(base)) => p.probe_logs_dir(base).map(|dir| dir.join(PROBE_LOG_FILE)),
            _ => None,
        };

        Self {
            hooks: HookSafetyManager::new(Arc::clone(&memory), config.hooks, backend),
            compositor: StereoCompositor::new(config.layout, locator).with_memory(Arc::clone(&memory)),
            reader: ConstantBufferReader::new(memory),
            metrics: PerformanceMetrics::with_budget_ms(config.frame_budget_ms),
            locator,
            stereo,
            config,
            profile,
            plan,
            camera: CameraMatrices::default(),
            state: AdapterState::Uninitialized,
            requested: false,
            installed: Vec::new(),
            frame: 0,
            heuristic: [None; 2],
            heuristic_warned: false,
            stream_warned: false,
            probe_remaining: 0,
            probe_path,
            last_upload: None,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn hooks(&self) -> &HookSafetyManager {
        &self.hooks
    }

    pub fn compositor(&self) -> &StereoCompositor<D> {
        &self.compositor
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Install every hook in the plan and arm the frame pipeline
    ///
    /// All or nothing: if any hook fails, the ones already installed are
    /// removed again before the error is returned.
    pub fn enable_vr(&mut self) -> VrResult<()> {
        if self.requested {
            return Ok(());
        }

        for target in self.plan.targets() {
            let mut info = HookInfo::new(&target.name, &target.module, target.original, target.detour);
            // SAFETY: HookTarget::new carries the signature contract.
            let result = unsafe { self.hooks.install_hook_gated(&mut info, target.gate.clone()) };
            if let Err(e) = result {
                error!(
                    target: "vrshim::adapter",
                    "Enabling VR failed at '{}': {}; rolling back",
                    target.name,
                    e
                );
                self.rollback_installed();
                self.state = AdapterState::Disabled;
                return Err(e);
            }
            self.installed.push(info);
        }

        self.requested = true;
        self.state = AdapterState::Uninitialized;
        self.probe_remaining = self.config.probe_frames;
        self.metrics.reset();
        info!(
            target: "vrshim::adapter",
            "VR enabled ({} hooks, {:?}, ipd {:.4} m, world scale {})",
            self.installed.len(),
            self.compositor.layout(),
            self.stereo.config().ipd,
            self.stereo.config().world_scale
        );
        Ok(())
    }

    /// Remove all hooks and release stereo targets
    pub fn disable_vr(&mut self) {
        self.rollback_installed();
        self.compositor.release_stereo_resources();
        let was_enabled = std::mem::replace(&mut self.requested, false);
        self.state = AdapterState::Disabled;
        self.probe_remaining = 0;
        if was_enabled {
            info!(target: "vrshim::adapter", "VR disabled after {} frames", self.metrics.frames());
        }
    }

    fn rollback_installed(&mut self) {
        for mut info in self.installed.drain(..) {
            if let Err(e) = self.hooks.remove_hook(&mut info) {
                warn!(target: "vrshim::adapter", "Could not remove '{}': {}", info.function_name, e);
            }
        }
        // Anything installed outside the plan
        self.hooks.rollback_all_hooks();
    }

    pub fn is_vr_enabled(&self) -> bool {
        self.requested
    }

    /// Last camera snapshot, including the per-eye matrices
    pub fn get_camera_matrices(&self) -> CameraMatrices {
        self.camera
    }

    /// Run the stereo pipeline for one presented frame
    pub fn on_frame(&mut self, device: &D) -> FrameOutcome {
        if !self.requested {
            return FrameOutcome::Inactive;
        }

        self.frame += 1;
        let started = Instant::now();

        if self.state == AdapterState::Uninitialized {
            self.state = AdapterState::HooksInstalled;
            info!(target: "vrshim::adapter", "First frame through hooks");
        }

        if self.probe_remaining > 0 {
            self.run_probe(device);
        }

        match self.process_frame(device) {
            Ok(()) => {
                self.metrics.record(started.elapsed());
                FrameOutcome::Rendered
            }
            Err(e) => {
                debug!(target: "vrshim::adapter", "Frame {} skipped: {}", self.frame, e);
                self.metrics.record_skipped();
                FrameOutcome::Skipped
            }
        }
    }

    fn process_frame(&mut self, device: &D) -> VrResult<()> {
        let upload = self.update_camera(device)?;

        // The camera snapshot stays current, but eyes cannot be drawn
        if !device.has_draw_stream() {
            if !self.stream_warned {
                self.stream_warned = true;
                warn!(
                    target: "vrshim::adapter",
                    "No draw stream to replay per eye; passing frames through unmodified"
                );
            }
            return Err(VrError::InvalidState("no draw stream to replay".to_string()));
        }

        if !self.compositor.has_resources() {
            let (width, height) = device.back_buffer_size()?;
            self.compositor.create_stereo_resources(device, width, height)?;
        }

        if self.state != AdapterState::VRActive {
            self.state = AdapterState::VRActive;
            info!(target: "vrshim::adapter", "Stereo rendering active");
        }

        for eye in Eye::BOTH {
            self.compositor.render_eye(device, eye, &self.camera, Some(&upload))?;
        }
        self.compositor.composite_stereo_frame(device)
    }

    /// The back buffer changed size
    ///
    /// Eye targets are recreated immediately. If that fails VR is turned off
    /// rather than left half-alive.
    pub fn on_resize(&mut self, device: &D, width: u32, height: u32) -> VrResult<()> {
        if !self.compositor.has_resources() {
            return Ok(());
        }
        if let Err(e) = self.compositor.resize(device, width, height) {
            error!(
                target: "vrshim::adapter",
                "Could not recreate stereo targets at {}x{}: {}; disabling VR",
                width,
                height,
                e
            );
            self.disable_vr();
            return Err(e);
        }
        Ok(())
    }

    /// Drop the eye targets; they are recreated on the next frame
    ///
    /// For when the device behind the swapchain changes.
    pub fn release_resources(&mut self) {
        self.compositor.release_stereo_resources();
        self.heuristic = [None; 2];
    }

    /// Refresh the camera snapshot and collect the buffers to re-upload
    ///
    /// Matrices that cannot be read this frame keep their previous value and
    /// are written at their last location, over the bytes that failed to
    /// validate. With nothing fresh at all, the last good camera is rendered again;
    /// before the first good camera the frame is skipped.
    fn update_camera(&mut self, device: &D) -> VrResult<CameraUpload> {
        let view = self.capture(device, MatrixKind::View);
        let projection = self.capture(device, MatrixKind::Projection);

        if view.is_none() && projection.is_none() {
            return match (&self.last_upload, self.camera.valid) {
                (Some(upload), true) => {
                    debug!(
                        target: "vrshim::adapter",
                        "No fresh camera; reusing frame {}",
                        self.camera.frame
                    );
                    Ok(upload.clone())
                }
                _ => Err(VrError::MatrixExtractionFailed(
                    "no valid camera matrix this frame".to_string(),
                )),
            };
        }

        let mut upload = CameraUpload::default();
        if let Some(c) = view {
            self.camera.view = c.matrix;
            upload.stage = Some(c.at.stage);
            upload.view = Some(c.at.mapping);
            upload.buffers.insert(c.at.mapping.cb_slot, c.bytes);
        }
        if let Some(c) = projection {
            self.camera.projection = c.matrix;
            if *upload.stage.get_or_insert(c.at.stage) == c.at.stage {
                upload.projection = Some(c.at.mapping);
                upload.buffers.entry(c.at.mapping.cb_slot).or_insert(c.bytes);
            } else {
                debug!(
                    target: "vrshim::adapter",
                    "Projection lives in {} but view in another stage; not re-uploading it",
                    c.at.stage
                );
            }
        }
        if let Some(previous) = self.last_upload.take() {
            carry_stale(&mut upload, &previous);
        }

        self.stereo.apply(&mut self.camera);
        self.camera.valid = true;
        self.camera.frame = self.frame;
        self.last_upload = Some(upload.clone());
        Ok(upload)
    }

    fn profile_mapping(&self, kind: MatrixKind) -> Option<MatrixMapping> {
        let profile = self.profile.as_ref()?;
        match kind {
            MatrixKind::View => profile.view_mapping(),
            MatrixKind::Projection => profile.projection_mapping(),
        }
    }

    fn validate(&self, kind: MatrixKind, bytes: &[u8], mapping: MatrixMapping) -> Option<Mat4> {
        match kind {
            MatrixKind::View => self.locator.extract_view(bytes, mapping),
            MatrixKind::Projection => self.locator.extract_projection(bytes, mapping),
        }
    }

    fn capture(&mut self, device: &D, kind: MatrixKind) -> Option<Captured> {
        if let Some(mapping) = self.profile_mapping(kind) {
            let found = self.reader.read_with_fallback(device, mapping.cb_slot, |bytes| {
                let matrix = self.validate(kind, bytes, mapping)?;
                Some((bytes.to_vec(), matrix))
            });
            return match found {
                Ok((stage, (bytes, matrix))) => Some(Captured {
                    at: Located { stage, mapping },
                    bytes,
                    matrix,
                }),
                Err(e) => {
                    debug!(target: "vrshim::adapter", "{} cb{}: {}", kind.name(), mapping.cb_slot, e);
                    None
                }
            };
        }

        if !self.heuristic_warned {
            self.heuristic_warned = true;
            warn!(
                target: "vrshim::adapter",
                "No profile mapping for the camera; locating matrices heuristically"
            );
        }

        let slot = kind as usize;
        if let Some(at) = self.heuristic[slot] {
            if let Some(captured) = self.read_at(device, kind, at) {
                return Some(captured);
            }
            debug!(target: "vrshim::adapter", "Cached {} location stopped validating", kind.name());
            self.heuristic[slot] = None;
        }

        let captured = self.scan(device, kind)?;
        info!(
            target: "vrshim::adapter",
            "Located {} matrix at {} cb{} +{}",
            kind.name(),
            captured.at.stage,
            captured.at.mapping.cb_slot,
            captured.at.mapping.offset_bytes
        );
        self.heuristic[slot] = Some(captured.at);
        Some(captured)
    }

    fn read_at(&self, device: &D, kind: MatrixKind, at: Located) -> Option<Captured> {
        let bytes = self.reader.read(device, at.stage, at.mapping.cb_slot).ok()?.to_vec();
        let matrix = self.validate(kind, &bytes, at.mapping)?;
        Some(Captured { at, bytes, matrix })
    }

    fn scan(&self, device: &D, kind: MatrixKind) -> Option<Captured> {
        for stage in [ShaderStage::Vertex, ShaderStage::Pixel] {
            for cb_slot in 0..CONSTANT_BUFFER_SLOT_COUNT {
                let Ok(info) = self.reader.read(device, stage, cb_slot) else {
                    continue;
                };
                let bytes = info.to_vec();
                drop(info);
                let found = match kind {
                    MatrixKind::View => self.locator.scan_for_view(&bytes),
                    MatrixKind::Projection => self.locator.scan_for_projection(&bytes),
                };
                if let Some(found) = found {
                    return Some(Captured {
                        at: Located {
                            stage,
                            mapping: MatrixMapping::new(cb_slot, found.offset_bytes),
                        },
                        bytes,
                        matrix: found.matrix,
                    });
                }
            }
        }
        None
    }

    fn run_probe(&mut self, device: &D) {
        self.probe_remaining -= 1;
        let records = self.reader.probe(device, self.frame);
        let Some(path) = self.probe_path.as_deref() else {
            return;
        };
        if let Err(e) = append_probe(path, self.frame, &records) {
            warn!(target: "vrshim::probe", "Cannot write {:?}: {}; probe output stays in the log", path, e);
            self.probe_path = None;
        }
    }
}

/// Keep writing last frame's location for a matrix that did not validate
///
/// The bytes bound this frame at that location are whatever failed
/// validation; the per-eye pass overwrites them with the last good snapshot.
fn carry_stale(upload: &mut CameraUpload, previous: &CameraUpload) {
    if upload.stage != previous.stage {
        return;
    }
    if upload.view.is_none() {
        upload.view = carry(&mut upload.buffers, previous, previous.view);
    }
    if upload.projection.is_none() {
        upload.projection = carry(&mut upload.buffers, previous, previous.projection);
    }
}

fn carry(
    buffers: &mut BTreeMap<u32, Vec<u8>>,
    previous: &CameraUpload,
    mapping: Option<MatrixMapping>,
) -> Option<MatrixMapping> {
    let mapping = mapping?;
    if !buffers.contains_key(&mapping.cb_slot) {
        buffers.insert(mapping.cb_slot, previous.buffers.get(&mapping.cb_slot)?.clone());
    }
    Some(mapping)
}

fn append_probe(path: &Path, frame: u64, records: &[ProbeRecord]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "# frame {frame}: {} buffers", records.len())?;
    for record in records {
        writeln!(file, "{record}")?;
    }
    Ok(())
}
