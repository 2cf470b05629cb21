//! End-to-end frame pipeline against the headless device

use glam::{Mat4 as GlamMat4, Vec3};
use vrshim_core::gpu::{DeviceCall, HeadlessDevice};
use vrshim_core::hooks::RecordingBackend;
use vrshim_core::sdk::{mat4_from_le_bytes, mat4_to_le_bytes, Eye, HookPoint, ShaderStage, Viewport};
use vrshim_core::{
    AdapterContext, AdapterState, CoreConfig, EngineAdapter, FrameOutcome, HookPlan, HookTarget,
    LateralAxis, Profile, StereoLayout,
};

extern "C" fn present() {}
extern "C" fn present_hook() {}

fn view() -> [f32; 16] {
    GlamMat4::look_at_lh(Vec3::new(1.0, 1.5, -4.0), Vec3::ZERO, Vec3::Y).to_cols_array()
}

fn projection() -> [f32; 16] {
    GlamMat4::perspective_lh(70f32.to_radians(), 16.0 / 9.0, 0.1, 5000.0).to_cols_array()
}

/// Game-style constant buffer: world matrix, then view, then projection
fn game_buffer() -> Vec<u8> {
    let mut bytes = mat4_to_le_bytes(&vrshim_core::sdk::IDENTITY).to_vec();
    bytes.extend_from_slice(&mat4_to_le_bytes(&view()));
    bytes.extend_from_slice(&mat4_to_le_bytes(&projection()));
    bytes
}

fn profile() -> Profile {
    serde_json::from_str(
        r#"{
            "camera_system": {
                "hook_points": {
                    "view_matrix": { "cb_slot": 1, "offset_bytes": 64 },
                    "projection_matrix": { "cb_slot": 1, "offset_bytes": 128 }
                }
            }
        }"#,
    )
    .unwrap()
}

fn adapter(config: CoreConfig, profile: Option<Profile>) -> EngineAdapter<HeadlessDevice> {
    let plan = HookPlan::new().with(unsafe {
        HookTarget::new(HookPoint::Present, "dxgi.dll", present as usize, present_hook as usize)
    });
    let mut context = AdapterContext::new(config).with_plan(plan);
    if let Some(profile) = profile {
        context = context.with_profile(profile);
    }
    EngineAdapter::new(context, Box::new(RecordingBackend::new()))
}

#[test]
fn test_stereo_frame_renders_both_eyes_and_composites() {
    let device = HeadlessDevice::new(1920, 1080);
    device.bind_constant_buffer(ShaderStage::Vertex, 1, game_buffer());

    let config = CoreConfig {
        world_scale: 100.0,
        ..Default::default()
    };
    let mut adapter = adapter(config, Some(profile()));
    adapter.enable_vr().unwrap();
    assert_eq!(adapter.on_frame(&device), FrameOutcome::Rendered);
    assert_eq!(adapter.state(), AdapterState::VRActive);

    let calls = device.calls();
    let replays: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            DeviceCall::ReplayDraws(eye) => Some(*eye),
            _ => None,
        })
        .collect();
    assert_eq!(replays, vec![Eye::Left, Eye::Right]);

    let viewport = Viewport::new(0.0, 0.0, 960.0, 1080.0);
    assert_eq!(
        calls
            .iter()
            .filter(|c| **c == DeviceCall::SetViewport(viewport))
            .count(),
        2
    );

    // Each eye re-uploads the game buffer with its own view patched in
    let uploads: Vec<Vec<u8>> = calls
        .iter()
        .filter_map(|c| match c {
            DeviceCall::BindConstantOverride { slot: 1, contents, .. } => Some(contents.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(uploads.len(), 2);
    let camera = adapter.get_camera_matrices();
    let mut left = [0u8; 64];
    left.copy_from_slice(&uploads[0][64..128]);
    assert_eq!(mat4_from_le_bytes(&left), camera.left_view);
    assert!((camera.left_view[12] - view()[12] - 3.2).abs() < 1e-4);
    assert!((camera.right_view[12] - view()[12] + 3.2).abs() < 1e-4);
    // Game's world matrix is carried through untouched
    assert_eq!(&uploads[1][0..64], &game_buffer()[0..64]);

    let copies: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            DeviceCall::CopyToBackBuffer { x, .. } => Some(*x),
            _ => None,
        })
        .collect();
    assert_eq!(copies, vec![0, 960]);

    // The game's own buffer was never written
    assert_eq!(
        device.constant_buffer_bytes(ShaderStage::Vertex, 1),
        Some(game_buffer())
    );
    // Every eye pass gave the pipeline back as it found it
    assert_eq!(device.pipeline_state(), Default::default());
    assert_eq!(device.live_staging_buffers(), 0);
}

#[test]
fn test_heuristic_location_without_profile() {
    let device = HeadlessDevice::new(1280, 720);
    device.bind_constant_buffer(ShaderStage::Vertex, 1, game_buffer());

    let mut adapter = adapter(CoreConfig::default(), None);
    adapter.enable_vr().unwrap();
    assert_eq!(adapter.on_frame(&device), FrameOutcome::Rendered);

    let camera = adapter.get_camera_matrices();
    assert_eq!(camera.view, view());
    assert_eq!(camera.projection, projection());
    assert_eq!(camera.left_projection, camera.right_projection);
}

#[test]
fn test_full_frame_layout_and_axis_from_config() {
    let device = HeadlessDevice::new(1280, 720);
    device.bind_constant_buffer(ShaderStage::Vertex, 1, game_buffer());

    let config = CoreConfig {
        layout: StereoLayout::FullFrame,
        lateral_axis: LateralAxis::Y,
        ..Default::default()
    };
    let mut adapter = adapter(config, Some(profile()));
    adapter.enable_vr().unwrap();
    assert_eq!(adapter.on_frame(&device), FrameOutcome::Rendered);

    assert_eq!(
        adapter.compositor().resources().unwrap().eye_size(),
        (1280, 720)
    );
    let camera = adapter.get_camera_matrices();
    assert_eq!(camera.left_view[12], camera.right_view[12]);
    assert!((camera.left_view[13] - camera.right_view[13] - 0.064).abs() < 1e-6);
}

#[test]
fn test_disable_then_reenable() {
    let device = HeadlessDevice::new(1920, 1080);
    device.bind_constant_buffer(ShaderStage::Vertex, 1, game_buffer());

    let mut adapter = adapter(CoreConfig::default(), Some(profile()));
    adapter.enable_vr().unwrap();
    assert_eq!(adapter.on_frame(&device), FrameOutcome::Rendered);

    adapter.disable_vr();
    assert_eq!(adapter.on_frame(&device), FrameOutcome::Inactive);
    assert_eq!(device.live_render_targets(), 0);
    assert!(adapter.hooks().get_active_hooks().is_empty());

    adapter.enable_vr().unwrap();
    assert_eq!(adapter.state(), AdapterState::Uninitialized);
    assert_eq!(adapter.on_frame(&device), FrameOutcome::Rendered);
    assert_eq!(adapter.hooks().get_active_hooks().len(), 1);
}
