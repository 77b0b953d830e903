//! Renderer integration tests.
//!
//! Every test body runs against each backend through `rstest` cases; backends
//! that are not available on the host are skipped.
//!
//! # Test Categories
//!
//! - **Frame Tests**: full frames in both culling modes, with and without a scene
//! - **Shading Tests**: accumulation output read back from the back buffer
//! - **Scene Tests**: background loading, promotion and failed loads
//! - **Resize Tests**: grid and G-buffer follow the viewport
//! - **Lifecycle Tests**: device loss, recovery and shutdown (dummy only)
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test renderer_tests
//! ```

mod common;

use std::time::{Duration, Instant};

use glam::Vec3;
use rstest::rstest;

use common::{test_camera, test_lights, Backend, TestContext, HEIGHT, WIDTH};
use trilight_renderer::jobs::CancellationToken;
use trilight_renderer::resources::StandardMaterial;
use trilight_renderer::{
    Camera, CullingMode, DeviceLossReason, DummyBackend, FrameCapture, PointLight,
    ProceduralScene, Renderer, RendererConfig, RendererError, RendererResult, SceneData,
    SceneProvider, SceneStatus, MAX_LIGHTS,
};

// ============================================================================
// Frame Tests
// ============================================================================

#[rstest]
#[case::dummy_tile(Backend::Dummy, CullingMode::Tile)]
#[case::dummy_triangle(Backend::Dummy, CullingMode::Triangle)]
#[case::webgpu_tile(Backend::WebGpu, CullingMode::Tile)]
#[case::webgpu_triangle(Backend::WebGpu, CullingMode::Triangle)]
fn test_frames_without_scene(#[case] backend: Backend, #[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(backend, mode) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer.replace_lights(test_lights());
    for _ in 0..4 {
        ctx.renderer.frame().unwrap();
    }

    assert_eq!(ctx.renderer.stats().frames, 4);
    assert_eq!(ctx.renderer.clustering().mode(), mode);
    assert!(ctx.hazards().is_empty());
    ctx.renderer.shutdown().unwrap();
}

#[rstest]
#[case::dummy_tile(Backend::Dummy, CullingMode::Tile)]
#[case::dummy_triangle(Backend::Dummy, CullingMode::Triangle)]
#[case::webgpu_tile(Backend::WebGpu, CullingMode::Tile)]
#[case::webgpu_triangle(Backend::WebGpu, CullingMode::Triangle)]
fn test_frames_with_scene_and_lights(#[case] backend: Backend, #[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(backend, mode) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer.set_camera(test_camera());
    ctx.renderer.replace_lights(test_lights());
    ctx.renderer.switch_scene(ProceduralScene::default()).unwrap();
    let status = ctx.renderer.wait_for_scene().unwrap().clone();
    assert_eq!(status, SceneStatus::Ready("box field".into()));

    for frame in 0..8 {
        ctx.renderer.camera_mut().orbit(frame as f32 * 0.2, 18.0, 12.0);
        ctx.renderer.frame().unwrap();
    }

    assert_eq!(ctx.renderer.lights().len(), test_lights().len());
    assert!(ctx.hazards().is_empty());
    ctx.renderer.shutdown().unwrap();
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::webgpu(Backend::WebGpu)]
fn test_light_edits_between_frames(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, CullingMode::Triangle) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer.frame().unwrap();
    for light in test_lights() {
        assert!(ctx.renderer.add_light(light));
        ctx.renderer.frame().unwrap();
    }
    while ctx.renderer.remove_light(0).is_some() {
        ctx.renderer.frame().unwrap();
    }

    assert!(ctx.renderer.lights().is_empty());
    assert_eq!(ctx.renderer.clustering().params().light_num, 0);
    assert!(ctx.hazards().is_empty());
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::webgpu(Backend::WebGpu)]
fn test_light_store_is_capped(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, CullingMode::Tile) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let light = test_lights()[0];
    ctx.renderer
        .replace_lights(std::iter::repeat(light).take(MAX_LIGHTS as usize + 10));
    assert_eq!(ctx.renderer.lights().len(), MAX_LIGHTS as usize);
    assert!(!ctx.renderer.add_light(light));

    ctx.renderer.frame().unwrap();
    assert_eq!(ctx.renderer.clustering().params().light_num, MAX_LIGHTS);
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::webgpu(Backend::WebGpu)]
fn test_debug_view_and_ambient(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, CullingMode::Triangle) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer.replace_lights(test_lights());
    ctx.renderer.set_debug_view(true);
    ctx.renderer.frame().unwrap();
    ctx.renderer.set_debug_view(false);
    ctx.renderer.set_ambient(0.2).unwrap();
    ctx.renderer.frame().unwrap();

    assert!(ctx.renderer.set_ambient(-1.0).is_err());
    assert!(!ctx.renderer.info_text().contains("light count view"));
}

// ============================================================================
// Shading Tests
// ============================================================================

const WALL_ALBEDO: [f32; 3] = [0.25, 0.5, 0.75];

/// One wide box facing the camera, filling the view.
struct WallScene;

impl SceneProvider for WallScene {
    fn name(&self) -> &str {
        "wall"
    }

    fn load(&self, _cancel: &CancellationToken) -> RendererResult<SceneData> {
        let mut data = SceneData::new("wall");
        data.push_box(Vec3::ZERO, Vec3::new(40.0, 40.0, 0.5), 0);
        data.materials.push(StandardMaterial {
            albedo: Vec3::from(WALL_ALBEDO),
            ..StandardMaterial::new("wall")
        });
        Ok(data)
    }
}

fn center_pixel(capture: &FrameCapture) -> [u8; 4] {
    capture
        .pixel(capture.width / 2, capture.height / 2)
        .expect("capture is empty")
}

fn assert_color_near(actual: [u8; 4], expected: [f32; 3]) {
    for channel in 0..3 {
        let want = expected[channel] * 255.0;
        assert!(
            (actual[channel] as f32 - want).abs() <= 2.0,
            "channel {channel}: got {:?}, expected {:?}",
            actual,
            expected
        );
    }
}

#[rstest]
#[case::webgpu_tile(Backend::WebGpu, CullingMode::Tile)]
#[case::webgpu_triangle(Backend::WebGpu, CullingMode::Triangle)]
fn test_unlit_surface_shows_base_color(#[case] backend: Backend, #[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(backend, mode) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer.set_camera(Camera::new(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO));
    ctx.renderer.switch_scene(WallScene).unwrap();
    ctx.renderer.wait_for_scene().unwrap();
    ctx.renderer.frame().unwrap();
    let capture = ctx.renderer.capture_frame().unwrap().unwrap();
    assert_color_near(center_pixel(&capture), WALL_ALBEDO);

    ctx.renderer.set_ambient(0.5).unwrap();
    ctx.renderer.frame().unwrap();
    let capture = ctx.renderer.capture_frame().unwrap().unwrap();
    assert_color_near(center_pixel(&capture), WALL_ALBEDO.map(|c| c * 0.5));

    // A light just in front of the wall only adds to the base color.
    ctx.renderer.set_ambient(1.0).unwrap();
    ctx.renderer
        .replace_lights([PointLight::new(Vec3::new(0.0, 0.0, 2.0), 5.0, Vec3::splat(0.2))]);
    ctx.renderer.frame().unwrap();
    let lit = center_pixel(&ctx.renderer.capture_frame().unwrap().unwrap());
    for channel in 0..3 {
        assert!(lit[channel] as f32 >= WALL_ALBEDO[channel] * 255.0 + 2.0, "{lit:?}");
    }
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::webgpu(Backend::WebGpu)]
fn test_capture_matches_viewport(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, CullingMode::Triangle) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    assert_eq!(ctx.renderer.capture_frame().unwrap(), None);
    ctx.renderer.frame().unwrap();
    let capture = ctx.renderer.capture_frame().unwrap().unwrap();
    assert_eq!((capture.width, capture.height), (WIDTH, HEIGHT));
    assert_eq!(capture.rgba.len(), (WIDTH * HEIGHT * 4) as usize);
}

// ============================================================================
// Scene Tests
// ============================================================================

struct MissingScene;

impl SceneProvider for MissingScene {
    fn name(&self) -> &str {
        "missing"
    }

    fn load(&self, _cancel: &CancellationToken) -> RendererResult<SceneData> {
        Err(RendererError::SceneLoad("missing.scene: not found".into()))
    }
}

/// Spins until cancelled.
struct EndlessScene;

impl SceneProvider for EndlessScene {
    fn name(&self) -> &str {
        "endless"
    }

    fn load(&self, cancel: &CancellationToken) -> RendererResult<SceneData> {
        while !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(RendererError::SceneLoad("cancelled".into()))
    }
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::webgpu(Backend::WebGpu)]
fn test_scene_buffers_end_up_device_local(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, CullingMode::Triangle) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer
        .switch_scene(ProceduralScene::new("small grid", 2, 3.0))
        .unwrap();
    ctx.renderer.wait_for_scene().unwrap();
    let generation = ctx.renderer.promotion().generation().current();

    // Copies run in the background; keep rendering until they are committed.
    for _ in 0..100 {
        ctx.renderer.frame().unwrap();
        if ctx.renderer.promotion().pending() == 0
            && ctx.renderer.promotion().awaiting_commit() == 0
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let scene = ctx.renderer.scene().unwrap();
    for binding in scene.bindings() {
        assert_eq!(
            binding.get().location,
            trilight_renderer::backend::MemoryLocation::DeviceLocal
        );
    }
    assert!(ctx.renderer.promotion().generation().current() > generation);
    assert!(ctx.hazards().is_empty());
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::webgpu(Backend::WebGpu)]
fn test_failed_load_keeps_rendering_previous_scene(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, CullingMode::Tile) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer.switch_scene(ProceduralScene::default()).unwrap();
    ctx.renderer.wait_for_scene().unwrap();
    ctx.renderer.frame().unwrap();

    ctx.renderer.switch_scene(MissingScene).unwrap();
    match ctx.renderer.wait_for_scene().unwrap() {
        SceneStatus::Failed { name, message } => {
            assert_eq!(name, "missing");
            assert!(message.contains("not found"));
        }
        other => panic!("unexpected status {other}"),
    }
    assert_eq!(ctx.renderer.scene().map(|s| s.name()), Some("box field"));
    ctx.renderer.frame().unwrap();
}

/// Sleeps through its load without checking for cancellation.
struct SlowScene {
    hold: Duration,
}

impl SceneProvider for SlowScene {
    fn name(&self) -> &str {
        "slow"
    }

    fn load(&self, _cancel: &CancellationToken) -> RendererResult<SceneData> {
        std::thread::sleep(self.hold);
        let mut data = SceneData::new("slow");
        data.push_box(Vec3::ZERO, Vec3::ONE, 0);
        Ok(data)
    }
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::webgpu(Backend::WebGpu)]
fn test_slow_loads_do_not_stall_frames(#[case] backend: Backend) {
    let config = common::config(CullingMode::Triangle)
        .with_worker_threads(2)
        .with_gpu_wait_timeout(Duration::from_millis(300));
    let Some(mut ctx) = TestContext::with_config(backend, config) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer.replace_lights(test_lights());
    let hold = Duration::from_millis(900);
    ctx.renderer.switch_scene(SlowScene { hold }).unwrap();
    ctx.renderer.switch_scene(SlowScene { hold }).unwrap();

    // Both load workers are asleep for longer than the GPU wait timeout.
    let started = Instant::now();
    let mut frames = 0;
    while started.elapsed() < hold {
        ctx.renderer.frame().unwrap();
        frames += 1;
    }
    assert!(frames > 1);
    assert!(!ctx.renderer.is_device_lost());

    ctx.renderer.wait_for_scene().unwrap();
    ctx.renderer.frame().unwrap();
    assert_eq!(ctx.renderer.scene().map(|s| s.name()), Some("slow"));
    assert!(ctx.hazards().is_empty());
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::webgpu(Backend::WebGpu)]
fn test_switching_cancels_pending_load(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, CullingMode::Triangle) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer.switch_scene(EndlessScene).unwrap();
    ctx.renderer.frame().unwrap();
    assert!(ctx.renderer.is_loading());

    ctx.renderer
        .switch_scene(ProceduralScene::new("replacement", 2, 2.0))
        .unwrap();
    let status = ctx.renderer.wait_for_scene().unwrap().clone();
    assert_eq!(status, SceneStatus::Ready("replacement".into()));
    assert!(!ctx.renderer.is_loading());
    ctx.renderer.frame().unwrap();
}

// ============================================================================
// Resize Tests
// ============================================================================

#[rstest]
#[case::dummy_tile(Backend::Dummy, CullingMode::Tile)]
#[case::dummy_triangle(Backend::Dummy, CullingMode::Triangle)]
#[case::webgpu_tile(Backend::WebGpu, CullingMode::Tile)]
#[case::webgpu_triangle(Backend::WebGpu, CullingMode::Triangle)]
fn test_resize_follows_viewport(#[case] backend: Backend, #[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(backend, mode) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.renderer.replace_lights(test_lights());
    ctx.renderer.frame().unwrap();
    let params = *ctx.renderer.clustering().params();
    assert_eq!((params.width_dim, params.height_dim), (WIDTH / 32, HEIGHT / 32));

    ctx.renderer.resize(100, 50).unwrap();
    ctx.renderer.frame().unwrap();
    let params = *ctx.renderer.clustering().params();
    // 100/32 rounds to 3, 50/32 rounds to 2
    assert_eq!((params.width_dim, params.height_dim), (3, 2));
    assert_eq!(ctx.renderer.size(), (100, 50));
    assert_eq!(ctx.renderer.clustering().tile_vertex_count(), 3 * 2 * 6);

    ctx.renderer.resize(WIDTH, HEIGHT).unwrap();
    ctx.renderer.frame().unwrap();
    assert!(ctx.hazards().is_empty());
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_stalled_gpu_becomes_device_loss() {
    let backend = DummyBackend::new_manual();
    let config = common::config(CullingMode::Triangle)
        .with_gpu_wait_timeout(Duration::from_millis(50));
    let mut renderer = Renderer::new(Box::new(backend), config).unwrap();

    let mut error = None;
    for _ in 0..8 {
        if let Err(err) = renderer.frame() {
            error = Some(err);
            break;
        }
    }
    let error = error.expect("frames kept succeeding on a stalled GPU");
    assert!(error.is_device_lost(), "unexpected error {error}");
}

#[test]
fn test_removed_device_recovers_on_new_backend() {
    let Some(mut ctx) = TestContext::new(Backend::Dummy, CullingMode::Tile) else {
        return;
    };
    let gpu = ctx.gpu.clone().unwrap();
    ctx.renderer.replace_lights(test_lights());
    ctx.renderer.switch_scene(ProceduralScene::default()).unwrap();
    ctx.renderer.wait_for_scene().unwrap();
    ctx.renderer.frame().unwrap();

    gpu.remove_device("TDR");
    let err = ctx.renderer.frame().unwrap_err();
    assert!(err.is_device_lost());
    assert!(matches!(
        ctx.renderer.device_loss(),
        Some(DeviceLossReason::Removed(_))
    ));

    let replacement = DummyBackend::new();
    let replacement_gpu = replacement.gpu();
    ctx.renderer.recover(Box::new(replacement)).unwrap();
    ctx.renderer.frame().unwrap();

    assert_eq!(ctx.renderer.lights().len(), test_lights().len());
    assert_eq!(ctx.renderer.scene().map(|s| s.name()), Some("box field"));
    assert_eq!(replacement_gpu.present_count(), 1);
    assert!(replacement_gpu.hazards().is_empty());
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = RendererConfig::default().with_tile_size(0);
    let err = Renderer::new(Box::new(DummyBackend::new()), config).unwrap_err();
    assert!(matches!(err, RendererError::Config(_)));
}
