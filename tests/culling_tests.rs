//! Light culling integration tests.
//!
//! # Test Categories
//!
//! - **Reference Tests**: properties of the CPU culling pass on the renderer's grid
//! - **GPU Tests**: culling kernel results read back, compared with the CPU pass
//!   and with a second run over the same inputs
//!
//! GPU tests only produce results on a real device; on the dummy backend the
//! slot buffer is never written and the comparison is skipped.

mod common;

use glam::{Vec3, Vec4Swizzles};
use rstest::rstest;

use common::{test_camera, Backend, TestContext, HEIGHT, WIDTH};
use trilight_renderer::clustering::{DepthImage, LightIndexBuffer};
use trilight_renderer::jobs::CancellationToken;
use trilight_renderer::scene::grid_lights;
use trilight_renderer::{
    Camera, CullingMode, PointLight, RendererResult, SceneData, SceneProvider,
    MAX_LIGHTS_PER_CLUSTER,
};

/// A single ground square seen from above.
struct GroundScene {
    half_size: f32,
}

impl SceneProvider for GroundScene {
    fn name(&self) -> &str {
        "ground"
    }

    fn load(&self, _cancel: &CancellationToken) -> RendererResult<SceneData> {
        let mut data = SceneData::new("ground");
        data.push_ground(0.0, self.half_size, 0);
        Ok(data)
    }
}

/// CPU depth of the ground square, sampled at pixel centres.
fn ground_depth(camera: &Camera, half_size: f32, width: u32, height: u32) -> DepthImage {
    let view_proj = camera.view_projection_matrix();
    let inv = view_proj.inverse();
    DepthImage::from_fn(width, height, |px, py| {
        let x = (px as f32 + 0.5) / width as f32 * 2.0 - 1.0;
        let y = 1.0 - (py as f32 + 0.5) / height as f32 * 2.0;
        let near = inv * glam::Vec4::new(x, y, 0.0, 1.0);
        let far = inv * glam::Vec4::new(x, y, 1.0, 1.0);
        let near = near.xyz() / near.w;
        let far = far.xyz() / far.w;
        let dir = far - near;
        if dir.y.abs() < 1e-6 {
            return 1.0;
        }
        let t = -near.y / dir.y;
        if !(0.0..=1.0).contains(&t) {
            return 1.0;
        }
        let hit = near + dir * t;
        if hit.x.abs() > half_size || hit.z.abs() > half_size {
            return 1.0;
        }
        let clip = view_proj * hit.extend(1.0);
        clip.z / clip.w
    })
}

fn ground_lights() -> Vec<PointLight> {
    grid_lights(
        6,
        1,
        6,
        Vec3::new(-12.0, 0.5, -12.0),
        Vec3::new(12.0, 0.5, 12.0),
        3.0,
    )
}

fn assert_well_formed(buffer: &LightIndexBuffer, light_count: u32) {
    for slot in buffer.slots() {
        assert!(slot.counter <= MAX_LIGHTS_PER_CLUSTER);
        let lights = slot.lights();
        assert!(lights.iter().all(|&light| light < light_count));
        assert!(lights.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

// ============================================================================
// Reference Tests
// ============================================================================

#[rstest]
#[case::tile_one_slice(CullingMode::Tile, 1)]
#[case::tile_four_slices(CullingMode::Tile, 4)]
#[case::triangle_one_slice(CullingMode::Triangle, 1)]
#[case::triangle_four_slices(CullingMode::Triangle, 4)]
fn test_reference_lists_are_well_formed(#[case] mode: CullingMode, #[case] slices: u32) {
    let mut config = common::config(mode);
    config.depth_slices = slices;
    let Some(mut ctx) = TestContext::with_config(Backend::Dummy, config) else {
        return;
    };
    ctx.renderer.set_camera(test_camera());
    ctx.renderer.replace_lights(ground_lights());
    ctx.renderer.update().unwrap();

    let engine = ctx.renderer.clustering();
    let lights = ctx.renderer.lights().lights();
    let result = engine.cull_reference(ctx.renderer.camera(), lights, None);

    let params = engine.params();
    assert_eq!(params.depth_dim, slices);
    assert_eq!(
        result.len() as u32,
        params.tile_count() * engine.policy().slots_per_tile()
    );
    assert_well_formed(&result, lights.len() as u32);
    assert!(result.total_assignments() > 0);
}

#[rstest]
#[case::tile(CullingMode::Tile)]
#[case::triangle(CullingMode::Triangle)]
fn test_lights_behind_camera_are_culled(#[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(Backend::Dummy, mode) else {
        return;
    };
    let camera = Camera::new(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO);
    ctx.renderer.set_camera(camera);
    ctx.renderer.update().unwrap();

    let behind = [PointLight::new(Vec3::new(0.0, 0.0, 20.0), 2.0, Vec3::ONE)];
    let result = ctx
        .renderer
        .clustering()
        .cull_reference(ctx.renderer.camera(), &behind, None);
    assert_eq!(result.total_assignments(), 0);
}

#[rstest]
#[case::tile(CullingMode::Tile)]
#[case::triangle(CullingMode::Triangle)]
fn test_surface_depth_only_removes_lights(#[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(Backend::Dummy, mode) else {
        return;
    };
    ctx.renderer.set_camera(test_camera());
    ctx.renderer.update().unwrap();

    let camera = ctx.renderer.camera().clone();
    let lights = ground_lights();
    let engine = ctx.renderer.clustering();
    let unbounded = engine.cull_reference(&camera, &lights, None);
    let depth = ground_depth(&camera, 20.0, WIDTH, HEIGHT);
    let bounded = engine.cull_reference(&camera, &lights, Some(&depth));

    assert_eq!(unbounded.len(), bounded.len());
    for index in 0..bounded.len() {
        let all = unbounded.lights(index);
        assert!(bounded.lights(index).iter().all(|light| all.contains(light)));
    }
    assert!(bounded.total_assignments() < unbounded.total_assignments());
}

#[rstest]
#[case::tile(CullingMode::Tile)]
#[case::triangle(CullingMode::Triangle)]
fn test_crowded_cells_are_clamped(#[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(Backend::Dummy, mode) else {
        return;
    };
    ctx.renderer.set_camera(test_camera());
    ctx.renderer.update().unwrap();

    let crowd: Vec<PointLight> = (0..400)
        .map(|i| PointLight::new(Vec3::new(0.0, 0.0, i as f32 * -0.01), 50.0, Vec3::ONE))
        .collect();
    let result = ctx
        .renderer
        .clustering()
        .cull_reference(ctx.renderer.camera(), &crowd, None);

    let expected: Vec<u32> = (0..MAX_LIGHTS_PER_CLUSTER).collect();
    let full = result
        .slots()
        .iter()
        .filter(|slot| slot.counter == MAX_LIGHTS_PER_CLUSTER)
        .count();
    assert!(full > 0);
    for slot in result.slots().iter().filter(|slot| slot.counter > 0) {
        assert_eq!(slot.lights(), expected.as_slice());
    }
}

// ============================================================================
// GPU Tests
// ============================================================================

#[rstest]
#[case::dummy_tile(Backend::Dummy, CullingMode::Tile)]
#[case::dummy_triangle(Backend::Dummy, CullingMode::Triangle)]
#[case::webgpu_tile(Backend::WebGpu, CullingMode::Tile)]
#[case::webgpu_triangle(Backend::WebGpu, CullingMode::Triangle)]
fn test_empty_scene_culls_every_light(#[case] backend: Backend, #[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(backend, mode) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    ctx.renderer.set_camera(test_camera());
    ctx.renderer.replace_lights(ground_lights());
    ctx.renderer.frame().unwrap();

    let slots = ctx.renderer.clustering().read_slots().unwrap();
    let expected = ctx.renderer.clustering().cull_reference(
        ctx.renderer.camera(),
        ctx.renderer.lights().lights(),
        Some(&DepthImage::new(WIDTH, HEIGHT, 1.0)),
    );
    assert_eq!(slots.len(), expected.len());
    assert_eq!(slots.total_assignments(), 0);
    assert_eq!(expected.total_assignments(), 0);
}

#[rstest]
#[case::webgpu_tile(Backend::WebGpu, CullingMode::Tile)]
#[case::webgpu_triangle(Backend::WebGpu, CullingMode::Triangle)]
fn test_gpu_culling_matches_reference(#[case] backend: Backend, #[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(backend, mode) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let half_size = 20.0;
    ctx.renderer.set_camera(test_camera());
    ctx.renderer.replace_lights(ground_lights());
    ctx.renderer.switch_scene(GroundScene { half_size }).unwrap();
    ctx.renderer.wait_for_scene().unwrap();
    ctx.renderer.frame().unwrap();

    let camera = ctx.renderer.camera().clone();
    let lights = ctx.renderer.lights().lights().to_vec();
    let gpu = ctx.renderer.clustering().read_slots().unwrap();
    let depth = ground_depth(&camera, half_size, WIDTH, HEIGHT);
    let cpu = ctx
        .renderer
        .clustering()
        .cull_reference(&camera, &lights, Some(&depth));

    assert_eq!(gpu.len(), cpu.len());
    assert_well_formed(&gpu, lights.len() as u32);
    assert!(cpu.total_assignments() > 0);

    // Rasterization and float order may flip a light sitting exactly on a
    // cell boundary; anything beyond that is a real disagreement.
    let mismatched = (0..cpu.len())
        .filter(|&index| gpu.lights(index) != cpu.lights(index))
        .count();
    assert!(
        mismatched * 50 <= cpu.len(),
        "{mismatched} of {} slots disagree",
        cpu.len()
    );
}

#[rstest]
#[case::webgpu_tile(Backend::WebGpu, CullingMode::Tile)]
#[case::webgpu_triangle(Backend::WebGpu, CullingMode::Triangle)]
fn test_repeated_culling_is_bit_identical(#[case] backend: Backend, #[case] mode: CullingMode) {
    let Some(mut ctx) = TestContext::new(backend, mode) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    ctx.renderer.set_camera(test_camera());
    ctx.renderer.replace_lights(ground_lights());
    ctx.renderer.switch_scene(GroundScene { half_size: 20.0 }).unwrap();
    ctx.renderer.wait_for_scene().unwrap();

    ctx.renderer.frame().unwrap();
    let first = ctx.renderer.clustering().read_slots().unwrap();
    ctx.renderer.frame().unwrap();
    let second = ctx.renderer.clustering().read_slots().unwrap();

    assert!(first.total_assignments() > 0);
    assert_eq!(first.as_bytes(), second.as_bytes());
}
