//! Common utilities for renderer integration tests.
//!
//! Shared backend selection and scene helpers so the same test body can run
//! against the recording dummy backend and a real wgpu device.

use std::time::Duration;

use glam::Vec3;
use trilight_renderer::backend::DummyGpu;
use trilight_renderer::scene::grid_lights;
use trilight_renderer::{
    Camera, CullingMode, DummyBackend, GraphicsBackend, PointLight, Renderer, RendererConfig,
    WgpuBackend,
};

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Available GPU backends for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Dummy backend (records commands, no GPU).
    Dummy,
    /// wgpu on whatever adapter the host provides.
    WebGpu,
}

impl Backend {
    /// Create the backend, `None` when no adapter is available.
    pub fn create(self) -> Option<(Box<dyn GraphicsBackend>, Option<DummyGpu>)> {
        match self {
            Backend::Dummy => {
                let backend = DummyBackend::new();
                let gpu = backend.gpu();
                Some((Box::new(backend), Some(gpu)))
            }
            Backend::WebGpu => match WgpuBackend::new() {
                Ok(backend) => Some((Box::new(backend), None)),
                Err(err) => {
                    eprintln!("wgpu unavailable: {err}");
                    None
                }
            },
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 192;

/// A renderer plus the dummy backend's inspection handle, if any.
pub struct TestContext {
    pub renderer: Renderer,
    pub gpu: Option<DummyGpu>,
}

impl TestContext {
    /// Build a renderer for `backend`, `None` when the backend is unavailable.
    pub fn new(backend: Backend, mode: CullingMode) -> Option<Self> {
        Self::with_config(backend, config(mode))
    }

    pub fn with_config(backend: Backend, config: RendererConfig) -> Option<Self> {
        let (backend, gpu) = backend.create()?;
        match Renderer::new(backend, config) {
            Ok(renderer) => Some(Self { renderer, gpu }),
            Err(err) if gpu.is_some() => panic!("renderer creation failed: {err}"),
            Err(err) => {
                eprintln!("Renderer could not be created ({}), skipping", err);
                None
            }
        }
    }

    /// Hazards recorded by the dummy backend; always empty on real devices.
    pub fn hazards(&self) -> Vec<String> {
        self.gpu.as_ref().map(|gpu| gpu.hazards()).unwrap_or_default()
    }
}

pub fn config(mode: CullingMode) -> RendererConfig {
    RendererConfig::default()
        .with_size(WIDTH, HEIGHT)
        .with_culling_mode(mode)
        .with_gpu_wait_timeout(Duration::from_secs(10))
}

// ============================================================================
// Scene Helpers
// ============================================================================

/// 32 lights spread over the procedural box field.
pub fn test_lights() -> Vec<PointLight> {
    grid_lights(
        8,
        1,
        4,
        Vec3::new(-10.0, 1.0, -10.0),
        Vec3::new(10.0, 1.0, 10.0),
        4.0,
    )
}

/// Camera looking down at the scene origin.
pub fn test_camera() -> Camera {
    Camera::new(Vec3::new(0.0, 12.0, 18.0), Vec3::ZERO)
}
