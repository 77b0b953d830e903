//! Renderer configuration
//!
//! Loaded from a TOML file or built in code. Every field has a default, so a
//! config file only needs the values it changes:
//!
//! ```toml
//! culling_mode = "tile"
//! tile_size = 16
//!
//! [capacity]
//! triangle = 2
//! ```

use crate::clustering::layout::MAX_LIGHTS;
use crate::error::{RendererError, RendererResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Granularity of the light culling grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CullingMode {
    /// One cell per screen tile, lights looked up per pixel.
    Tile,
    /// Two triangle cells per screen tile, lights fetched per primitive.
    #[default]
    Triangle,
}

impl CullingMode {
    /// Number of cells the culling kernel emits for one tile.
    pub fn cells_per_tile(&self) -> u32 {
        match self {
            CullingMode::Tile => 1,
            CullingMode::Triangle => 2,
        }
    }
}

/// Light index slots reserved per tile, for each culling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub tile: u32,
    pub triangle: u32,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            tile: 1,
            triangle: 2,
        }
    }
}

impl CapacityConfig {
    pub fn slots_per_tile(&self, mode: CullingMode) -> u32 {
        match mode {
            CullingMode::Tile => self.tile,
            CullingMode::Triangle => self.triangle,
        }
    }
}

/// Configuration for initializing the renderer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Initial viewport width
    pub width: u32,
    /// Initial viewport height
    pub height: u32,
    /// Frames the CPU may record ahead of the GPU
    pub frames_in_flight: usize,
    pub culling_mode: CullingMode,
    /// Requested tile edge in pixels; the actual size is rounded to fit the viewport
    pub tile_size: u32,
    /// Maximum number of lights in the light store
    pub max_lights: u32,
    /// Depth slices of the culling grid
    pub depth_slices: u32,
    pub capacity: CapacityConfig,
    /// Bound for every GPU wait; expiry is treated as device loss
    pub gpu_wait_timeout_ms: u64,
    /// Scene load workers. Light culling and promotion copies have their own threads.
    pub worker_threads: usize,
    /// Weight of the unlit base color under the light contributions. At 1.0 a
    /// pixel no light reaches shows its G-buffer base color.
    pub ambient: f32,
    /// G-buffer clear color
    pub clear_color: [f32; 4],
    /// Start with the light count visualization instead of shading
    pub debug_view: bool,
    /// Draw a small sphere at every light in its color
    pub light_preview: bool,
    /// Measure culling and light-pass GPU time where timestamp queries exist.
    /// The readback waits for every frame to finish on the GPU.
    pub gpu_timings: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frames_in_flight: 3,
            culling_mode: CullingMode::Triangle,
            tile_size: 32,
            max_lights: MAX_LIGHTS,
            depth_slices: 1,
            capacity: CapacityConfig::default(),
            gpu_wait_timeout_ms: 2000,
            worker_threads: 2,
            ambient: 1.0,
            clear_color: [0.2, 0.5, 0.7, 1.0],
            debug_view: false,
            light_preview: false,
            gpu_timings: false,
        }
    }
}

impl RendererConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> RendererResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RendererError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> RendererResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RendererError::ConfigLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| RendererError::ConfigLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        log::info!("loaded renderer config from {}", path.display());
        Ok(config)
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_culling_mode(mut self, mode: CullingMode) -> Self {
        self.culling_mode = mode;
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_max_lights(mut self, max_lights: u32) -> Self {
        self.max_lights = max_lights;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_gpu_wait_timeout(mut self, timeout: Duration) -> Self {
        self.gpu_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_debug_view(mut self, enabled: bool) -> Self {
        self.debug_view = enabled;
        self
    }

    pub fn with_light_preview(mut self, enabled: bool) -> Self {
        self.light_preview = enabled;
        self
    }

    pub fn with_gpu_timings(mut self, enabled: bool) -> Self {
        self.gpu_timings = enabled;
        self
    }

    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn gpu_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.gpu_wait_timeout_ms)
    }

    /// Light index slots per tile for the configured mode
    pub fn slots_per_tile(&self) -> u32 {
        self.capacity.slots_per_tile(self.culling_mode)
    }

    pub fn validate(&self) -> RendererResult<()> {
        let fail = |message: String| Err(RendererError::Config(message));
        if self.width == 0 || self.height == 0 {
            return fail(format!("viewport {}x{} is empty", self.width, self.height));
        }
        if self.frames_in_flight == 0 {
            return fail("frames_in_flight must be at least 1".into());
        }
        if self.tile_size == 0 {
            return fail("tile_size must be at least 1".into());
        }
        if self.max_lights > MAX_LIGHTS {
            return fail(format!(
                "max_lights {} exceeds the culling kernel limit of {}",
                self.max_lights, MAX_LIGHTS
            ));
        }
        if self.depth_slices == 0 {
            return fail("depth_slices must be at least 1".into());
        }
        let slots = self.slots_per_tile();
        if slots < self.culling_mode.cells_per_tile() {
            return fail(format!(
                "{:?} culling needs {} slots per tile, capacity allows {}",
                self.culling_mode,
                self.culling_mode.cells_per_tile(),
                slots
            ));
        }
        if !(self.ambient.is_finite() && self.ambient >= 0.0) {
            return fail(format!("ambient {} must be a non-negative number", self.ambient));
        }
        if self.gpu_wait_timeout_ms == 0 {
            return fail("gpu_wait_timeout_ms must be positive".into());
        }
        if self.worker_threads == 0 {
            return fail("worker_threads must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RendererConfig::default();
        config.validate().unwrap();
        assert_eq!(config.culling_mode, CullingMode::Triangle);
        assert_eq!(config.tile_size, 32);
        assert_eq!(config.max_lights, 2048);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.slots_per_tile(), 2);
        assert_eq!(config.ambient, 1.0);
        assert!(!config.light_preview);
        assert!(!config.gpu_timings);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = RendererConfig::from_toml_str(
            r#"
            culling_mode = "tile"
            tile_size = 16

            light_preview = true
            gpu_timings = true

            [capacity]
            tile = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.culling_mode, CullingMode::Tile);
        assert_eq!(config.tile_size, 16);
        assert_eq!(config.slots_per_tile(), 3);
        assert_eq!(config.capacity.triangle, 2);
        assert_eq!(config.width, 1280);
        assert!(config.light_preview);
        assert!(config.gpu_timings);
    }

    #[test]
    fn test_rejects_too_many_lights() {
        let config = RendererConfig::default().with_max_lights(4096);
        assert!(matches!(config.validate(), Err(RendererError::Config(_))));
    }

    #[test]
    fn test_rejects_triangle_capacity_below_two() {
        let result = RendererConfig::from_toml_str("[capacity]\ntriangle = 1\n");
        assert!(matches!(result, Err(RendererError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = RendererConfig::load(Path::new("/nonexistent/renderer.toml"));
        assert!(matches!(result, Err(RendererError::ConfigLoad { .. })));
    }
}
