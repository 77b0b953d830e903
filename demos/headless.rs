//! # Headless Demo
//!
//! Demonstrates:
//! - Renderer setup from a TOML config file and command line overrides
//! - Background scene loading with a procedural box field
//! - A grid of point lights culled per tile or per tile triangle
//! - Orbiting camera, periodic statistics and recovery from device loss
//! - Light preview spheres, GPU pass timings and a PPM capture of the last frame
//!
//! ```bash
//! cargo run --example headless -- --frames 300 --mode triangle --lights 512
//! ```

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use glam::Vec3;
use trilight_renderer::scene::grid_lights;
use trilight_renderer::{
    Camera, CullingMode, DummyBackend, GraphicsBackend, ProceduralScene, Renderer, RendererConfig,
    WgpuBackend, MAX_LIGHTS,
};

/// Graphics backend selection for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum CliBackend {
    /// wgpu when an adapter is found, dummy otherwise.
    #[default]
    Auto,
    /// wgpu on the default high performance adapter.
    Wgpu,
    /// No-op backend for testing and CI environments.
    Dummy,
}

/// Light culling granularity for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliMode {
    /// One light list per screen tile.
    Tile,
    /// Two light lists per tile, split along the diagonal.
    Triangle,
}

impl From<CliMode> for CullingMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Tile => CullingMode::Tile,
            CliMode::Triangle => CullingMode::Triangle,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "headless", about = "Render a lit box field without a window")]
struct Args {
    /// Graphics backend.
    #[arg(long, value_enum, default_value_t = CliBackend::Auto)]
    backend: CliBackend,

    /// TOML renderer config; command line options override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Light culling mode.
    #[arg(long, value_enum)]
    mode: Option<CliMode>,

    /// Viewport width.
    #[arg(long)]
    width: Option<u32>,

    /// Viewport height.
    #[arg(long)]
    height: Option<u32>,

    /// Number of point lights.
    #[arg(long, default_value_t = 256)]
    lights: u32,

    /// Frames to render before exiting.
    #[arg(long, default_value_t = 240)]
    frames: u64,

    /// Boxes per side of the procedural scene.
    #[arg(long, default_value_t = 8)]
    grid: u32,

    /// Show per-pixel light counts.
    #[arg(long)]
    debug_view: bool,

    /// Draw a sphere at every light.
    #[arg(long)]
    light_preview: bool,

    /// Report culling and light-pass GPU time when the adapter has timestamps.
    #[arg(long)]
    gpu_timings: bool,

    /// Write the last frame to this PPM file.
    #[arg(long)]
    capture: Option<PathBuf>,
}

fn create_backend(choice: CliBackend) -> Result<Box<dyn GraphicsBackend>, Box<dyn Error>> {
    match choice {
        CliBackend::Dummy => Ok(Box::new(DummyBackend::new())),
        CliBackend::Wgpu => Ok(Box::new(WgpuBackend::new()?)),
        CliBackend::Auto => match WgpuBackend::new() {
            Ok(backend) => Ok(Box::new(backend)),
            Err(err) => {
                log::warn!("wgpu unavailable ({}), falling back to the dummy backend", err);
                Ok(Box::new(DummyBackend::new()))
            }
        },
    }
}

fn load_config(args: &Args) -> Result<RendererConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => RendererConfig::load(path)?,
        None => RendererConfig::default(),
    };
    if let Some(mode) = args.mode {
        config = config.with_culling_mode(mode.into());
    }
    let width = args.width.unwrap_or(config.width);
    let height = args.height.unwrap_or(config.height);
    let debug_view = args.debug_view || config.debug_view;
    let light_preview = args.light_preview || config.light_preview;
    let gpu_timings = args.gpu_timings || config.gpu_timings;
    Ok(config
        .with_size(width, height)
        .with_debug_view(debug_view)
        .with_light_preview(light_preview)
        .with_gpu_timings(gpu_timings))
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = load_config(&args)?;
    let mut renderer = Renderer::new(create_backend(args.backend)?, config)?;

    let per_side = ((args.lights.min(MAX_LIGHTS) as f32).sqrt().ceil() as u32).max(1);
    let extent = args.grid as f32 * 2.0;
    let lights = grid_lights(
        per_side,
        1,
        per_side,
        Vec3::new(-extent, 1.0, -extent),
        Vec3::new(extent, 1.0, extent),
        3.0,
    );
    renderer.replace_lights(lights.into_iter().take(args.lights as usize));
    renderer.set_camera(Camera::new(Vec3::new(0.0, 10.0, extent * 1.5), Vec3::ZERO));
    renderer.switch_scene(ProceduralScene::new("box field", args.grid, 4.0))?;

    let mut frame = 0;
    while frame < args.frames {
        let angle = frame as f32 * 0.01;
        renderer.camera_mut().orbit(angle, extent * 1.5, 10.0);

        match renderer.frame() {
            Ok(()) => frame += 1,
            Err(err) if err.is_device_lost() => {
                log::error!("{}; recreating the renderer", err);
                renderer.recover(create_backend(args.backend)?)?;
                continue;
            }
            Err(err) => return Err(err.into()),
        }

        if frame % 60 == 0 {
            log::info!("frame {}: {}", frame, renderer.info_text());
        }
    }

    log::info!("{}", renderer.info_text());
    if let Some(path) = &args.capture {
        match renderer.capture_frame()? {
            Some(capture) => {
                capture.write_ppm(std::io::BufWriter::new(std::fs::File::create(path)?))?;
                log::info!(
                    "Wrote {}x{} capture to {}",
                    capture.width,
                    capture.height,
                    path.display()
                );
            }
            None => log::warn!("No frame was presented; nothing to capture"),
        }
    }
    renderer.shutdown()?;
    Ok(())
}
