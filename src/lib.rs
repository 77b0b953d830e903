//! Trilight Renderer - deferred shading with GPU light culling
//!
//! Point lights are culled per screen tile on the compute queue and
//! accumulated additively over a G-buffer on the graphics queue. Two culling
//! granularities are supported:
//! - **Tile**: one light list per tile and depth slice
//! - **Triangle**: every tile split along its diagonal, one list per half
//!
//! # Features
//! - Backend abstraction with a wgpu implementation and a recording dummy for tests
//! - Typed timeline edges between the graphics, compute and copy queues
//! - Upload-to-device buffer promotion with generation-checked commits
//! - Prerecorded G-buffer bundles rebuilt only when bindings change
//! - Frames in flight with deferred resource release and device loss detection
//! - Background scene loading with cancellation
//! - Light preview spheres and GPU pass timings from timestamp queries

pub mod backend;
pub mod clustering;
pub mod config;
pub mod error;
pub mod frame;
pub mod jobs;
pub mod pipeline;
pub mod profiler;
pub mod renderer;
pub mod resources;
pub mod scene;

pub use backend::{DummyBackend, GpuContext, GraphicsBackend, WgpuBackend};
pub use clustering::{
    LightClusteringEngine, CLUSTER_PARAMS_BUFFER_SIZE, MAX_LIGHTS, MAX_LIGHTS_PER_CLUSTER,
};
pub use config::{CapacityConfig, CullingMode, RendererConfig};
pub use error::{DeviceLossReason, RendererError, RendererResult};
pub use frame::{FrameCapture, FrameManager};
pub use profiler::{GpuProfiler, GpuTimings};
pub use renderer::{FrameStats, Renderer, SceneStatus};
pub use scene::{Camera, PointLight, ProceduralScene, SceneData, SceneProvider};
