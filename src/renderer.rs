//! Frame orchestration
//!
//! [`Renderer`] owns every subsystem and drives one frame as two calls:
//!
//! - [`Renderer::update`] applies CPU-side changes: resize, light edits,
//!   finished scene loads, the camera uniform and committed promotions.
//! - [`Renderer::render`] records and submits the frame. Depth pre-pass and
//!   G-buffer fill go to the graphics queue, light culling is recorded on its
//!   own worker thread and submitted to the compute queue, and the
//!   accumulation list waits for the culling edge before it reads the light
//!   lists. With GPU timings enabled, both passes write timestamps that are
//!   read back once the frame is submitted.

use crate::backend::{
    CommandList, DepthPrepassDone, GpuContext, GraphicsBackend, LightCullDone, QueueKind,
    SubmitInfo, SyncEdge,
};
use crate::clustering::LightClusteringEngine;
use crate::config::RendererConfig;
use crate::error::{DeviceLossReason, RendererError, RendererResult};
use crate::frame::{DeferredRelease, FrameCapture, FrameManager};
use crate::jobs::{JobHandle, JobSystem};
use crate::pipeline::DeferredPipeline;
use crate::profiler::{GpuProfiler, GpuTimings, TimedPass};
use crate::resources::{
    CopyReceipt, MaterialLibrary, PromotionManager, ResourceGeneration, ShaderLibrary,
    StandardMaterial,
};
use crate::scene::{Camera, LightStore, PointLight, SceneData, SceneGeometry, SceneProvider};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Weight of the newest sample in the frame timing averages
const STATS_SMOOTHING: f64 = 0.1;

/// Where the current scene switch stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneStatus {
    Empty,
    Loading(String),
    Ready(String),
    /// The load failed; the previous scene, if any, is still drawn.
    Failed { name: String, message: String },
}

impl std::fmt::Display for SceneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneStatus::Empty => f.write_str("no scene"),
            SceneStatus::Loading(name) => write!(f, "loading '{name}'"),
            SceneStatus::Ready(name) => write!(f, "'{name}'"),
            SceneStatus::Failed { name, message } => write!(f, "'{name}' failed: {message}"),
        }
    }
}

/// Smoothed frame timings in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub frames: u64,
    /// Recording and submitting the culling dispatch
    pub cull_issue_ms: f64,
    /// Recording the G-buffer and accumulation lists
    pub light_pass_ms: f64,
    /// Whole `render` call
    pub frame_ms: f64,
    /// GPU time of the culling dispatch, when timestamps are available
    pub gpu_cull_ms: Option<f64>,
    /// GPU time of the accumulation pass, when timestamps are available
    pub gpu_light_ms: Option<f64>,
}

impl FrameStats {
    fn record(&mut self, cull: Duration, light: Duration, frame: Duration) {
        let first = self.frames == 0;
        let blend = |average: &mut f64, sample: Duration| {
            let ms = sample.as_secs_f64() * 1000.0;
            *average = if first {
                ms
            } else {
                *average + (ms - *average) * STATS_SMOOTHING
            };
        };
        blend(&mut self.cull_issue_ms, cull);
        blend(&mut self.light_pass_ms, light);
        blend(&mut self.frame_ms, frame);
        self.frames += 1;
    }

    fn record_gpu(&mut self, timings: GpuTimings) {
        let blend = |average: Option<f64>, sample: Option<f64>| match (average, sample) {
            (Some(average), Some(ms)) => Some(average + (ms - average) * STATS_SMOOTHING),
            (_, sample) => sample,
        };
        self.gpu_cull_ms = blend(self.gpu_cull_ms, timings.cull_ms);
        self.gpu_light_ms = blend(self.gpu_light_ms, timings.light_ms);
    }
}

type CopyJob = JobHandle<RendererResult<Option<CopyReceipt>>>;

pub struct Renderer {
    ctx: Arc<GpuContext>,
    config: RendererConfig,
    frames: FrameManager,
    /// Scene loads
    jobs: JobSystem,
    /// Light-culling issuance only
    cull_worker: JobSystem,
    copy_worker: JobSystem,
    promotion: Arc<PromotionManager>,
    lights: LightStore,
    clustering: LightClusteringEngine,
    deferred: DeferredPipeline,
    profiler: GpuProfiler,
    materials: MaterialLibrary,
    camera: Camera,
    scene: Option<SceneGeometry>,
    scene_data: Option<Arc<SceneData>>,
    scene_job: Option<JobHandle<RendererResult<SceneData>>>,
    copy_job: Option<CopyJob>,
    depth_edge: SyncEdge<DepthPrepassDone>,
    cull_edge: SyncEdge<LightCullDone>,
    status: SceneStatus,
    stats: FrameStats,
    pending_resize: Option<(u32, u32)>,
}

impl Renderer {
    /// Create every subsystem on `backend`.
    pub fn new(backend: Box<dyn GraphicsBackend>, config: RendererConfig) -> RendererResult<Self> {
        config.validate()?;
        let ctx = GpuContext::new(backend, config.gpu_wait_timeout());
        log::info!(
            "Creating renderer on {} ({}), {}x{}, {:?} culling",
            ctx.backend_name(),
            ctx.adapter_identity(),
            config.width,
            config.height,
            config.culling_mode
        );

        let frames = FrameManager::new(
            ctx.clone(),
            config.frames_in_flight,
            config.width,
            config.height,
        )?;
        let jobs = JobSystem::new(config.worker_threads);
        let cull_worker = JobSystem::named("light-cull", 1);
        let copy_worker = JobSystem::named("promotion-copy", 1);
        let generation = ResourceGeneration::new();
        let promotion = Arc::new(PromotionManager::new(ctx.clone(), generation.clone()));
        let shaders = ShaderLibrary::with_builtins()?;

        let lights = LightStore::new(ctx.clone(), config.max_lights as usize)?;
        let mut clustering = LightClusteringEngine::new(ctx.clone(), &shaders, &config)?;
        clustering.configure(&promotion, config.width, config.height, config.depth_slices)?;
        let mut deferred = DeferredPipeline::new(ctx.clone(), &shaders, &config)?;
        deferred.set_debug_view(config.debug_view);
        let profiler = GpuProfiler::new(ctx.clone(), config.gpu_timings)?;
        deferred.set_accumulate_timestamps(profiler.timestamps(TimedPass::LightAccumulation));

        let mut camera = Camera::default();
        camera.set_aspect(config.width, config.height);

        Ok(Self {
            ctx,
            config,
            frames,
            jobs,
            cull_worker,
            copy_worker,
            promotion,
            lights,
            clustering,
            deferred,
            profiler,
            materials: MaterialLibrary::new(generation),
            camera,
            scene: None,
            scene_data: None,
            scene_job: None,
            copy_job: None,
            depth_edge: SyncEdge::new(),
            cull_edge: SyncEdge::new(),
            status: SceneStatus::Empty,
            stats: FrameStats::default(),
            pending_resize: None,
        })
    }

    /// Apply CPU-side changes for the next frame.
    pub fn update(&mut self) -> RendererResult<()> {
        let result = self.update_inner();
        self.track_loss(result)
    }

    fn update_inner(&mut self) -> RendererResult<()> {
        if let Some((width, height)) = self.pending_resize.take() {
            self.apply_resize(width, height)?;
        }

        if let Some(upload) = self.lights.flush()? {
            log::trace!(
                "{} lights uploaded (generation {})",
                upload.count,
                upload.generation
            );
        }

        self.poll_scene_job(false)?;

        let (width, height) = self.frames.size();
        self.deferred
            .upload_camera(&self.camera.uniform_data(width, height))?;
        self.clustering
            .set_lights(self.lights.buffer(), self.lights.len() as u32)?;
        self.clustering
            .set_camera_buffer(self.deferred.camera_buffer());
        self.clustering
            .set_depth_view(self.deferred.gbuffer().depth_view());
        let planes = self.camera.depth_planes(self.clustering.params().depth_dim);
        self.clustering.set_depth_planes(&planes)?;
        self.clustering.prepare()?;
        self.deferred
            .prepare_accumulation(&self.clustering, self.lights.buffer())?;

        self.finish_copy_job(false)?;
        self.prepare_scene_bundle()?;
        self.start_copy_job()?;
        self.release_retired();
        Ok(())
    }

    /// Record, submit and present one frame.
    pub fn render(&mut self) -> RendererResult<()> {
        let result = self.render_inner();
        self.track_loss(result)
    }

    fn track_loss<T>(&mut self, result: RendererResult<T>) -> RendererResult<T> {
        if let Err(RendererError::DeviceLost(reason)) = &result {
            self.frames.record_device_loss(reason.clone());
        }
        result
    }

    fn render_inner(&mut self) -> RendererResult<()> {
        let started = Instant::now();
        // Fails early when culling was never prepared, before any state moves.
        let dispatch = self.clustering.dispatch_args()?;
        let token = self.frames.begin_frame()?;

        let result = self.record_frame(dispatch, token.back_buffer_view());
        let (cull_job, light_elapsed) = match result {
            Ok(recorded) => recorded,
            Err(err) => {
                self.deferred.reset_frame();
                return Err(err);
            }
        };

        self.frames.present(token)?;

        let cull_elapsed = cull_job.join_timeout(self.ctx.wait_timeout() * 2)??;
        self.release_retired();
        self.stats
            .record(cull_elapsed, light_elapsed, started.elapsed());
        if let Some(timings) = self.profiler.read()? {
            self.stats.record_gpu(timings);
        }
        Ok(())
    }

    /// `update` followed by `render`
    pub fn frame(&mut self) -> RendererResult<()> {
        self.update()?;
        self.render()
    }

    fn record_frame(
        &mut self,
        dispatch: crate::clustering::CullDispatch,
        target: crate::backend::TextureViewHandle,
    ) -> RendererResult<(JobHandle<RendererResult<Duration>>, Duration)> {
        let mut depth = CommandList::new(QueueKind::Graphics, "depth pre-pass");
        self.deferred.record_depth_prepass(&mut depth)?;
        let depth_point = self.depth_edge.issue();
        self.ctx.submit(
            depth,
            SubmitInfo::new().signal(self.depth_edge.signal(depth_point)),
        )?;

        let cull_point = self.cull_edge.issue();
        let info = SubmitInfo::new()
            .wait(self.depth_edge.wait(depth_point))
            .signal(self.cull_edge.signal(cull_point));
        let ctx = self.ctx.clone();
        let timestamps = self.profiler.timestamps(TimedPass::LightCulling);
        let cull_job = self.cull_worker.spawn("light culling", move |_| -> RendererResult<Duration> {
            let started = Instant::now();
            let mut list = CommandList::new(QueueKind::Compute, "light culling");
            dispatch.record_timed(&mut list, timestamps);
            ctx.submit(list, info)?;
            Ok(started.elapsed())
        })?;

        let light_started = Instant::now();
        let mut gbuffer = CommandList::new(QueueKind::Graphics, "G-buffer");
        self.deferred.record_gbuffer(&mut gbuffer)?;
        self.ctx.submit(gbuffer, SubmitInfo::new())?;

        let wait = self.deferred.light_cull_wait(&self.cull_edge, cull_point)?;
        let mut accumulate = CommandList::new(QueueKind::Graphics, "light accumulation");
        self.deferred
            .record_accumulate(&mut accumulate, target, &self.clustering)?;
        self.profiler.record_resolve(&mut accumulate);
        let light_elapsed = light_started.elapsed();
        self.ctx.submit(accumulate, SubmitInfo::new().wait(wait))?;

        Ok((cull_job, light_elapsed))
    }

    /// Resize on the next `update`.
    pub fn resize(&mut self, width: u32, height: u32) -> RendererResult<()> {
        if width == 0 || height == 0 {
            return Err(RendererError::Config(format!(
                "cannot resize to {width}x{height}"
            )));
        }
        if (width, height) != self.frames.size() {
            self.pending_resize = Some((width, height));
        } else {
            self.pending_resize = None;
        }
        Ok(())
    }

    fn apply_resize(&mut self, width: u32, height: u32) -> RendererResult<()> {
        log::info!("Resizing renderer to {}x{}", width, height);
        self.frames.resize(width, height)?;
        // The tile mesh binding is replaced below; nothing may still be copying it.
        self.flush_promotions()?;
        self.clustering
            .configure(&self.promotion, width, height, self.config.depth_slices)?;
        self.deferred.resize(width, height)?;
        self.camera.set_aspect(width, height);
        self.config.width = width;
        self.config.height = height;
        self.release_retired();
        Ok(())
    }

    /// Start loading a scene in the background. A load already in progress is
    /// cancelled; the current scene keeps rendering until the new one is ready.
    pub fn switch_scene<P: SceneProvider>(&mut self, provider: P) -> RendererResult<()> {
        if let Some(previous) = self.scene_job.take() {
            log::info!("Cancelling scene load '{}'", previous.name());
            previous.cancel();
        }
        let name = provider.name().to_string();
        log::info!("Loading scene '{}'", name);
        let job = self
            .jobs
            .spawn(&format!("load scene '{name}'"), move |cancel| {
                provider.load(cancel)
            })?;
        self.scene_job = Some(job);
        self.status = SceneStatus::Loading(name);
        Ok(())
    }

    /// Block until the pending scene load finishes and install it.
    pub fn wait_for_scene(&mut self) -> RendererResult<&SceneStatus> {
        self.poll_scene_job(true)?;
        Ok(&self.status)
    }

    pub fn is_loading(&self) -> bool {
        self.scene_job.is_some()
    }

    fn poll_scene_job(&mut self, block: bool) -> RendererResult<()> {
        let job = match self.scene_job.take() {
            None => return Ok(()),
            Some(job) if !block && !job.is_finished() => {
                self.scene_job = Some(job);
                return Ok(());
            }
            Some(job) => job,
        };

        let name = match &self.status {
            SceneStatus::Loading(name) => name.clone(),
            _ => job.name().to_string(),
        };
        let loaded = match job.join() {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        };
        match loaded {
            Ok(data) => self.install_scene(data),
            Err(err) if err.is_device_lost() => Err(err),
            Err(err) => {
                log::error!("Scene '{}' failed to load: {}", name, err);
                self.status = SceneStatus::Failed {
                    name,
                    message: err.to_string(),
                };
                Ok(())
            }
        }
    }

    fn install_scene(&mut self, mut data: SceneData) -> RendererResult<()> {
        if data.materials.is_empty() {
            data.materials.push(StandardMaterial::default());
        }
        if let Err(err) = data.validate() {
            log::error!("Scene '{}' rejected: {}", data.name, err);
            self.status = SceneStatus::Failed {
                name: data.name.clone(),
                message: err.to_string(),
            };
            return Ok(());
        }

        // Old geometry is released below; it must not be mid-promotion.
        self.flush_promotions()?;
        let geometry = SceneGeometry::upload(&self.promotion, &data)?;
        let evicted = self.materials.replace(&self.promotion, &data.materials)?;

        if let Some(old) = self.scene.replace(geometry) {
            for binding in old.bindings() {
                self.frames
                    .defer_release(DeferredRelease::Buffer(binding.buffer()));
            }
        }
        if let Some(evicted) = evicted {
            self.frames
                .defer_release(DeferredRelease::Buffer(evicted.buffer()));
        }

        log::info!(
            "Scene '{}' ready: {} triangles, {} materials",
            data.name,
            data.triangle_count(),
            data.materials.len()
        );
        self.status = SceneStatus::Ready(data.name.clone());
        self.scene_data = Some(Arc::new(data));
        Ok(())
    }

    fn prepare_scene_bundle(&mut self) -> RendererResult<()> {
        if let (Some(scene), Some(materials)) = (&self.scene, self.materials.binding()) {
            let generation = self.promotion.generation().current();
            self.deferred.prepare_scene(scene, materials, generation)?;
        }
        Ok(())
    }

    fn start_copy_job(&mut self) -> RendererResult<()> {
        if self.copy_job.is_some() || self.promotion.pending() == 0 {
            return Ok(());
        }
        let promotion = self.promotion.clone();
        let job = self
            .copy_worker
            .spawn("promotion copy", move |_| promotion.run_copy_cycle())?;
        self.copy_job = Some(job);
        Ok(())
    }

    /// Commit the running copy cycle once it finished; with `block`, wait for it.
    fn finish_copy_job(&mut self, block: bool) -> RendererResult<()> {
        let receipt = match self.copy_job.take() {
            None => return Ok(()),
            Some(job) if !block && !job.is_finished() => {
                self.copy_job = Some(job);
                return Ok(());
            }
            Some(job) => job.join_timeout(self.ctx.wait_timeout() * 2)??,
        };
        if let Some(receipt) = receipt {
            self.commit(receipt)?;
        }
        Ok(())
    }

    fn commit(&mut self, receipt: CopyReceipt) -> RendererResult<()> {
        let summary = self.promotion.commit_bindings(receipt)?;
        for buffer in summary.retired {
            self.frames.defer_release(DeferredRelease::Buffer(buffer));
        }
        Ok(())
    }

    /// Promote everything queued so far before returning.
    fn flush_promotions(&mut self) -> RendererResult<()> {
        self.finish_copy_job(true)?;
        if let Some(receipt) = self.promotion.run_copy_cycle()? {
            self.commit(receipt)?;
        }
        Ok(())
    }

    fn release_retired(&mut self) {
        let retired = self
            .clustering
            .take_retired()
            .into_iter()
            .chain(self.deferred.take_retired());
        for resource in retired {
            self.frames.defer_release(resource);
        }
    }

    /// Add a light; false when the store is full.
    pub fn add_light(&mut self, light: PointLight) -> bool {
        self.lights.add(light)
    }

    pub fn remove_light(&mut self, index: usize) -> Option<PointLight> {
        self.lights.remove(index)
    }

    pub fn replace_lights(&mut self, lights: impl IntoIterator<Item = PointLight>) {
        self.lights.replace_all(lights);
    }

    pub fn lights(&self) -> &LightStore {
        &self.lights
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
        let (width, height) = self.frames.size();
        self.camera.set_aspect(width, height);
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Show per-pixel light counts instead of shading.
    pub fn set_debug_view(&mut self, enabled: bool) {
        self.deferred.set_debug_view(enabled);
        self.config.debug_view = enabled;
    }

    /// Draw a sphere at every light in its color.
    pub fn set_light_preview(&mut self, enabled: bool) {
        self.deferred.set_light_preview(enabled);
        self.config.light_preview = enabled;
    }

    pub fn set_ambient(&mut self, ambient: f32) -> RendererResult<()> {
        if !(ambient.is_finite() && ambient >= 0.0) {
            return Err(RendererError::Config(format!("invalid ambient {ambient}")));
        }
        self.deferred.set_ambient(ambient)?;
        self.config.ambient = ambient;
        Ok(())
    }

    /// Replace every GPU object with ones created on `backend`.
    ///
    /// Lights, camera, view toggles and the last loaded scene carry over. The old
    /// device's objects are abandoned without waiting for it.
    pub fn recover(&mut self, backend: Box<dyn GraphicsBackend>) -> RendererResult<()> {
        if let Some(reason) = self.frames.device_loss() {
            log::warn!("Recovering from device loss: {}", reason);
        } else {
            log::info!("Recreating renderer on a new device");
        }
        if let Some(job) = self.scene_job.take() {
            job.cancel();
        }

        let mut fresh = Renderer::new(backend, self.config.clone())?;
        fresh.replace_lights(self.lights.iter().copied());
        fresh.camera = self.camera.clone();
        if let Some(data) = &self.scene_data {
            fresh.install_scene(SceneData::clone(data))?;
        }
        *self = fresh;
        Ok(())
    }

    /// Wait for the GPU and destroy everything.
    pub fn shutdown(mut self) -> RendererResult<()> {
        if let Some(job) = self.scene_job.take() {
            job.cancel();
        }
        if self.frames.is_device_removed() {
            log::warn!("Shutting down after device loss; GPU objects are abandoned");
            return Ok(());
        }

        self.finish_copy_job(true)?;
        self.release_retired();
        self.frames.wait_idle()?;

        self.clustering.destroy();
        self.deferred.destroy();
        self.profiler.destroy();
        self.lights.destroy();
        let mut buffers = Vec::new();
        if let Some(scene) = self.scene.take() {
            buffers.extend(scene.bindings().map(|binding| binding.buffer()));
        }
        buffers.extend(self.materials.binding().map(|binding| binding.buffer()));
        buffers.extend(self.materials.previous().map(|binding| binding.buffer()));
        let mut backend = self.ctx.backend();
        for buffer in buffers {
            backend.destroy_buffer(buffer);
        }
        log::info!("Renderer shut down after {} frames", self.frames.frame_count());
        Ok(())
    }

    /// Pixels of the last presented frame, once the GPU has finished it
    pub fn capture_frame(&mut self) -> RendererResult<Option<FrameCapture>> {
        let result = self.frames.capture_last_frame();
        self.track_loss(result)
    }

    /// One-line status for overlays and logs
    pub fn info_text(&self) -> String {
        let (width, height) = self.frames.size();
        let params = self.clustering.params();
        let gpu = |ms: Option<f64>| match ms {
            Some(ms) => format!(" (GPU {ms:.2} ms)"),
            None => String::new(),
        };
        let mut text = format!(
            "{} | {} lights | {:?} culling, {}x{} tiles of {:.0}x{:.0} px at {}x{} | cull {:.2} ms{} | lights {:.2} ms{} | frame {:.2} ms",
            self.status,
            self.lights.len(),
            self.clustering.mode(),
            params.width_dim,
            params.height_dim,
            params.tile_size_x,
            params.tile_size_y,
            width,
            height,
            self.stats.cull_issue_ms,
            gpu(self.stats.gpu_cull_ms),
            self.stats.light_pass_ms,
            gpu(self.stats.gpu_light_ms),
            self.stats.frame_ms,
        );
        if self.deferred.debug_view() {
            text.push_str(" | light count view");
        } else if self.deferred.light_preview() {
            text.push_str(" | light preview");
        }
        text
    }

    pub fn status(&self) -> &SceneStatus {
        &self.status
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    pub fn frames(&self) -> &FrameManager {
        &self.frames
    }

    pub fn promotion(&self) -> &PromotionManager {
        &self.promotion
    }

    pub fn clustering(&self) -> &LightClusteringEngine {
        &self.clustering
    }

    pub fn deferred(&self) -> &DeferredPipeline {
        &self.deferred
    }

    pub fn profiler(&self) -> &GpuProfiler {
        &self.profiler
    }

    pub fn materials(&self) -> &MaterialLibrary {
        &self.materials
    }

    pub fn scene(&self) -> Option<&SceneGeometry> {
        self.scene.as_ref()
    }

    pub fn size(&self) -> (u32, u32) {
        self.frames.size()
    }

    pub fn is_device_lost(&self) -> bool {
        self.frames.is_device_removed()
    }

    pub fn device_loss(&self) -> Option<&DeviceLossReason> {
        self.frames.device_loss()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // The job system joins its workers on drop; a load must not keep it waiting.
        if let Some(job) = self.scene_job.take() {
            job.cancel();
        }
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.ctx.backend_name())
            .field("size", &self.frames.size())
            .field("status", &self.status)
            .field("lights", &self.lights.len())
            .field("deferred", &self.deferred)
            .finish()
    }
}
