//! Light clustering
//!
//! Splits the viewport into a grid of tiles (optionally sliced in depth) and
//! computes, for every cell, the list of lights whose sphere of influence
//! intersects it. A cell is a whole tile in [`CullingMode::Tile`] and one of
//! the two triangles of a tile in [`CullingMode::Triangle`].
//!
//! The result lives in the slot buffer, one [`LightIndexSlot`] per cell at
//! `tile_index * slots_per_tile + cell`. The accumulation pass reads the same
//! buffer after the culling submission signals its edge.

pub mod layout;
pub mod reference;
pub mod shaders;
pub mod tile_mesh;

pub use layout::{
    grid_for_viewport, ClusterParams, LightIndexBuffer, LightIndexSlot, SlotCapacityPolicy,
    CLUSTER_PARAMS_BUFFER_SIZE, LIGHT_MASK_WORDS, MAX_LIGHTS, MAX_LIGHTS_PER_CLUSTER,
};
pub use reference::{cull_lights, CellVolume, CullInputs, DepthImage};
pub use tile_mesh::{TileMesh, TileVertex};

use crate::backend::{
    BindGroupEntry, BindGroupHandle, BindGroupLayoutEntry, BindGroupLayoutHandle, BindingType,
    BufferDescriptor, BufferHandle, BufferUsage, CommandList, ComputePipelineDescriptor,
    ComputePipelineHandle, GpuContext, PassTimestamps, ShaderStageFlags, TextureSampleType, TextureViewHandle,
};
use crate::config::{CullingMode, RendererConfig};
use crate::error::{RendererError, RendererResult};
use crate::frame::DeferredRelease;
use crate::resources::{BindingSlot, PromotionManager, PromotionTarget, ShaderLibrary};
use crate::scene::{Camera, PointLight};
use std::sync::Arc;

/// Everything needed to record one culling dispatch.
///
/// Plain handles, so it can be moved to the job that issues the culling
/// submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullDispatch {
    pub pipeline: ComputePipelineHandle,
    pub bind_group: BindGroupHandle,
    /// Workgroups: one per tile and depth slice
    pub groups: (u32, u32, u32),
}

impl CullDispatch {
    pub fn record(&self, list: &mut CommandList) {
        self.record_timed(list, None);
    }

    /// Record the dispatch in a pass that writes `timestamps`.
    pub fn record_timed(&self, list: &mut CommandList, timestamps: Option<PassTimestamps>) {
        let (x, y, z) = self.groups;
        list.begin_timed_compute_pass(Some("Light Culling"), timestamps);
        list.set_compute_pipeline(self.pipeline);
        list.set_bind_group(0, self.bind_group);
        list.dispatch(x, y, z);
        list.end_compute_pass();
    }
}

/// Owner of the culling grid, its GPU buffers and the culling pipeline.
pub struct LightClusteringEngine {
    ctx: Arc<GpuContext>,
    policy: SlotCapacityPolicy,
    tile_size: u32,
    params: ClusterParams,
    depth_planes: Vec<f32>,
    params_buffer: BufferHandle,
    planes_buffer: Option<BufferHandle>,
    slot_buffer: Option<BufferHandle>,
    tile_mesh: TileMesh,
    tile_mesh_binding: Option<BindingSlot>,
    layout: BindGroupLayoutHandle,
    pipeline: ComputePipelineHandle,
    bind_group: Option<BindGroupHandle>,
    light_buffer: Option<BufferHandle>,
    camera_buffer: Option<BufferHandle>,
    depth_view: Option<TextureViewHandle>,
    dirty: bool,
    retired: Vec<DeferredRelease>,
}

impl LightClusteringEngine {
    pub fn new(
        ctx: Arc<GpuContext>,
        shaders: &ShaderLibrary,
        config: &RendererConfig,
    ) -> RendererResult<Self> {
        let policy = SlotCapacityPolicy::new(config.culling_mode, &config.capacity);
        let entry_point = match policy.mode() {
            CullingMode::Tile => shaders::TILE_ENTRY,
            CullingMode::Triangle => shaders::TRIANGLE_ENTRY,
        };
        let source = shaders.source("light_culling")?;

        let (params_buffer, layout, pipeline) = {
            let mut backend = ctx.backend();
            let params_buffer = backend.create_buffer(&BufferDescriptor::new(
                "cluster params",
                CLUSTER_PARAMS_BUFFER_SIZE,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            ))?;

            let storage = |binding, read_only| BindGroupLayoutEntry {
                binding,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only },
            };
            let uniform = |binding| BindGroupLayoutEntry {
                binding,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::UniformBuffer,
            };
            let layout = backend.create_bind_group_layout(&[
                uniform(0),
                uniform(1),
                storage(2, true),
                storage(3, true),
                BindGroupLayoutEntry {
                    binding: 4,
                    visibility: ShaderStageFlags::COMPUTE,
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Depth,
                    },
                },
                storage(5, false),
            ])?;

            let pipeline = backend.create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(format!("Light Culling ({:?})", policy.mode())),
                shader: source.to_string(),
                entry_point: entry_point.to_string(),
                bind_group_layouts: vec![layout],
                constants: vec![("SLOT_STRIDE".to_string(), policy.slots_per_tile() as f64)],
            })?;
            (params_buffer, layout, pipeline)
        };

        log::debug!(
            "light clustering engine created: {:?} mode, {} slots per tile",
            policy.mode(),
            policy.slots_per_tile()
        );

        Ok(Self {
            ctx,
            policy,
            tile_size: config.tile_size,
            params: ClusterParams::default(),
            depth_planes: vec![0.0, 1.0],
            params_buffer,
            planes_buffer: None,
            slot_buffer: None,
            tile_mesh: TileMesh::new(1, 1),
            tile_mesh_binding: None,
            layout,
            pipeline,
            bind_group: None,
            light_buffer: None,
            camera_buffer: None,
            depth_view: None,
            dirty: true,
            retired: Vec::new(),
        })
    }

    /// Size the grid for a viewport and reallocate everything that depends on it.
    ///
    /// The tile mesh is uploaded through `promotion`. Replaced buffers are
    /// parked in [`take_retired`](Self::take_retired).
    pub fn configure(
        &mut self,
        promotion: &PromotionManager,
        viewport_width: u32,
        viewport_height: u32,
        depth_slices: u32,
    ) -> RendererResult<()> {
        if viewport_width == 0 || viewport_height == 0 {
            return Err(RendererError::Config(format!(
                "cannot cluster an empty viewport {viewport_width}x{viewport_height}"
            )));
        }
        let (width_dim, height_dim, tile_size_x, tile_size_y) =
            grid_for_viewport(viewport_width, viewport_height, self.tile_size);
        let depth_dim = depth_slices.max(1);
        self.params = ClusterParams {
            width_dim,
            height_dim,
            light_num: self.params.light_num,
            depth_dim,
            tile_size_x,
            tile_size_y,
        };

        let slot_size = self.policy.slot_count(&self.params) as u64
            * std::mem::size_of::<LightIndexSlot>() as u64;
        let planes_size = (depth_dim as u64 + 1) * std::mem::size_of::<f32>() as u64;
        let (slot_buffer, planes_buffer) = {
            let mut backend = self.ctx.backend();
            let slots = backend.create_buffer(&BufferDescriptor::new(
                "light index slots",
                slot_size,
                BufferUsage::STORAGE | BufferUsage::COPY_SRC,
            ))?;
            let planes = backend.create_buffer(&BufferDescriptor::new(
                "depth planes",
                planes_size,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            ))?;
            (slots, planes)
        };
        if let Some(old) = self.slot_buffer.replace(slot_buffer) {
            self.retired.push(DeferredRelease::Buffer(old));
        }
        if let Some(old) = self.planes_buffer.replace(planes_buffer) {
            self.retired.push(DeferredRelease::Buffer(old));
        }

        self.depth_planes = (0..=depth_dim)
            .map(|i| i as f32 / depth_dim as f32)
            .collect();
        self.write_planes()?;

        self.tile_mesh = TileMesh::new(width_dim, height_dim);
        let vertices = self.tile_mesh.gpu_vertices(self.policy.slots_per_tile());
        let binding = promotion.upload(
            "tile mesh",
            bytemuck::cast_slice(&vertices),
            PromotionTarget::VertexView,
        )?;
        if let Some(old) = self.tile_mesh_binding.replace(binding) {
            self.retired.push(DeferredRelease::Buffer(old.buffer()));
        }

        self.write_params()?;
        self.dirty = true;

        log::debug!(
            "light grid {}x{}x{} for {}x{} ({:.2}x{:.2} px tiles, {} slots)",
            width_dim,
            height_dim,
            depth_dim,
            viewport_width,
            viewport_height,
            tile_size_x,
            tile_size_y,
            self.policy.slot_count(&self.params)
        );
        Ok(())
    }

    /// Bind the light buffer and set the number of lights to cull.
    pub fn set_lights(&mut self, buffer: BufferHandle, count: u32) -> RendererResult<()> {
        let count = count.min(MAX_LIGHTS);
        if self.light_buffer != Some(buffer) {
            self.light_buffer = Some(buffer);
            self.dirty = true;
        }
        if self.params.light_num != count {
            self.params.light_num = count;
            self.write_params()?;
        }
        Ok(())
    }

    pub fn set_camera_buffer(&mut self, buffer: BufferHandle) {
        if self.camera_buffer != Some(buffer) {
            self.camera_buffer = Some(buffer);
            self.dirty = true;
        }
    }

    /// Depth buffer of the pre-pass, read by the kernel
    pub fn set_depth_view(&mut self, view: TextureViewHandle) {
        if self.depth_view != Some(view) {
            self.depth_view = Some(view);
            self.dirty = true;
        }
    }

    /// Upload the NDC depths bounding the depth slices, near to far.
    pub fn set_depth_planes(&mut self, planes: &[f32]) -> RendererResult<()> {
        let expected = self.params.depth_dim as usize + 1;
        if planes.len() != expected {
            return Err(RendererError::Config(format!(
                "{} depth planes for {} slices, expected {}",
                planes.len(),
                self.params.depth_dim,
                expected
            )));
        }
        if planes != self.depth_planes.as_slice() {
            self.depth_planes = planes.to_vec();
            self.write_planes()?;
        }
        Ok(())
    }

    fn write_params(&self) -> RendererResult<()> {
        self.ctx
            .backend()
            .write_buffer(self.params_buffer, 0, bytemuck::bytes_of(&self.params))?;
        Ok(())
    }

    fn write_planes(&self) -> RendererResult<()> {
        if let Some(buffer) = self.planes_buffer {
            self.ctx
                .backend()
                .write_buffer(buffer, 0, bytemuck::cast_slice(&self.depth_planes))?;
        }
        Ok(())
    }

    /// Rebuild the bind group if any input changed.
    pub fn prepare(&mut self) -> RendererResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let missing = |what: &str| RendererError::NotReady(format!("light culling {what}"));
        let camera = self.camera_buffer.ok_or_else(|| missing("camera buffer"))?;
        let lights = self.light_buffer.ok_or_else(|| missing("light buffer"))?;
        let planes = self.planes_buffer.ok_or_else(|| missing("depth planes"))?;
        let depth = self.depth_view.ok_or_else(|| missing("depth view"))?;
        let slots = self.slot_buffer.ok_or_else(|| missing("slot buffer"))?;

        let bind_group = self.ctx.backend().create_bind_group(
            self.layout,
            &[
                (0, BindGroupEntry::whole(self.params_buffer)),
                (1, BindGroupEntry::whole(camera)),
                (2, BindGroupEntry::whole(lights)),
                (3, BindGroupEntry::whole(planes)),
                (4, BindGroupEntry::Texture(depth)),
                (5, BindGroupEntry::whole(slots)),
            ],
        )?;
        if let Some(old) = self.bind_group.replace(bind_group) {
            self.retired.push(DeferredRelease::BindGroup(old));
        }
        self.dirty = false;
        log::trace!("light culling bind group rebuilt");
        Ok(())
    }

    /// Handles for recording a dispatch, once every input is bound.
    pub fn dispatch_args(&self) -> RendererResult<CullDispatch> {
        let bind_group = match (self.dirty, self.bind_group) {
            (false, Some(bind_group)) => bind_group,
            _ => {
                return Err(RendererError::NotReady(
                    "light culling bind group".to_string(),
                ))
            }
        };
        Ok(CullDispatch {
            pipeline: self.pipeline,
            bind_group,
            groups: (
                self.params.width_dim,
                self.params.height_dim,
                self.params.depth_dim,
            ),
        })
    }

    /// Record the culling pass into `list`.
    pub fn dispatch(&self, list: &mut CommandList) -> RendererResult<()> {
        self.dispatch_args()?.record(list);
        Ok(())
    }

    /// Cull on the CPU with the current grid.
    pub fn cull_reference(
        &self,
        camera: &Camera,
        lights: &[PointLight],
        depth: Option<&DepthImage>,
    ) -> LightIndexBuffer {
        let params = ClusterParams {
            light_num: lights.len().min(MAX_LIGHTS as usize) as u32,
            ..self.params
        };
        cull_lights(&CullInputs {
            params,
            policy: self.policy,
            view: camera.view_matrix(),
            inv_proj: camera.projection_matrix().inverse(),
            depth_planes: &self.depth_planes,
            depth,
            lights,
        })
    }

    /// Read the slot buffer back. Blocks until the GPU is done with it.
    pub fn read_slots(&self) -> RendererResult<LightIndexBuffer> {
        let buffer = self
            .slot_buffer
            .ok_or_else(|| RendererError::NotReady("light index slots".to_string()))?;
        let bytes = self.ctx.backend().read_buffer(buffer)?;
        Ok(LightIndexBuffer::from_bytes(&bytes))
    }

    /// Objects replaced since the last call; release them through the frame manager.
    pub fn take_retired(&mut self) -> Vec<DeferredRelease> {
        std::mem::take(&mut self.retired)
    }

    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    pub fn policy(&self) -> &SlotCapacityPolicy {
        &self.policy
    }

    pub fn mode(&self) -> CullingMode {
        self.policy.mode()
    }

    pub fn depth_planes(&self) -> &[f32] {
        &self.depth_planes
    }

    pub fn params_buffer(&self) -> BufferHandle {
        self.params_buffer
    }

    pub fn planes_buffer(&self) -> Option<BufferHandle> {
        self.planes_buffer
    }

    pub fn slot_buffer(&self) -> Option<BufferHandle> {
        self.slot_buffer
    }

    pub fn tile_mesh(&self) -> &TileMesh {
        &self.tile_mesh
    }

    /// Vertex buffer of the expanded tile mesh
    pub fn tile_mesh_binding(&self) -> Option<&BindingSlot> {
        self.tile_mesh_binding.as_ref()
    }

    pub fn tile_vertex_count(&self) -> u32 {
        self.params.width_dim * self.params.height_dim * 6
    }

    /// Destroy every GPU object owned by the engine. The GPU must be idle.
    pub(crate) fn destroy(&mut self) {
        let mut backend = self.ctx.backend();
        for resource in self.retired.drain(..) {
            match resource {
                DeferredRelease::Buffer(buffer) => backend.destroy_buffer(buffer),
                DeferredRelease::BindGroup(group) => backend.destroy_bind_group(group),
                DeferredRelease::Bundle(bundle) => backend.destroy_render_bundle(bundle),
                DeferredRelease::Texture(texture) => backend.destroy_texture(texture),
            }
        }
        if let Some(group) = self.bind_group.take() {
            backend.destroy_bind_group(group);
        }
        for buffer in [self.slot_buffer.take(), self.planes_buffer.take()]
            .into_iter()
            .flatten()
        {
            backend.destroy_buffer(buffer);
        }
        if let Some(binding) = self.tile_mesh_binding.take() {
            backend.destroy_buffer(binding.buffer());
        }
        backend.destroy_buffer(self.params_buffer);
    }
}

impl std::fmt::Debug for LightClusteringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightClusteringEngine")
            .field("mode", &self.policy.mode())
            .field("params", &self.params)
            .field("slot_buffer", &self.slot_buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        Command, DummyBackend, DummyGpu, MemoryLocation, TextureDescriptor, TextureFormat,
    };
    use crate::resources::ResourceGeneration;
    use std::time::Duration;

    struct Fixture {
        ctx: Arc<GpuContext>,
        gpu: DummyGpu,
        promotion: PromotionManager,
        shaders: ShaderLibrary,
    }

    fn fixture() -> Fixture {
        let backend = DummyBackend::new();
        let gpu = backend.gpu();
        let ctx = GpuContext::new(Box::new(backend), Duration::from_secs(5));
        Fixture {
            promotion: PromotionManager::new(ctx.clone(), ResourceGeneration::new()),
            shaders: ShaderLibrary::with_builtins().unwrap(),
            ctx,
            gpu,
        }
    }

    fn bind_inputs(f: &Fixture, engine: &mut LightClusteringEngine) {
        let mut backend = f.ctx.backend();
        let camera = backend
            .create_buffer(&BufferDescriptor::new("camera", 368, BufferUsage::UNIFORM))
            .unwrap();
        let lights = backend
            .create_buffer(&BufferDescriptor::new("lights", 28, BufferUsage::STORAGE))
            .unwrap();
        let depth = backend
            .create_texture(&TextureDescriptor::render_target(
                "depth",
                64,
                64,
                TextureFormat::Depth32Float,
            ))
            .unwrap();
        let view = backend.create_texture_view(depth).unwrap();
        drop(backend);
        engine.set_camera_buffer(camera);
        engine.set_lights(lights, 1).unwrap();
        engine.set_depth_view(view);
    }

    #[test]
    fn test_configure_sizes_grid_and_buffers() {
        let f = fixture();
        let config = RendererConfig::default();
        let mut engine = LightClusteringEngine::new(f.ctx.clone(), &f.shaders, &config).unwrap();
        engine.configure(&f.promotion, 1280, 720, 1).unwrap();

        let params = *engine.params();
        assert_eq!((params.width_dim, params.height_dim, params.depth_dim), (40, 23, 1));
        let slots = engine.read_slots().unwrap();
        assert_eq!(slots.len(), 40 * 23 * 2);
        assert_eq!(engine.tile_vertex_count(), 40 * 23 * 6);

        let mesh = engine.tile_mesh_binding().unwrap().get();
        assert_eq!(mesh.location, MemoryLocation::Upload);
        assert_eq!(mesh.size, 40 * 23 * 6 * 32);
        assert_eq!(f.promotion.pending(), 1);
    }

    #[test]
    fn test_reconfigure_retires_old_buffers() {
        let f = fixture();
        let mut engine =
            LightClusteringEngine::new(f.ctx.clone(), &f.shaders, &RendererConfig::default())
                .unwrap();
        engine.configure(&f.promotion, 640, 480, 1).unwrap();
        let old_slots = engine.slot_buffer().unwrap();
        engine.configure(&f.promotion, 320, 240, 2).unwrap();

        let retired = engine.take_retired();
        assert!(retired.contains(&DeferredRelease::Buffer(old_slots)));
        assert_eq!(retired.len(), 3);
        assert!(f.gpu.is_buffer_alive(old_slots));
        assert!(engine.take_retired().is_empty());
    }

    #[test]
    fn test_dispatch_requires_bound_inputs() {
        let f = fixture();
        let mut engine =
            LightClusteringEngine::new(f.ctx.clone(), &f.shaders, &RendererConfig::default())
                .unwrap();
        engine.configure(&f.promotion, 256, 128, 1).unwrap();
        assert!(matches!(engine.prepare(), Err(RendererError::NotReady(_))));

        let mut list = CommandList::new(crate::backend::QueueKind::Compute, "cull");
        assert!(engine.dispatch(&mut list).is_err());
        assert!(list.is_empty());
    }

    #[test]
    fn test_dispatch_covers_every_tile_and_slice() {
        let f = fixture();
        let config = RendererConfig::default().with_culling_mode(CullingMode::Tile);
        let mut engine = LightClusteringEngine::new(f.ctx.clone(), &f.shaders, &config).unwrap();
        engine.configure(&f.promotion, 256, 128, 3).unwrap();
        bind_inputs(&f, &mut engine);
        engine.prepare().unwrap();

        let mut list = CommandList::new(crate::backend::QueueKind::Compute, "cull");
        engine.dispatch(&mut list).unwrap();
        assert!(list
            .commands()
            .contains(&Command::Dispatch { x: 8, y: 4, z: 3 }));
    }

    #[test]
    fn test_depth_planes_must_match_slices() {
        let f = fixture();
        let mut engine =
            LightClusteringEngine::new(f.ctx.clone(), &f.shaders, &RendererConfig::default())
                .unwrap();
        engine.configure(&f.promotion, 256, 128, 2).unwrap();
        assert!(engine.set_depth_planes(&[0.0, 1.0]).is_err());
        engine.set_depth_planes(&[0.0, 0.9, 1.0]).unwrap();

        let planes = f.gpu.buffer_data(engine.planes_buffer().unwrap()).unwrap();
        let planes: Vec<f32> = bytemuck::pod_collect_to_vec(&planes);
        assert_eq!(planes, vec![0.0, 0.9, 1.0]);
    }

    #[test]
    fn test_params_upload_tracks_light_count() {
        let f = fixture();
        let mut engine =
            LightClusteringEngine::new(f.ctx.clone(), &f.shaders, &RendererConfig::default())
                .unwrap();
        engine.configure(&f.promotion, 64, 64, 1).unwrap();
        bind_inputs(&f, &mut engine);
        engine.set_lights(engine.light_buffer.unwrap(), 17).unwrap();

        let bytes = f.gpu.buffer_data(engine.params_buffer()).unwrap();
        let params: ClusterParams = bytemuck::pod_read_unaligned(&bytes[..24]);
        assert_eq!(params.light_num, 17);
        assert_eq!(params.width_dim, 2);
    }

    #[test]
    fn test_reference_uses_engine_grid() {
        let f = fixture();
        let mut engine =
            LightClusteringEngine::new(f.ctx.clone(), &f.shaders, &RendererConfig::default())
                .unwrap();
        engine.configure(&f.promotion, 128, 128, 1).unwrap();

        let mut camera = Camera::new(glam::Vec3::new(0.0, 0.0, 10.0), glam::Vec3::ZERO);
        camera.set_aspect(128, 128);
        let lights = [PointLight::new(glam::Vec3::ZERO, 0.05, glam::Vec3::ONE)];
        let slots = engine.cull_reference(&camera, &lights, None);
        assert_eq!(slots.len(), 4 * 4 * 2);
        assert!(slots.total_assignments() > 0);
        assert!(slots.total_assignments() <= 8);
    }
}
