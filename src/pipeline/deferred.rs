//! Deferred pipeline: depth pre-pass, G-buffer fill and light accumulation
//!
//! [`DeferredPipeline`] owns the G-buffer, the camera and lighting uniforms,
//! every render pipeline of the frame and the prerecorded G-buffer bundle.
//! Each `record_*` method appends one stage group to a command list and
//! advances the [`StageTracker`](super::StageTracker), so stages can only
//! be recorded in frame order.

use super::bundle::GBufferBundle;
use super::gbuffer::{GBuffer, GBUFFER_DEPTH_FORMAT, GBUFFER_FORMATS};
use super::light_preview::LightPreview;
use super::{FrameStage, StageTracker};
use crate::backend::{
    BindGroupEntry, BindGroupHandle, BindGroupLayoutEntry, BindGroupLayoutHandle, BindingType,
    BlendMode, BufferDescriptor, BufferHandle, BufferUsage, BundleCommand, ColorAttachment,
    ColorTarget, CommandList, DepthAttachment, DepthCompare, DepthState, FenceWait, GpuContext,
    LightCullDone, LoadOp, PassTimestamps, RenderBundleDescriptor, RenderPassDescriptor, RenderPipelineDescriptor,
    RenderPipelineHandle, ResourceState, ShaderStageFlags, StateTransition, StoreOp, SyncEdge,
    SyncPoint, TextureSampleType, TextureViewHandle,
};
use crate::clustering::{LightClusteringEngine, TileVertex};
use crate::config::{CullingMode, RendererConfig};
use crate::error::{RendererError, RendererResult};
use crate::frame::{DeferredRelease, BACK_BUFFER_FORMAT};
use crate::resources::{BindingSlot, ShaderLibrary};
use crate::scene::{CameraUniform, SceneGeometry, SceneVertex};
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

/// Lighting uniform of the accumulation pass
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightingUniform {
    pub ambient: [f32; 4],
}

impl LightingUniform {
    pub fn new(ambient: f32) -> Self {
        Self {
            ambient: [ambient, ambient, ambient, 1.0],
        }
    }
}

/// Everything the accumulation bind group points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AccumulateInputs {
    params: BufferHandle,
    lights: BufferHandle,
    slots: BufferHandle,
    planes: BufferHandle,
    color_views: [TextureViewHandle; 3],
    depth_view: TextureViewHandle,
}

pub struct DeferredPipeline {
    ctx: Arc<GpuContext>,
    mode: CullingMode,
    clear_color: [f32; 4],
    gbuffer: GBuffer,
    camera_buffer: BufferHandle,
    lighting_buffer: BufferHandle,
    material_layout: BindGroupLayoutHandle,
    accumulate_layout: BindGroupLayoutHandle,
    depth_pipeline: RenderPipelineHandle,
    gbuffer_pipeline: RenderPipelineHandle,
    accumulate_pipeline: RenderPipelineHandle,
    debug_pipeline: RenderPipelineHandle,
    camera_bind_group: BindGroupHandle,
    material_bind_group: Option<(BindGroupHandle, BufferHandle)>,
    accumulate_bind_group: Option<(BindGroupHandle, AccumulateInputs)>,
    scene: Option<SceneGeometry>,
    bundle: GBufferBundle,
    stages: StageTracker,
    debug_view: bool,
    preview: LightPreview,
    accumulate_timestamps: Option<PassTimestamps>,
    retired: Vec<DeferredRelease>,
}

impl DeferredPipeline {
    pub fn new(
        ctx: Arc<GpuContext>,
        shaders: &ShaderLibrary,
        config: &RendererConfig,
    ) -> RendererResult<Self> {
        let mode = config.culling_mode;
        let gbuffer = GBuffer::new(&ctx, config.width, config.height)?;
        let accumulate_shader = match mode {
            CullingMode::Tile => shaders.source("accumulate_tile")?,
            CullingMode::Triangle => shaders.source("accumulate_triangle")?,
        };
        let accumulate_vertex_layouts = match mode {
            CullingMode::Tile => Vec::new(),
            CullingMode::Triangle => vec![TileVertex::layout()],
        };
        let slot_stride = config.slots_per_tile() as f64;

        let mut backend = ctx.backend();
        let camera_buffer = backend.create_buffer(&BufferDescriptor::new(
            "camera uniforms",
            std::mem::size_of::<CameraUniform>() as u64,
            BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        ))?;
        let lighting_buffer = backend.create_buffer_init(
            &BufferDescriptor::new(
                "lighting uniforms",
                std::mem::size_of::<LightingUniform>() as u64,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            ),
            bytemuck::bytes_of(&LightingUniform::new(config.ambient)),
        )?;

        let camera_layout = backend.create_bind_group_layout(&[BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::VERTEX_FRAGMENT,
            ty: BindingType::UniformBuffer,
        }])?;
        let material_layout = backend.create_bind_group_layout(&[BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::StorageBuffer { read_only: true },
        }])?;

        let fragment = |binding, ty| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStageFlags::FRAGMENT,
            ty,
        };
        let gbuffer_texture = BindingType::Texture {
            sample_type: TextureSampleType::Float,
        };
        let accumulate_layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
            fragment(1, BindingType::UniformBuffer),
            fragment(2, BindingType::StorageBuffer { read_only: true }),
            fragment(3, BindingType::StorageBuffer { read_only: true }),
            fragment(4, BindingType::StorageBuffer { read_only: true }),
            fragment(5, gbuffer_texture.clone()),
            fragment(6, gbuffer_texture.clone()),
            fragment(7, gbuffer_texture),
            fragment(
                8,
                BindingType::Texture {
                    sample_type: TextureSampleType::Depth,
                },
            ),
            fragment(9, BindingType::UniformBuffer),
        ])?;

        let depth_pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("Depth Pre-Pass".into()),
            shader: shaders.source("depth_prepass")?.to_string(),
            vertex_entry: "vs_main".into(),
            fragment_entry: None,
            vertex_layouts: vec![SceneVertex::layout()],
            bind_group_layouts: vec![camera_layout],
            depth: Some(DepthState {
                format: GBUFFER_DEPTH_FORMAT,
                write: true,
                compare: DepthCompare::Less,
            }),
            color_targets: Vec::new(),
            constants: Vec::new(),
        })?;

        let gbuffer_pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("G-Buffer Fill".into()),
            shader: shaders.source("gbuffer")?.to_string(),
            vertex_entry: "vs_main".into(),
            fragment_entry: Some("fs_main".into()),
            vertex_layouts: vec![SceneVertex::layout()],
            bind_group_layouts: vec![camera_layout, material_layout],
            depth: Some(DepthState {
                format: GBUFFER_DEPTH_FORMAT,
                write: false,
                compare: DepthCompare::LessEqual,
            }),
            color_targets: GBUFFER_FORMATS
                .iter()
                .map(|&format| ColorTarget {
                    format,
                    blend: BlendMode::Replace,
                })
                .collect(),
            constants: Vec::new(),
        })?;

        let accumulate_desc = |label: &str, fragment_entry: &str, blend: BlendMode| {
            RenderPipelineDescriptor {
                label: Some(label.to_string()),
                shader: accumulate_shader.to_string(),
                vertex_entry: "vs_main".into(),
                fragment_entry: Some(fragment_entry.to_string()),
                vertex_layouts: accumulate_vertex_layouts.clone(),
                bind_group_layouts: vec![accumulate_layout],
                depth: None,
                color_targets: vec![ColorTarget {
                    format: BACK_BUFFER_FORMAT,
                    blend,
                }],
                constants: vec![("SLOT_STRIDE".to_string(), slot_stride)],
            }
        };
        let accumulate_pipeline = backend.create_render_pipeline(&accumulate_desc(
            "Light Accumulation",
            "fs_main",
            BlendMode::Additive,
        ))?;
        let debug_pipeline = backend.create_render_pipeline(&accumulate_desc(
            "Light Count Debug",
            "fs_debug",
            BlendMode::Replace,
        ))?;

        let camera_bind_group = backend
            .create_bind_group(camera_layout, &[(0, BindGroupEntry::whole(camera_buffer))])?;
        drop(backend);
        let preview = LightPreview::new(ctx.clone(), shaders, config.light_preview)?;

        log::info!(
            "deferred pipeline created: {:?} accumulation, {}x{} G-buffer",
            mode,
            config.width,
            config.height
        );

        Ok(Self {
            ctx,
            mode,
            clear_color: config.clear_color,
            gbuffer,
            camera_buffer,
            lighting_buffer,
            material_layout,
            accumulate_layout,
            depth_pipeline,
            gbuffer_pipeline,
            accumulate_pipeline,
            debug_pipeline,
            camera_bind_group,
            material_bind_group: None,
            accumulate_bind_group: None,
            scene: None,
            bundle: GBufferBundle::new(),
            stages: StageTracker::new(),
            debug_view: config.debug_view,
            preview,
            accumulate_timestamps: None,
            retired: Vec::new(),
        })
    }

    /// Recreate the G-buffer for a new viewport. Only valid between frames.
    pub fn resize(&mut self, width: u32, height: u32) -> RendererResult<()> {
        if !self.stages.is_idle() {
            return Err(RendererError::Hazard(format!(
                "G-buffer resized during {:?}",
                self.stages.current()
            )));
        }
        let gbuffer = GBuffer::new(&self.ctx, width, height)?;
        let old = std::mem::replace(&mut self.gbuffer, gbuffer);
        self.retired.extend(old.retire());
        Ok(())
    }

    pub fn upload_camera(&self, uniform: &CameraUniform) -> RendererResult<()> {
        self.ctx
            .backend()
            .write_buffer(self.camera_buffer, 0, bytemuck::bytes_of(uniform))?;
        Ok(())
    }

    pub fn set_ambient(&self, ambient: f32) -> RendererResult<()> {
        self.ctx.backend().write_buffer(
            self.lighting_buffer,
            0,
            bytemuck::bytes_of(&LightingUniform::new(ambient)),
        )?;
        Ok(())
    }

    pub fn set_debug_view(&mut self, enabled: bool) {
        self.debug_view = enabled;
    }

    /// Draw a sphere at every light after accumulation. Hidden in the debug view.
    pub fn set_light_preview(&mut self, enabled: bool) {
        self.preview.set_enabled(enabled);
    }

    /// Timestamps written around the accumulation pass
    pub fn set_accumulate_timestamps(&mut self, timestamps: Option<PassTimestamps>) {
        self.accumulate_timestamps = timestamps;
    }

    /// Bind scene geometry and materials, re-recording the G-buffer bundle
    /// if `generation` moved since it was recorded.
    pub fn prepare_scene(
        &mut self,
        geometry: &SceneGeometry,
        materials: &BindingSlot,
        generation: u64,
    ) -> RendererResult<()> {
        let material_buffer = materials.buffer();
        let rebind = self
            .material_bind_group
            .map_or(true, |(_, buffer)| buffer != material_buffer);
        if rebind {
            let bind_group = self.ctx.backend().create_bind_group(
                self.material_layout,
                &[(0, BindGroupEntry::whole(material_buffer))],
            )?;
            if let Some((old, _)) = self.material_bind_group.replace((bind_group, material_buffer)) {
                self.retired.push(DeferredRelease::BindGroup(old));
            }
            if let Some(old) = self.bundle.invalidate() {
                self.retired.push(DeferredRelease::Bundle(old));
            }
        }
        let material_bind_group = match self.material_bind_group {
            Some((bind_group, _)) => bind_group,
            None => return Err(RendererError::NotReady("material bind group".into())),
        };

        let pipeline = self.gbuffer_pipeline;
        let camera = self.camera_bind_group;
        let replaced = self.bundle.ensure_current(&self.ctx, generation, || {
            Ok(RenderBundleDescriptor {
                label: Some(format!("G-Buffer: {}", geometry.name())),
                color_formats: GBUFFER_FORMATS.to_vec(),
                depth_format: Some(GBUFFER_DEPTH_FORMAT),
                depth_read_only: true,
                commands: vec![
                    BundleCommand::SetPipeline(pipeline),
                    BundleCommand::SetBindGroup {
                        index: 0,
                        bind_group: camera,
                    },
                    BundleCommand::SetBindGroup {
                        index: 1,
                        bind_group: material_bind_group,
                    },
                    BundleCommand::SetVertexBuffer {
                        slot: 0,
                        buffer: geometry.vertices().buffer(),
                        offset: 0,
                    },
                    BundleCommand::SetIndexBuffer {
                        buffer: geometry.indices().buffer(),
                        offset: 0,
                    },
                    BundleCommand::DrawIndexed {
                        indices: 0..geometry.index_count(),
                        base_vertex: 0,
                        instances: 0..1,
                    },
                ],
            })
        })?;
        if let Some(old) = replaced {
            self.retired.push(DeferredRelease::Bundle(old));
        }
        self.scene = Some(geometry.clone());
        Ok(())
    }

    /// Point the accumulation and preview bind groups at the current culling output.
    pub fn prepare_accumulation(
        &mut self,
        clustering: &LightClusteringEngine,
        light_buffer: BufferHandle,
    ) -> RendererResult<()> {
        if let Some(old) = self.preview.prepare(self.camera_buffer, light_buffer)? {
            self.retired.push(old);
        }
        let missing = |what: &str| RendererError::NotReady(format!("accumulation {what}"));
        let inputs = AccumulateInputs {
            params: clustering.params_buffer(),
            lights: light_buffer,
            slots: clustering.slot_buffer().ok_or_else(|| missing("slot buffer"))?,
            planes: clustering
                .planes_buffer()
                .ok_or_else(|| missing("depth planes"))?,
            color_views: self.gbuffer.color_views(),
            depth_view: self.gbuffer.depth_view(),
        };
        if matches!(self.accumulate_bind_group, Some((_, current)) if current == inputs) {
            return Ok(());
        }

        let [albedo, normal, specular] = inputs.color_views;
        let bind_group = self.ctx.backend().create_bind_group(
            self.accumulate_layout,
            &[
                (0, BindGroupEntry::whole(self.camera_buffer)),
                (1, BindGroupEntry::whole(inputs.params)),
                (2, BindGroupEntry::whole(inputs.lights)),
                (3, BindGroupEntry::whole(inputs.slots)),
                (4, BindGroupEntry::whole(inputs.planes)),
                (5, BindGroupEntry::Texture(albedo)),
                (6, BindGroupEntry::Texture(normal)),
                (7, BindGroupEntry::Texture(specular)),
                (8, BindGroupEntry::Texture(inputs.depth_view)),
                (9, BindGroupEntry::whole(self.lighting_buffer)),
            ],
        )?;
        if let Some((old, _)) = self.accumulate_bind_group.replace((bind_group, inputs)) {
            self.retired.push(DeferredRelease::BindGroup(old));
        }
        log::trace!("accumulation bind group rebuilt");
        Ok(())
    }

    /// Depth pre-pass: scene depth only, then make depth readable.
    pub fn record_depth_prepass(&mut self, list: &mut CommandList) -> RendererResult<()> {
        self.stages.enter(FrameStage::DepthPrePass)?;
        let (width, height) = self.gbuffer.size();
        list.begin_render_pass(RenderPassDescriptor {
            label: Some("Depth Pre-Pass".into()),
            color_attachments: Vec::new(),
            depth_attachment: Some(DepthAttachment {
                view: self.gbuffer.depth_view(),
                load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                store_op: StoreOp::Store,
                clear_value: 1.0,
                read_only: false,
            }),
            timestamps: None,
        });
        list.set_viewport(0.0, 0.0, width as f32, height as f32);
        if let Some(scene) = &self.scene {
            list.set_render_pipeline(self.depth_pipeline);
            list.set_bind_group(0, self.camera_bind_group);
            list.set_vertex_buffer(0, scene.vertices().buffer(), 0);
            list.set_index_buffer(scene.indices().buffer(), 0);
            list.draw_indexed(0..scene.index_count(), 0, 0..1);
        }
        list.end_render_pass();
        self.gbuffer.finish_depth_prepass(list)
    }

    /// G-buffer fill from the prerecorded bundle, then the barrier to read.
    pub fn record_gbuffer(&mut self, list: &mut CommandList) -> RendererResult<()> {
        self.stages.enter(FrameStage::GBufferFill)?;
        let [albedo, normal, specular] = self.gbuffer.color_views();
        let color = |view, clear| ColorAttachment {
            view,
            load_op: LoadOp::Clear(clear),
            store_op: StoreOp::Store,
        };
        list.begin_render_pass(RenderPassDescriptor {
            label: Some("G-Buffer Fill".into()),
            color_attachments: vec![
                color(albedo, self.clear_color),
                color(normal, [0.0; 4]),
                color(specular, [0.0; 4]),
            ],
            depth_attachment: Some(DepthAttachment {
                view: self.gbuffer.depth_view(),
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
                clear_value: 1.0,
                read_only: true,
            }),
            timestamps: None,
        });
        if let Some(bundle) = self.bundle.handle() {
            list.execute_bundle(bundle);
        }
        list.end_render_pass();

        self.stages.enter(FrameStage::BarrierToRead)?;
        self.gbuffer.transition_to_read(list)
    }

    /// Wait entry for the accumulation submission on the culling edge.
    pub fn light_cull_wait(
        &mut self,
        edge: &SyncEdge<LightCullDone>,
        point: SyncPoint<LightCullDone>,
    ) -> RendererResult<FenceWait> {
        self.stages.enter(FrameStage::LightCullWait)?;
        Ok(edge.wait(point))
    }

    /// Accumulate lighting into `target`, then return the G-buffer to write state
    /// and draw the light preview when enabled.
    pub fn record_accumulate(
        &mut self,
        list: &mut CommandList,
        target: TextureViewHandle,
        clustering: &LightClusteringEngine,
    ) -> RendererResult<()> {
        self.stages.enter(FrameStage::Accumulate)?;
        let (bind_group, inputs) = self
            .accumulate_bind_group
            .ok_or_else(|| RendererError::NotReady("accumulation bind group".into()))?;
        let mesh = match self.mode {
            CullingMode::Tile => None,
            CullingMode::Triangle => Some(
                clustering
                    .tile_mesh_binding()
                    .ok_or_else(|| RendererError::NotReady("tile mesh".into()))?
                    .buffer(),
            ),
        };

        list.transition(vec![StateTransition::buffer(
            inputs.slots,
            ResourceState::UnorderedAccess,
            ResourceState::ShaderRead,
        )]);
        let (width, height) = self.gbuffer.size();
        list.begin_render_pass(RenderPassDescriptor {
            label: Some("Light Accumulation".into()),
            color_attachments: vec![ColorAttachment {
                view: target,
                load_op: LoadOp::Clear([0.0, 0.0, 0.0, 1.0]),
                store_op: StoreOp::Store,
            }],
            depth_attachment: None,
            timestamps: self.accumulate_timestamps,
        });
        list.set_viewport(0.0, 0.0, width as f32, height as f32);
        let pipeline = if self.debug_view {
            self.debug_pipeline
        } else {
            self.accumulate_pipeline
        };
        list.set_render_pipeline(pipeline);
        list.set_bind_group(0, bind_group);
        match mesh {
            None => list.draw(0..3, 0..1),
            Some(buffer) => {
                list.set_vertex_buffer(0, buffer, 0);
                list.draw(0..clustering.tile_vertex_count(), 0..1);
            }
        }
        list.end_render_pass();
        list.transition(vec![StateTransition::buffer(
            inputs.slots,
            ResourceState::ShaderRead,
            ResourceState::UnorderedAccess,
        )]);

        self.stages.enter(FrameStage::BarrierToWrite)?;
        self.gbuffer.transition_to_write(list)?;
        if !self.debug_view {
            self.preview.record(
                list,
                target,
                self.gbuffer.depth_view(),
                clustering.params().light_num,
                (width, height),
            );
        }
        Ok(())
    }

    /// Abandon a partially recorded frame.
    pub fn reset_frame(&mut self) {
        self.stages.reset();
    }

    /// Objects replaced since the last call; release them through the frame manager.
    pub fn take_retired(&mut self) -> Vec<DeferredRelease> {
        std::mem::take(&mut self.retired)
    }

    pub fn gbuffer(&self) -> &GBuffer {
        &self.gbuffer
    }

    pub fn camera_buffer(&self) -> BufferHandle {
        self.camera_buffer
    }

    pub fn bundle(&self) -> &GBufferBundle {
        &self.bundle
    }

    pub fn stage(&self) -> Option<FrameStage> {
        self.stages.current()
    }

    pub fn mode(&self) -> CullingMode {
        self.mode
    }

    pub fn debug_view(&self) -> bool {
        self.debug_view
    }

    pub fn light_preview(&self) -> bool {
        self.preview.is_enabled()
    }

    pub fn has_scene(&self) -> bool {
        self.scene.is_some()
    }

    /// Destroy every GPU object owned by the pipeline. The GPU must be idle.
    pub(crate) fn destroy(&mut self) {
        let mut retired = std::mem::take(&mut self.retired);
        retired.extend(self.gbuffer.retire());
        retired.extend(self.bundle.invalidate().map(DeferredRelease::Bundle));
        retired.extend(self.preview.retire());
        retired.extend(
            [
                self.material_bind_group.take().map(|(group, _)| group),
                self.accumulate_bind_group.take().map(|(group, _)| group),
                Some(self.camera_bind_group),
            ]
            .into_iter()
            .flatten()
            .map(DeferredRelease::BindGroup),
        );
        retired.push(DeferredRelease::Buffer(self.camera_buffer));
        retired.push(DeferredRelease::Buffer(self.lighting_buffer));

        let mut backend = self.ctx.backend();
        for resource in retired {
            match resource {
                DeferredRelease::Buffer(buffer) => backend.destroy_buffer(buffer),
                DeferredRelease::BindGroup(group) => backend.destroy_bind_group(group),
                DeferredRelease::Bundle(bundle) => backend.destroy_render_bundle(bundle),
                DeferredRelease::Texture(texture) => backend.destroy_texture(texture),
            }
        }
        self.scene = None;
    }
}

impl std::fmt::Debug for DeferredPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredPipeline")
            .field("mode", &self.mode)
            .field("gbuffer", &self.gbuffer.size())
            .field("stage", &self.stages.current())
            .field("bundle_generation", &self.bundle.generation())
            .field("debug_view", &self.debug_view)
            .field("preview", &self.preview)
            .finish()
    }
}
