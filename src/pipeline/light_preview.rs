//! Light preview: a small sphere at every light, drawn in the light's color
//!
//! Recorded after accumulation into the back buffer, depth tested against
//! the scene depth without writing it.

use super::gbuffer::GBUFFER_DEPTH_FORMAT;
use crate::backend::{
    BindGroupEntry, BindGroupHandle, BindGroupLayoutEntry, BindGroupLayoutHandle, BindingType,
    BlendMode, BufferDescriptor, BufferHandle, BufferUsage, ColorAttachment, ColorTarget,
    CommandList, DepthAttachment, DepthCompare, DepthState, GpuContext, LoadOp,
    RenderPassDescriptor, RenderPipelineDescriptor, RenderPipelineHandle, ShaderStageFlags,
    StoreOp, TextureViewHandle, VertexAttribute, VertexBufferLayout, VertexFormat,
};
use crate::error::RendererResult;
use crate::frame::{DeferredRelease, BACK_BUFFER_FORMAT};
use crate::resources::ShaderLibrary;
use bytemuck::{Pod, Zeroable};
use std::f32::consts::{PI, TAU};
use std::sync::Arc;

/// World-space radius of a preview sphere
pub const PREVIEW_SPHERE_RADIUS: f32 = 1.0;

const SPHERE_RINGS: u32 = 20;
const SPHERE_SEGMENTS: u32 = 20;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SphereVertex {
    pub position: [f32; 3],
}

impl SphereVertex {
    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<SphereVertex>() as u64,
            attributes: vec![VertexAttribute {
                location: 0,
                format: VertexFormat::Float32x3,
                offset: 0,
            }],
        }
    }
}

/// UV sphere: both poles plus `rings` rows of `segments + 1` vertices.
/// The last vertex of a row repeats the first.
#[derive(Debug, Clone)]
pub struct SphereMesh {
    pub vertices: Vec<SphereVertex>,
    pub indices: Vec<u32>,
}

impl SphereMesh {
    pub fn new(radius: f32, rings: u32, segments: u32) -> Self {
        let row = segments + 1;
        let mut vertices = Vec::with_capacity((rings * row + 2) as usize);
        vertices.push(SphereVertex {
            position: [0.0, radius, 0.0],
        });
        for ring in 0..rings {
            let polar = PI * (ring + 1) as f32 / (rings + 1) as f32;
            for segment in 0..row {
                let azimuth = TAU * (segment % segments) as f32 / segments as f32;
                vertices.push(SphereVertex {
                    position: [
                        polar.sin() * azimuth.cos() * radius,
                        polar.cos() * radius,
                        polar.sin() * azimuth.sin() * radius,
                    ],
                });
            }
        }
        vertices.push(SphereVertex {
            position: [0.0, -radius, 0.0],
        });

        let top = 0;
        let bottom = vertices.len() as u32 - 1;
        let at = |ring: u32, segment: u32| 1 + ring * row + segment;
        let mut indices = Vec::with_capacity((segments * 6 * rings) as usize);
        for segment in 0..segments {
            indices.extend([top, at(0, segment + 1), at(0, segment)]);
        }
        for ring in 0..rings.saturating_sub(1) {
            for segment in 0..segments {
                let (a, b) = (at(ring, segment), at(ring, segment + 1));
                let (c, d) = (at(ring + 1, segment), at(ring + 1, segment + 1));
                indices.extend([a, b, d, a, d, c]);
            }
        }
        let last = rings - 1;
        for segment in 0..segments {
            indices.extend([bottom, at(last, segment), at(last, segment + 1)]);
        }
        Self { vertices, indices }
    }
}

pub struct LightPreview {
    ctx: Arc<GpuContext>,
    enabled: bool,
    layout: BindGroupLayoutHandle,
    pipeline: RenderPipelineHandle,
    vertices: BufferHandle,
    indices: BufferHandle,
    index_count: u32,
    /// Bind group and the light buffer it points at
    bind_group: Option<(BindGroupHandle, BufferHandle)>,
}

impl LightPreview {
    pub fn new(
        ctx: Arc<GpuContext>,
        shaders: &ShaderLibrary,
        enabled: bool,
    ) -> RendererResult<Self> {
        let mesh = SphereMesh::new(PREVIEW_SPHERE_RADIUS, SPHERE_RINGS, SPHERE_SEGMENTS);
        let mut backend = ctx.backend();
        let layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::UniformBuffer,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::StorageBuffer { read_only: true },
            },
        ])?;
        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("Light Preview".into()),
            shader: shaders.source("light_preview")?.to_string(),
            vertex_entry: "vs_main".into(),
            fragment_entry: Some("fs_main".into()),
            vertex_layouts: vec![SphereVertex::layout()],
            bind_group_layouts: vec![layout],
            depth: Some(DepthState {
                format: GBUFFER_DEPTH_FORMAT,
                write: false,
                compare: DepthCompare::LessEqual,
            }),
            color_targets: vec![ColorTarget {
                format: BACK_BUFFER_FORMAT,
                blend: BlendMode::Replace,
            }],
            constants: Vec::new(),
        })?;
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let vertices = backend.create_buffer_init(
            &BufferDescriptor::new(
                "light preview vertices",
                vertex_bytes.len() as u64,
                BufferUsage::VERTEX,
            ),
            vertex_bytes,
        )?;
        let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);
        let indices = match backend.create_buffer_init(
            &BufferDescriptor::new(
                "light preview indices",
                index_bytes.len() as u64,
                BufferUsage::INDEX,
            ),
            index_bytes,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                backend.destroy_buffer(vertices);
                return Err(err.into());
            }
        };
        drop(backend);

        Ok(Self {
            ctx,
            enabled,
            layout,
            pipeline,
            vertices,
            indices,
            index_count: mesh.indices.len() as u32,
            bind_group: None,
        })
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Point the bind group at `lights`. Returns the replaced bind group.
    pub fn prepare(
        &mut self,
        camera: BufferHandle,
        lights: BufferHandle,
    ) -> RendererResult<Option<DeferredRelease>> {
        if matches!(self.bind_group, Some((_, current)) if current == lights) {
            return Ok(None);
        }
        let bind_group = self.ctx.backend().create_bind_group(
            self.layout,
            &[
                (0, BindGroupEntry::whole(camera)),
                (1, BindGroupEntry::whole(lights)),
            ],
        )?;
        Ok(self
            .bind_group
            .replace((bind_group, lights))
            .map(|(old, _)| DeferredRelease::BindGroup(old)))
    }

    /// Draw `light_count` spheres over `target`. Nothing is recorded while
    /// disabled, unprepared or without lights.
    pub fn record(
        &self,
        list: &mut CommandList,
        target: TextureViewHandle,
        depth: TextureViewHandle,
        light_count: u32,
        (width, height): (u32, u32),
    ) -> bool {
        let Some((bind_group, _)) = self.bind_group else {
            return false;
        };
        if !self.enabled || light_count == 0 {
            return false;
        }
        list.begin_render_pass(RenderPassDescriptor {
            label: Some("Light Preview".into()),
            color_attachments: vec![ColorAttachment {
                view: target,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_attachment: Some(DepthAttachment {
                view: depth,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
                clear_value: 1.0,
                read_only: true,
            }),
            timestamps: None,
        });
        list.set_viewport(0.0, 0.0, width as f32, height as f32);
        list.set_render_pipeline(self.pipeline);
        list.set_bind_group(0, bind_group);
        list.set_vertex_buffer(0, self.vertices, 0);
        list.set_index_buffer(self.indices, 0);
        list.draw_indexed(0..self.index_count, 0, 0..light_count);
        list.end_render_pass();
        true
    }

    /// Every GPU object still owned, for release once the GPU is idle
    pub fn retire(&mut self) -> Vec<DeferredRelease> {
        let mut retired = vec![
            DeferredRelease::Buffer(self.vertices),
            DeferredRelease::Buffer(self.indices),
        ];
        retired.extend(
            self.bind_group
                .take()
                .map(|(group, _)| DeferredRelease::BindGroup(group)),
        );
        retired
    }
}

impl std::fmt::Debug for LightPreview {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightPreview")
            .field("enabled", &self.enabled)
            .field("index_count", &self.index_count)
            .finish()
    }
}
