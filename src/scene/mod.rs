//! Scene data
//!
//! A [`SceneProvider`] produces flat vertex and index lists plus materials on
//! a background job. The renderer turns the result into [`SceneGeometry`],
//! whose buffers start in upload memory and are promoted to device-local
//! memory by the promotion manager.

mod camera;
mod light;

pub use camera::*;
pub use light::*;

use crate::backend::{VertexAttribute, VertexBufferLayout, VertexFormat};
use crate::error::{RendererError, RendererResult};
use crate::jobs::CancellationToken;
use crate::resources::{BindingSlot, PromotionManager, PromotionTarget, StandardMaterial};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Scene vertex with a per-vertex material index
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub material_index: u32,
}

const _: () = assert!(std::mem::size_of::<SceneVertex>() == 36);

impl SceneVertex {
    pub fn new(position: Vec3, normal: Vec3, uv: [f32; 2], material_index: u32) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            uv,
            material_index,
        }
    }

    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<SceneVertex>() as u64,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x3,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Float32x2,
                    offset: 24,
                },
                VertexAttribute {
                    location: 3,
                    format: VertexFormat::Uint32,
                    offset: 32,
                },
            ],
        }
    }
}

/// CPU-side scene as produced by a provider
#[derive(Debug, Clone, Default)]
pub struct SceneData {
    pub name: String,
    pub vertices: Vec<SceneVertex>,
    pub indices: Vec<u32>,
    pub materials: Vec<StandardMaterial>,
}

impl SceneData {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Reject index or material references that would read out of bounds.
    pub fn validate(&self) -> RendererResult<()> {
        let fail = |message: String| Err(RendererError::SceneLoad(format!("{}: {}", self.name, message)));
        if self.indices.len() % 3 != 0 {
            return fail(format!("{} indices is not a triangle list", self.indices.len()));
        }
        if let Some(index) = self
            .indices
            .iter()
            .find(|&&i| i as usize >= self.vertices.len())
        {
            return fail(format!(
                "index {} out of range ({} vertices)",
                index,
                self.vertices.len()
            ));
        }
        let materials = self.materials.len().max(1);
        if let Some(vertex) = self
            .vertices
            .iter()
            .find(|v| v.material_index as usize >= materials)
        {
            return fail(format!(
                "material index {} out of range ({} materials)",
                vertex.material_index, materials
            ));
        }
        Ok(())
    }

    /// Append an axis-aligned box centred at `center`.
    pub fn push_box(&mut self, center: Vec3, half_extent: Vec3, material_index: u32) {
        let faces = [Vec3::X, -Vec3::X, Vec3::Y, -Vec3::Y, Vec3::Z, -Vec3::Z];
        for normal in faces {
            let tangent = if normal.y.abs() > 0.5 { Vec3::X } else { Vec3::Y.cross(normal) };
            let bitangent = normal.cross(tangent);
            let base = self.vertices.len() as u32;
            for (u, v) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let offset = normal + tangent * u + bitangent * v;
                self.vertices.push(SceneVertex::new(
                    center + offset * half_extent,
                    normal,
                    [(u + 1.0) * 0.5, (1.0 - v) * 0.5],
                    material_index,
                ));
            }
            self.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
    }

    /// Append a horizontal square at height `y`, facing up.
    pub fn push_ground(&mut self, y: f32, half_size: f32, material_index: u32) {
        let base = self.vertices.len() as u32;
        for (x, z, uv) in [
            (-1.0, 1.0, [0.0, 1.0]),
            (1.0, 1.0, [1.0, 1.0]),
            (1.0, -1.0, [1.0, 0.0]),
            (-1.0, -1.0, [0.0, 0.0]),
        ] {
            self.vertices.push(SceneVertex::new(
                Vec3::new(x * half_size, y, z * half_size),
                Vec3::Y,
                uv,
                material_index,
            ));
        }
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
}

/// Source of scene data, run on a worker thread.
///
/// Loading should check `cancel` between expensive steps and return early
/// once it is set.
pub trait SceneProvider: Send + 'static {
    fn name(&self) -> &str;

    fn load(&self, cancel: &CancellationToken) -> RendererResult<SceneData>;
}

/// Ground plane with a grid of boxes, one material per row.
#[derive(Debug, Clone)]
pub struct ProceduralScene {
    pub name: String,
    /// Boxes per side
    pub grid: u32,
    pub spacing: f32,
}

impl ProceduralScene {
    pub fn new(name: &str, grid: u32, spacing: f32) -> Self {
        Self {
            name: name.to_string(),
            grid,
            spacing,
        }
    }
}

impl Default for ProceduralScene {
    fn default() -> Self {
        Self::new("box field", 6, 4.0)
    }
}

impl SceneProvider for ProceduralScene {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, cancel: &CancellationToken) -> RendererResult<SceneData> {
        let mut scene = SceneData::new(&self.name);
        scene.materials = vec![
            StandardMaterial::matte(Vec3::splat(0.7)),
            StandardMaterial::glossy(Vec3::new(0.8, 0.2, 0.2)),
            StandardMaterial::glossy(Vec3::new(0.2, 0.7, 0.3)),
            StandardMaterial::matte(Vec3::new(0.2, 0.3, 0.9)),
        ];

        let extent = self.grid as f32 * self.spacing * 0.5;
        scene.push_ground(0.0, extent + self.spacing, 0);
        for row in 0..self.grid {
            if cancel.is_cancelled() {
                return Err(RendererError::SceneLoad(format!("{}: cancelled", self.name)));
            }
            let material = 1 + row % 3;
            for column in 0..self.grid {
                let center = Vec3::new(
                    (column as f32 + 0.5) * self.spacing - extent,
                    0.75,
                    (row as f32 + 0.5) * self.spacing - extent,
                );
                scene.push_box(center, Vec3::splat(0.75), material);
            }
        }
        log::debug!(
            "procedural scene '{}': {} vertices, {} triangles",
            self.name,
            scene.vertices.len(),
            scene.triangle_count()
        );
        Ok(scene)
    }
}

/// Scene buffers bound by the depth and G-buffer passes
#[derive(Debug, Clone)]
pub struct SceneGeometry {
    name: String,
    vertices: BindingSlot,
    indices: BindingSlot,
    index_count: u32,
}

impl SceneGeometry {
    /// Create upload buffers for `data` and queue them for promotion.
    pub fn upload(promotion: &PromotionManager, data: &SceneData) -> RendererResult<Self> {
        data.validate()?;
        let vertices = promotion.upload(
            &format!("{} vertices", data.name),
            bytemuck::cast_slice(&data.vertices),
            PromotionTarget::VertexView,
        )?;
        let indices = promotion.upload(
            &format!("{} indices", data.name),
            bytemuck::cast_slice(&data.indices),
            PromotionTarget::IndexView,
        )?;
        Ok(Self {
            name: data.name.clone(),
            vertices,
            indices,
            index_count: data.indices.len() as u32,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &BindingSlot {
        &self.vertices
    }

    pub fn indices(&self) -> &BindingSlot {
        &self.indices
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn bindings(&self) -> [&BindingSlot; 2] {
        [&self.vertices, &self.indices]
    }
}
