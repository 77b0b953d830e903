//! Screen-space tile mesh
//!
//! The viewport is covered by a `W x H` grid of quads, each split along its
//! anti-diagonal into two triangles:
//!
//! ```text
//! (i,j) ----- (i+1,j)
//!   |  0     /   |
//!   |      /     |
//!   |    /    1  |
//! (i,j+1) --- (i+1,j+1)
//! ```
//!
//! Triangle 0 (upper-left) is cell parity 0, triangle 1 (lower-right) is
//! parity 1. Grid point `(i, j)` sits at NDC `(u * 2 - 1, 1 - v * 2)` with
//! `u = i / W`, `v = j / H`.

use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::backend::{VertexAttribute, VertexBufferLayout, VertexFormat};

/// Vertex of the expanded accumulation mesh.
///
/// All three vertices of a triangle carry the triangle's light index slot,
/// read with flat interpolation in the fragment stage.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TileVertex {
    pub position: [f32; 4],
    pub uv: [f32; 2],
    pub slot: u32,
    pub _pad: u32,
}

const _: () = assert!(std::mem::size_of::<TileVertex>() == 32);

impl TileVertex {
    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<TileVertex>() as u64,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x4,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x2,
                    offset: 16,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Uint32,
                    offset: 24,
                },
            ],
        }
    }
}

/// Grid corners of triangle `parity` of tile `(x, y)`, as `(i, j)` pairs.
pub fn triangle_corners(x: u32, y: u32, parity: u32) -> [(u32, u32); 3] {
    if parity == 0 {
        [(x, y), (x + 1, y), (x, y + 1)]
    } else {
        [(x + 1, y), (x + 1, y + 1), (x, y + 1)]
    }
}

/// Which triangle of its tile a point lies in, from its position inside the
/// tile normalized to 0..1. The diagonal belongs to triangle 0.
pub fn triangle_parity(local_u: f32, local_v: f32) -> u32 {
    if local_u + local_v > 1.0 {
        1
    } else {
        0
    }
}

/// Indexed triangle grid covering the viewport
#[derive(Debug, Clone, PartialEq)]
pub struct TileMesh {
    width: u32,
    height: u32,
    positions: Vec<Vec2>,
    indices: Vec<u32>,
}

impl TileMesh {
    pub fn new(width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let mut positions = Vec::with_capacity(((width + 1) * (height + 1)) as usize);
        for j in 0..=height {
            for i in 0..=width {
                positions.push(Self::ndc(i, j, width, height));
            }
        }

        let mut indices = Vec::with_capacity((width * height * 6) as usize);
        let vertex = |i: u32, j: u32| j * (width + 1) + i;
        for y in 0..height {
            for x in 0..width {
                for parity in 0..2 {
                    for (i, j) in triangle_corners(x, y, parity) {
                        indices.push(vertex(i, j));
                    }
                }
            }
        }

        Self {
            width,
            height,
            positions,
            indices,
        }
    }

    fn ndc(i: u32, j: u32, width: u32, height: u32) -> Vec2 {
        let u = i as f32 / width as f32;
        let v = j as f32 / height as f32;
        Vec2::new(u * 2.0 - 1.0, 1.0 - v * 2.0)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn positions(&self) -> &[Vec2] {
        &self.positions
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// NDC corners of triangle `parity` of tile `(x, y)`
    pub fn triangle(&self, x: u32, y: u32, parity: u32) -> [Vec2; 3] {
        triangle_corners(x, y, parity).map(|(i, j)| Self::ndc(i, j, self.width, self.height))
    }

    /// Non-indexed vertices for the accumulation pass, six per tile.
    ///
    /// `slot_stride` is the number of slots reserved per tile; the slot of a
    /// triangle is `tile * slot_stride + parity` for depth slice 0.
    pub fn gpu_vertices(&self, slot_stride: u32) -> Vec<TileVertex> {
        let mut vertices = Vec::with_capacity(self.indices.len());
        for y in 0..self.height {
            for x in 0..self.width {
                let tile = y * self.width + x;
                for parity in 0..2 {
                    let slot = tile * slot_stride + parity;
                    for (i, j) in triangle_corners(x, y, parity) {
                        let ndc = Self::ndc(i, j, self.width, self.height);
                        vertices.push(TileVertex {
                            position: [ndc.x, ndc.y, 0.0, 1.0],
                            uv: [i as f32 / self.width as f32, j as f32 / self.height as f32],
                            slot,
                            _pad: 0,
                        });
                    }
                }
            }
        }
        vertices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_counts() {
        let mesh = TileMesh::new(4, 3);
        assert_eq!(mesh.positions().len(), 5 * 4);
        assert_eq!(mesh.triangle_count(), 4 * 3 * 2);
        assert_eq!(mesh.gpu_vertices(2).len(), 4 * 3 * 6);
    }

    #[test]
    fn test_corners_span_ndc() {
        let mesh = TileMesh::new(2, 2);
        assert_eq!(mesh.positions()[0], Vec2::new(-1.0, 1.0));
        assert_eq!(*mesh.positions().last().unwrap(), Vec2::new(1.0, -1.0));
    }

    #[test]
    fn test_triangles_split_tile() {
        let mesh = TileMesh::new(2, 2);
        let upper = mesh.triangle(1, 0, 0);
        let lower = mesh.triangle(1, 0, 1);
        assert_eq!(upper[0], Vec2::new(0.0, 1.0));
        assert_eq!(lower[1], Vec2::new(1.0, 0.0));
        // The diagonal is shared.
        assert_eq!(upper[1], lower[0]);
        assert_eq!(upper[2], lower[2]);
    }

    #[test]
    fn test_gpu_vertices_carry_slot() {
        let mesh = TileMesh::new(3, 2);
        let vertices = mesh.gpu_vertices(2);
        // Tile (1, 1) is tile index 4, its lower-right triangle is slot 9.
        let start = (4 * 2 + 1) * 3;
        assert!(vertices[start..start + 3].iter().all(|v| v.slot == 9));
    }

    #[test]
    fn test_parity_split() {
        assert_eq!(triangle_parity(0.1, 0.1), 0);
        assert_eq!(triangle_parity(0.5, 0.5), 0);
        assert_eq!(triangle_parity(0.9, 0.2), 1);
    }
}
