//! CPU light culling
//!
//! Mirrors the culling kernels cell for cell: same cell volumes, same sphere
//! test, same ascending append order and the same clamp at
//! [`MAX_LIGHTS_PER_CLUSTER`](super::layout::MAX_LIGHTS_PER_CLUSTER). Rows of
//! the grid are spread over scoped threads.

use super::layout::{ClusterParams, LightIndexBuffer, LightIndexSlot, SlotCapacityPolicy, MAX_LIGHTS};
use super::tile_mesh::triangle_parity;
use crate::config::CullingMode;
use crate::scene::PointLight;
use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};

/// Per-pixel NDC depth, row major
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    width: u32,
    height: u32,
    depth: Vec<f32>,
}

impl DepthImage {
    /// Image with every pixel at `depth`. 1.0 is the cleared (empty) value.
    pub fn new(width: u32, height: u32, depth: f32) -> Self {
        Self {
            width,
            height,
            depth: vec![depth; (width * height) as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> f32) -> Self {
        let mut depth = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                depth.push(f(x, y));
            }
        }
        Self { width, height, depth }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.depth[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, depth: f32) {
        self.depth[(y * self.width + x) as usize] = depth;
    }
}

/// Everything one culling pass reads
#[derive(Debug, Clone)]
pub struct CullInputs<'a> {
    pub params: ClusterParams,
    pub policy: SlotCapacityPolicy,
    pub view: Mat4,
    pub inv_proj: Mat4,
    /// `depth_dim + 1` NDC depths bounding the slices
    pub depth_planes: &'a [f32],
    /// Surface depth; without it every cell spans its whole slice
    pub depth: Option<&'a DepthImage>,
    pub lights: &'a [PointLight],
}

/// View-space volume of one cell
#[derive(Debug, Clone, PartialEq)]
pub struct CellVolume {
    /// Inward-facing side plane normals; every plane passes through the eye
    pub planes: Vec<Vec3>,
    /// View distance range
    pub near: f32,
    pub far: f32,
}

impl CellVolume {
    /// Sphere in view space (right-handed, -Z forward) against the volume
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        if self.planes.iter().any(|n| n.dot(center) < -radius) {
            return false;
        }
        let distance = -center.z;
        distance + radius >= self.near && distance - radius <= self.far
    }
}

/// Corners of a cell in normalized screen coordinates (0..1, y down)
pub fn cell_polygon(params: &ClusterParams, mode: CullingMode, x: u32, y: u32, cell: u32) -> Vec<Vec2> {
    let u0 = x as f32 / params.width_dim as f32;
    let u1 = (x + 1) as f32 / params.width_dim as f32;
    let v0 = y as f32 / params.height_dim as f32;
    let v1 = (y + 1) as f32 / params.height_dim as f32;
    match (mode, cell) {
        (CullingMode::Tile, _) => vec![
            Vec2::new(u0, v0),
            Vec2::new(u1, v0),
            Vec2::new(u1, v1),
            Vec2::new(u0, v1),
        ],
        (CullingMode::Triangle, 0) => vec![Vec2::new(u0, v0), Vec2::new(u1, v0), Vec2::new(u0, v1)],
        (CullingMode::Triangle, _) => vec![Vec2::new(u1, v0), Vec2::new(u1, v1), Vec2::new(u0, v1)],
    }
}

fn eye_ray(inv_proj: &Mat4, uv: Vec2) -> Vec3 {
    let p = *inv_proj * Vec4::new(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, 1.0, 1.0);
    p.xyz() / p.w
}

/// View distance of a point at NDC depth `depth` on the view axis
pub fn view_distance(inv_proj: &Mat4, depth: f32) -> f32 {
    let p = *inv_proj * Vec4::new(0.0, 0.0, depth, 1.0);
    -p.z / p.w
}

/// Side planes of the pyramid through the eye and `polygon`.
pub fn side_planes(inv_proj: &Mat4, polygon: &[Vec2]) -> Vec<Vec3> {
    let rays: Vec<Vec3> = polygon.iter().map(|uv| eye_ray(inv_proj, *uv)).collect();
    let centroid = rays.iter().copied().sum::<Vec3>() / rays.len() as f32;
    (0..rays.len())
        .map(|i| {
            let normal = rays[i].cross(rays[(i + 1) % rays.len()]).normalize_or_zero();
            if normal.dot(centroid) < 0.0 {
                -normal
            } else {
                normal
            }
        })
        .collect()
}

/// Min and max surface depth of the pixels of a cell inside the slice range,
/// or `None` if the cell covers no surface there.
pub fn surface_depth_bounds(
    depth: &DepthImage,
    params: &ClusterParams,
    mode: CullingMode,
    x: u32,
    y: u32,
    cell: u32,
    slice: (f32, f32),
) -> Option<(f32, f32)> {
    let left = x as f32 * params.tile_size_x;
    let top = y as f32 * params.tile_size_y;
    let right = left + params.tile_size_x;
    let bottom = top + params.tile_size_y;
    let px0 = left.floor() as u32;
    let py0 = top.floor() as u32;
    let px1 = (right.ceil() as u32).min(depth.width());
    let py1 = (bottom.ceil() as u32).min(depth.height());

    let mut bounds: Option<(f32, f32)> = None;
    for py in py0..py1 {
        let cy = py as f32 + 0.5;
        if cy < top || cy >= bottom {
            continue;
        }
        for px in px0..px1 {
            let cx = px as f32 + 0.5;
            if cx < left || cx >= right {
                continue;
            }
            if mode == CullingMode::Triangle {
                let local_u = (cx - left) / params.tile_size_x;
                let local_v = (cy - top) / params.tile_size_y;
                if triangle_parity(local_u, local_v) != cell {
                    continue;
                }
            }
            let d = depth.get(px, py);
            if d >= 1.0 || d < slice.0 || d > slice.1 {
                continue;
            }
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(d), hi.max(d)),
                None => (d, d),
            });
        }
    }
    bounds
}

/// Volume of one cell, `None` if it covers no surface.
pub fn cell_volume(inputs: &CullInputs<'_>, x: u32, y: u32, z: u32, cell: u32) -> Option<CellVolume> {
    let mode = inputs.policy.mode();
    let slice = (
        inputs.depth_planes.get(z as usize).copied().unwrap_or(0.0),
        inputs.depth_planes.get(z as usize + 1).copied().unwrap_or(1.0),
    );
    let (min_depth, max_depth) = match inputs.depth {
        Some(depth) => surface_depth_bounds(depth, &inputs.params, mode, x, y, cell, slice)?,
        None => slice,
    };
    let polygon = cell_polygon(&inputs.params, mode, x, y, cell);
    Some(CellVolume {
        planes: side_planes(&inputs.inv_proj, &polygon),
        near: view_distance(&inputs.inv_proj, min_depth),
        far: view_distance(&inputs.inv_proj, max_depth),
    })
}

/// Run a full culling pass on the CPU.
pub fn cull_lights(inputs: &CullInputs<'_>) -> LightIndexBuffer {
    let params = inputs.params;
    let stride = inputs.policy.slots_per_tile() as usize;
    let mut buffer = LightIndexBuffer::new(inputs.policy.slot_count(&params) as usize);
    if buffer.is_empty() {
        return buffer;
    }

    let light_count = (params.light_num as usize)
        .min(inputs.lights.len())
        .min(MAX_LIGHTS as usize);
    let view_lights: Vec<(Vec3, f32)> = inputs.lights[..light_count]
        .iter()
        .map(|light| ((inputs.view * light.position().extend(1.0)).xyz(), light.radius))
        .collect();

    let row_len = params.width_dim as usize * stride;
    let rows = (params.height_dim * params.depth_dim) as usize;
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(rows)
        .max(1);
    let rows_per_thread = rows.div_ceil(threads);

    std::thread::scope(|scope| {
        for (chunk_index, chunk) in buffer
            .slots_mut()
            .chunks_mut(rows_per_thread * row_len)
            .enumerate()
        {
            let view_lights = &view_lights;
            scope.spawn(move || {
                for (row_offset, row) in chunk.chunks_mut(row_len).enumerate() {
                    let row_index = (chunk_index * rows_per_thread + row_offset) as u32;
                    let y = row_index % params.height_dim;
                    let z = row_index / params.height_dim;
                    for x in 0..params.width_dim {
                        let tile = &mut row[x as usize * stride..(x as usize + 1) * stride];
                        for cell in 0..inputs.policy.cells_per_tile() {
                            tile[cell as usize] = cull_cell(inputs, view_lights, x, y, z, cell);
                        }
                    }
                }
            });
        }
    });
    buffer
}

fn cull_cell(
    inputs: &CullInputs<'_>,
    view_lights: &[(Vec3, f32)],
    x: u32,
    y: u32,
    z: u32,
    cell: u32,
) -> LightIndexSlot {
    let mut slot = LightIndexSlot::default();
    let Some(volume) = cell_volume(inputs, x, y, z, cell) else {
        return slot;
    };
    for (index, (center, radius)) in view_lights.iter().enumerate() {
        if volume.intersects_sphere(*center, *radius) {
            // Overflow is dropped silently.
            slot.push(index as u32);
        }
    }
    slot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::layout::{grid_for_viewport, MAX_LIGHTS_PER_CLUSTER};
    use crate::config::CapacityConfig;
    use crate::scene::Camera;

    fn params(width: u32, height: u32, tile: u32, lights: usize) -> ClusterParams {
        let (w, h, tx, ty) = grid_for_viewport(width, height, tile);
        ClusterParams {
            width_dim: w,
            height_dim: h,
            light_num: lights as u32,
            depth_dim: 1,
            tile_size_x: tx,
            tile_size_y: ty,
        }
    }

    fn camera() -> Camera {
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO).with_clip(0.1, 100.0);
        camera.set_aspect(128, 128);
        camera
    }

    #[test]
    fn test_planes_face_inward() {
        let camera = camera();
        let inv_proj = camera.projection_matrix().inverse();
        let polygon = [Vec2::new(0.25, 0.25), Vec2::new(0.75, 0.25), Vec2::new(0.5, 0.75)];
        let planes = side_planes(&inv_proj, &polygon);
        let inside = eye_ray(&inv_proj, Vec2::new(0.5, 0.4));
        assert!(planes.iter().all(|n| n.dot(inside) > 0.0));
        let outside = eye_ray(&inv_proj, Vec2::new(0.05, 0.95));
        assert!(planes.iter().any(|n| n.dot(outside) < 0.0));
    }

    #[test]
    fn test_light_on_axis_hits_center_cells_only() {
        let camera = camera();
        let lights = [PointLight::new(Vec3::ZERO, 0.05, Vec3::ONE)];
        let params = params(128, 128, 32, lights.len());
        let policy = SlotCapacityPolicy::new(CullingMode::Tile, &CapacityConfig::default());
        let planes = camera.depth_planes(1);
        let result = cull_lights(&CullInputs {
            params,
            policy,
            view: camera.view_matrix(),
            inv_proj: camera.projection_matrix().inverse(),
            depth_planes: &planes,
            depth: None,
            lights: &lights,
        });

        // The sphere sits on the corner shared by the four centre tiles.
        let hit: Vec<usize> = (0..result.len()).filter(|&i| result.slots()[i].counter > 0).collect();
        let expected: Vec<usize> = [(1, 1), (2, 1), (1, 2), (2, 2)]
            .iter()
            .map(|&(x, y)| params.tile_index(x, y, 0) as usize)
            .collect();
        assert_eq!(hit, expected);
        for index in hit {
            assert_eq!(result.lights(index), &[0]);
        }
    }

    #[test]
    fn test_empty_depth_gets_no_lights() {
        let camera = camera();
        let lights = [PointLight::new(Vec3::ZERO, 50.0, Vec3::ONE)];
        let params = params(64, 64, 32, 1);
        let policy = SlotCapacityPolicy::new(CullingMode::Triangle, &CapacityConfig::default());
        let planes = camera.depth_planes(1);
        let depth = DepthImage::new(64, 64, 1.0);
        let result = cull_lights(&CullInputs {
            params,
            policy,
            view: camera.view_matrix(),
            inv_proj: camera.projection_matrix().inverse(),
            depth_planes: &planes,
            depth: Some(&depth),
            lights: &lights,
        });
        assert_eq!(result.total_assignments(), 0);
    }

    #[test]
    fn test_surface_depth_limits_range() {
        let camera = camera();
        // Surface 10 units away, one light hugging it and one far behind it.
        let surface = camera.ndc_depth(10.0);
        let lights = [
            PointLight::new(Vec3::new(0.0, 0.0, 0.5), 1.0, Vec3::ONE),
            PointLight::new(Vec3::new(0.0, 0.0, -30.0), 1.0, Vec3::ONE),
        ];
        let params = params(64, 64, 64, lights.len());
        let policy = SlotCapacityPolicy::new(CullingMode::Tile, &CapacityConfig::default());
        let planes = camera.depth_planes(1);
        let depth = DepthImage::new(64, 64, surface);
        let inputs = CullInputs {
            params,
            policy,
            view: camera.view_matrix(),
            inv_proj: camera.projection_matrix().inverse(),
            depth_planes: &planes,
            depth: Some(&depth),
            lights: &lights,
        };
        let result = cull_lights(&inputs);
        assert_eq!(result.lights(0), &[0]);

        let without_depth = cull_lights(&CullInputs { depth: None, ..inputs });
        assert_eq!(without_depth.lights(0), &[0, 1]);
    }

    #[test]
    fn test_overflow_is_clamped() {
        let camera = camera();
        let lights: Vec<PointLight> = (0..300)
            .map(|i| PointLight::new(Vec3::new(0.0, 0.0, -(i as f32) * 0.01), 20.0, Vec3::ONE))
            .collect();
        let params = params(32, 32, 32, lights.len());
        let policy = SlotCapacityPolicy::new(CullingMode::Tile, &CapacityConfig::default());
        let planes = camera.depth_planes(1);
        let result = cull_lights(&CullInputs {
            params,
            policy,
            view: camera.view_matrix(),
            inv_proj: camera.projection_matrix().inverse(),
            depth_planes: &planes,
            depth: None,
            lights: &lights,
        });
        let slot = result.slot(0).unwrap();
        assert_eq!(slot.counter, MAX_LIGHTS_PER_CLUSTER);
        let expected: Vec<u32> = (0..MAX_LIGHTS_PER_CLUSTER).collect();
        assert_eq!(slot.lights(), expected.as_slice());
    }

    #[test]
    fn test_repeated_pass_is_bit_identical() {
        let camera = camera();
        let lights: Vec<PointLight> = (0..400)
            .map(|i| {
                let angle = i as f32 * 0.37;
                let ring = 1.0 + (i % 7) as f32;
                PointLight::new(
                    Vec3::new(angle.cos() * ring, (i % 5) as f32 - 2.0, angle.sin() * ring),
                    0.5 + (i % 3) as f32,
                    Vec3::ONE,
                )
            })
            .collect();
        let params = ClusterParams {
            depth_dim: 4,
            ..params(128, 128, 16, lights.len())
        };
        let policy = SlotCapacityPolicy::new(CullingMode::Triangle, &CapacityConfig::default());
        let planes = camera.depth_planes(4);
        let depth = DepthImage::from_fn(128, 128, |x, y| {
            if (x / 9 + y / 13) % 4 == 0 {
                1.0
            } else {
                camera.ndc_depth(8.0 + (x % 11) as f32 * 0.3 + (y % 5) as f32 * 0.2)
            }
        });
        let inputs = CullInputs {
            params,
            policy,
            view: camera.view_matrix(),
            inv_proj: camera.projection_matrix().inverse(),
            depth_planes: &planes,
            depth: Some(&depth),
            lights: &lights,
        };

        let first = cull_lights(&inputs);
        let second = cull_lights(&inputs);
        assert!(first.total_assignments() > 0);
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_crowded_triangle_cells_stay_bounded_and_ascending() {
        let camera = camera();
        // Every light covers the whole view, so each covered cell overflows.
        let lights: Vec<PointLight> = (0..320)
            .map(|i| PointLight::new(Vec3::new(0.0, 0.0, (i % 10) as f32 * 0.1), 40.0, Vec3::ONE))
            .collect();
        let params = ClusterParams {
            depth_dim: 2,
            ..params(64, 64, 32, lights.len())
        };
        let policy = SlotCapacityPolicy::new(CullingMode::Triangle, &CapacityConfig::default());
        let planes = camera.depth_planes(2);
        let result = cull_lights(&CullInputs {
            params,
            policy,
            view: camera.view_matrix(),
            inv_proj: camera.projection_matrix().inverse(),
            depth_planes: &planes,
            depth: None,
            lights: &lights,
        });

        let expected: Vec<u32> = (0..MAX_LIGHTS_PER_CLUSTER).collect();
        assert_eq!(result.len(), 2 * 2 * 2 * 2);
        for index in 0..result.len() {
            let slot = result.slot(index).unwrap();
            assert_eq!(slot.counter, MAX_LIGHTS_PER_CLUSTER, "slot {index}");
            assert_eq!(slot.lights(), expected.as_slice(), "slot {index}");
        }
    }
}
