//! Light culling kernels
//!
//! One workgroup handles one tile of one depth slice. The tile's cells are
//! its single quad (tile mode) or its two triangles (triangle mode):
//!
//! 1. Every thread folds a strided subset of the tile's pixels into the
//!    per-cell depth min/max.
//! 2. Every thread tests a strided subset of the lights against each
//!    non-empty cell and sets the hits in a per-cell bitmask.
//! 3. One thread per cell walks the bitmask in ascending order and appends
//!    the hits to the cell's slot through `atomicAdd`, undoing increments
//!    past capacity. The slot is rewritten completely, so no clear pass is
//!    needed and repeated runs give identical buffers.

use crate::pipeline::shaders::camera_wgsl;

/// Entry point for tile mode
pub const TILE_ENTRY: &str = "cull_tiles";
/// Entry point for triangle mode
pub const TRIANGLE_ENTRY: &str = "cull_triangles";

pub const LIGHT_CULLING_SHADER: &str = concat!(
    camera_wgsl!(),
    r#"
struct ClusterParams {
    width_dim: u32,
    height_dim: u32,
    light_num: u32,
    depth_dim: u32,
    tile_size_x: f32,
    tile_size_y: f32,
}

struct PointLight {
    radius: f32,
    pos_x: f32,
    pos_y: f32,
    pos_z: f32,
    color_r: f32,
    color_g: f32,
    color_b: f32,
}

struct LightIndexSlot {
    counter: atomic<u32>,
    light_indices: array<u32, 255>,
}

struct Cell {
    planes: array<vec3<f32>, 4>,
    plane_count: u32,
}

// Slots reserved per tile
override SLOT_STRIDE: u32 = 2u;

const MAX_LIGHTS_PER_CLUSTER: u32 = 255u;
const MASK_WORDS: u32 = 64u;
const GROUP_SIZE: u32 = 64u;
const EMPTY_DEPTH: u32 = 0x7f800000u;

@group(0) @binding(0) var<uniform> params: ClusterParams;
@group(0) @binding(1) var<uniform> camera: Camera;
@group(0) @binding(2) var<storage, read> lights: array<PointLight>;
@group(0) @binding(3) var<storage, read> depth_planes: array<f32>;
@group(0) @binding(4) var depth_texture: texture_depth_2d;
@group(0) @binding(5) var<storage, read_write> slots: array<LightIndexSlot>;

var<workgroup> depth_min: array<atomic<u32>, 2>;
var<workgroup> depth_max: array<atomic<u32>, 2>;
var<workgroup> light_mask: array<array<atomic<u32>, 64>, 2>;

fn eye_ray(uv: vec2<f32>) -> vec3<f32> {
    let p = camera.inv_proj * vec4<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, 1.0, 1.0);
    return p.xyz / p.w;
}

fn view_distance(depth: f32) -> f32 {
    let p = camera.inv_proj * vec4<f32>(0.0, 0.0, depth, 1.0);
    return -p.z / p.w;
}

// Side planes of the pyramid from the eye through the cell, facing inward.
fn build_cell(tile: vec2<u32>, cells: u32, cell: u32) -> Cell {
    let dims = vec2<f32>(f32(params.width_dim), f32(params.height_dim));
    let lo = vec2<f32>(tile) / dims;
    let hi = vec2<f32>(tile + vec2<u32>(1u, 1u)) / dims;

    var corners: array<vec2<f32>, 4>;
    var count = 4u;
    if cells == 1u {
        corners[0] = vec2<f32>(lo.x, lo.y);
        corners[1] = vec2<f32>(hi.x, lo.y);
        corners[2] = vec2<f32>(hi.x, hi.y);
        corners[3] = vec2<f32>(lo.x, hi.y);
    } else if cell == 0u {
        corners[0] = vec2<f32>(lo.x, lo.y);
        corners[1] = vec2<f32>(hi.x, lo.y);
        corners[2] = vec2<f32>(lo.x, hi.y);
        count = 3u;
    } else {
        corners[0] = vec2<f32>(hi.x, lo.y);
        corners[1] = vec2<f32>(hi.x, hi.y);
        corners[2] = vec2<f32>(lo.x, hi.y);
        count = 3u;
    }

    var rays: array<vec3<f32>, 4>;
    var centroid = vec3<f32>(0.0);
    for (var i = 0u; i < count; i++) {
        rays[i] = eye_ray(corners[i]);
        centroid += rays[i];
    }
    centroid = centroid / f32(count);

    var result: Cell;
    result.plane_count = count;
    for (var i = 0u; i < count; i++) {
        var n = cross(rays[i], rays[(i + 1u) % count]);
        let len = length(n);
        if len > 0.0 {
            n = n / len;
        }
        if dot(n, centroid) < 0.0 {
            n = -n;
        }
        result.planes[i] = n;
    }
    return result;
}

fn cull_tile(group: vec3<u32>, local: u32, cells: u32) {
    if local < cells {
        atomicStore(&depth_min[local], EMPTY_DEPTH);
        atomicStore(&depth_max[local], 0u);
    }
    for (var c = 0u; c < cells; c++) {
        atomicStore(&light_mask[c][local], 0u);
    }
    workgroupBarrier();

    // Surface depth range per cell, restricted to this slice.
    let z_lo = depth_planes[group.z];
    let z_hi = depth_planes[group.z + 1u];
    let tile_size = vec2<f32>(params.tile_size_x, params.tile_size_y);
    let origin = vec2<f32>(group.xy) * tile_size;
    let extent = origin + tile_size;
    let first = vec2<u32>(floor(origin));
    let last = min(vec2<u32>(ceil(extent)), textureDimensions(depth_texture));
    for (var py = first.y + local / 8u; py < last.y; py += 8u) {
        for (var px = first.x + local % 8u; px < last.x; px += 8u) {
            let center = vec2<f32>(f32(px), f32(py)) + vec2<f32>(0.5);
            if any(center < origin) || any(center >= extent) {
                continue;
            }
            var cell = 0u;
            if cells == 2u {
                let local_uv = (center - origin) / tile_size;
                if local_uv.x + local_uv.y > 1.0 {
                    cell = 1u;
                }
            }
            let depth = textureLoad(depth_texture, vec2<i32>(i32(px), i32(py)), 0);
            if depth >= 1.0 || depth < z_lo || depth > z_hi {
                continue;
            }
            atomicMin(&depth_min[cell], bitcast<u32>(depth));
            atomicMax(&depth_max[cell], bitcast<u32>(depth));
        }
    }
    workgroupBarrier();

    let light_count = min(params.light_num, MASK_WORDS * 32u);
    for (var c = 0u; c < cells; c++) {
        let lo_bits = atomicLoad(&depth_min[c]);
        if lo_bits == EMPTY_DEPTH {
            continue;
        }
        let near = view_distance(bitcast<f32>(lo_bits));
        let far = view_distance(bitcast<f32>(atomicLoad(&depth_max[c])));
        var cell = build_cell(group.xy, cells, c);
        for (var i = local; i < light_count; i += GROUP_SIZE) {
            let light = lights[i];
            let center = (camera.view * vec4<f32>(light.pos_x, light.pos_y, light.pos_z, 1.0)).xyz;
            var inside = true;
            for (var p = 0u; p < cell.plane_count; p++) {
                if dot(cell.planes[p], center) < -light.radius {
                    inside = false;
                    break;
                }
            }
            let distance = -center.z;
            if inside && distance + light.radius >= near && distance - light.radius <= far {
                atomicOr(&light_mask[c][i / 32u], 1u << (i % 32u));
            }
        }
    }
    workgroupBarrier();

    if local < cells {
        let tile = (group.z * params.height_dim + group.y) * params.width_dim + group.x;
        let slot = tile * SLOT_STRIDE + local;
        atomicStore(&slots[slot].counter, 0u);
        for (var w = 0u; w < MASK_WORDS; w++) {
            var bits = atomicLoad(&light_mask[local][w]);
            while bits != 0u {
                let bit = firstTrailingBit(bits);
                bits = bits & (bits - 1u);
                let index = atomicAdd(&slots[slot].counter, 1u);
                if index < MAX_LIGHTS_PER_CLUSTER {
                    slots[slot].light_indices[index] = w * 32u + bit;
                } else {
                    atomicSub(&slots[slot].counter, 1u);
                }
            }
        }
        let written = atomicLoad(&slots[slot].counter);
        for (var k = written; k < MAX_LIGHTS_PER_CLUSTER; k++) {
            slots[slot].light_indices[k] = 0u;
        }
    }
}

@compute @workgroup_size(8, 8, 1)
fn cull_tiles(
    @builtin(workgroup_id) group: vec3<u32>,
    @builtin(local_invocation_index) local: u32,
) {
    cull_tile(group, local, 1u);
}

@compute @workgroup_size(8, 8, 1)
fn cull_triangles(
    @builtin(workgroup_id) group: vec3<u32>,
    @builtin(local_invocation_index) local: u32,
) {
    cull_tile(group, local, 2u);
}
"#
);

/// Shaders registered by [`ShaderLibrary::with_builtins`](crate::resources::ShaderLibrary::with_builtins)
pub const BUILTIN_SHADERS: &[(&str, &str)] = &[("light_culling", LIGHT_CULLING_SHADER)];
