//! WGSL sources of the deferred passes
//!
//! The accumulation shaders share their bindings and shading code and only
//! differ in how a fragment finds its light index slot: a per-pixel tile
//! lookup under a full-screen triangle, or the flat slot attribute of the
//! expanded tile mesh.

/// WGSL layout of [`CameraUniform`](crate::scene::CameraUniform)
macro_rules! camera_wgsl {
    () => {
        r#"
struct Camera {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    inv_proj: mat4x4<f32>,
    position: vec4<f32>,
    near_far: vec4<f32>,
    viewport: vec4<f32>,
}
"#
    };
}

pub(crate) use camera_wgsl;

/// Depth pre-pass shader
pub const DEPTH_PREPASS_SHADER: &str = concat!(
    camera_wgsl!(),
    r#"
struct DepthOutput {
    @builtin(position) @invariant clip_position: vec4<f32>,
}

@group(0) @binding(0) var<uniform> camera: Camera;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> DepthOutput {
    var output: DepthOutput;
    output.clip_position = camera.view_proj * vec4<f32>(position, 1.0);
    return output;
}
"#
);

/// G-buffer fill shader
pub const GBUFFER_SHADER: &str = concat!(
    camera_wgsl!(),
    r#"
struct Material {
    albedo: vec3<f32>,
    _pad0: u32,
    specular: vec3<f32>,
    gloss: f32,
    albedo_map_index: u32,
    _pad1: u32,
    _pad2: u32,
    _pad3: u32,
}

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) material_index: u32,
}

struct VertexOutput {
    @builtin(position) @invariant clip_position: vec4<f32>,
    @location(0) world_normal: vec3<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) @interpolate(flat) material_index: u32,
}

struct GBufferOutput {
    @location(0) albedo: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) specular: vec4<f32>,
}

@group(0) @binding(0) var<uniform> camera: Camera;
@group(1) @binding(0) var<storage, read> materials: array<Material>;

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var output: VertexOutput;
    output.clip_position = camera.view_proj * vec4<f32>(input.position, 1.0);
    output.world_normal = input.normal;
    output.uv = input.uv;
    output.material_index = input.material_index;
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> GBufferOutput {
    let index = min(input.material_index, arrayLength(&materials) - 1u);
    let material = materials[index];

    var output: GBufferOutput;
    output.albedo = vec4<f32>(material.albedo, 1.0);
    output.normal = vec4<f32>(normalize(input.world_normal), 0.0);
    output.specular = vec4<f32>(material.specular, clamp(material.gloss / 256.0, 0.0, 1.0));
    return output;
}
"#
);

macro_rules! accumulate_common {
    () => {
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
    counter: u32,
    light_indices: array<u32, 255>,
}

struct Lighting {
    ambient: vec4<f32>,
}

// Slots reserved per tile
override SLOT_STRIDE: u32 = 2u;

const MAX_LIGHTS_PER_CLUSTER: u32 = 255u;

@group(0) @binding(0) var<uniform> camera: Camera;
@group(0) @binding(1) var<uniform> params: ClusterParams;
@group(0) @binding(2) var<storage, read> lights: array<PointLight>;
@group(0) @binding(3) var<storage, read> slots: array<LightIndexSlot>;
@group(0) @binding(4) var<storage, read> depth_planes: array<f32>;
@group(0) @binding(5) var gbuffer_albedo: texture_2d<f32>;
@group(0) @binding(6) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(7) var gbuffer_specular: texture_2d<f32>;
@group(0) @binding(8) var gbuffer_depth: texture_depth_2d;
@group(0) @binding(9) var<uniform> lighting: Lighting;

fn depth_slice(depth: f32) -> u32 {
    var slice = 0u;
    for (var i = 1u; i < params.depth_dim; i++) {
        if depth > depth_planes[i] {
            slice = i;
        }
    }
    return slice;
}

// Slot of the cell in slice 0 plus the offset of the pixel's depth slice.
fn slice_slot(slot: u32, depth: f32) -> u32 {
    let slice_stride = params.width_dim * params.height_dim * SLOT_STRIDE;
    return slot + depth_slice(depth) * slice_stride;
}

fn world_position(pixel: vec2<i32>, depth: f32) -> vec3<f32> {
    let uv = (vec2<f32>(pixel) + vec2<f32>(0.5)) * camera.viewport.zw;
    let ndc = vec4<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, depth, 1.0);
    let view = camera.inv_proj * ndc;
    let world = camera.inv_view * vec4<f32>(view.xyz / view.w, 1.0);
    return world.xyz;
}

fn shade(pixel: vec2<i32>, slot: u32) -> vec4<f32> {
    let albedo = textureLoad(gbuffer_albedo, pixel, 0).rgb;
    let depth = textureLoad(gbuffer_depth, pixel, 0);
    if depth >= 1.0 {
        return vec4<f32>(albedo, 1.0);
    }

    let normal = normalize(textureLoad(gbuffer_normal, pixel, 0).xyz);
    let specular = textureLoad(gbuffer_specular, pixel, 0);
    let gloss = max(specular.a * 256.0, 1.0);
    let position = world_position(pixel, depth);
    let to_eye = normalize(camera.position.xyz - position);

    var color = lighting.ambient.rgb * albedo;
    let cell = slice_slot(slot, depth);
    let count = min(slots[cell].counter, MAX_LIGHTS_PER_CLUSTER);
    for (var i = 0u; i < count; i++) {
        let light = lights[slots[cell].light_indices[i]];
        let to_light = vec3<f32>(light.pos_x, light.pos_y, light.pos_z) - position;
        let distance = length(to_light);
        if distance >= light.radius {
            continue;
        }
        let l = to_light / max(distance, 1e-4);
        let ratio = distance / light.radius;
        let falloff = (1.0 - ratio * ratio) * (1.0 - ratio * ratio);
        let n_dot_l = max(dot(normal, l), 0.0);
        let h = normalize(l + to_eye);
        let highlight = pow(max(dot(normal, h), 0.0), gloss) * specular.rgb * step(0.0001, n_dot_l);
        let light_color = vec3<f32>(light.color_r, light.color_g, light.color_b);
        color += light_color * falloff * (albedo * n_dot_l + highlight);
    }
    return vec4<f32>(color, 1.0);
}

// Blue (no lights) through green to red (16 or more).
fn count_ramp(pixel: vec2<i32>, slot: u32) -> vec4<f32> {
    let depth = textureLoad(gbuffer_depth, pixel, 0);
    if depth >= 1.0 {
        return vec4<f32>(0.0, 0.0, 0.0, 1.0);
    }
    let count = min(slots[slice_slot(slot, depth)].counter, MAX_LIGHTS_PER_CLUSTER);
    if count == 0u {
        return vec4<f32>(0.0, 0.0, 0.25, 1.0);
    }
    let t = clamp(f32(count) / 16.0, 0.0, 1.0);
    return vec4<f32>(t, 1.0 - abs(t * 2.0 - 1.0), 1.0 - t, 1.0);
}
"#
    };
}

/// Tile-mode accumulation: full-screen triangle, slot looked up per pixel
pub const ACCUMULATE_TILE_SHADER: &str = concat!(
    camera_wgsl!(),
    accumulate_common!(),
    r#"
struct FullscreenOutput {
    @builtin(position) position: vec4<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) vertex: u32) -> FullscreenOutput {
    let corner = vec2<f32>(f32((vertex << 1u) & 2u), f32(vertex & 2u));
    var output: FullscreenOutput;
    output.position = vec4<f32>(corner * 2.0 - 1.0, 0.0, 1.0);
    return output;
}

fn tile_slot(frag: vec2<f32>) -> u32 {
    let tile_size = vec2<f32>(params.tile_size_x, params.tile_size_y);
    let last = vec2<u32>(params.width_dim - 1u, params.height_dim - 1u);
    let tile = min(vec2<u32>(frag / tile_size), last);
    return (tile.y * params.width_dim + tile.x) * SLOT_STRIDE;
}

@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    return shade(vec2<i32>(input.position.xy), tile_slot(input.position.xy));
}

@fragment
fn fs_debug(input: FullscreenOutput) -> @location(0) vec4<f32> {
    return count_ramp(vec2<i32>(input.position.xy), tile_slot(input.position.xy));
}
"#
);

/// Triangle-mode accumulation: the expanded tile mesh carries each
/// triangle's slot as a flat attribute
pub const ACCUMULATE_TRIANGLE_SHADER: &str = concat!(
    camera_wgsl!(),
    accumulate_common!(),
    r#"
struct TileVertexInput {
    @location(0) position: vec4<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) slot: u32,
}

struct TileOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) @interpolate(flat) slot: u32,
}

@vertex
fn vs_main(input: TileVertexInput) -> TileOutput {
    var output: TileOutput;
    output.position = input.position;
    output.slot = input.slot;
    return output;
}

@fragment
fn fs_main(input: TileOutput) -> @location(0) vec4<f32> {
    return shade(vec2<i32>(input.position.xy), input.slot);
}

@fragment
fn fs_debug(input: TileOutput) -> @location(0) vec4<f32> {
    return count_ramp(vec2<i32>(input.position.xy), input.slot);
}
"#
);

/// Light preview: one sphere instance per light, offset to the light and
/// flat shaded in its color
pub const LIGHT_PREVIEW_SHADER: &str = concat!(
    camera_wgsl!(),
    r#"
struct PointLight {
    radius: f32,
    pos_x: f32,
    pos_y: f32,
    pos_z: f32,
    color_r: f32,
    color_g: f32,
    color_b: f32,
}

struct PreviewOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) @interpolate(flat) color: vec3<f32>,
}

@group(0) @binding(0) var<uniform> camera: Camera;
@group(0) @binding(1) var<storage, read> lights: array<PointLight>;

@vertex
fn vs_main(@location(0) position: vec3<f32>, @builtin(instance_index) instance: u32) -> PreviewOutput {
    let light = lights[instance];
    let world = position + vec3<f32>(light.pos_x, light.pos_y, light.pos_z);
    var output: PreviewOutput;
    output.clip_position = camera.view_proj * vec4<f32>(world, 1.0);
    output.color = vec3<f32>(light.color_r, light.color_g, light.color_b);
    return output;
}

@fragment
fn fs_main(input: PreviewOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(input.color, 1.0);
}
"#
);

/// Shaders registered by [`ShaderLibrary::with_builtins`](crate::resources::ShaderLibrary::with_builtins)
pub const BUILTIN_SHADERS: &[(&str, &str)] = &[
    ("depth_prepass", DEPTH_PREPASS_SHADER),
    ("gbuffer", GBUFFER_SHADER),
    ("accumulate_tile", ACCUMULATE_TILE_SHADER),
    ("accumulate_triangle", ACCUMULATE_TRIANGLE_SHADER),
    ("light_preview", LIGHT_PREVIEW_SHADER),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::shader::validate_wgsl;

    fn entry_points(name: &str, source: &str) -> Vec<String> {
        validate_wgsl(name, source)
            .unwrap()
            .entry_points
            .iter()
            .map(|ep| ep.name.clone())
            .collect()
    }

    #[test]
    fn test_builtin_shaders_validate() {
        for (name, source) in BUILTIN_SHADERS {
            assert!(
                validate_wgsl(name, source).is_ok(),
                "{name} failed validation"
            );
        }
    }

    #[test]
    fn test_accumulate_variants_share_entry_points() {
        for (name, source) in [
            ("accumulate_tile", ACCUMULATE_TILE_SHADER),
            ("accumulate_triangle", ACCUMULATE_TRIANGLE_SHADER),
        ] {
            let entries = entry_points(name, source);
            for entry in ["vs_main", "fs_main", "fs_debug"] {
                assert!(entries.iter().any(|e| e == entry), "{name} lacks {entry}");
            }
        }
    }

    #[test]
    fn test_depth_prepass_is_vertex_only() {
        assert_eq!(entry_points("depth_prepass", DEPTH_PREPASS_SHADER), vec!["vs_main"]);
    }

    #[test]
    fn test_light_preview_draws_with_its_own_entry_points() {
        let mut entries = entry_points("light_preview", LIGHT_PREVIEW_SHADER);
        entries.sort();
        assert_eq!(entries, vec!["fs_main", "vs_main"]);
    }
}
