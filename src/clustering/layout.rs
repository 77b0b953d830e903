//! GPU layouts shared by the culling kernels and the accumulation shaders
//!
//! These structs are bit-for-bit the WGSL structs of the same name. Their
//! sizes are checked at compile time.

use crate::config::{CapacityConfig, CullingMode};
use bytemuck::{Pod, Zeroable};

/// Capacity of one light index slot
pub const MAX_LIGHTS_PER_CLUSTER: u32 = 255;

/// Lights the culling kernels can address (one workgroup bitmask bit each)
pub const MAX_LIGHTS: u32 = 2048;

/// `u32` words in a per-cell light bitmask
pub const LIGHT_MASK_WORDS: u32 = MAX_LIGHTS / 32;

/// Size of the clustering parameter uniform buffer
pub const CLUSTER_PARAMS_BUFFER_SIZE: u64 = 32;

/// Clustering parameters, read by the culling and accumulation shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct ClusterParams {
    pub width_dim: u32,
    pub height_dim: u32,
    pub light_num: u32,
    pub depth_dim: u32,
    pub tile_size_x: f32,
    pub tile_size_y: f32,
}

const _: () = assert!(std::mem::size_of::<ClusterParams>() == 24);
const _: () = assert!(std::mem::size_of::<ClusterParams>() as u64 <= CLUSTER_PARAMS_BUFFER_SIZE);

impl ClusterParams {
    /// Number of tiles in the grid, all slices included
    pub fn tile_count(&self) -> u32 {
        self.width_dim * self.height_dim * self.depth_dim
    }

    /// Linear tile index
    pub fn tile_index(&self, x: u32, y: u32, z: u32) -> u32 {
        (z * self.height_dim + y) * self.width_dim + x
    }

    /// Grid coordinates of tile `index`
    pub fn tile_coords(&self, index: u32) -> (u32, u32, u32) {
        let x = index % self.width_dim;
        let y = (index / self.width_dim) % self.height_dim;
        let z = index / (self.width_dim * self.height_dim);
        (x, y, z)
    }
}

/// Per-cell light list: a counter followed by a fixed index array.
///
/// `counter` never exceeds [`MAX_LIGHTS_PER_CLUSTER`]; entries at and past
/// `counter` are zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightIndexSlot {
    pub counter: u32,
    pub light_indices: [u32; MAX_LIGHTS_PER_CLUSTER as usize],
}

const _: () = assert!(std::mem::size_of::<LightIndexSlot>() == 1024);

impl Default for LightIndexSlot {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl LightIndexSlot {
    /// Append a light, dropping it once the slot is full.
    pub fn push(&mut self, light: u32) -> bool {
        if self.counter >= MAX_LIGHTS_PER_CLUSTER {
            return false;
        }
        self.light_indices[self.counter as usize] = light;
        self.counter += 1;
        true
    }

    pub fn lights(&self) -> &[u32] {
        let count = self.counter.min(MAX_LIGHTS_PER_CLUSTER) as usize;
        &self.light_indices[..count]
    }
}

/// Maps a culling mode to the number of light index slots reserved per tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCapacityPolicy {
    mode: CullingMode,
    slots_per_tile: u32,
}

impl SlotCapacityPolicy {
    pub fn new(mode: CullingMode, capacity: &CapacityConfig) -> Self {
        Self {
            mode,
            slots_per_tile: capacity.slots_per_tile(mode).max(mode.cells_per_tile()),
        }
    }

    pub fn mode(&self) -> CullingMode {
        self.mode
    }

    /// Cells the kernel fills per tile
    pub fn cells_per_tile(&self) -> u32 {
        self.mode.cells_per_tile()
    }

    /// Stride between consecutive tiles in the slot array
    pub fn slots_per_tile(&self) -> u32 {
        self.slots_per_tile
    }

    pub fn slot_count(&self, params: &ClusterParams) -> u32 {
        params.tile_count() * self.slots_per_tile
    }

    /// Slot of cell `cell` (triangle parity in triangle mode) of tile `tile_index`
    pub fn slot_index(&self, tile_index: u32, cell: u32) -> u32 {
        tile_index * self.slots_per_tile + cell
    }
}

/// Grid resolution for a viewport: the nearest whole tile count per axis,
/// and the resulting tile size in pixels.
pub fn grid_for_viewport(width: u32, height: u32, tile_size: u32) -> (u32, u32, f32, f32) {
    let tile = tile_size.max(1) as f32;
    let grid_x = ((width as f32 / tile + 0.5) as u32).max(1);
    let grid_y = ((height as f32 / tile + 0.5) as u32).max(1);
    (
        grid_x,
        grid_y,
        width as f32 / grid_x as f32,
        height as f32 / grid_y as f32,
    )
}

/// CPU copy of the light index buffer
#[derive(Debug, Clone, PartialEq)]
pub struct LightIndexBuffer {
    slots: Vec<LightIndexSlot>,
}

impl LightIndexBuffer {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![LightIndexSlot::default(); slot_count],
        }
    }

    /// Decode a buffer read back from the GPU. Trailing partial slots are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let slot_size = std::mem::size_of::<LightIndexSlot>();
        let whole = bytes.len() / slot_size * slot_size;
        Self {
            slots: bytemuck::pod_collect_to_vec(&bytes[..whole]),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.slots)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&LightIndexSlot> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[LightIndexSlot] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [LightIndexSlot] {
        &mut self.slots
    }

    /// Lights listed in slot `index`
    pub fn lights(&self, index: usize) -> &[u32] {
        self.slots.get(index).map(LightIndexSlot::lights).unwrap_or(&[])
    }

    /// Counter of every slot
    pub fn counts(&self) -> Vec<u32> {
        self.slots.iter().map(|slot| slot.counter).collect()
    }

    pub fn total_assignments(&self) -> u64 {
        self.slots.iter().map(|slot| slot.counter as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_rounds_to_nearest_tile_count() {
        assert_eq!(grid_for_viewport(1280, 720, 32), (40, 23, 32.0, 720.0 / 23.0));
        let (gx, gy, tx, ty) = grid_for_viewport(100, 47, 32);
        assert_eq!((gx, gy), (3, 1));
        assert!((tx * gx as f32 - 100.0).abs() < 1e-3);
        assert!((ty * gy as f32 - 47.0).abs() < 1e-3);
    }

    #[test]
    fn test_grid_never_empty() {
        let (gx, gy, tx, ty) = grid_for_viewport(8, 8, 64);
        assert_eq!((gx, gy), (1, 1));
        assert_eq!((tx, ty), (8.0, 8.0));
    }

    #[test]
    fn test_slot_push_clamps() {
        let mut slot = LightIndexSlot::default();
        for light in 0..MAX_LIGHTS_PER_CLUSTER {
            assert!(slot.push(light));
        }
        assert!(!slot.push(999));
        assert_eq!(slot.counter, MAX_LIGHTS_PER_CLUSTER);
        assert_eq!(slot.lights().len(), MAX_LIGHTS_PER_CLUSTER as usize);
    }

    #[test]
    fn test_slot_addressing() {
        let params = ClusterParams {
            width_dim: 4,
            height_dim: 3,
            depth_dim: 2,
            ..Default::default()
        };
        let policy = SlotCapacityPolicy::new(CullingMode::Triangle, &CapacityConfig::default());
        assert_eq!(policy.slot_count(&params), 4 * 3 * 2 * 2);

        let tile = params.tile_index(1, 2, 1);
        assert_eq!(tile, (1 * 3 + 2) * 4 + 1);
        assert_eq!(params.tile_coords(tile), (1, 2, 1));
        assert_eq!(policy.slot_index(tile, 1), tile * 2 + 1);
    }

    #[test]
    fn test_capacity_is_configurable() {
        let capacity = CapacityConfig { tile: 3, triangle: 2 };
        let policy = SlotCapacityPolicy::new(CullingMode::Tile, &capacity);
        assert_eq!(policy.slots_per_tile(), 3);
        assert_eq!(policy.cells_per_tile(), 1);
    }

    #[test]
    fn test_buffer_from_bytes() {
        let mut buffer = LightIndexBuffer::new(2);
        buffer.slots_mut()[1].push(7);
        let decoded = LightIndexBuffer::from_bytes(buffer.as_bytes());
        assert_eq!(decoded, buffer);
        assert_eq!(decoded.lights(1), &[7]);
        assert_eq!(decoded.lights(5), &[] as &[u32]);
    }

    #[test]
    fn test_buffer_from_unaligned_readback() {
        let mut buffer = LightIndexBuffer::new(3);
        buffer.slots_mut()[2].push(11);
        buffer.slots_mut()[2].push(4);

        // Offset by one byte and leave a partial slot at the end.
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(buffer.as_bytes());
        bytes.extend_from_slice(&[0xff; 9]);
        let decoded = LightIndexBuffer::from_bytes(&bytes[1..]);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.lights(2), &[11, 4]);
    }
}
