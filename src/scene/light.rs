//! Point lights and the light store

use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, GpuContext};
use crate::error::RendererResult;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::sync::Arc;

/// Point light as laid out in the light buffer.
///
/// Tightly packed scalars, so the WGSL array stride is 28 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PointLight {
    pub radius: f32,
    pub position: [f32; 3],
    pub color: [f32; 3],
}

const _: () = assert!(std::mem::size_of::<PointLight>() == 28);

impl PointLight {
    pub fn new(position: Vec3, radius: f32, color: Vec3) -> Self {
        Self {
            radius,
            position: position.to_array(),
            color: color.to_array(),
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn color(&self) -> Vec3 {
        Vec3::from_array(self.color)
    }
}

/// Result of flushing a pending edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightUpload {
    pub count: u32,
    pub generation: u64,
}

/// Owner of the light list and the storage buffer the GPU reads it from.
///
/// Edits only touch the CPU list and raise the pending flag. The whole list
/// is re-uploaded by [`LightStore::flush`] at the frame boundary; the write
/// is queue ordered, so frames already submitted keep reading the old
/// contents.
pub struct LightStore {
    ctx: Arc<GpuContext>,
    lights: Vec<PointLight>,
    capacity: usize,
    buffer: BufferHandle,
    pending: bool,
    generation: u64,
}

impl LightStore {
    pub fn new(ctx: Arc<GpuContext>, capacity: usize) -> RendererResult<Self> {
        let size = (capacity.max(1) * std::mem::size_of::<PointLight>()) as u64;
        let buffer = ctx.backend().create_buffer(&BufferDescriptor::new(
            "point lights",
            size,
            BufferUsage::STORAGE | BufferUsage::COPY_DST,
        ))?;
        log::debug!("light store created with capacity {}", capacity);
        Ok(Self {
            ctx,
            lights: Vec::with_capacity(capacity),
            capacity,
            buffer,
            pending: false,
            generation: 0,
        })
    }

    /// Append a light. Does nothing once the store is full.
    pub fn add(&mut self, light: PointLight) -> bool {
        if self.lights.len() >= self.capacity {
            log::debug!("light store full ({}), light ignored", self.capacity);
            return false;
        }
        self.lights.push(light);
        self.mark_edited();
        true
    }

    pub fn remove(&mut self, index: usize) -> Option<PointLight> {
        if index >= self.lights.len() {
            return None;
        }
        let light = self.lights.remove(index);
        self.mark_edited();
        Some(light)
    }

    pub fn pop(&mut self) -> Option<PointLight> {
        let light = self.lights.pop()?;
        self.mark_edited();
        Some(light)
    }

    pub fn set(&mut self, index: usize, light: PointLight) -> bool {
        match self.lights.get_mut(index) {
            Some(slot) => {
                *slot = light;
                self.mark_edited();
                true
            }
            None => false,
        }
    }

    /// Replace the whole list, truncated to the capacity.
    pub fn replace_all(&mut self, lights: impl IntoIterator<Item = PointLight>) {
        self.lights.clear();
        self.lights
            .extend(lights.into_iter().take(self.capacity));
        self.mark_edited();
    }

    pub fn clear(&mut self) {
        self.lights.clear();
        self.mark_edited();
    }

    fn mark_edited(&mut self) {
        self.pending = true;
        self.generation += 1;
    }

    /// Upload the list if it changed since the last flush.
    pub fn flush(&mut self) -> RendererResult<Option<LightUpload>> {
        if !self.pending {
            return Ok(None);
        }
        if !self.lights.is_empty() {
            self.ctx
                .backend()
                .write_buffer(self.buffer, 0, bytemuck::cast_slice(&self.lights))?;
        }
        self.pending = false;
        log::debug!(
            "uploaded {} lights (generation {})",
            self.lights.len(),
            self.generation
        );
        Ok(Some(LightUpload {
            count: self.lights.len() as u32,
            generation: self.generation,
        }))
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, index: usize) -> Option<&PointLight> {
        self.lights.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PointLight> {
        self.lights.iter()
    }

    pub fn lights(&self) -> &[PointLight] {
        &self.lights
    }

    /// Storage buffer read by culling and accumulation
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub(crate) fn destroy(&mut self) {
        self.ctx.backend().destroy_buffer(self.buffer);
    }
}

/// Lay out `nx * ny * nz` lights evenly inside the box `min..max`.
///
/// Colors cycle through a fixed hue wheel so neighbouring lights differ.
pub fn grid_lights(nx: u32, ny: u32, nz: u32, min: Vec3, max: Vec3, radius: f32) -> Vec<PointLight> {
    let counts = [nx.max(1), ny.max(1), nz.max(1)];
    let step = (max - min) / Vec3::new(counts[0] as f32, counts[1] as f32, counts[2] as f32);
    let mut lights = Vec::with_capacity((counts[0] * counts[1] * counts[2]) as usize);
    for z in 0..counts[2] {
        for y in 0..counts[1] {
            for x in 0..counts[0] {
                let cell = Vec3::new(x as f32 + 0.5, y as f32 + 0.5, z as f32 + 0.5);
                let index = lights.len();
                lights.push(PointLight::new(min + cell * step, radius, hue_color(index)));
            }
        }
    }
    lights
}

fn hue_color(index: usize) -> Vec3 {
    const PALETTE: [[f32; 3]; 6] = [
        [1.0, 0.3, 0.3],
        [1.0, 0.8, 0.3],
        [0.4, 1.0, 0.4],
        [0.3, 0.9, 1.0],
        [0.4, 0.4, 1.0],
        [1.0, 0.4, 1.0],
    ];
    Vec3::from_array(PALETTE[index % PALETTE.len()])
}
