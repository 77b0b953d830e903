//! Material data and its GPU layout
//!
//! Materials reach the shaders as one storage buffer of [`GpuMaterial`]
//! records. Reading a record back on the CPU goes through a
//! [`MaterialSchema`], which names every property with its offset and type,
//! so bytes are only ever decoded as the type they were written with.

use crate::resources::promotion::{BindingSlot, PromotionManager, PromotionTarget, ResourceGeneration};
use crate::error::RendererResult;
use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use std::fmt;
use thiserror::Error;

/// Sentinel for "no albedo texture"
pub const NO_TEXTURE: u32 = u32::MAX;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaterialError {
    #[error("material property '{0}' does not exist")]
    UnknownProperty(String),
    #[error("material property '{name}' is {actual}, read as {requested}")]
    TypeMismatch {
        name: String,
        actual: PropertyType,
        requested: PropertyType,
    },
    #[error("material record of {len} bytes is too short for property '{name}'")]
    OutOfBounds { name: String, len: usize },
    #[error("material index {index} out of range ({count} materials)")]
    IndexOutOfRange { index: usize, count: usize },
}

/// Type of one material property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    F32,
    U32,
    Vec3,
    Vec4,
}

impl PropertyType {
    pub fn size(&self) -> usize {
        match self {
            PropertyType::F32 | PropertyType::U32 => 4,
            PropertyType::Vec3 => 12,
            PropertyType::Vec4 => 16,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::F32 => "f32",
            PropertyType::U32 => "u32",
            PropertyType::Vec3 => "vec3<f32>",
            PropertyType::Vec4 => "vec4<f32>",
        };
        f.write_str(name)
    }
}

/// Location and type of one property inside a material record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDesc {
    pub name: &'static str,
    pub offset: usize,
    pub ty: PropertyType,
}

impl PropertyDesc {
    pub const fn new(name: &'static str, offset: usize, ty: PropertyType) -> Self {
        Self { name, offset, ty }
    }

    pub fn end(&self) -> usize {
        self.offset + self.ty.size()
    }
}

/// Layout of a material record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialSchema {
    stride: usize,
    properties: Vec<PropertyDesc>,
}

impl MaterialSchema {
    pub fn new(stride: usize, properties: Vec<PropertyDesc>) -> Self {
        Self { stride, properties }
    }

    /// Schema of [`GpuMaterial`]
    pub fn standard() -> Self {
        Self::new(
            std::mem::size_of::<GpuMaterial>(),
            vec![
                PropertyDesc::new("albedo", 0, PropertyType::Vec3),
                PropertyDesc::new("specular", 16, PropertyType::Vec3),
                PropertyDesc::new("gloss", 28, PropertyType::F32),
                PropertyDesc::new("albedo_map_index", 32, PropertyType::U32),
            ],
        )
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn properties(&self) -> &[PropertyDesc] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDesc> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Typed view of record `index` inside `bytes`.
    pub fn view<'a>(&'a self, bytes: &'a [u8], index: usize) -> Result<MaterialView<'a>, MaterialError> {
        let count = if self.stride == 0 { 0 } else { bytes.len() / self.stride };
        if index >= count {
            return Err(MaterialError::IndexOutOfRange { index, count });
        }
        let start = index * self.stride;
        Ok(MaterialView {
            schema: self,
            bytes: &bytes[start..start + self.stride],
        })
    }
}

/// A value that can be decoded from a material property.
pub trait MaterialValue: Sized {
    const TYPE: PropertyType;

    fn decode(bytes: &[u8]) -> Self;
}

impl MaterialValue for f32 {
    const TYPE: PropertyType = PropertyType::F32;

    fn decode(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..4])
    }
}

impl MaterialValue for u32 {
    const TYPE: PropertyType = PropertyType::U32;

    fn decode(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..4])
    }
}

impl MaterialValue for Vec3 {
    const TYPE: PropertyType = PropertyType::Vec3;

    fn decode(bytes: &[u8]) -> Self {
        Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(&bytes[..12]))
    }
}

impl MaterialValue for Vec4 {
    const TYPE: PropertyType = PropertyType::Vec4;

    fn decode(bytes: &[u8]) -> Self {
        Vec4::from_array(bytemuck::pod_read_unaligned::<[f32; 4]>(&bytes[..16]))
    }
}

/// Borrowed material record decoded through its schema
#[derive(Debug, Clone, Copy)]
pub struct MaterialView<'a> {
    schema: &'a MaterialSchema,
    bytes: &'a [u8],
}

impl<'a> MaterialView<'a> {
    pub fn get<T: MaterialValue>(&self, name: &str) -> Result<T, MaterialError> {
        let desc = self
            .schema
            .property(name)
            .ok_or_else(|| MaterialError::UnknownProperty(name.to_string()))?;
        if desc.ty != T::TYPE {
            return Err(MaterialError::TypeMismatch {
                name: name.to_string(),
                actual: desc.ty,
                requested: T::TYPE,
            });
        }
        if desc.end() > self.bytes.len() {
            return Err(MaterialError::OutOfBounds {
                name: name.to_string(),
                len: self.bytes.len(),
            });
        }
        Ok(T::decode(&self.bytes[desc.offset..desc.end()]))
    }
}

/// GPU material record, 48 bytes, matching `Material` in the G-buffer shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuMaterial {
    pub albedo: [f32; 3],
    pub _pad0: u32,
    pub specular: [f32; 3],
    pub gloss: f32,
    pub albedo_map_index: u32,
    pub _pad1: [u32; 3],
}

const _: () = assert!(std::mem::size_of::<GpuMaterial>() == 48);

/// Blinn-Phong material as supplied by a scene
#[derive(Debug, Clone, PartialEq)]
pub struct StandardMaterial {
    pub name: String,
    pub albedo: Vec3,
    pub specular: Vec3,
    /// Specular exponent
    pub gloss: f32,
    /// Index into the scene's texture table. Texture sampling is not wired up;
    /// the index is carried through to the GPU record only.
    pub albedo_map: Option<u32>,
}

impl Default for StandardMaterial {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            albedo: Vec3::splat(0.8),
            specular: Vec3::splat(0.5),
            gloss: 32.0,
            albedo_map: None,
        }
    }
}

impl StandardMaterial {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_albedo(mut self, albedo: Vec3) -> Self {
        self.albedo = albedo;
        self
    }

    pub fn with_specular(mut self, specular: Vec3, gloss: f32) -> Self {
        self.specular = specular;
        self.gloss = gloss;
        self
    }

    pub fn with_albedo_map(mut self, index: u32) -> Self {
        self.albedo_map = Some(index);
        self
    }

    pub fn matte(color: Vec3) -> Self {
        Self::new("matte")
            .with_albedo(color)
            .with_specular(Vec3::splat(0.05), 4.0)
    }

    pub fn glossy(color: Vec3) -> Self {
        Self::new("glossy")
            .with_albedo(color)
            .with_specular(Vec3::splat(0.8), 96.0)
    }

    pub fn to_gpu(&self) -> GpuMaterial {
        GpuMaterial {
            albedo: self.albedo.to_array(),
            _pad0: 0,
            specular: self.specular.to_array(),
            gloss: self.gloss,
            albedo_map_index: self.albedo_map.unwrap_or(NO_TEXTURE),
            _pad1: [0; 3],
        }
    }
}

/// Encode materials into the GPU buffer layout. An empty list encodes one
/// default material so the buffer is never empty.
pub fn encode_materials(materials: &[StandardMaterial]) -> Vec<GpuMaterial> {
    if materials.is_empty() {
        return vec![StandardMaterial::default().to_gpu()];
    }
    materials.iter().map(StandardMaterial::to_gpu).collect()
}

/// Owner of the material buffer bound by the G-buffer pass.
///
/// The previous buffer stays alive for one replacement so frames still in
/// flight keep a valid binding. Every replacement bumps the resource
/// generation, which marks prerecorded bundles stale.
pub struct MaterialLibrary {
    schema: MaterialSchema,
    generation: ResourceGeneration,
    records: Vec<GpuMaterial>,
    current: Option<BindingSlot>,
    previous: Option<BindingSlot>,
}

impl MaterialLibrary {
    pub fn new(generation: ResourceGeneration) -> Self {
        Self {
            schema: MaterialSchema::standard(),
            generation,
            records: Vec::new(),
            current: None,
            previous: None,
        }
    }

    /// Upload a new material set and queue it for promotion.
    ///
    /// Returns the binding that fell out of the retention window; its buffer
    /// should be released once no frame uses it.
    pub fn replace(
        &mut self,
        promotion: &PromotionManager,
        materials: &[StandardMaterial],
    ) -> RendererResult<Option<BindingSlot>> {
        let records = encode_materials(materials);
        let binding = promotion.upload(
            "materials",
            bytemuck::cast_slice(&records),
            PromotionTarget::Descriptor,
        )?;
        self.records = records;

        let evicted = self.previous.take();
        self.previous = self.current.replace(binding);
        let generation = self.generation.bump();
        log::debug!(
            "material set replaced: {} materials (resource generation {})",
            self.records.len(),
            generation
        );
        Ok(evicted)
    }

    pub fn binding(&self) -> Option<&BindingSlot> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&BindingSlot> {
        self.previous.as_ref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn schema(&self) -> &MaterialSchema {
        &self.schema
    }

    /// CPU copy of material `index`, decoded through the schema
    pub fn view(&self, index: usize) -> Result<MaterialView<'_>, MaterialError> {
        self.schema
            .view(bytemuck::cast_slice(&self.records), index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, GpuContext};
    use std::time::Duration;

    #[test]
    fn test_schema_matches_struct_layout() {
        let schema = MaterialSchema::standard();
        assert_eq!(schema.stride(), 48);
        for property in schema.properties() {
            assert!(property.end() <= schema.stride(), "{} overflows", property.name);
        }
        assert_eq!(
            schema.property("gloss").map(|p| p.offset),
            Some(std::mem::offset_of!(GpuMaterial, gloss))
        );
        assert_eq!(
            schema.property("albedo_map_index").map(|p| p.offset),
            Some(std::mem::offset_of!(GpuMaterial, albedo_map_index))
        );
    }

    #[test]
    fn test_typed_decode() {
        let material = StandardMaterial::new("red")
            .with_albedo(Vec3::new(1.0, 0.0, 0.0))
            .with_specular(Vec3::splat(0.25), 64.0)
            .with_albedo_map(3);
        let records = encode_materials(&[StandardMaterial::default(), material]);
        let schema = MaterialSchema::standard();
        let view = schema.view(bytemuck::cast_slice(&records), 1).unwrap();

        assert_eq!(view.get::<Vec3>("albedo").unwrap(), Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(view.get::<Vec3>("specular").unwrap(), Vec3::splat(0.25));
        assert_eq!(view.get::<f32>("gloss").unwrap(), 64.0);
        assert_eq!(view.get::<u32>("albedo_map_index").unwrap(), 3);
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let records = encode_materials(&[]);
        let schema = MaterialSchema::standard();
        let view = schema.view(bytemuck::cast_slice(&records), 0).unwrap();

        assert_eq!(
            view.get::<u32>("gloss").unwrap_err(),
            MaterialError::TypeMismatch {
                name: "gloss".to_string(),
                actual: PropertyType::F32,
                requested: PropertyType::U32,
            }
        );
        assert!(matches!(
            view.get::<f32>("roughness"),
            Err(MaterialError::UnknownProperty(_))
        ));
        assert_eq!(view.get::<u32>("albedo_map_index").unwrap(), NO_TEXTURE);
    }

    #[test]
    fn test_view_index_out_of_range() {
        let records = encode_materials(&[]);
        let schema = MaterialSchema::standard();
        assert!(matches!(
            schema.view(bytemuck::cast_slice(&records), 1),
            Err(MaterialError::IndexOutOfRange { index: 1, count: 1 })
        ));
    }

    #[test]
    fn test_replace_keeps_previous_and_bumps_generation() {
        let ctx = GpuContext::new(Box::new(DummyBackend::new()), Duration::from_secs(1));
        let generation = ResourceGeneration::new();
        let promotion = PromotionManager::new(ctx, generation.clone());
        let mut library = MaterialLibrary::new(generation.clone());

        assert!(library.replace(&promotion, &[StandardMaterial::default()]).unwrap().is_none());
        let first = library.binding().map(BindingSlot::buffer);
        assert!(library.replace(&promotion, &[StandardMaterial::default()]).unwrap().is_none());
        assert_eq!(library.previous().map(BindingSlot::buffer), first);

        let evicted = library.replace(&promotion, &[]).unwrap();
        assert_eq!(evicted.map(|b| b.buffer()), first);
        assert_eq!(generation.current(), 3);
        assert_eq!(library.len(), 1);
    }
}
