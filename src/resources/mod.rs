//! Resource management
//!
//! Upload-to-device promotion, material data and the shader library.

pub mod material;
pub mod promotion;
pub mod shader;

pub use material::{
    GpuMaterial, MaterialError, MaterialLibrary, MaterialSchema, MaterialValue, MaterialView,
    PropertyDesc, PropertyType, StandardMaterial,
};
pub use promotion::{
    BindingSlot, BufferBinding, CommitSummary, CopyReceipt, PromotionEntry, PromotionError,
    PromotionManager, PromotionTarget, ResourceGeneration,
};
pub use shader::{ShaderError, ShaderLibrary, ShaderObject};
