//! Resource formats, usage flags and pipeline state shared by every backend

use bitflags::bitflags;
use std::fmt;

/// Pixel formats the renderer allocates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Albedo, specular and back buffers
    Rgba8Unorm,
    /// G-buffer normals
    Rgba16Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        *self == TextureFormat::Depth32Float
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }
}

bitflags! {
    /// How a texture may be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        /// Read in shaders with `textureLoad`.
        const TEXTURE_BINDING = 1 << 1;
        const RENDER_ATTACHMENT = 1 << 2;
    }
}

bitflags! {
    /// How a buffer may be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
        /// CPU readback target.
        const MAP_READ = 1 << 6;
        /// Destination of resolved timestamp queries.
        const QUERY_RESOLVE = 1 << 7;
    }
}

bitflags! {
    /// Shader stages that can see a binding. Bits match `wgpu::ShaderStages`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const VERTEX_FRAGMENT = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

/// Where a buffer lives.
///
/// `Upload` buffers are CPU-writable staging memory. Steady-state rendering
/// only reads `DeviceLocal` buffers; upload buffers reach the GPU-local heap
/// through the promotion manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLocation {
    Upload,
    #[default]
    DeviceLocal,
}

#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDescriptor {
    /// A render target that later passes read with `textureLoad`.
    pub fn render_target(label: &str, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: Some(label.to_string()),
            width,
            height,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

impl BufferDescriptor {
    pub fn new(label: &str, size: u64, usage: BufferUsage) -> Self {
        Self {
            label: Some(label.to_string()),
            size,
            usage,
            location: MemoryLocation::DeviceLocal,
        }
    }

    /// Staging buffer that can later be copied to device-local memory.
    pub fn upload(label: &str, size: u64, usage: BufferUsage) -> Self {
        Self {
            location: MemoryLocation::Upload,
            ..Self::new(label, size, usage | BufferUsage::COPY_SRC)
        }
    }
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Uint32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// One per-vertex buffer binding
#[derive(Debug, Clone)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub attributes: Vec<VertexAttribute>,
}

/// Depth test of a pipeline with a depth attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthCompare {
    /// Depth pre-pass
    Less,
    /// Passes that re-draw the pre-pass geometry
    LessEqual,
}

/// Color blending of one render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Replace,
    /// One + One on color, max on alpha. Accumulates light contributions.
    Additive,
}

/// Hardware queue a command list is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Copy,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueKind::Graphics => "graphics",
            QueueKind::Compute => "compute",
            QueueKind::Copy => "copy",
        })
    }
}

/// Access state of a GPU resource, changed only by explicit transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    RenderTarget,
    DepthWrite,
    DepthRead,
    ShaderRead,
    UnorderedAccess,
}

/// Identity of the adapter a device was created on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterIdentity {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub backend: String,
}

impl fmt::Display for AdapterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x}, {})",
            self.name, self.vendor, self.device, self.backend
        )
    }
}

/// Health of the logical device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    Removed(String),
}
