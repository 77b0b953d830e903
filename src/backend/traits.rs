//! Core backend abstraction traits
//!
//! These traits define the interface that both the wgpu backend and the
//! recording dummy backend implement.

use crate::backend::command::{BundleCommand, CommandList};
use crate::backend::sync::{SubmitInfo, SyncError};
use crate::backend::types::*;
use thiserror::Error;

/// Errors reported by a backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("no usable GPU adapter: {0}")]
    NoAdapter(String),
    #[error("device request refused: {0}")]
    RequestDevice(String),
    #[error("could not create {kind}: {reason}")]
    Create { kind: &'static str, reason: String },
    #[error("buffer readback failed: {0}")]
    Readback(String),
    #[error("present failed: {0}")]
    Present(String),
    #[error("unknown {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },
    #[error("bad command stream in '{list}': {reason}")]
    InvalidCommand { list: String, reason: String },
    #[error("resource state mismatch: {0}")]
    StateMismatch(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("device lost: {0}")]
    DeviceLost(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

macro_rules! gpu_handles {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub(crate) u64);
        )*
    };
}

gpu_handles! {
    BufferHandle;
    TextureHandle;
    TextureViewHandle;
    RenderPipelineHandle;
    ComputePipelineHandle;
    BindGroupHandle;
    BindGroupLayoutHandle;
    /// Prerecorded draw commands, replayed inside a render pass
    RenderBundleHandle;
    /// Timestamp queries written at pass boundaries
    QuerySetHandle;
}

/// Resource bound at one binding index
#[derive(Debug, Clone)]
pub enum BindGroupEntry {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    Texture(TextureViewHandle),
}

impl BindGroupEntry {
    pub fn whole(buffer: BufferHandle) -> Self {
        BindGroupEntry::Buffer {
            buffer,
            offset: 0,
            size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStageFlags,
    pub ty: BindingType,
}

#[derive(Debug, Clone)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer { read_only: bool },
    /// Read with `textureLoad`; never sampled
    Texture { sample_type: TextureSampleType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureSampleType {
    /// Unfilterable float
    Float,
    Depth,
}

/// Render pipeline descriptor
///
/// Shader sources are WGSL. Every pipeline draws triangle lists with
/// counter-clockwise front faces and no face culling. A pipeline without a
/// fragment entry is depth only.
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    pub shader: String,
    pub vertex_entry: String,
    pub fragment_entry: Option<String>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub depth: Option<DepthState>,
    pub color_targets: Vec<ColorTarget>,
    /// Values for WGSL `override` declarations
    pub constants: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthState {
    pub format: TextureFormat,
    pub write: bool,
    pub compare: DepthCompare,
}

#[derive(Debug, Clone, Copy)]
pub struct ColorTarget {
    pub format: TextureFormat,
    pub blend: BlendMode,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub shader: String,
    pub entry_point: String,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    /// Values for WGSL `override` declarations
    pub constants: Vec<(String, f64)>,
}

/// Render bundle descriptor
///
/// The attachment formats must match the render pass the bundle is executed in.
#[derive(Debug, Clone)]
pub struct RenderBundleDescriptor {
    pub label: Option<String>,
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub depth_read_only: bool,
    pub commands: Vec<BundleCommand>,
}

/// Main graphics backend trait
///
/// Backends are owned by a [`GpuContext`](crate::backend::GpuContext) and are
/// only ever reached through it.
pub trait GraphicsBackend: Send {
    /// Human readable backend name
    fn name(&self) -> &'static str;

    /// Identity of the adapter the device was created on
    fn adapter_identity(&self) -> AdapterIdentity;

    /// Identity of the adapter the platform would pick now
    fn current_adapter_identity(&mut self) -> Option<AdapterIdentity>;

    /// Whether the logical device is still usable
    fn device_status(&mut self) -> DeviceStatus;

    // Resources

    /// Allocate a zero-initialized buffer in `desc.location`
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Allocate a buffer and fill it; `data` may be shorter than `desc.size`
    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle>;

    /// Descriptor a live buffer was created with
    fn buffer_descriptor(&self, buffer: BufferHandle) -> Option<BufferDescriptor>;

    /// Write data to a buffer.
    ///
    /// Writes are queue ordered: they land after every previous submission
    /// and before any later one.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> BackendResult<()>;

    /// Copy a buffer's contents back to the CPU, blocking until they are available
    fn read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Vec<u8>>;

    /// Copy a color texture back to the CPU as tightly packed rows, blocking
    /// until they are available. The texture needs `COPY_SRC` usage.
    fn read_texture(&mut self, texture: TextureHandle) -> BackendResult<Vec<u8>>;

    /// Allocate a 2D single-mip texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Full view of a texture, usable as attachment or shader input
    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle>;

    // Pipelines

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle>;

    /// Bind resources to a layout; `entries` pair binding indices with resources
    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle>;

    /// Compile WGSL and build a render pipeline, reporting validation errors
    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle>;

    /// Record a reusable render bundle
    fn create_render_bundle(
        &mut self,
        desc: &RenderBundleDescriptor,
    ) -> BackendResult<RenderBundleHandle>;

    // Timestamps

    /// Nanoseconds per timestamp tick, or `None` when the device cannot
    /// write timestamps at pass boundaries
    fn timestamp_period(&self) -> Option<f32>;

    /// Allocate `count` timestamp queries
    fn create_query_set(&mut self, label: &str, count: u32) -> BackendResult<QuerySetHandle>;

    // Submission

    /// Submit a recorded command list to its queue.
    ///
    /// The submission starts once every wait in `info` is reached and
    /// advances every signalled fence when it finishes.
    fn submit(&mut self, list: CommandList, info: SubmitInfo) -> BackendResult<()>;

    /// Process completed work and fire completion callbacks
    fn poll(&mut self);

    /// Present a finished back buffer
    fn present(&mut self, back_buffer: TextureHandle) -> BackendResult<()>;

    // Release. Callers defer these until the GPU is done with the resource;
    // unknown handles are ignored.

    fn destroy_buffer(&mut self, buffer: BufferHandle);
    fn destroy_texture(&mut self, texture: TextureHandle);
    fn destroy_render_bundle(&mut self, bundle: RenderBundleHandle);
    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle);
    fn destroy_query_set(&mut self, query_set: QuerySetHandle);
}
