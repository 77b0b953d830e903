//! wgpu backend implementation
//!
//! Headless: the back buffers are ordinary render targets and `present` only
//! checks the device. wgpu exposes a single queue, so command lists for every
//! [`QueueKind`] land on it in submission order. [`GpuContext::submit`] holds a
//! consumer back until its producer has been submitted, which makes every
//! timeline wait hold by queue order alone. Timeline signals are advanced from
//! `on_submitted_work_done` callbacks, fired by `poll`.
//!
//! [`GpuContext::submit`]: crate::backend::GpuContext::submit

use crate::backend::command::*;
use crate::backend::sync::SubmitInfo;
use crate::backend::traits::*;
use crate::backend::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wgpu::util::{DeviceExt, RenderEncoder};

/// How often `current_adapter_identity` re-enumerates adapters
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    desc: BufferDescriptor,
}

/// wgpu backend implementation
pub struct WgpuBackend {
    instance: wgpu::Instance,
    backends: wgpu::Backends,
    device: wgpu::Device,
    queue: wgpu::Queue,
    identity: AdapterIdentity,
    lost: Arc<Mutex<Option<String>>>,
    adapter_check: Option<(Instant, AdapterIdentity)>,

    // Resource storage
    buffers: HashMap<u64, WgpuBuffer>,
    textures: HashMap<u64, wgpu::Texture>,
    texture_views: HashMap<u64, wgpu::TextureView>,
    bind_group_layouts: HashMap<u64, wgpu::BindGroupLayout>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,
    render_pipelines: HashMap<u64, wgpu::RenderPipeline>,
    compute_pipelines: HashMap<u64, wgpu::ComputePipeline>,
    render_bundles: HashMap<u64, wgpu::RenderBundle>,
    query_sets: HashMap<u64, wgpu::QuerySet>,
    timestamp_period: Option<f32>,
    next_id: u64,
    presents: u64,
}

impl WgpuBackend {
    fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        }
    }

    fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
        // Mappable buffers may only be copy destinations.
        if usage.contains(BufferUsage::MAP_READ) {
            return wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;
        }
        // Anything else stays readable for debugging and writable through the queue.
        let pairs = [
            (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
            (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
            (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
            (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
            (BufferUsage::QUERY_RESOLVE, wgpu::BufferUsages::QUERY_RESOLVE),
        ];
        pairs
            .into_iter()
            .filter(|(ours, _)| usage.contains(*ours))
            .fold(
                wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                |acc, (_, theirs)| acc | theirs,
            )
    }

    fn texture_usages(usage: TextureUsage) -> wgpu::TextureUsages {
        let pairs = [
            (TextureUsage::COPY_SRC, wgpu::TextureUsages::COPY_SRC),
            (TextureUsage::TEXTURE_BINDING, wgpu::TextureUsages::TEXTURE_BINDING),
            (TextureUsage::RENDER_ATTACHMENT, wgpu::TextureUsages::RENDER_ATTACHMENT),
        ];
        pairs
            .into_iter()
            .filter(|(ours, _)| usage.contains(*ours))
            .fold(wgpu::TextureUsages::empty(), |acc, (_, theirs)| acc | theirs)
    }

    fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
            VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        }
    }

    fn vertex_attributes(layout: &VertexBufferLayout) -> Vec<wgpu::VertexAttribute> {
        layout
            .attributes
            .iter()
            .map(|attribute| wgpu::VertexAttribute {
                format: Self::vertex_format(attribute.format),
                offset: attribute.offset,
                shader_location: attribute.location,
            })
            .collect()
    }

    fn binding_type(ty: &BindingType) -> wgpu::BindingType {
        let buffer = |ty| wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        };
        match *ty {
            BindingType::UniformBuffer => buffer(wgpu::BufferBindingType::Uniform),
            BindingType::StorageBuffer { read_only } => {
                buffer(wgpu::BufferBindingType::Storage { read_only })
            }
            BindingType::Texture { sample_type } => wgpu::BindingType::Texture {
                sample_type: match sample_type {
                    TextureSampleType::Float => wgpu::TextureSampleType::Float { filterable: false },
                    TextureSampleType::Depth => wgpu::TextureSampleType::Depth,
                },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
        }
    }

    fn depth_compare(compare: DepthCompare) -> wgpu::CompareFunction {
        match compare {
            DepthCompare::Less => wgpu::CompareFunction::Less,
            DepthCompare::LessEqual => wgpu::CompareFunction::LessEqual,
        }
    }

    fn blend_state(mode: BlendMode) -> Option<wgpu::BlendState> {
        let add = |operation| wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::One,
            operation,
        };
        match mode {
            BlendMode::Replace => None,
            BlendMode::Additive => Some(wgpu::BlendState {
                color: add(wgpu::BlendOperation::Add),
                alpha: add(wgpu::BlendOperation::Max),
            }),
        }
    }

    fn load_op<T>(op: &LoadOp, clear: impl FnOnce([f32; 4]) -> T) -> wgpu::LoadOp<T> {
        match op {
            LoadOp::Clear(color) => wgpu::LoadOp::Clear(clear(*color)),
            LoadOp::Load => wgpu::LoadOp::Load,
        }
    }

    fn store_op(op: StoreOp) -> wgpu::StoreOp {
        match op {
            StoreOp::Store => wgpu::StoreOp::Store,
            StoreOp::Discard => wgpu::StoreOp::Discard,
        }
    }

    fn identity_of(info: &wgpu::AdapterInfo) -> AdapterIdentity {
        AdapterIdentity {
            name: info.name.clone(),
            vendor: info.vendor,
            device: info.device,
            backend: format!("{:?}", info.backend),
        }
    }

    /// Create a device on the default high-performance adapter.
    ///
    /// Only the primary backends (Vulkan, Metal, DX12, browser WebGPU) are
    /// considered unless `WGPU_BACKEND` names others.
    pub fn new() -> BackendResult<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> BackendResult<Self> {
        let backends = wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::PRIMARY);
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::NoAdapter(format!("no adapter among {backends:?}")))?;

        let adapter_info = adapter.get_info();
        check_adapter(&adapter_info, &adapter.get_downlevel_capabilities())?;
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        // Pass timings are optional; without timestamps they are simply not reported.
        let required_features = adapter.features() & wgpu::Features::TIMESTAMP_QUERY;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Trilight Device"),
                    required_features,
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::RequestDevice(e.to_string()))?;

        let timestamp_period = required_features
            .contains(wgpu::Features::TIMESTAMP_QUERY)
            .then(|| queue.get_timestamp_period());
        log::debug!("GPU timestamp period: {:?} ns", timestamp_period);

        let lost = Arc::new(Mutex::new(None));
        let lost_flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("wgpu device lost ({:?}): {}", reason, message);
            *lost_flag.lock() = Some(format!("{reason:?}: {message}"));
        });
        let oom_flag = lost.clone();
        device.on_uncaptured_error(Box::new(move |error: wgpu::Error| {
            log::error!("wgpu error: {}", error);
            if let wgpu::Error::OutOfMemory { .. } = error {
                *oom_flag.lock() = Some("out of memory".to_string());
            }
        }));

        Ok(Self {
            instance,
            backends,
            device,
            queue,
            identity: Self::identity_of(&adapter_info),
            lost,
            adapter_check: None,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            render_bundles: HashMap::new(),
            query_sets: HashMap::new(),
            timestamp_period,
            next_id: 1,
            presents: 0,
        })
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_device(&self) -> BackendResult<()> {
        match &*self.lost.lock() {
            Some(reason) => Err(BackendError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Map a `MAP_READ` staging buffer once the queue reaches it, then free it.
    fn map_staging(&self, staging: &wgpu::Buffer) -> BackendResult<Vec<u8>> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| BackendError::Readback(e.to_string()))?
            .map_err(|e| BackendError::Readback(e.to_string()))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        staging.destroy();
        Ok(bytes)
    }

    fn buffer(&self, handle: BufferHandle) -> BackendResult<&wgpu::Buffer> {
        self.buffers
            .get(&handle.0)
            .map(|entry| &entry.buffer)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: handle.0,
            })
    }

    fn view(&self, handle: TextureViewHandle) -> BackendResult<&wgpu::TextureView> {
        self.texture_views
            .get(&handle.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "texture view",
                id: handle.0,
            })
    }

    fn query_set(&self, handle: QuerySetHandle) -> BackendResult<&wgpu::QuerySet> {
        self.query_sets
            .get(&handle.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "query set",
                id: handle.0,
            })
    }

    fn bind_group(&self, handle: BindGroupHandle) -> BackendResult<&wgpu::BindGroup> {
        self.bind_groups
            .get(&handle.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "bind group",
                id: handle.0,
            })
    }

    fn layouts(&self, handles: &[BindGroupLayoutHandle]) -> BackendResult<Vec<&wgpu::BindGroupLayout>> {
        handles
            .iter()
            .map(|handle| {
                self.bind_group_layouts
                    .get(&handle.0)
                    .ok_or(BackendError::InvalidHandle {
                        kind: "bind group layout",
                        id: handle.0,
                    })
            })
            .collect()
    }

    /// Run `create` inside a validation error scope.
    fn validated<T>(
        &self,
        kind: &'static str,
        label: &str,
        create: impl FnOnce() -> T,
    ) -> BackendResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(BackendError::Create {
                kind,
                reason: format!("'{label}': {error}"),
            }),
            None => Ok(value),
        }
    }

    /// Replay one render command on a pass or a bundle encoder.
    fn encode_render_command<'a, E: RenderEncoder<'a>>(
        &'a self,
        encoder: &mut E,
        command: &BundleCommand,
    ) -> BackendResult<()> {
        match command {
            BundleCommand::SetPipeline(handle) => {
                let pipeline = self.render_pipelines.get(&handle.0).ok_or(
                    BackendError::InvalidHandle {
                        kind: "render pipeline",
                        id: handle.0,
                    },
                )?;
                encoder.set_pipeline(pipeline);
            }
            BundleCommand::SetBindGroup { index, bind_group } => {
                encoder.set_bind_group(*index, self.bind_group(*bind_group)?, &[]);
            }
            BundleCommand::SetVertexBuffer {
                slot,
                buffer,
                offset,
            } => {
                encoder.set_vertex_buffer(*slot, self.buffer(*buffer)?.slice(*offset..));
            }
            BundleCommand::SetIndexBuffer { buffer, offset } => {
                encoder.set_index_buffer(
                    self.buffer(*buffer)?.slice(*offset..),
                    wgpu::IndexFormat::Uint32,
                );
            }
            BundleCommand::Draw {
                vertices,
                instances,
            } => encoder.draw(vertices.clone(), instances.clone()),
            BundleCommand::DrawIndexed {
                indices,
                base_vertex,
                instances,
            } => encoder.draw_indexed(indices.clone(), *base_vertex, instances.clone()),
        }
        Ok(())
    }

    fn encode_render_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        desc: &RenderPassDescriptor,
        commands: &[Command],
        list: &str,
    ) -> BackendResult<()> {
        let color_attachments = desc
            .color_attachments
            .iter()
            .map(|att| {
                Ok(Some(wgpu::RenderPassColorAttachment {
                    view: self.view(att.view)?,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: Self::load_op(&att.load_op, |c| wgpu::Color {
                            r: c[0] as f64,
                            g: c[1] as f64,
                            b: c[2] as f64,
                            a: c[3] as f64,
                        }),
                        store: Self::store_op(att.store_op),
                    },
                }))
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let depth_stencil_attachment = match &desc.depth_attachment {
            Some(att) => Some(wgpu::RenderPassDepthStencilAttachment {
                view: self.view(att.view)?,
                // No depth ops marks the depth aspect read-only.
                depth_ops: if att.read_only {
                    None
                } else {
                    Some(wgpu::Operations {
                        load: Self::load_op(&att.load_op, |_| att.clear_value),
                        store: Self::store_op(att.store_op),
                    })
                },
                stencil_ops: None,
            }),
            None => None,
        };

        let timestamp_writes = match desc.timestamps {
            Some(t) => Some(wgpu::RenderPassTimestampWrites {
                query_set: self.query_set(t.query_set)?,
                beginning_of_pass_write_index: Some(t.begin),
                end_of_pass_write_index: Some(t.end),
            }),
            None => None,
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: desc.label.as_deref(),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes,
            occlusion_query_set: None,
        });

        for command in commands {
            match command {
                Command::Render(render) => self.encode_render_command(&mut pass, render)?,
                Command::SetViewport {
                    x,
                    y,
                    width,
                    height,
                } => pass.set_viewport(*x, *y, *width, *height, 0.0, 1.0),
                Command::ExecuteBundle(handle) => {
                    let bundle = self.render_bundles.get(&handle.0).ok_or(
                        BackendError::InvalidHandle {
                            kind: "render bundle",
                            id: handle.0,
                        },
                    )?;
                    pass.execute_bundles(std::iter::once(bundle));
                }
                other => {
                    return Err(BackendError::InvalidCommand {
                        list: list.to_string(),
                        reason: format!("{other:?} inside a render pass"),
                    })
                }
            }
        }
        Ok(())
    }

    fn encode_compute_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        label: Option<&str>,
        timestamps: Option<PassTimestamps>,
        commands: &[Command],
        list: &str,
    ) -> BackendResult<()> {
        let timestamp_writes = match timestamps {
            Some(t) => Some(wgpu::ComputePassTimestampWrites {
                query_set: self.query_set(t.query_set)?,
                beginning_of_pass_write_index: Some(t.begin),
                end_of_pass_write_index: Some(t.end),
            }),
            None => None,
        };
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label,
            timestamp_writes,
        });
        for command in commands {
            match command {
                Command::SetComputePipeline(handle) => {
                    let pipeline = self.compute_pipelines.get(&handle.0).ok_or(
                        BackendError::InvalidHandle {
                            kind: "compute pipeline",
                            id: handle.0,
                        },
                    )?;
                    pass.set_pipeline(pipeline);
                }
                Command::Render(BundleCommand::SetBindGroup { index, bind_group }) => {
                    pass.set_bind_group(*index, self.bind_group(*bind_group)?, &[]);
                }
                Command::Dispatch { x, y, z } => pass.dispatch_workgroups(*x, *y, *z),
                other => {
                    return Err(BackendError::InvalidCommand {
                        list: list.to_string(),
                        reason: format!("{other:?} inside a compute pass"),
                    })
                }
            }
        }
        Ok(())
    }

    /// Index of the command closing the pass opened just before `start`.
    fn pass_end(commands: &[Command], start: usize, list: &str) -> BackendResult<usize> {
        commands[start..]
            .iter()
            .position(|c| matches!(c, Command::EndRenderPass | Command::EndComputePass))
            .map(|offset| start + offset)
            .ok_or_else(|| BackendError::InvalidCommand {
                list: list.to_string(),
                reason: "pass is never ended".to_string(),
            })
    }

    fn encode(&self, list: &CommandList) -> BackendResult<wgpu::CommandBuffer> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(list.label()),
            });
        let commands = list.commands();
        let mut index = 0;
        while index < commands.len() {
            match &commands[index] {
                Command::BeginRenderPass(desc) => {
                    let end = Self::pass_end(commands, index + 1, list.label())?;
                    self.encode_render_pass(
                        &mut encoder,
                        desc,
                        &commands[index + 1..end],
                        list.label(),
                    )?;
                    index = end;
                }
                Command::BeginComputePass { label, timestamps } => {
                    let end = Self::pass_end(commands, index + 1, list.label())?;
                    self.encode_compute_pass(
                        &mut encoder,
                        label.as_deref(),
                        *timestamps,
                        &commands[index + 1..end],
                        list.label(),
                    )?;
                    index = end;
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => encoder.copy_buffer_to_buffer(
                    self.buffer(*src)?,
                    *src_offset,
                    self.buffer(*dst)?,
                    *dst_offset,
                    *size,
                ),
                Command::ResolveQueries {
                    query_set,
                    queries,
                    dst,
                    dst_offset,
                } => encoder.resolve_query_set(
                    self.query_set(*query_set)?,
                    queries.clone(),
                    self.buffer(*dst)?,
                    *dst_offset,
                ),
                // wgpu tracks resource usage itself.
                Command::Transition(_) => {}
                other => {
                    return Err(BackendError::InvalidCommand {
                        list: list.label().to_string(),
                        reason: format!("{other:?} outside of a pass"),
                    })
                }
            }
            index += 1;
        }
        Ok(encoder.finish())
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn present_count(&self) -> u64 {
        self.presents
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn adapter_identity(&self) -> AdapterIdentity {
        self.identity.clone()
    }

    fn current_adapter_identity(&mut self) -> Option<AdapterIdentity> {
        if let Some((checked, identity)) = &self.adapter_check {
            if checked.elapsed() < ADAPTER_CHECK_INTERVAL {
                return Some(identity.clone());
            }
        }
        let adapters = self.instance.enumerate_adapters(self.backends);
        let identities: Vec<AdapterIdentity> = adapters
            .iter()
            .map(|adapter| Self::identity_of(&adapter.get_info()))
            .collect();
        // The recorded adapter stays current for as long as it is enumerated.
        let current = if identities.contains(&self.identity) {
            Some(self.identity.clone())
        } else {
            identities.into_iter().next()
        };
        if let Some(identity) = &current {
            self.adapter_check = Some((Instant::now(), identity.clone()));
        }
        current
    }

    fn device_status(&mut self) -> DeviceStatus {
        match &*self.lost.lock() {
            Some(reason) => DeviceStatus::Removed(reason.clone()),
            None => DeviceStatus::Ok,
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        self.check_device()?;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size: desc.size,
            usage: Self::buffer_usages(desc.usage),
            mapped_at_creation: false,
        });
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            WgpuBuffer {
                buffer,
                desc: desc.clone(),
            },
        );
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        self.check_device()?;
        if data.len() as u64 > desc.size {
            return Err(BackendError::Create {
                kind: "buffer",
                reason: format!(
                    "{} bytes do not fit {:?} ({} bytes)",
                    data.len(),
                    desc.label,
                    desc.size
                ),
            });
        }
        let mut contents = data.to_vec();
        contents.resize(desc.size as usize, 0);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: desc.label.as_deref(),
                contents: &contents,
                usage: Self::buffer_usages(desc.usage),
            });
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            WgpuBuffer {
                buffer,
                desc: desc.clone(),
            },
        );
        Ok(BufferHandle(id))
    }

    fn buffer_descriptor(&self, buffer: BufferHandle) -> Option<BufferDescriptor> {
        self.buffers.get(&buffer.0).map(|entry| entry.desc.clone())
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        self.check_device()?;
        let target = self.buffer(buffer)?;
        self.queue.write_buffer(target, offset, data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Vec<u8>> {
        self.check_device()?;
        let size = self
            .buffers
            .get(&buffer.0)
            .map(|entry| entry.desc.size)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(self.buffer(buffer)?, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));
        self.map_staging(&staging)
    }

    fn read_texture(&mut self, texture: TextureHandle) -> BackendResult<Vec<u8>> {
        self.check_device()?;
        let source = self.textures.get(&texture.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        let texel = match source.format().block_copy_size(None) {
            Some(size) if !source.format().is_depth_stencil_format() => size,
            _ => {
                return Err(BackendError::Readback(format!(
                    "{:?} textures cannot be read back",
                    source.format()
                )))
            }
        };
        let (width, height) = (source.width(), source.height());
        let row = width * texel;
        let padded_row = row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture readback staging"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("texture readback"),
            });
        encoder.copy_texture_to_buffer(
            source.as_image_copy(),
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let padded = self.map_staging(&staging)?;
        Ok(padded
            .chunks(padded_row as usize)
            .flat_map(|line| &line[..row as usize])
            .copied()
            .collect())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        self.check_device()?;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::texture_format(desc.format),
            usage: Self::texture_usages(desc.usage),
            view_formats: &[],
        });
        let id = self.alloc_id();
        self.textures.insert(id, texture);
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let view = self
            .textures
            .get(&texture.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            })?
            .create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.alloc_id();
        self.texture_views.insert(id, view);
        Ok(TextureViewHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        self.check_device()?;
        let entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: wgpu::ShaderStages::from_bits_truncate(entry.visibility.bits()),
                ty: Self::binding_type(&entry.ty),
                count: None,
            })
            .collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: None,
                entries: &entries,
            });
        let id = self.alloc_id();
        self.bind_group_layouts.insert(id, layout);
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        self.check_device()?;
        let layout_ref = self
            .bind_group_layouts
            .get(&layout.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "bind group layout",
                id: layout.0,
            })?;

        let wgpu_entries = entries
            .iter()
            .map(|(binding, entry)| {
                let resource = match entry {
                    BindGroupEntry::Buffer {
                        buffer,
                        offset,
                        size,
                    } => wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: self.buffer(*buffer)?,
                        offset: *offset,
                        size: size.and_then(wgpu::BufferSize::new),
                    }),
                    BindGroupEntry::Texture(view) => {
                        wgpu::BindingResource::TextureView(self.view(*view)?)
                    }
                };
                Ok(wgpu::BindGroupEntry {
                    binding: *binding,
                    resource,
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: layout_ref,
            entries: &wgpu_entries,
        });
        let id = self.alloc_id();
        self.bind_groups.insert(id, bind_group);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        self.check_device()?;
        let label = desc.label.as_deref().unwrap_or("render pipeline");
        let layouts = self.layouts(&desc.bind_group_layouts)?;
        let constants: HashMap<String, f64> = desc.constants.iter().cloned().collect();

        // wgpu layouts borrow their attribute slices.
        let attributes: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_layouts
            .iter()
            .map(Self::vertex_attributes)
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(&attributes)
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes,
            })
            .collect();

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_targets
            .iter()
            .map(|target| {
                Some(wgpu::ColorTargetState {
                    format: Self::texture_format(target.format),
                    blend: Self::blend_state(target.blend),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let depth_stencil = desc.depth.map(|depth| wgpu::DepthStencilState {
            format: Self::texture_format(depth.format),
            depth_write_enabled: depth.write,
            depth_compare: Self::depth_compare(depth.compare),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let device = &self.device;
        let pipeline = self.validated("render pipeline", label, || {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: desc.label.as_deref(),
                source: wgpu::ShaderSource::Wgsl(desc.shader.as_str().into()),
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: desc.label.as_deref(),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });
            let fragment = match &desc.fragment_entry {
                Some(entry) if !color_targets.is_empty() => Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: entry,
                    targets: &color_targets,
                    compilation_options: wgpu::PipelineCompilationOptions {
                        constants: &constants,
                        ..Default::default()
                    },
                }),
                _ => None,
            };
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: desc.label.as_deref(),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: &desc.vertex_entry,
                    buffers: &vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions {
                        constants: &constants,
                        ..Default::default()
                    },
                },
                fragment,
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            })
        })?;

        let id = self.alloc_id();
        self.render_pipelines.insert(id, pipeline);
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        self.check_device()?;
        let label = desc.label.as_deref().unwrap_or("compute pipeline");
        let layouts = self.layouts(&desc.bind_group_layouts)?;
        let constants: HashMap<String, f64> = desc.constants.iter().cloned().collect();

        let device = &self.device;
        let pipeline = self.validated("compute pipeline", label, || {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: desc.label.as_deref(),
                source: wgpu::ShaderSource::Wgsl(desc.shader.as_str().into()),
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: desc.label.as_deref(),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: desc.label.as_deref(),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: &desc.entry_point,
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    ..Default::default()
                },
            })
        })?;

        let id = self.alloc_id();
        self.compute_pipelines.insert(id, pipeline);
        Ok(ComputePipelineHandle(id))
    }

    fn create_render_bundle(
        &mut self,
        desc: &RenderBundleDescriptor,
    ) -> BackendResult<RenderBundleHandle> {
        self.check_device()?;
        let color_formats: Vec<Option<wgpu::TextureFormat>> = desc
            .color_formats
            .iter()
            .map(|format| Some(Self::texture_format(*format)))
            .collect();
        let mut encoder =
            self.device
                .create_render_bundle_encoder(&wgpu::RenderBundleEncoderDescriptor {
                    label: desc.label.as_deref(),
                    color_formats: &color_formats,
                    depth_stencil: desc.depth_format.map(|format| {
                        wgpu::RenderBundleDepthStencil {
                            format: Self::texture_format(format),
                            depth_read_only: desc.depth_read_only,
                            stencil_read_only: true,
                        }
                    }),
                    sample_count: 1,
                    multiview: None,
                });
        for command in &desc.commands {
            self.encode_render_command(&mut encoder, command)?;
        }
        let bundle = encoder.finish(&wgpu::RenderBundleDescriptor {
            label: desc.label.as_deref(),
        });

        let id = self.alloc_id();
        self.render_bundles.insert(id, bundle);
        Ok(RenderBundleHandle(id))
    }

    fn timestamp_period(&self) -> Option<f32> {
        self.timestamp_period
    }

    fn create_query_set(&mut self, label: &str, count: u32) -> BackendResult<QuerySetHandle> {
        self.check_device()?;
        if self.timestamp_period.is_none() {
            return Err(BackendError::Create {
                kind: "query set",
                reason: format!("'{label}': device was created without timestamp queries"),
            });
        }
        let query_set = self.validated("query set", label, || {
            self.device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some(label),
                ty: wgpu::QueryType::Timestamp,
                count,
            })
        })?;
        let id = self.alloc_id();
        self.query_sets.insert(id, query_set);
        Ok(QuerySetHandle(id))
    }

    fn submit(&mut self, list: CommandList, info: SubmitInfo) -> BackendResult<()> {
        self.check_device()?;
        let commands = self.encode(&list)?;
        self.queue.submit(Some(commands));

        if info.signals.is_empty() {
            return Ok(());
        }
        for signal in &info.signals {
            signal.fence.mark_submitted(signal.value);
        }
        let signals = info.signals;
        self.queue.on_submitted_work_done(move || {
            for signal in &signals {
                signal.fence.signal(signal.value);
            }
        });
        Ok(())
    }

    fn poll(&mut self) {
        self.device.poll(wgpu::Maintain::Poll);
    }

    fn present(&mut self, back_buffer: TextureHandle) -> BackendResult<()> {
        self.check_device()?;
        if !self.textures.contains_key(&back_buffer.0) {
            return Err(BackendError::Present(format!(
                "unknown back buffer {}",
                back_buffer.0
            )));
        }
        self.presents += 1;
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(entry) = self.buffers.remove(&buffer.0) {
            entry.buffer.destroy();
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(texture) = self.textures.remove(&texture.0) {
            texture.destroy();
        }
    }

    fn destroy_render_bundle(&mut self, bundle: RenderBundleHandle) {
        self.render_bundles.remove(&bundle.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_query_set(&mut self, query_set: QuerySetHandle) {
        self.query_sets.remove(&query_set.0);
    }
}

/// Reject adapters that cannot run the culling and accumulation shaders.
///
/// Both sample the depth buffer with `textureLoad`, which the GL backend
/// cannot translate, and culling needs compute shaders.
fn check_adapter(
    info: &wgpu::AdapterInfo,
    caps: &wgpu::DownlevelCapabilities,
) -> BackendResult<()> {
    if info.backend == wgpu::Backend::Gl {
        return Err(BackendError::NoAdapter(format!(
            "{} uses the GL backend, which cannot load from depth textures",
            info.name
        )));
    }
    if !caps.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
        return Err(BackendError::NoAdapter(format!(
            "{} does not support compute shaders",
            info.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_read_buffers_only_add_copy_dst() {
        let usage = WgpuBackend::buffer_usages(BufferUsage::MAP_READ | BufferUsage::COPY_DST);
        assert_eq!(usage, wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST);
    }

    #[test]
    fn test_storage_buffers_can_be_read_back() {
        let usage = WgpuBackend::buffer_usages(BufferUsage::STORAGE);
        assert!(usage.contains(wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC));
    }

    #[test]
    fn test_query_resolve_buffers_can_be_read_back() {
        let usage = WgpuBackend::buffer_usages(BufferUsage::QUERY_RESOLVE);
        assert!(usage.contains(wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC));
    }

    #[test]
    fn test_stage_bits_match_wgpu() {
        let stages = ShaderStageFlags::VERTEX_FRAGMENT | ShaderStageFlags::COMPUTE;
        assert_eq!(
            wgpu::ShaderStages::from_bits_truncate(stages.bits()),
            wgpu::ShaderStages::VERTEX_FRAGMENT | wgpu::ShaderStages::COMPUTE
        );
    }

    #[test]
    fn test_additive_blend_keeps_alpha_max() {
        let blend = WgpuBackend::blend_state(BlendMode::Additive).unwrap();
        assert_eq!(blend.color.operation, wgpu::BlendOperation::Add);
        assert_eq!(blend.alpha.operation, wgpu::BlendOperation::Max);
        assert!(WgpuBackend::blend_state(BlendMode::Replace).is_none());
    }

    #[test]
    fn test_gbuffer_formats_convert() {
        assert_eq!(
            WgpuBackend::texture_format(TextureFormat::Rgba16Float),
            wgpu::TextureFormat::Rgba16Float
        );
        assert_eq!(
            WgpuBackend::texture_format(TextureFormat::Depth32Float),
            wgpu::TextureFormat::Depth32Float
        );
    }

    fn adapter_info(backend: wgpu::Backend) -> wgpu::AdapterInfo {
        wgpu::AdapterInfo {
            name: "test adapter".to_string(),
            vendor: 0,
            device: 0,
            device_type: wgpu::DeviceType::Other,
            driver: String::new(),
            driver_info: String::new(),
            backend,
        }
    }

    #[test]
    fn test_gl_adapters_are_rejected() {
        let caps = wgpu::DownlevelCapabilities::default();
        let err = check_adapter(&adapter_info(wgpu::Backend::Gl), &caps).unwrap_err();
        assert!(matches!(err, BackendError::NoAdapter(_)));
        assert!(check_adapter(&adapter_info(wgpu::Backend::Vulkan), &caps).is_ok());
    }

    #[test]
    fn test_adapters_without_compute_are_rejected() {
        let caps = wgpu::DownlevelCapabilities {
            flags: wgpu::DownlevelFlags::empty(),
            ..Default::default()
        };
        let err = check_adapter(&adapter_info(wgpu::Backend::Metal), &caps).unwrap_err();
        assert!(err.to_string().contains("compute"));
    }
}
