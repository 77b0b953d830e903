//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't run shaders but models everything the renderer
//! relies on for ordering. Specifically it:
//!
//! - keeps buffer contents and executes copies when a submission completes
//! - tracks resource states and rejects transitions from the wrong state
//! - holds submissions until their timeline waits are reached, completing
//!   them in order per queue
//! - validates WGSL for every pipeline with naga
//!
//! Completion is automatic by default. A backend created with
//! [`DummyBackend::new_manual`] only completes work when the test steps the
//! GPU through its [`DummyGpu`] handle.

use crate::backend::command::{
    BundleCommand, Command, CommandList, PassTimestamps, RenderPassDescriptor, ResourceRef,
};
use crate::backend::sync::SubmitInfo;
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::shader::validate_wgsl;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Ticks between the begin and end timestamps of every timed pass
pub const DUMMY_PASS_TICKS: u64 = 1_000_000;

/// What the dummy GPU saw for one submission
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub id: u64,
    pub queue: QueueKind,
    pub label: String,
    pub commands: Vec<Command>,
    pub waits: Vec<(String, u64)>,
    pub signals: Vec<(String, u64)>,
}

struct PendingSubmission {
    id: u64,
    list: CommandList,
    info: SubmitInfo,
}

struct DummyBuffer {
    desc: BufferDescriptor,
    data: Vec<u8>,
}

struct DummyState {
    next_id: u64,
    buffers: HashMap<u64, DummyBuffer>,
    textures: HashMap<u64, TextureDescriptor>,
    views: HashMap<u64, u64>,
    layouts: HashMap<u64, usize>,
    bind_groups: HashMap<u64, u64>,
    render_pipelines: HashMap<u64, String>,
    compute_pipelines: HashMap<u64, String>,
    bundles: HashMap<u64, RenderBundleDescriptor>,
    query_sets: HashMap<u64, Vec<u64>>,
    timestamp_period: Option<f32>,
    clock: u64,
    states: HashMap<ResourceRef, ResourceState>,
    pending: VecDeque<PendingSubmission>,
    submissions: Vec<SubmissionRecord>,
    completed: Vec<String>,
    hazards: Vec<String>,
    auto_complete: bool,
    removed: Option<String>,
    fail_next_submit: Option<String>,
    current_adapter: AdapterIdentity,
    presents: u64,
}

impl DummyState {
    fn new(adapter: AdapterIdentity, auto_complete: bool) -> Self {
        Self {
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            bundles: HashMap::new(),
            query_sets: HashMap::new(),
            timestamp_period: None,
            clock: 0,
            states: HashMap::new(),
            pending: VecDeque::new(),
            submissions: Vec::new(),
            completed: Vec::new(),
            hazards: Vec::new(),
            auto_complete,
            removed: None,
            fail_next_submit: None,
            current_adapter: adapter,
            presents: 0,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_device(&self) -> BackendResult<()> {
        match &self.removed {
            Some(reason) => Err(BackendError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn buffer(&self, handle: BufferHandle) -> BackendResult<&DummyBuffer> {
        self.buffers.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: handle.0,
        })
    }

    fn check_queries(&self, query_set: QuerySetHandle, queries: &[u32]) -> Result<(), String> {
        let count = match self.query_sets.get(&query_set.0) {
            Some(values) => values.len() as u32,
            None => return Err(format!("unknown query set {}", query_set.0)),
        };
        match queries.iter().find(|&&query| query >= count) {
            Some(query) => Err(format!("query {query} outside a set of {count}")),
            None => Ok(()),
        }
    }

    /// Check pass nesting and handle validity, then apply transitions.
    fn validate(&mut self, list: &CommandList) -> BackendResult<()> {
        #[derive(PartialEq)]
        enum Scope {
            None,
            Render,
            Compute,
        }

        let invalid = |reason: String| BackendError::InvalidCommand {
            list: list.label().to_string(),
            reason,
        };

        let mut scope = Scope::None;
        for command in list.commands() {
            match command {
                Command::BeginRenderPass(desc) => {
                    if scope != Scope::None {
                        return Err(invalid("render pass begun inside another pass".into()));
                    }
                    for attachment in &desc.color_attachments {
                        if !self.views.contains_key(&attachment.view.0) {
                            return Err(invalid(format!("unknown view {}", attachment.view.0)));
                        }
                    }
                    if let Some(t) = desc.timestamps {
                        self.check_queries(t.query_set, &[t.begin, t.end])
                            .map_err(invalid)?;
                    }
                    scope = Scope::Render;
                }
                Command::EndRenderPass => {
                    if scope != Scope::Render {
                        return Err(invalid("end_render_pass without a render pass".into()));
                    }
                    scope = Scope::None;
                }
                Command::BeginComputePass { timestamps, .. } => {
                    if scope != Scope::None {
                        return Err(invalid("compute pass begun inside another pass".into()));
                    }
                    if let Some(t) = timestamps {
                        self.check_queries(t.query_set, &[t.begin, t.end])
                            .map_err(invalid)?;
                    }
                    scope = Scope::Compute;
                }
                Command::EndComputePass => {
                    if scope != Scope::Compute {
                        return Err(invalid("end_compute_pass without a compute pass".into()));
                    }
                    scope = Scope::None;
                }
                Command::SetComputePipeline(pipeline) => {
                    if !self.compute_pipelines.contains_key(&pipeline.0) {
                        return Err(invalid(format!("unknown compute pipeline {}", pipeline.0)));
                    }
                }
                Command::Dispatch { .. } => {
                    if scope != Scope::Compute {
                        return Err(invalid("dispatch outside a compute pass".into()));
                    }
                }
                Command::Render(BundleCommand::SetBindGroup { bind_group, .. }) => {
                    if scope == Scope::None {
                        return Err(invalid("bind group set outside a pass".into()));
                    }
                    if !self.bind_groups.contains_key(&bind_group.0) {
                        return Err(invalid(format!("unknown bind group {}", bind_group.0)));
                    }
                }
                Command::Render(render) => {
                    if scope != Scope::Render {
                        return Err(invalid(format!("{render:?} outside a render pass")));
                    }
                    if let BundleCommand::SetPipeline(pipeline) = render {
                        if !self.render_pipelines.contains_key(&pipeline.0) {
                            return Err(invalid(format!("unknown render pipeline {}", pipeline.0)));
                        }
                    }
                }
                Command::SetViewport { .. } => {
                    if scope != Scope::Render {
                        return Err(invalid("viewport set outside a render pass".into()));
                    }
                }
                Command::ExecuteBundle(bundle) => {
                    if scope != Scope::Render {
                        return Err(invalid("bundle executed outside a render pass".into()));
                    }
                    if !self.bundles.contains_key(&bundle.0) {
                        return Err(invalid(format!("unknown render bundle {}", bundle.0)));
                    }
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    if scope != Scope::None {
                        return Err(invalid("copy recorded inside a pass".into()));
                    }
                    let src_len = self.buffer(*src)?.desc.size;
                    let dst_len = self.buffer(*dst)?.desc.size;
                    if src_offset + size > src_len || dst_offset + size > dst_len {
                        return Err(invalid(format!("copy of {size} bytes out of bounds")));
                    }
                }
                Command::ResolveQueries {
                    query_set,
                    queries,
                    dst,
                    dst_offset,
                } => {
                    if scope != Scope::None {
                        return Err(invalid("queries resolved inside a pass".into()));
                    }
                    if queries.is_empty() {
                        return Err(invalid("empty query resolve".into()));
                    }
                    self.check_queries(*query_set, &[queries.end - 1])
                        .map_err(invalid)?;
                    let target = self.buffer(*dst)?;
                    if !target.desc.usage.contains(BufferUsage::QUERY_RESOLVE) {
                        return Err(invalid(format!(
                            "{:?} cannot receive resolved queries",
                            target.desc.label
                        )));
                    }
                    let size = queries.len() as u64 * 8;
                    if dst_offset + size > target.desc.size {
                        return Err(invalid(format!("resolve of {size} bytes out of bounds")));
                    }
                }
                Command::Transition(transitions) => {
                    if scope != Scope::None {
                        return Err(invalid("transition recorded inside a pass".into()));
                    }
                    for transition in transitions {
                        let current = self
                            .states
                            .get(&transition.resource)
                            .copied()
                            .unwrap_or(ResourceState::Common);
                        if current != transition.before {
                            let message = format!(
                                "{:?} is {:?}, transition in '{}' expected {:?}",
                                transition.resource,
                                current,
                                list.label(),
                                transition.before
                            );
                            log::error!("DummyBackend: {}", message);
                            self.hazards.push(message.clone());
                            return Err(BackendError::StateMismatch(message));
                        }
                        self.states.insert(transition.resource, transition.after);
                    }
                }
            }
        }

        if scope != Scope::None {
            return Err(invalid("command list ends inside a pass".into()));
        }
        Ok(())
    }

    fn execute(&mut self, list: &CommandList) {
        for command in list.commands() {
            match command {
                Command::BeginRenderPass(RenderPassDescriptor {
                    timestamps: Some(timestamps),
                    ..
                })
                | Command::BeginComputePass {
                    timestamps: Some(timestamps),
                    ..
                } => self.write_timestamps(*timestamps),
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let bytes = match self.buffers.get(&src.0) {
                        Some(buffer) => {
                            let start = *src_offset as usize;
                            buffer.data[start..start + *size as usize].to_vec()
                        }
                        None => continue,
                    };
                    self.write_into(*dst, *dst_offset, &bytes);
                }
                Command::ResolveQueries {
                    query_set,
                    queries,
                    dst,
                    dst_offset,
                } => {
                    let bytes: Vec<u8> = match self.query_sets.get(&query_set.0) {
                        Some(values) => values[queries.start as usize..queries.end as usize]
                            .iter()
                            .flat_map(|value| value.to_le_bytes())
                            .collect(),
                        None => continue,
                    };
                    self.write_into(*dst, *dst_offset, &bytes);
                }
                _ => {}
            }
        }
    }

    fn write_into(&mut self, dst: BufferHandle, offset: u64, bytes: &[u8]) {
        if let Some(buffer) = self.buffers.get_mut(&dst.0) {
            let start = offset as usize;
            buffer.data[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Every timed pass takes [`DUMMY_PASS_TICKS`] on a clock shared by all queues.
    fn write_timestamps(&mut self, timestamps: PassTimestamps) {
        let begin = self.clock;
        self.clock += DUMMY_PASS_TICKS;
        if let Some(values) = self.query_sets.get_mut(&timestamps.query_set.0) {
            values[timestamps.begin as usize] = begin;
            values[timestamps.end as usize] = self.clock;
        }
    }

    /// Complete the oldest runnable submission. Queues complete in order.
    fn complete_one(&mut self) -> bool {
        let mut blocked_queues: Vec<QueueKind> = Vec::new();
        let mut runnable = None;
        for (index, pending) in self.pending.iter().enumerate() {
            let queue = pending.list.queue();
            if blocked_queues.contains(&queue) {
                continue;
            }
            if pending
                .info
                .waits
                .iter()
                .all(|wait| wait.fence.is_reached(wait.value))
            {
                runnable = Some(index);
                break;
            }
            blocked_queues.push(queue);
        }

        let Some(index) = runnable else {
            return false;
        };
        let Some(submission) = self.pending.remove(index) else {
            return false;
        };
        self.execute(&submission.list);
        log::trace!(
            "DummyBackend: completed submission {} '{}'",
            submission.id,
            submission.list.label()
        );
        self.completed.push(submission.list.label().to_string());
        for signal in &submission.info.signals {
            signal.fence.signal(signal.value);
        }
        true
    }

    fn complete_ready(&mut self) -> usize {
        let mut count = 0;
        while self.complete_one() {
            count += 1;
        }
        count
    }
}

/// Dummy GPU backend.
pub struct DummyBackend {
    shared: Arc<Mutex<DummyState>>,
    adapter: AdapterIdentity,
}

impl DummyBackend {
    /// Backend whose submissions complete as soon as their waits allow.
    pub fn new() -> Self {
        Self::with_completion(true)
    }

    /// Backend whose submissions only complete when stepped through [`DummyGpu`].
    pub fn new_manual() -> Self {
        Self::with_completion(false)
    }

    /// Report timestamp support with `period` nanoseconds per tick.
    pub fn with_timestamps(self, period: f32) -> Self {
        self.shared.lock().timestamp_period = Some(period);
        self
    }

    fn with_completion(auto_complete: bool) -> Self {
        let adapter = Self::default_adapter();
        Self {
            shared: Arc::new(Mutex::new(DummyState::new(adapter.clone(), auto_complete))),
            adapter,
        }
    }

    pub fn default_adapter() -> AdapterIdentity {
        AdapterIdentity {
            name: "Dummy Adapter".to_string(),
            vendor: 0,
            device: 0,
            backend: "dummy".to_string(),
        }
    }

    /// Control handle that outlives the move of the backend into a context.
    pub fn gpu(&self) -> DummyGpu {
        DummyGpu {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn adapter_identity(&self) -> AdapterIdentity {
        self.adapter.clone()
    }

    fn current_adapter_identity(&mut self) -> Option<AdapterIdentity> {
        Some(self.shared.lock().current_adapter.clone())
    }

    fn device_status(&mut self) -> DeviceStatus {
        match &self.shared.lock().removed {
            Some(reason) => DeviceStatus::Removed(reason.clone()),
            None => DeviceStatus::Ok,
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        self.create_buffer_init(desc, &[])
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let mut state = self.shared.lock();
        state.check_device()?;
        if data.len() as u64 > desc.size {
            return Err(BackendError::Create {
                kind: "buffer",
                reason: format!(
                    "{:?}: {} bytes of data for a {} byte buffer",
                    desc.label,
                    data.len(),
                    desc.size
                ),
            });
        }
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {}, {:?})",
            desc.label,
            desc.size,
            desc.location
        );
        let id = state.alloc_id();
        let mut contents = vec![0u8; desc.size as usize];
        contents[..data.len()].copy_from_slice(data);
        let initial = if desc.usage.contains(BufferUsage::STORAGE) {
            ResourceState::UnorderedAccess
        } else {
            ResourceState::Common
        };
        state
            .states
            .insert(ResourceRef::Buffer(BufferHandle(id)), initial);
        state.buffers.insert(
            id,
            DummyBuffer {
                desc: desc.clone(),
                data: contents,
            },
        );
        Ok(BufferHandle(id))
    }

    fn buffer_descriptor(&self, buffer: BufferHandle) -> Option<BufferDescriptor> {
        self.shared
            .lock()
            .buffers
            .get(&buffer.0)
            .map(|buffer| buffer.desc.clone())
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let mut state = self.shared.lock();
        state.check_device()?;
        let target = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        let start = offset as usize;
        let end = start + data.len();
        if end > target.data.len() {
            return Err(BackendError::InvalidCommand {
                list: "write_buffer".to_string(),
                reason: format!(
                    "write of {} bytes at {} overflows {:?}",
                    data.len(),
                    offset,
                    target.desc.label
                ),
            });
        }
        target.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Vec<u8>> {
        let state = self.shared.lock();
        state.check_device()?;
        Ok(state.buffer(buffer)?.data.clone())
    }

    /// Nothing is ever drawn, so every texel reads back as zero.
    fn read_texture(&mut self, texture: TextureHandle) -> BackendResult<Vec<u8>> {
        let state = self.shared.lock();
        state.check_device()?;
        let desc = state.textures.get(&texture.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        if desc.format.is_depth() || !desc.usage.contains(TextureUsage::COPY_SRC) {
            return Err(BackendError::Readback(format!(
                "{:?} ({:?}, {:?}) cannot be read back",
                desc.label, desc.format, desc.usage
            )));
        }
        let size = desc.width * desc.height * desc.format.bytes_per_pixel();
        Ok(vec![0; size as usize])
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let mut state = self.shared.lock();
        state.check_device()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::Create {
                kind: "texture",
                reason: format!("{:?} has zero extent", desc.label),
            });
        }
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        let id = state.alloc_id();
        let initial = if !desc.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            ResourceState::Common
        } else if desc.format.is_depth() {
            ResourceState::DepthWrite
        } else {
            ResourceState::RenderTarget
        };
        state
            .states
            .insert(ResourceRef::Texture(TextureHandle(id)), initial);
        state.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let mut state = self.shared.lock();
        if !state.textures.contains_key(&texture.0) {
            return Err(BackendError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        let id = state.alloc_id();
        state.views.insert(id, texture.0);
        Ok(TextureViewHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let mut state = self.shared.lock();
        let id = state.alloc_id();
        state.layouts.insert(id, entries.len());
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let mut state = self.shared.lock();
        let expected = *state
            .layouts
            .get(&layout.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "bind group layout",
                id: layout.0,
            })?;
        if expected != entries.len() {
            return Err(BackendError::Create {
                kind: "bind group",
                reason: format!("{} entries, layout expects {}", entries.len(), expected),
            });
        }
        for (_, entry) in entries {
            match entry {
                BindGroupEntry::Buffer { buffer, .. } => {
                    state.buffer(*buffer)?;
                }
                BindGroupEntry::Texture(view) => {
                    if !state.views.contains_key(&view.0) {
                        return Err(BackendError::InvalidHandle {
                            kind: "texture view",
                            id: view.0,
                        });
                    }
                }
            }
        }
        let id = state.alloc_id();
        state.bind_groups.insert(id, layout.0);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let label = desc.label.clone().unwrap_or_default();
        let module = validate_wgsl(&label, &desc.shader).map_err(|e| BackendError::Create {
            kind: "shader module",
            reason: e.to_string(),
        })?;
        let mut entries = vec![desc.vertex_entry.as_str()];
        entries.extend(desc.fragment_entry.as_deref());
        for entry in entries {
            if !module.entry_points.iter().any(|ep| ep.name == entry) {
                return Err(BackendError::Create {
                    kind: "render pipeline",
                    reason: format!("{label}: entry point '{entry}' not found"),
                });
            }
        }
        log::trace!("DummyBackend: creating render pipeline {:?}", desc.label);
        let mut state = self.shared.lock();
        let id = state.alloc_id();
        state.render_pipelines.insert(id, label);
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let label = desc.label.clone().unwrap_or_default();
        let module = validate_wgsl(&label, &desc.shader).map_err(|e| BackendError::Create {
            kind: "shader module",
            reason: e.to_string(),
        })?;
        if !module
            .entry_points
            .iter()
            .any(|ep| ep.name == desc.entry_point)
        {
            return Err(BackendError::Create {
                kind: "compute pipeline",
                reason: format!("{label}: entry point '{}' not found", desc.entry_point),
            });
        }
        log::trace!("DummyBackend: creating compute pipeline {:?}", desc.label);
        let mut state = self.shared.lock();
        let id = state.alloc_id();
        state.compute_pipelines.insert(id, label);
        Ok(ComputePipelineHandle(id))
    }

    fn create_render_bundle(
        &mut self,
        desc: &RenderBundleDescriptor,
    ) -> BackendResult<RenderBundleHandle> {
        let mut state = self.shared.lock();
        state.check_device()?;
        for command in &desc.commands {
            match command {
                BundleCommand::SetPipeline(pipeline) => {
                    if !state.render_pipelines.contains_key(&pipeline.0) {
                        return Err(BackendError::InvalidHandle {
                            kind: "render pipeline",
                            id: pipeline.0,
                        });
                    }
                }
                BundleCommand::SetVertexBuffer { buffer, .. }
                | BundleCommand::SetIndexBuffer { buffer, .. } => {
                    state.buffer(*buffer)?;
                }
                _ => {}
            }
        }
        log::trace!(
            "DummyBackend: recording render bundle {:?} ({} commands)",
            desc.label,
            desc.commands.len()
        );
        let id = state.alloc_id();
        state.bundles.insert(id, desc.clone());
        Ok(RenderBundleHandle(id))
    }

    fn timestamp_period(&self) -> Option<f32> {
        self.shared.lock().timestamp_period
    }

    fn create_query_set(&mut self, label: &str, count: u32) -> BackendResult<QuerySetHandle> {
        let mut state = self.shared.lock();
        state.check_device()?;
        if state.timestamp_period.is_none() {
            return Err(BackendError::Create {
                kind: "query set",
                reason: format!("'{label}': timestamps are not supported"),
            });
        }
        if count == 0 {
            return Err(BackendError::Create {
                kind: "query set",
                reason: format!("'{label}' has no queries"),
            });
        }
        let id = state.alloc_id();
        state.query_sets.insert(id, vec![0; count as usize]);
        Ok(QuerySetHandle(id))
    }

    fn submit(&mut self, list: CommandList, info: SubmitInfo) -> BackendResult<()> {
        let mut state = self.shared.lock();
        state.check_device()?;
        if let Some(reason) = state.fail_next_submit.take() {
            return Err(BackendError::InvalidCommand {
                list: list.label().to_string(),
                reason,
            });
        }
        state.validate(&list)?;

        let id = state.alloc_id();
        log::trace!(
            "DummyBackend: submission {} '{}' on {} queue",
            id,
            list.label(),
            list.queue()
        );
        state.submissions.push(SubmissionRecord {
            id,
            queue: list.queue(),
            label: list.label().to_string(),
            commands: list.commands().to_vec(),
            waits: info
                .waits
                .iter()
                .map(|w| (w.fence.name().to_string(), w.value))
                .collect(),
            signals: info
                .signals
                .iter()
                .map(|s| (s.fence.name().to_string(), s.value))
                .collect(),
        });
        for signal in &info.signals {
            signal.fence.mark_submitted(signal.value);
        }
        state.pending.push_back(PendingSubmission { id, list, info });
        if state.auto_complete {
            state.complete_ready();
        }
        Ok(())
    }

    fn poll(&mut self) {
        let mut state = self.shared.lock();
        if state.auto_complete {
            state.complete_ready();
        }
    }

    fn present(&mut self, back_buffer: TextureHandle) -> BackendResult<()> {
        let mut state = self.shared.lock();
        state.check_device()?;
        if !state.textures.contains_key(&back_buffer.0) {
            return Err(BackendError::Present(format!(
                "unknown back buffer {}",
                back_buffer.0
            )));
        }
        state.presents += 1;
        log::trace!("DummyBackend: present #{}", state.presents);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        log::trace!("DummyBackend: destroying buffer {}", buffer.0);
        let mut state = self.shared.lock();
        state.buffers.remove(&buffer.0);
        state.states.remove(&ResourceRef::Buffer(buffer));
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        log::trace!("DummyBackend: destroying texture {}", texture.0);
        let mut state = self.shared.lock();
        state.textures.remove(&texture.0);
        state.views.retain(|_, owner| *owner != texture.0);
        state.states.remove(&ResourceRef::Texture(texture));
    }

    fn destroy_render_bundle(&mut self, bundle: RenderBundleHandle) {
        self.shared.lock().bundles.remove(&bundle.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.shared.lock().bind_groups.remove(&bind_group.0);
    }

    fn destroy_query_set(&mut self, query_set: QuerySetHandle) {
        self.shared.lock().query_sets.remove(&query_set.0);
    }
}

/// Test-side control of a [`DummyBackend`]
#[derive(Clone)]
pub struct DummyGpu {
    shared: Arc<Mutex<DummyState>>,
}

impl DummyGpu {
    /// Complete the oldest runnable submission. Returns false if none can run.
    pub fn complete_next(&self) -> bool {
        self.shared.lock().complete_one()
    }

    /// Complete everything whose waits are reached.
    pub fn complete_all(&self) -> usize {
        self.shared.lock().complete_ready()
    }

    pub fn set_auto_complete(&self, enabled: bool) {
        let mut state = self.shared.lock();
        state.auto_complete = enabled;
        if enabled {
            state.complete_ready();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Every submission in submit order
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.shared.lock().submissions.clone()
    }

    /// Labels of completed submissions in completion order
    pub fn completed_labels(&self) -> Vec<String> {
        self.shared.lock().completed.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.shared.lock();
        state.submissions.clear();
        state.completed.clear();
    }

    /// Rejected transitions
    pub fn hazards(&self) -> Vec<String> {
        self.shared.lock().hazards.clone()
    }

    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.shared
            .lock()
            .buffers
            .get(&buffer.0)
            .map(|buffer| buffer.data.clone())
    }

    pub fn buffer_location(&self, buffer: BufferHandle) -> Option<MemoryLocation> {
        self.shared
            .lock()
            .buffers
            .get(&buffer.0)
            .map(|buffer| buffer.desc.location)
    }

    pub fn is_buffer_alive(&self, buffer: BufferHandle) -> bool {
        self.shared.lock().buffers.contains_key(&buffer.0)
    }

    /// Buffers created and not yet destroyed
    pub fn buffer_count(&self) -> usize {
        self.shared.lock().buffers.len()
    }

    /// Query sets created and not yet destroyed
    pub fn query_set_count(&self) -> usize {
        self.shared.lock().query_sets.len()
    }

    pub fn resource_state(&self, resource: ResourceRef) -> Option<ResourceState> {
        self.shared.lock().states.get(&resource).copied()
    }

    pub fn present_count(&self) -> u64 {
        self.shared.lock().presents
    }

    /// Simulate device removal. Pending work is lost.
    pub fn remove_device(&self, reason: &str) {
        let mut state = self.shared.lock();
        log::warn!("DummyBackend: device removed ({})", reason);
        state.removed = Some(reason.to_string());
        state.pending.clear();
    }

    /// Reject the next submission with `reason`.
    pub fn fail_next_submit(&self, reason: &str) {
        self.shared.lock().fail_next_submit = Some(reason.to_string());
    }

    /// Change the adapter the platform reports as default.
    pub fn set_current_adapter(&self, adapter: AdapterIdentity) {
        self.shared.lock().current_adapter = adapter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sync::{FenceSignal, FenceWait, TimelineFence};

    fn storage_buffer(backend: &mut DummyBackend, size: u64) -> BufferHandle {
        backend
            .create_buffer(&BufferDescriptor::new(
                "test",
                size,
                BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
            ))
            .unwrap()
    }

    #[test]
    fn test_copy_executes_on_completion() {
        let mut backend = DummyBackend::new_manual();
        let gpu = backend.gpu();
        let src = backend
            .create_buffer_init(
                &BufferDescriptor::upload("src", 4, BufferUsage::VERTEX),
                &[1, 2, 3, 4],
            )
            .unwrap();
        let dst = storage_buffer(&mut backend, 4);

        let mut list = CommandList::new(QueueKind::Copy, "copy");
        list.copy_buffer(src, 0, dst, 0, 4);
        backend.submit(list, SubmitInfo::new()).unwrap();

        assert_eq!(gpu.buffer_data(dst).unwrap(), vec![0, 0, 0, 0]);
        assert!(gpu.complete_next());
        assert_eq!(gpu.buffer_data(dst).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_timed_pass_resolves_its_timestamps() {
        let mut backend = DummyBackend::new_manual().with_timestamps(1.0);
        let gpu = backend.gpu();
        let queries = backend.create_query_set("timings", 2).unwrap();
        let resolved = backend
            .create_buffer(&BufferDescriptor::new(
                "resolved",
                16,
                BufferUsage::QUERY_RESOLVE | BufferUsage::COPY_SRC,
            ))
            .unwrap();

        let mut list = CommandList::new(QueueKind::Compute, "timed");
        list.begin_timed_compute_pass(
            Some("timed"),
            Some(PassTimestamps {
                query_set: queries,
                begin: 0,
                end: 1,
            }),
        );
        list.end_compute_pass();
        list.resolve_queries(queries, 0..2, resolved, 0);
        backend.submit(list, SubmitInfo::new()).unwrap();
        assert!(gpu.complete_next());

        let data = gpu.buffer_data(resolved).unwrap();
        let values: Vec<u64> = bytemuck::pod_collect_to_vec(&data[..]);
        assert_eq!(values[1] - values[0], DUMMY_PASS_TICKS);
    }

    #[test]
    fn test_query_sets_need_timestamp_support() {
        let mut backend = DummyBackend::new();
        assert_eq!(backend.timestamp_period(), None);
        assert!(matches!(
            backend.create_query_set("timings", 2),
            Err(BackendError::Create { kind: "query set", .. })
        ));
    }

    #[test]
    fn test_resolve_needs_a_query_resolve_buffer() {
        let mut backend = DummyBackend::new().with_timestamps(1.0);
        let queries = backend.create_query_set("timings", 2).unwrap();
        let plain = storage_buffer(&mut backend, 16);
        let mut list = CommandList::new(QueueKind::Graphics, "resolve");
        list.resolve_queries(queries, 0..2, plain, 0);
        assert!(matches!(
            backend.submit(list, SubmitInfo::new()),
            Err(BackendError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_submission_waits_for_timeline() {
        let mut backend = DummyBackend::new();
        let gpu = backend.gpu();
        let fence = TimelineFence::new("edge");

        let consumer = CommandList::new(QueueKind::Graphics, "consumer");
        backend
            .submit(
                consumer,
                SubmitInfo::new().wait(FenceWait {
                    fence: fence.clone(),
                    value: 1,
                }),
            )
            .unwrap();
        assert_eq!(gpu.pending_count(), 1);

        let producer = CommandList::new(QueueKind::Compute, "producer");
        backend
            .submit(
                producer,
                SubmitInfo::new().signal(FenceSignal {
                    fence: fence.clone(),
                    value: 1,
                }),
            )
            .unwrap();

        assert_eq!(gpu.pending_count(), 0);
        assert_eq!(gpu.completed_labels(), vec!["producer", "consumer"]);
        assert_eq!(fence.completed_value(), 1);
    }

    #[test]
    fn test_transition_from_wrong_state_is_rejected() {
        let mut backend = DummyBackend::new();
        let gpu = backend.gpu();
        let buffer = storage_buffer(&mut backend, 16);

        let mut list = CommandList::new(QueueKind::Graphics, "bad barrier");
        list.transition(vec![crate::backend::command::StateTransition::buffer(
            buffer,
            ResourceState::ShaderRead,
            ResourceState::UnorderedAccess,
        )]);
        let err = backend.submit(list, SubmitInfo::new()).unwrap_err();
        assert!(matches!(err, BackendError::StateMismatch(_)));
        assert_eq!(gpu.hazards().len(), 1);
    }

    #[test]
    fn test_unbalanced_pass_is_rejected() {
        let mut backend = DummyBackend::new();
        let mut list = CommandList::new(QueueKind::Compute, "open");
        list.begin_compute_pass(None);
        assert!(matches!(
            backend.submit(list, SubmitInfo::new()),
            Err(BackendError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_removed_device_fails_submission_and_present() {
        let mut backend = DummyBackend::new();
        let gpu = backend.gpu();
        let texture = backend
            .create_texture(&TextureDescriptor::render_target(
                "back buffer",
                4,
                4,
                TextureFormat::Rgba8Unorm,
            ))
            .unwrap();

        gpu.remove_device("test");
        assert_eq!(
            backend.device_status(),
            DeviceStatus::Removed("test".to_string())
        );
        assert!(matches!(
            backend.present(texture),
            Err(BackendError::DeviceLost(_))
        ));
        assert!(backend
            .submit(CommandList::new(QueueKind::Graphics, "x"), SubmitInfo::new())
            .is_err());
    }
}
