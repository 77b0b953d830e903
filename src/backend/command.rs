//! Recorded command lists
//!
//! Command lists are plain data. They are recorded on any thread without
//! touching the device and handed to [`GraphicsBackend::submit`] together
//! with the timeline waits and signals of the submission.
//!
//! [`GraphicsBackend::submit`]: crate::backend::GraphicsBackend::submit

use crate::backend::traits::*;
use crate::backend::types::*;
use std::ops::Range;

/// Color attachment for render pass
#[derive(Debug, Clone, PartialEq)]
pub struct ColorAttachment {
    pub view: TextureViewHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Clear([f32; 4]),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

/// Depth attachment for render pass
#[derive(Debug, Clone, PartialEq)]
pub struct DepthAttachment {
    pub view: TextureViewHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: f32,
    pub read_only: bool,
}

/// Timestamps written when a pass begins and ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassTimestamps {
    pub query_set: QuerySetHandle,
    pub begin: u32,
    pub end: u32,
}

/// Render pass descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_attachment: Option<DepthAttachment>,
    pub timestamps: Option<PassTimestamps>,
}

/// A resource whose access state a transition changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

/// One resource moving from `before` to `after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub resource: ResourceRef,
    pub before: ResourceState,
    pub after: ResourceState,
}

impl StateTransition {
    pub fn texture(texture: TextureHandle, before: ResourceState, after: ResourceState) -> Self {
        Self {
            resource: ResourceRef::Texture(texture),
            before,
            after,
        }
    }

    pub fn buffer(buffer: BufferHandle, before: ResourceState, after: ResourceState) -> Self {
        Self {
            resource: ResourceRef::Buffer(buffer),
            before,
            after,
        }
    }
}

/// Render commands allowed inside a render bundle
#[derive(Debug, Clone, PartialEq)]
pub enum BundleCommand {
    SetPipeline(RenderPipelineHandle),
    SetBindGroup {
        index: u32,
        bind_group: BindGroupHandle,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    /// 32-bit indices
    SetIndexBuffer { buffer: BufferHandle, offset: u64 },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
}

/// A single recorded command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass(RenderPassDescriptor),
    EndRenderPass,
    BeginComputePass {
        label: Option<String>,
        timestamps: Option<PassTimestamps>,
    },
    EndComputePass,
    SetComputePipeline(ComputePipelineHandle),
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    /// Render state and draws, valid inside a render pass.
    Render(BundleCommand),
    SetViewport {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
    ExecuteBundle(RenderBundleHandle),
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    Transition(Vec<StateTransition>),
    /// Write query values as little-endian `u64`s into `dst`
    ResolveQueries {
        query_set: QuerySetHandle,
        queries: Range<u32>,
        dst: BufferHandle,
        dst_offset: u64,
    },
}

/// Ordered list of commands for one queue
#[derive(Debug, Clone)]
pub struct CommandList {
    queue: QueueKind,
    label: String,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(queue: QueueKind, label: impl Into<String>) -> Self {
        Self {
            queue,
            label: label.into(),
            commands: Vec::new(),
        }
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn begin_render_pass(&mut self, desc: RenderPassDescriptor) {
        self.commands.push(Command::BeginRenderPass(desc));
    }

    pub fn end_render_pass(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }

    pub fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.begin_timed_compute_pass(label, None);
    }

    /// Compute pass that writes `timestamps` when it begins and ends
    pub fn begin_timed_compute_pass(
        &mut self,
        label: Option<&str>,
        timestamps: Option<PassTimestamps>,
    ) {
        self.commands.push(Command::BeginComputePass {
            label: label.map(str::to_string),
            timestamps,
        });
    }

    pub fn end_compute_pass(&mut self) {
        self.commands.push(Command::EndComputePass);
    }

    pub fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.commands
            .push(Command::Render(BundleCommand::SetPipeline(pipeline)));
    }

    pub fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.commands.push(Command::SetComputePipeline(pipeline));
    }

    /// Bind a group for whichever pass is open.
    pub fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        self.commands
            .push(Command::Render(BundleCommand::SetBindGroup { index, bind_group }));
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.commands.push(Command::Render(BundleCommand::SetVertexBuffer {
            slot,
            buffer,
            offset,
        }));
    }

    pub fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64) {
        self.commands
            .push(Command::Render(BundleCommand::SetIndexBuffer { buffer, offset }));
    }

    pub fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.commands.push(Command::SetViewport {
            x,
            y,
            width,
            height,
        });
    }

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.commands
            .push(Command::Render(BundleCommand::Draw { vertices, instances }));
    }

    pub fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.commands.push(Command::Render(BundleCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        }));
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch { x, y, z });
    }

    pub fn execute_bundle(&mut self, bundle: RenderBundleHandle) {
        self.commands.push(Command::ExecuteBundle(bundle));
    }

    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        self.commands.push(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    /// Resolve `queries` into `dst`, eight bytes per query. Outside of passes only.
    pub fn resolve_queries(
        &mut self,
        query_set: QuerySetHandle,
        queries: Range<u32>,
        dst: BufferHandle,
        dst_offset: u64,
    ) {
        self.commands.push(Command::ResolveQueries {
            query_set,
            queries,
            dst,
            dst_offset,
        });
    }

    /// Record one barrier covering every transition in `transitions`.
    pub fn transition(&mut self, transitions: Vec<StateTransition>) {
        if !transitions.is_empty() {
            self.commands.push(Command::Transition(transitions));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_list_records_in_order() {
        let mut list = CommandList::new(QueueKind::Compute, "cull");
        list.begin_compute_pass(Some("cull"));
        list.set_compute_pipeline(ComputePipelineHandle(1));
        list.set_bind_group(0, BindGroupHandle(2));
        list.dispatch(4, 3, 1);
        list.end_compute_pass();

        assert_eq!(list.queue(), QueueKind::Compute);
        assert_eq!(list.commands().len(), 5);
        assert_eq!(list.commands()[3], Command::Dispatch { x: 4, y: 3, z: 1 });
    }

    #[test]
    fn test_timed_compute_pass_carries_its_queries() {
        let timestamps = PassTimestamps {
            query_set: QuerySetHandle(7),
            begin: 0,
            end: 1,
        };
        let mut list = CommandList::new(QueueKind::Compute, "cull");
        list.begin_timed_compute_pass(Some("cull"), Some(timestamps));
        list.end_compute_pass();
        list.resolve_queries(QuerySetHandle(7), 0..2, BufferHandle(3), 0);

        assert_eq!(
            list.commands()[0],
            Command::BeginComputePass {
                label: Some("cull".to_string()),
                timestamps: Some(timestamps),
            }
        );
        assert!(matches!(
            list.commands()[2],
            Command::ResolveQueries { ref queries, .. } if *queries == (0..2)
        ));
    }

    #[test]
    fn test_empty_transition_is_skipped() {
        let mut list = CommandList::new(QueueKind::Graphics, "noop");
        list.transition(Vec::new());
        assert!(list.is_empty());
    }
}
