//! Upload -> device-local resource promotion
//!
//! Scene and material data are first written into CPU-visible upload
//! buffers so they can be used immediately. [`PromotionManager`] later copies
//! them into device-local buffers on the copy queue and repoints every
//! [`BindingSlot`] at the promoted buffer, so steady-state rendering never
//! reads upload memory.
//!
//! The copy and the commit are separate steps. `run_copy_cycle` blocks until
//! the copy queue has finished and hands back a [`CopyReceipt`];
//! `commit_bindings` only accepts the receipt of the latest completed cycle.

use crate::backend::{
    BufferDescriptor, BufferHandle, BufferUsage, CommandList, CopyDone,
    GpuContext, MemoryLocation, QueueKind, SubmitInfo, SyncEdge,
};
use crate::error::RendererResult;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromotionError {
    #[error("copy receipt for generation {receipt} is stale (latest completed copy is {latest})")]
    StaleReceipt { receipt: u64, latest: u64 },
    #[error("a copy cycle is already running")]
    CycleInProgress,
    #[error("promotion source '{0}' no longer exists")]
    MissingSource(String),
}

/// How a promoted buffer is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromotionTarget {
    VertexView,
    IndexView,
    /// Shader-visible storage buffer
    Descriptor,
}

impl PromotionTarget {
    pub fn usage(&self) -> BufferUsage {
        match self {
            PromotionTarget::VertexView => BufferUsage::VERTEX,
            PromotionTarget::IndexView => BufferUsage::INDEX,
            PromotionTarget::Descriptor => BufferUsage::STORAGE,
        }
    }
}

/// The buffer a binding currently points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: BufferHandle,
    pub size: u64,
    pub location: MemoryLocation,
    /// Incremented every time the binding is repointed
    pub version: u64,
}

/// Shared, repointable buffer binding.
///
/// Clones share the same binding, so every holder sees a repoint.
#[derive(Debug, Clone)]
pub struct BindingSlot {
    inner: Arc<RwLock<BufferBinding>>,
}

impl BindingSlot {
    pub fn new(buffer: BufferHandle, size: u64, location: MemoryLocation) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BufferBinding {
                buffer,
                size,
                location,
                version: 0,
            })),
        }
    }

    pub fn get(&self) -> BufferBinding {
        *self.inner.read()
    }

    pub fn buffer(&self) -> BufferHandle {
        self.inner.read().buffer
    }

    /// Point at a new buffer and return the previous one.
    fn repoint(&self, buffer: BufferHandle, location: MemoryLocation) -> BufferHandle {
        let mut binding = self.inner.write();
        let old = binding.buffer;
        binding.buffer = buffer;
        binding.location = location;
        binding.version += 1;
        old
    }
}

/// Version of the bindings prerecorded work depends on.
///
/// Bumped on every binding commit and material replacement; bundles compare
/// the generation they were recorded at against the current one.
#[derive(Debug, Clone, Default)]
pub struct ResourceGeneration(Arc<AtomicU64>);

impl ResourceGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// An upload buffer waiting to be promoted
#[derive(Debug, Clone)]
pub struct PromotionEntry {
    pub label: String,
    pub source: BufferHandle,
    pub binding: BindingSlot,
    pub target: PromotionTarget,
}

/// Proof that a copy cycle finished on the GPU.
#[derive(Debug)]
pub struct CopyReceipt {
    generation: u64,
    entries: usize,
}

impl CopyReceipt {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn entries(&self) -> usize {
        self.entries
    }
}

/// Result of a binding commit
#[derive(Debug, Default)]
pub struct CommitSummary {
    pub repointed: usize,
    /// Upload buffers no longer referenced by any binding. They may still be
    /// read by frames in flight and must be released through the frame manager.
    pub retired: Vec<BufferHandle>,
}

struct QueuedEntry {
    entry: PromotionEntry,
    promoted: Option<BufferHandle>,
}

#[derive(Default)]
struct PromotionState {
    entries: Vec<QueuedEntry>,
    /// Entries before this index have been copied.
    copy_index: usize,
    copy_generation: u64,
}

pub struct PromotionManager {
    ctx: Arc<GpuContext>,
    copy_edge: SyncEdge<CopyDone>,
    state: Mutex<PromotionState>,
    cycle: Mutex<()>,
    generation: ResourceGeneration,
}

impl PromotionManager {
    pub fn new(ctx: Arc<GpuContext>, generation: ResourceGeneration) -> Self {
        Self {
            ctx,
            copy_edge: SyncEdge::new(),
            state: Mutex::new(PromotionState::default()),
            cycle: Mutex::new(()),
            generation,
        }
    }

    pub fn enqueue(&self, entry: PromotionEntry) {
        log::trace!("promotion queued: '{}' ({:?})", entry.label, entry.target);
        self.state.lock().entries.push(QueuedEntry {
            entry,
            promoted: None,
        });
    }

    /// Create an upload buffer holding `data` and queue it for promotion.
    pub fn upload(
        &self,
        label: &str,
        data: &[u8],
        target: PromotionTarget,
    ) -> RendererResult<BindingSlot> {
        let size = (data.len() as u64).max(4);
        let buffer = self
            .ctx
            .backend()
            .create_buffer_init(&BufferDescriptor::upload(label, size, target.usage()), data)?;
        let binding = BindingSlot::new(buffer, size, MemoryLocation::Upload);
        self.enqueue(PromotionEntry {
            label: label.to_string(),
            source: buffer,
            binding: binding.clone(),
            target,
        });
        Ok(binding)
    }

    /// Entries not yet copied
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.entries.len() - state.copy_index
    }

    /// Entries copied but not yet committed
    pub fn awaiting_commit(&self) -> usize {
        self.state.lock().copy_index
    }

    pub fn generation(&self) -> &ResourceGeneration {
        &self.generation
    }

    /// Copy every pending entry to device-local memory.
    ///
    /// Blocks until the copy queue finishes. Returns `None` if nothing was
    /// pending.
    pub fn run_copy_cycle(&self) -> RendererResult<Option<CopyReceipt>> {
        let _cycle = self
            .cycle
            .try_lock()
            .ok_or(PromotionError::CycleInProgress)?;

        let (start, batch) = {
            let state = self.state.lock();
            let batch: Vec<PromotionEntry> = state.entries[state.copy_index..]
                .iter()
                .map(|queued| queued.entry.clone())
                .collect();
            (state.copy_index, batch)
        };
        if batch.is_empty() {
            return Ok(None);
        }

        let mut list = CommandList::new(QueueKind::Copy, "resource promotion");
        let destinations = self.create_destinations(&batch, &mut list)?;

        let point = self.copy_edge.issue();
        if let Err(err) = self
            .ctx
            .submit(list, SubmitInfo::new().signal(self.copy_edge.signal(point)))
        {
            self.destroy_destinations(&destinations);
            return Err(err.into());
        }
        // A failed wait means the device is gone; its objects are abandoned.
        self.ctx.wait_for(self.copy_edge.fence(), point.value())?;

        let mut state = self.state.lock();
        for (offset, destination) in destinations.into_iter().enumerate() {
            state.entries[start + offset].promoted = Some(destination);
        }
        state.copy_index = start + batch.len();
        state.copy_generation += 1;
        log::debug!(
            "copy cycle {} promoted {} resources",
            state.copy_generation,
            batch.len()
        );

        Ok(Some(CopyReceipt {
            generation: state.copy_generation,
            entries: batch.len(),
        }))
    }

    /// Create one device-local buffer per entry and record its copy. Nothing
    /// created here outlives a failure.
    fn create_destinations(
        &self,
        batch: &[PromotionEntry],
        list: &mut CommandList,
    ) -> RendererResult<Vec<BufferHandle>> {
        let mut backend = self.ctx.backend();
        let mut destinations = Vec::with_capacity(batch.len());
        for entry in batch {
            let source = backend.buffer_descriptor(entry.source);
            let created: RendererResult<(BufferHandle, u64)> = match source {
                Some(source) => backend
                    .create_buffer(&BufferDescriptor::new(
                        &format!("{} (device)", entry.label),
                        source.size,
                        entry.target.usage() | BufferUsage::COPY_DST,
                    ))
                    .map(|destination| (destination, source.size))
                    .map_err(Into::into),
                None => Err(PromotionError::MissingSource(entry.label.clone()).into()),
            };
            match created {
                Ok((destination, size)) => {
                    list.copy_buffer(entry.source, 0, destination, 0, size);
                    destinations.push(destination);
                }
                Err(err) => {
                    log::warn!(
                        "promotion of '{}' failed, dropping {} new buffers",
                        entry.label,
                        destinations.len()
                    );
                    for destination in destinations {
                        backend.destroy_buffer(destination);
                    }
                    return Err(err);
                }
            }
        }
        Ok(destinations)
    }

    fn destroy_destinations(&self, destinations: &[BufferHandle]) {
        let mut backend = self.ctx.backend();
        for destination in destinations {
            backend.destroy_buffer(*destination);
        }
    }

    /// Repoint every copied entry's binding at its device-local buffer.
    pub fn commit_bindings(&self, receipt: CopyReceipt) -> Result<CommitSummary, PromotionError> {
        let mut state = self.state.lock();
        if receipt.generation != state.copy_generation {
            return Err(PromotionError::StaleReceipt {
                receipt: receipt.generation,
                latest: state.copy_generation,
            });
        }

        let copied = state.copy_index;
        let mut summary = CommitSummary::default();
        for queued in state.entries.drain(..copied) {
            if let Some(destination) = queued.promoted {
                let old = queued
                    .entry
                    .binding
                    .repoint(destination, MemoryLocation::DeviceLocal);
                summary.retired.push(old);
                summary.repointed += 1;
            }
        }
        state.copy_index = 0;
        drop(state);

        let generation = self.generation.bump();
        log::debug!(
            "committed {} promoted bindings (resource generation {})",
            summary.repointed,
            generation
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, DummyGpu};
    use std::time::Duration;

    fn manager() -> (PromotionManager, DummyGpu) {
        let backend = DummyBackend::new();
        let gpu = backend.gpu();
        let ctx = GpuContext::new(Box::new(backend), Duration::from_secs(5));
        (PromotionManager::new(ctx, ResourceGeneration::new()), gpu)
    }

    #[test]
    fn test_empty_cycle() {
        let (manager, _gpu) = manager();
        assert!(manager.run_copy_cycle().unwrap().is_none());
    }

    #[test]
    fn test_copy_then_commit_repoints_binding() {
        let (manager, gpu) = manager();
        let data: Vec<u8> = (0..16).collect();
        let binding = manager
            .upload("vertices", &data, PromotionTarget::VertexView)
            .unwrap();
        let upload = binding.buffer();
        assert_eq!(binding.get().location, MemoryLocation::Upload);
        assert_eq!(manager.pending(), 1);

        let receipt = manager.run_copy_cycle().unwrap().unwrap();
        assert_eq!(receipt.entries(), 1);
        assert_eq!(manager.pending(), 0);
        // Not repointed until commit.
        assert_eq!(binding.buffer(), upload);

        let summary = manager.commit_bindings(receipt).unwrap();
        assert_eq!(summary.repointed, 1);
        assert_eq!(summary.retired, vec![upload]);

        let promoted = binding.get();
        assert_ne!(promoted.buffer, upload);
        assert_eq!(promoted.location, MemoryLocation::DeviceLocal);
        assert_eq!(promoted.version, 1);
        assert_eq!(gpu.buffer_data(promoted.buffer).unwrap(), data);
        assert_eq!(
            gpu.buffer_location(promoted.buffer),
            Some(MemoryLocation::DeviceLocal)
        );
        assert_eq!(manager.generation().current(), 1);
    }

    #[test]
    fn test_stale_receipt_rejected() {
        let (manager, _gpu) = manager();
        manager
            .upload("a", &[1, 2, 3, 4], PromotionTarget::Descriptor)
            .unwrap();
        let first = manager.run_copy_cycle().unwrap().unwrap();

        manager
            .upload("b", &[5, 6, 7, 8], PromotionTarget::Descriptor)
            .unwrap();
        let second = manager.run_copy_cycle().unwrap().unwrap();

        assert_eq!(
            manager.commit_bindings(first).unwrap_err(),
            PromotionError::StaleReceipt {
                receipt: 1,
                latest: 2
            }
        );
        let summary = manager.commit_bindings(second).unwrap();
        assert_eq!(summary.repointed, 2);
    }

    #[test]
    fn test_entries_enqueued_during_cycle_wait_for_next_cycle() {
        let (manager, _gpu) = manager();
        manager
            .upload("first", &[0; 8], PromotionTarget::IndexView)
            .unwrap();
        let receipt = manager.run_copy_cycle().unwrap().unwrap();

        let late = manager
            .upload("late", &[0; 8], PromotionTarget::IndexView)
            .unwrap();
        manager.commit_bindings(receipt).unwrap();

        assert_eq!(late.get().location, MemoryLocation::Upload);
        assert_eq!(manager.pending(), 1);
    }

    #[test]
    fn test_missing_source_leaves_no_device_buffers() {
        let backend = DummyBackend::new();
        let gpu = backend.gpu();
        let ctx = GpuContext::new(Box::new(backend), Duration::from_secs(5));
        let manager = PromotionManager::new(ctx.clone(), ResourceGeneration::new());
        manager
            .upload("kept", &[1; 8], PromotionTarget::VertexView)
            .unwrap();
        let gone = manager
            .upload("gone", &[2; 8], PromotionTarget::IndexView)
            .unwrap();
        ctx.backend().destroy_buffer(gone.buffer());
        let before = gpu.buffer_count();

        let err = manager.run_copy_cycle().unwrap_err();
        assert!(err.to_string().contains("gone"));
        assert_eq!(gpu.buffer_count(), before);
        assert_eq!(manager.pending(), 2);
        assert_eq!(manager.awaiting_commit(), 0);
    }

    #[test]
    fn test_failed_submit_leaves_no_device_buffers() {
        let backend = DummyBackend::new();
        let gpu = backend.gpu();
        let ctx = GpuContext::new(Box::new(backend), Duration::from_secs(5));
        let manager = PromotionManager::new(ctx, ResourceGeneration::new());
        manager
            .upload("a", &[0; 16], PromotionTarget::Descriptor)
            .unwrap();
        manager
            .upload("b", &[0; 16], PromotionTarget::Descriptor)
            .unwrap();
        let before = gpu.buffer_count();
        gpu.fail_next_submit("copy queue rejected the list");

        let err = manager.run_copy_cycle().unwrap_err();
        assert!(err.to_string().contains("copy queue rejected"));
        assert_eq!(gpu.buffer_count(), before);

        // Nothing was consumed; the next cycle promotes both entries.
        let receipt = manager.run_copy_cycle().unwrap().unwrap();
        assert_eq!(receipt.entries(), 2);
    }

    #[test]
    fn test_copy_timeout_is_device_loss() {
        let backend = DummyBackend::new_manual();
        let ctx = GpuContext::new(Box::new(backend), Duration::from_millis(20));
        let manager = PromotionManager::new(ctx, ResourceGeneration::new());
        manager
            .upload("stuck", &[0; 4], PromotionTarget::VertexView)
            .unwrap();

        let err = manager.run_copy_cycle().unwrap_err();
        assert!(err.is_device_lost());
    }
}
