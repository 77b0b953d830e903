//! Shared GPU context
//!
//! Every manager receives an `Arc<GpuContext>` at construction. The context
//! owns the backend behind a mutex and implements bounded fence waits that
//! keep polling the device while they block.

use crate::backend::command::CommandList;
use crate::backend::sync::{SubmitInfo, SyncError, TimelineFence};
use crate::backend::traits::{BackendResult, GraphicsBackend};
use crate::backend::types::AdapterIdentity;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct GpuContext {
    backend: Mutex<Box<dyn GraphicsBackend>>,
    backend_name: &'static str,
    adapter: AdapterIdentity,
    wait_timeout: Duration,
}

impl GpuContext {
    pub fn new(backend: Box<dyn GraphicsBackend>, wait_timeout: Duration) -> Arc<Self> {
        let backend_name = backend.name();
        let adapter = backend.adapter_identity();
        log::info!("GPU context created on {} backend, adapter {}", backend_name, adapter);
        Arc::new(Self {
            backend: Mutex::new(backend),
            backend_name,
            adapter,
            wait_timeout,
        })
    }

    /// Lock the backend for a sequence of calls.
    ///
    /// Never hold the guard across a fence wait.
    pub fn backend(&self) -> MutexGuard<'_, Box<dyn GraphicsBackend>> {
        self.backend.lock()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Adapter recorded when the device was created
    pub fn adapter_identity(&self) -> &AdapterIdentity {
        &self.adapter
    }

    /// Default bound for every GPU wait
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Hand a command list to its queue.
    ///
    /// A submission that waits on a timeline point is held back until that
    /// point's signal has itself been submitted, bounded by the context
    /// timeout. The backend lock is not taken while holding back.
    pub fn submit(&self, list: CommandList, info: SubmitInfo) -> BackendResult<()> {
        for wait in &info.waits {
            wait.fence.wait_submitted(wait.value, self.wait_timeout)?;
        }
        log::trace!(
            "submit '{}' to {} queue ({} commands, {} waits, {} signals)",
            list.label(),
            list.queue(),
            list.commands().len(),
            info.waits.len(),
            info.signals.len()
        );
        self.backend.lock().submit(list, info)
    }

    /// Block until `fence` reaches `value`, bounded by the context timeout.
    pub fn wait_for(&self, fence: &TimelineFence, value: u64) -> Result<(), SyncError> {
        self.wait_for_timeout(fence, value, self.wait_timeout)
    }

    pub fn wait_for_timeout(
        &self,
        fence: &TimelineFence,
        value: u64,
        timeout: Duration,
    ) -> Result<(), SyncError> {
        let start = Instant::now();
        loop {
            if fence.is_reached(value) {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                log::error!(
                    "fence '{}' stuck at {} waiting for {} after {:?}",
                    fence.name(),
                    fence.completed_value(),
                    value,
                    elapsed
                );
                return Err(SyncError::Timeout {
                    fence: fence.name().to_string(),
                    target: value,
                    completed: fence.completed_value(),
                    waited: elapsed,
                });
            }
            self.backend.lock().poll();
            let slice = POLL_INTERVAL.min(timeout - elapsed);
            // A slice timing out only means the next poll is due.
            let _ = fence.wait(value, slice);
        }
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("backend", &self.backend_name)
            .field("adapter", &self.adapter)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}
