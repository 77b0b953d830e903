//! GPU synchronization primitives.
//!
//! This module provides the timeline types used to order work between the
//! CPU and the GPU, and between queues.
//!
//! - [`TimelineFence`] is a monotonic 64-bit counter advanced by the queue
//!   that executes the signalling submission.
//! - [`SyncEdge`] is one named producer -> consumer relationship. Every edge
//!   owns its own fence, so values of different edges can never collide.
//! - [`SyncPoint`] is a value issued by an edge. It carries the edge marker
//!   type, so a point issued by one edge cannot be waited on through another.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error returned by bounded fence waits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("timed out after {waited:?} waiting for fence '{fence}' to reach {target} (completed {completed})")]
    Timeout {
        fence: String,
        target: u64,
        completed: u64,
        waited: Duration,
    },
    #[error("timed out after {waited:?} waiting for fence '{fence}' value {target} to be submitted (submitted {submitted})")]
    NeverSubmitted {
        fence: String,
        target: u64,
        submitted: u64,
        waited: Duration,
    },
}

struct TimelineState {
    name: String,
    completed: Mutex<u64>,
    completed_cv: Condvar,
    submitted: AtomicU64,
    submitted_lock: Mutex<()>,
    submitted_cv: Condvar,
}

/// Monotonic GPU timeline.
///
/// `completed` is the highest value the GPU has reached. `submitted` is the
/// highest value whose signal has been handed to a queue. Clones share state.
#[derive(Clone)]
pub struct TimelineFence {
    state: Arc<TimelineState>,
}

impl TimelineFence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(TimelineState {
                name: name.into(),
                completed: Mutex::new(0),
                completed_cv: Condvar::new(),
                submitted: AtomicU64::new(0),
                submitted_lock: Mutex::new(()),
                submitted_cv: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Highest value reached by the GPU.
    pub fn completed_value(&self) -> u64 {
        *self.state.completed.lock()
    }

    /// Highest value handed to a queue.
    pub fn submitted_value(&self) -> u64 {
        self.state.submitted.load(Ordering::Acquire)
    }

    pub fn is_reached(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    /// Advance the completed value. Lower values are ignored.
    ///
    /// Called by backends when the signalling submission finishes.
    pub(crate) fn signal(&self, value: u64) {
        let mut completed = self.state.completed.lock();
        if value > *completed {
            *completed = value;
            log::trace!("fence '{}' completed {}", self.state.name, value);
            self.state.completed_cv.notify_all();
        }
    }

    /// Record that a signal of `value` has been submitted.
    pub(crate) fn mark_submitted(&self, value: u64) {
        let _guard = self.state.submitted_lock.lock();
        self.state.submitted.fetch_max(value, Ordering::AcqRel);
        self.state.submitted_cv.notify_all();
    }

    /// Block until `value` is reached or `timeout` elapses.
    pub fn wait(&self, value: u64, timeout: Duration) -> Result<(), SyncError> {
        let start = Instant::now();
        let mut completed = self.state.completed.lock();
        while *completed < value {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(SyncError::Timeout {
                    fence: self.state.name.clone(),
                    target: value,
                    completed: *completed,
                    waited: elapsed,
                });
            }
            self.state
                .completed_cv
                .wait_for(&mut completed, timeout - elapsed);
        }
        Ok(())
    }

    /// Block until a signal of at least `value` has been submitted.
    ///
    /// Single-queue backends use this to keep a consumer behind its producer.
    pub fn wait_submitted(&self, value: u64, timeout: Duration) -> Result<(), SyncError> {
        let start = Instant::now();
        let mut guard = self.state.submitted_lock.lock();
        while self.submitted_value() < value {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(SyncError::NeverSubmitted {
                    fence: self.state.name.clone(),
                    target: value,
                    submitted: self.submitted_value(),
                    waited: elapsed,
                });
            }
            self.state
                .submitted_cv
                .wait_for(&mut guard, timeout - elapsed);
        }
        Ok(())
    }

    fn same_as(&self, other: &TimelineFence) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for TimelineFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineFence")
            .field("name", &self.state.name)
            .field("submitted", &self.submitted_value())
            .field("completed", &self.completed_value())
            .finish()
    }
}

impl PartialEq for TimelineFence {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

/// A submission waits until `fence` reaches `value` before it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct FenceWait {
    pub fence: TimelineFence,
    pub value: u64,
}

/// A submission advances `fence` to `value` when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct FenceSignal {
    pub fence: TimelineFence,
    pub value: u64,
}

/// Timeline operations attached to one queue submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    pub waits: Vec<FenceWait>,
    pub signals: Vec<FenceSignal>,
}

impl SubmitInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(mut self, wait: FenceWait) -> Self {
        self.waits.push(wait);
        self
    }

    pub fn signal(mut self, signal: FenceSignal) -> Self {
        self.signals.push(signal);
        self
    }
}

/// Marker for one producer -> consumer dependency.
pub trait EdgeKind: Send + Sync + 'static {
    /// Name used for the edge's fence and in diagnostics.
    const NAME: &'static str;
}

macro_rules! define_edge {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl EdgeKind for $name {
            const NAME: &'static str = $label;
        }
    };
}

define_edge!(
    /// Depth pre-pass (graphics) -> light culling (compute).
    DepthPrepassDone,
    "depth-prepass->light-cull"
);
define_edge!(
    /// Light culling (compute) -> light accumulation (graphics).
    LightCullDone,
    "light-cull->accumulate"
);
define_edge!(
    /// Promotion copy (copy queue) -> binding commit (CPU).
    CopyDone,
    "copy->commit"
);

/// A value on the timeline of edge `E`.
pub struct SyncPoint<E: EdgeKind> {
    value: u64,
    _edge: PhantomData<E>,
}

impl<E: EdgeKind> SyncPoint<E> {
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl<E: EdgeKind> Clone for SyncPoint<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: EdgeKind> Copy for SyncPoint<E> {}

impl<E: EdgeKind> PartialEq for SyncPoint<E> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<E: EdgeKind> fmt::Debug for SyncPoint<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncPoint<{}>({})", E::NAME, self.value)
    }
}

/// Named semaphore for a single producer -> consumer relationship.
///
/// `issue` hands out strictly increasing points. The producer attaches
/// `signal(point)` to its submission, the consumer attaches `wait(point)`.
pub struct SyncEdge<E: EdgeKind> {
    fence: TimelineFence,
    issued: AtomicU64,
    _edge: PhantomData<E>,
}

impl<E: EdgeKind> SyncEdge<E> {
    pub fn new() -> Self {
        Self {
            fence: TimelineFence::new(E::NAME),
            issued: AtomicU64::new(0),
            _edge: PhantomData,
        }
    }

    /// Reserve the next point on this edge.
    pub fn issue(&self) -> SyncPoint<E> {
        let value = self.issued.fetch_add(1, Ordering::AcqRel) + 1;
        SyncPoint {
            value,
            _edge: PhantomData,
        }
    }

    /// Most recently issued point, if any.
    pub fn latest(&self) -> Option<SyncPoint<E>> {
        match self.issued.load(Ordering::Acquire) {
            0 => None,
            value => Some(SyncPoint {
                value,
                _edge: PhantomData,
            }),
        }
    }

    pub fn signal(&self, point: SyncPoint<E>) -> FenceSignal {
        FenceSignal {
            fence: self.fence.clone(),
            value: point.value,
        }
    }

    pub fn wait(&self, point: SyncPoint<E>) -> FenceWait {
        FenceWait {
            fence: self.fence.clone(),
            value: point.value,
        }
    }

    pub fn is_complete(&self, point: SyncPoint<E>) -> bool {
        self.fence.is_reached(point.value)
    }

    pub fn fence(&self) -> &TimelineFence {
        &self.fence
    }
}

impl<E: EdgeKind> Default for SyncEdge<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EdgeKind> fmt::Debug for SyncEdge<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEdge")
            .field("edge", &E::NAME)
            .field("issued", &self.issued.load(Ordering::Acquire))
            .field("fence", &self.fence)
            .finish()
    }
}
