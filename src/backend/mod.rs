//! Backend abstraction layer
//!
//! Provides the traits and types that the wgpu backend and the recording
//! dummy backend implement, plus the shared [`GpuContext`] and the timeline
//! primitives used to order work across queues.

pub mod command;
pub mod context;
pub mod dummy;
pub mod sync;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use command::*;
pub use context::GpuContext;
pub use dummy::{DummyBackend, DummyGpu, SubmissionRecord, DUMMY_PASS_TICKS};
pub use sync::*;
pub use traits::*;
pub use types::*;
pub use wgpu_backend::WgpuBackend;
