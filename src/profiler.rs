//! GPU pass timings from timestamp queries
//!
//! The culling dispatch and the light accumulation pass each write a
//! timestamp when they begin and end. The accumulation list resolves all
//! four into a small buffer that is read back once the frame is submitted.
//!
//! Devices without timestamp support get an inactive profiler: passes are
//! recorded without timestamps and no GPU timings are reported.

use crate::backend::{
    BackendError, BufferDescriptor, BufferHandle, BufferUsage, CommandList, GpuContext,
    PassTimestamps, QuerySetHandle,
};
use crate::error::RendererResult;
use std::sync::Arc;

/// Passes that carry timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedPass {
    LightCulling,
    LightAccumulation,
}

impl TimedPass {
    const ALL: [TimedPass; 2] = [TimedPass::LightCulling, TimedPass::LightAccumulation];

    fn first_query(self) -> u32 {
        match self {
            TimedPass::LightCulling => 0,
            TimedPass::LightAccumulation => 2,
        }
    }
}

const QUERY_COUNT: u32 = 2 * TimedPass::ALL.len() as u32;

/// Milliseconds the GPU spent in each timed pass of one frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpuTimings {
    pub cull_ms: Option<f64>,
    pub light_ms: Option<f64>,
}

#[derive(Debug)]
struct Queries {
    query_set: QuerySetHandle,
    resolved: BufferHandle,
    /// Nanoseconds per tick
    period: f32,
}

#[derive(Debug)]
pub struct GpuProfiler {
    ctx: Arc<GpuContext>,
    queries: Option<Queries>,
}

impl GpuProfiler {
    /// Profiler that times passes when `enabled` and the device supports it.
    pub fn new(ctx: Arc<GpuContext>, enabled: bool) -> RendererResult<Self> {
        if !enabled {
            return Ok(Self::inactive(ctx));
        }
        let mut backend = ctx.backend();
        let Some(period) = backend.timestamp_period() else {
            log::info!(
                "GPU timestamps unsupported on {}; pass timings are CPU only",
                backend.name()
            );
            drop(backend);
            return Ok(Self::inactive(ctx));
        };
        let query_set = match backend.create_query_set("pass timings", QUERY_COUNT) {
            Ok(query_set) => query_set,
            Err(BackendError::Create { reason, .. }) => {
                log::warn!("GPU pass timings disabled: {}", reason);
                drop(backend);
                return Ok(Self::inactive(ctx));
            }
            Err(err) => return Err(err.into()),
        };
        let resolved = match backend.create_buffer(&BufferDescriptor::new(
            "resolved pass timings",
            QUERY_COUNT as u64 * 8,
            BufferUsage::QUERY_RESOLVE | BufferUsage::COPY_SRC,
        )) {
            Ok(buffer) => buffer,
            Err(err) => {
                backend.destroy_query_set(query_set);
                return Err(err.into());
            }
        };
        drop(backend);
        log::debug!("GPU pass timings enabled ({} ns per tick)", period);
        Ok(Self {
            ctx,
            queries: Some(Queries {
                query_set,
                resolved,
                period,
            }),
        })
    }

    fn inactive(ctx: Arc<GpuContext>) -> Self {
        Self { ctx, queries: None }
    }

    pub fn is_active(&self) -> bool {
        self.queries.is_some()
    }

    /// Timestamps for `pass`, or `None` when inactive
    pub fn timestamps(&self, pass: TimedPass) -> Option<PassTimestamps> {
        self.queries.as_ref().map(|queries| PassTimestamps {
            query_set: queries.query_set,
            begin: pass.first_query(),
            end: pass.first_query() + 1,
        })
    }

    /// Resolve every query. Record after the last timed pass of the frame.
    pub fn record_resolve(&self, list: &mut CommandList) {
        if let Some(queries) = &self.queries {
            list.resolve_queries(queries.query_set, 0..QUERY_COUNT, queries.resolved, 0);
        }
    }

    /// Read back the last resolved timings. Waits for the resolving submission.
    pub fn read(&self) -> RendererResult<Option<GpuTimings>> {
        let Some(queries) = &self.queries else {
            return Ok(None);
        };
        let bytes = self.ctx.backend().read_buffer(queries.resolved)?;
        let ticks: Vec<u64> = bytemuck::pod_collect_to_vec(&bytes[..]);
        let elapsed = |pass: TimedPass| {
            let begin = *ticks.get(pass.first_query() as usize)?;
            let end = *ticks.get(pass.first_query() as usize + 1)?;
            // Unwritten or wrapped queries
            (end > begin).then(|| (end - begin) as f64 * queries.period as f64 / 1_000_000.0)
        };
        Ok(Some(GpuTimings {
            cull_ms: elapsed(TimedPass::LightCulling),
            light_ms: elapsed(TimedPass::LightAccumulation),
        }))
    }

    /// Destroy the query set and its buffer. The GPU must be idle.
    pub(crate) fn destroy(&mut self) {
        if let Some(queries) = self.queries.take() {
            let mut backend = self.ctx.backend();
            backend.destroy_query_set(queries.query_set);
            backend.destroy_buffer(queries.resolved);
        }
    }
}
