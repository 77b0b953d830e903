//! Prerecorded G-buffer draw bundle
//!
//! The scene draws of the G-buffer fill are recorded once into a render
//! bundle. The bundle remembers the resource generation it was recorded at;
//! any binding commit or material replacement bumps the generation and the
//! next [`GBufferBundle::ensure_current`] records a fresh bundle.

use crate::backend::{GpuContext, RenderBundleDescriptor, RenderBundleHandle};
use crate::error::RendererResult;

#[derive(Debug, Default)]
pub struct GBufferBundle {
    bundle: Option<RenderBundleHandle>,
    generation: u64,
    rebuilds: u64,
}

impl GBufferBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stale(&self, generation: u64) -> bool {
        self.bundle.is_none() || self.generation != generation
    }

    /// Rebuild the bundle if it was recorded for another generation.
    ///
    /// `record` is only called when a rebuild is needed. Returns the replaced
    /// bundle, which frames in flight may still execute.
    pub fn ensure_current<F>(
        &mut self,
        ctx: &GpuContext,
        generation: u64,
        record: F,
    ) -> RendererResult<Option<RenderBundleHandle>>
    where
        F: FnOnce() -> RendererResult<RenderBundleDescriptor>,
    {
        if !self.is_stale(generation) {
            return Ok(None);
        }
        let desc = record()?;
        let bundle = ctx.backend().create_render_bundle(&desc)?;
        log::debug!(
            "G-buffer bundle recorded for generation {} (was {}, {} commands)",
            generation,
            self.generation,
            desc.commands.len()
        );
        self.generation = generation;
        self.rebuilds += 1;
        Ok(self.bundle.replace(bundle))
    }

    /// Drop the current bundle so the next `ensure_current` records one.
    pub fn invalidate(&mut self) -> Option<RenderBundleHandle> {
        self.bundle.take()
    }

    pub fn handle(&self) -> Option<RenderBundleHandle> {
        self.bundle
    }

    /// Generation the current bundle was recorded at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }
}
