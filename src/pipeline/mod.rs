//! Deferred accumulation pipeline
//!
//! Every frame walks the same stages in order:
//!
//! 1. Depth pre-pass - scene depth only, graphics queue
//! 2. G-buffer fill - albedo, normal, specular+gloss from a prerecorded bundle
//! 3. Barrier to read - all four targets become shader inputs
//! 4. Light cull wait - the accumulation submission waits on the culling edge
//! 5. Accumulate - additive lighting from the per-cell light lists
//! 6. Barrier to write - targets return to attachment state
//!
//! [`StageTracker`] rejects any other order. With the light preview enabled,
//! a sphere per light is drawn over the back buffer after the last stage,
//! depth tested against the scene.

pub mod bundle;
pub mod deferred;
pub mod gbuffer;
pub mod light_preview;
pub mod shaders;

pub use bundle::GBufferBundle;
pub use deferred::DeferredPipeline;
pub use gbuffer::{GBuffer, GBUFFER_FORMATS};
pub use light_preview::{LightPreview, SphereMesh, PREVIEW_SPHERE_RADIUS};

use crate::error::{RendererError, RendererResult};

/// Stage of the per-frame pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameStage {
    DepthPrePass,
    GBufferFill,
    BarrierToRead,
    LightCullWait,
    Accumulate,
    BarrierToWrite,
}

impl FrameStage {
    pub const ALL: [FrameStage; 6] = [
        FrameStage::DepthPrePass,
        FrameStage::GBufferFill,
        FrameStage::BarrierToRead,
        FrameStage::LightCullWait,
        FrameStage::Accumulate,
        FrameStage::BarrierToWrite,
    ];

    /// Stage that must follow this one. The last stage wraps to the next frame.
    pub fn next(&self) -> FrameStage {
        match self {
            FrameStage::DepthPrePass => FrameStage::GBufferFill,
            FrameStage::GBufferFill => FrameStage::BarrierToRead,
            FrameStage::BarrierToRead => FrameStage::LightCullWait,
            FrameStage::LightCullWait => FrameStage::Accumulate,
            FrameStage::Accumulate => FrameStage::BarrierToWrite,
            FrameStage::BarrierToWrite => FrameStage::DepthPrePass,
        }
    }
}

impl std::fmt::Display for FrameStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameStage::DepthPrePass => "depth pre-pass",
            FrameStage::GBufferFill => "G-buffer fill",
            FrameStage::BarrierToRead => "barrier to read",
            FrameStage::LightCullWait => "light cull wait",
            FrameStage::Accumulate => "accumulate",
            FrameStage::BarrierToWrite => "barrier to write",
        };
        f.write_str(name)
    }
}

/// Enforces the stage order of one frame after another.
#[derive(Debug, Clone, Default)]
pub struct StageTracker {
    current: Option<FrameStage>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `stage`, failing if it is not the successor of the current stage.
    pub fn enter(&mut self, stage: FrameStage) -> RendererResult<()> {
        let expected = self
            .current
            .map(|current| current.next())
            .unwrap_or(FrameStage::DepthPrePass);
        if stage != expected {
            return Err(RendererError::StageOrder {
                expected,
                found: stage,
            });
        }
        log::trace!("frame stage: {}", stage);
        self.current = Some(stage);
        Ok(())
    }

    /// Forget the current frame, e.g. after a failed submission.
    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<FrameStage> {
        self.current
    }

    /// True between frames
    pub fn is_idle(&self) -> bool {
        matches!(self.current, None | Some(FrameStage::BarrierToWrite))
    }
}
