//! G-buffer targets and their state transitions
//!
//! Four co-resident targets sized to the viewport:
//! - Albedo (RGBA8)
//! - World-space normal (RGBA16F)
//! - Specular color + gloss / 256 (RGBA8)
//! - Depth (D32F), shared with the depth pre-pass and the culling kernel
//!
//! The targets are either all writable or all readable. Transitions between
//! the two are recorded as one barrier and checked against the tracked state
//! before anything is recorded.

use crate::backend::{
    CommandList, GpuContext, ResourceState, StateTransition, TextureDescriptor, TextureFormat,
    TextureHandle, TextureViewHandle,
};
use crate::error::{RendererError, RendererResult};
use crate::frame::DeferredRelease;

/// Color target formats in attachment order
pub const GBUFFER_FORMATS: [TextureFormat; 3] = [
    TextureFormat::Rgba8Unorm,
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba8Unorm,
];

pub const GBUFFER_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

const ALBEDO: usize = 0;
const NORMAL: usize = 1;
const SPECULAR: usize = 2;
const DEPTH: usize = 3;

const NAMES: [&str; 4] = ["albedo", "normal", "specular", "depth"];

#[derive(Debug, Clone, Copy)]
struct Target {
    texture: TextureHandle,
    view: TextureViewHandle,
    state: ResourceState,
}

#[derive(Debug)]
pub struct GBuffer {
    width: u32,
    height: u32,
    targets: [Target; 4],
}

impl GBuffer {
    pub fn new(ctx: &GpuContext, width: u32, height: u32) -> RendererResult<Self> {
        let formats = [
            GBUFFER_FORMATS[ALBEDO],
            GBUFFER_FORMATS[NORMAL],
            GBUFFER_FORMATS[SPECULAR],
            GBUFFER_DEPTH_FORMAT,
        ];
        let mut backend = ctx.backend();
        let mut create = |index: usize| -> RendererResult<Target> {
            let format = formats[index];
            let label = format!("gbuffer_{}", NAMES[index]);
            let texture = backend.create_texture(&TextureDescriptor::render_target(
                &label, width, height, format,
            ))?;
            let view = backend.create_texture_view(texture)?;
            let state = if format.is_depth() {
                ResourceState::DepthWrite
            } else {
                ResourceState::RenderTarget
            };
            Ok(Target {
                texture,
                view,
                state,
            })
        };
        let targets = [create(ALBEDO)?, create(NORMAL)?, create(SPECULAR)?, create(DEPTH)?];
        log::debug!("G-buffer created: {}x{}", width, height);
        Ok(Self {
            width,
            height,
            targets,
        })
    }

    /// Make the pre-pass depth readable by the culling kernel and usable as a
    /// read-only attachment by the G-buffer fill.
    pub fn finish_depth_prepass(&mut self, list: &mut CommandList) -> RendererResult<()> {
        self.transition(
            list,
            &[DEPTH],
            &[ResourceState::DepthWrite],
            &[ResourceState::DepthRead],
        )
    }

    /// Barrier to read: every target becomes a shader input.
    pub fn transition_to_read(&mut self, list: &mut CommandList) -> RendererResult<()> {
        self.transition(
            list,
            &[ALBEDO, NORMAL, SPECULAR, DEPTH],
            &[
                ResourceState::RenderTarget,
                ResourceState::RenderTarget,
                ResourceState::RenderTarget,
                ResourceState::DepthRead,
            ],
            &[ResourceState::ShaderRead; 4],
        )
    }

    /// Barrier to write: every target returns to attachment state.
    pub fn transition_to_write(&mut self, list: &mut CommandList) -> RendererResult<()> {
        self.transition(
            list,
            &[ALBEDO, NORMAL, SPECULAR, DEPTH],
            &[ResourceState::ShaderRead; 4],
            &[
                ResourceState::RenderTarget,
                ResourceState::RenderTarget,
                ResourceState::RenderTarget,
                ResourceState::DepthWrite,
            ],
        )
    }

    fn transition(
        &mut self,
        list: &mut CommandList,
        targets: &[usize],
        before: &[ResourceState],
        after: &[ResourceState],
    ) -> RendererResult<()> {
        for (&index, &expected) in targets.iter().zip(before) {
            let current = self.targets[index].state;
            if current != expected {
                return Err(RendererError::Hazard(format!(
                    "G-buffer {} is {:?}, expected {:?}",
                    NAMES[index], current, expected
                )));
            }
        }
        let transitions = targets
            .iter()
            .zip(before.iter().zip(after))
            .map(|(&index, (&before, &after))| {
                StateTransition::texture(self.targets[index].texture, before, after)
            })
            .collect();
        list.transition(transitions);
        for (&index, &state) in targets.iter().zip(after) {
            self.targets[index].state = state;
        }
        Ok(())
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Albedo, normal and specular views in attachment order
    pub fn color_views(&self) -> [TextureViewHandle; 3] {
        [
            self.targets[ALBEDO].view,
            self.targets[NORMAL].view,
            self.targets[SPECULAR].view,
        ]
    }

    pub fn depth_view(&self) -> TextureViewHandle {
        self.targets[DEPTH].view
    }

    pub fn depth_texture(&self) -> TextureHandle {
        self.targets[DEPTH].texture
    }

    pub fn textures(&self) -> [TextureHandle; 4] {
        self.targets.map(|target| target.texture)
    }

    /// Tracked states: albedo, normal, specular, depth
    pub fn states(&self) -> [ResourceState; 4] {
        self.targets.map(|target| target.state)
    }

    pub fn is_readable(&self) -> bool {
        self.targets
            .iter()
            .all(|target| target.state == ResourceState::ShaderRead)
    }

    /// Textures to release once no frame in flight uses them
    pub fn retire(&self) -> Vec<DeferredRelease> {
        self.targets
            .iter()
            .map(|target| DeferredRelease::Texture(target.texture))
            .collect()
    }
}
