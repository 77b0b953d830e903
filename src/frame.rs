//! Frame manager for multiple frames in flight.
//!
//! [`FrameManager`] owns the back buffers, one [`FrameResources`] set per
//! buffered frame and the graphics frame timeline. It bounds how far the CPU
//! may run ahead of the GPU and detects device loss at present time.
//!
//! # Frame timeline
//!
//! Every frame slot remembers the timeline value that marks the end of the
//! last frame recorded into it. Advancing signals the current value on the
//! graphics queue, rotates to the next slot and waits until that slot's value
//! has completed:
//!
//! ```text
//! frames_in_flight = 3
//!
//! advance  signal  slot  waits for
//! -------  ------  ----  ---------
//!    1        1      1    nothing (slot unused)
//!    2        2      2    nothing (slot unused)
//!    3        3      0    value 1  (frame 0 finished)
//!    4        4      1    value 2  (frame 1 finished)
//! ```
//!
//! The CPU therefore never starts frame `i + N` while frame `i` is still
//! unsignaled.
//!
//! # Device loss
//!
//! [`present`](FrameManager::present) compares the adapter the device was
//! created on with the current default adapter and checks the device status.
//! A mismatch or removal is recorded; afterwards every
//! [`begin_frame`](FrameManager::begin_frame) fails with
//! [`RendererError::DeviceLost`] until the owner rebuilds all GPU state.
//!
//! # Deferred release
//!
//! Resources replaced mid-frame can still be read by frames in flight.
//! [`defer_release`](FrameManager::defer_release) parks them on the current
//! slot; they are destroyed the next time that slot is reused, after its
//! fence value has completed.

use crate::backend::{
    BindGroupHandle, BufferHandle, CommandList, FenceSignal, GpuContext, QueueKind,
    RenderBundleHandle, SubmitInfo, TextureDescriptor, TextureFormat, TextureHandle,
    TextureUsage, TextureViewHandle, TimelineFence,
};
use crate::error::{DeviceLossReason, RendererError, RendererResult};
use std::sync::Arc;

/// Format of the offscreen back buffers
pub const BACK_BUFFER_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// A GPU object whose destruction waits for the frame that last used it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredRelease {
    Buffer(BufferHandle),
    BindGroup(BindGroupHandle),
    Bundle(RenderBundleHandle),
    Texture(TextureHandle),
}

/// RGBA8 pixels of a presented back buffer, rows top to bottom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCapture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl FrameCapture {
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = ((y * self.width + x) * 4) as usize;
        self.rgba
            .get(start..start + 4)
            .and_then(|texel| texel.try_into().ok())
    }

    /// Write a binary PPM; alpha is dropped.
    pub fn write_ppm(&self, mut out: impl std::io::Write) -> std::io::Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.width, self.height)?;
        for texel in self.rgba.chunks_exact(4) {
            out.write_all(&texel[..3])?;
        }
        Ok(())
    }
}

/// Per-buffered-frame state
#[derive(Debug)]
pub struct FrameResources {
    back_buffer: TextureHandle,
    back_buffer_view: TextureViewHandle,
    fence_value: u64,
    deferred: Vec<DeferredRelease>,
}

impl FrameResources {
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }
}

/// Proof that a frame was begun; consumed by [`FrameManager::present`].
#[derive(Debug)]
pub struct FrameToken {
    slot: usize,
    frame_number: u64,
    back_buffer: TextureHandle,
    back_buffer_view: TextureViewHandle,
}

impl FrameToken {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn back_buffer(&self) -> TextureHandle {
        self.back_buffer
    }

    pub fn back_buffer_view(&self) -> TextureViewHandle {
        self.back_buffer_view
    }
}

/// Manages the back buffers and the frame-in-flight protocol.
///
/// Not thread-safe; owned by the thread that records and presents frames.
pub struct FrameManager {
    ctx: Arc<GpuContext>,
    frame_fence: TimelineFence,
    frames: Vec<FrameResources>,
    current: usize,
    frame_count: u64,
    width: u32,
    height: u32,
    device_loss: Option<DeviceLossReason>,
    last_presented: Option<TextureHandle>,
}

impl FrameManager {
    /// Create the frame manager and its back buffers.
    pub fn new(
        ctx: Arc<GpuContext>,
        frames_in_flight: usize,
        width: u32,
        height: u32,
    ) -> RendererResult<Self> {
        if frames_in_flight == 0 {
            return Err(RendererError::Config(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }

        let mut frames = Vec::with_capacity(frames_in_flight);
        for index in 0..frames_in_flight {
            let (back_buffer, back_buffer_view) =
                Self::create_back_buffer(&ctx, index, width, height)?;
            frames.push(FrameResources {
                back_buffer,
                back_buffer_view,
                fence_value: 0,
                deferred: Vec::new(),
            });
        }
        frames[0].fence_value = 1;

        log::debug!(
            "frame manager created: {} frames in flight, {}x{}",
            frames_in_flight,
            width,
            height
        );

        Ok(Self {
            ctx,
            frame_fence: TimelineFence::new("frame"),
            frames,
            current: 0,
            frame_count: 0,
            width,
            height,
            device_loss: None,
            last_presented: None,
        })
    }

    fn create_back_buffer(
        ctx: &GpuContext,
        index: usize,
        width: u32,
        height: u32,
    ) -> RendererResult<(TextureHandle, TextureViewHandle)> {
        let mut backend = ctx.backend();
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(format!("Back Buffer {index}")),
            width,
            height,
            format: BACK_BUFFER_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
        })?;
        let view = backend.create_texture_view(texture)?;
        Ok((texture, view))
    }

    /// Start recording a frame into the current slot.
    pub fn begin_frame(&mut self) -> RendererResult<FrameToken> {
        if let Some(reason) = &self.device_loss {
            return Err(RendererError::DeviceLost(reason.clone()));
        }

        self.frame_count += 1;
        let frame = &self.frames[self.current];
        log::trace!(
            "Begin frame {} (slot {}, fence value {})",
            self.frame_count,
            self.current,
            frame.fence_value
        );

        Ok(FrameToken {
            slot: self.current,
            frame_number: self.frame_count,
            back_buffer: frame.back_buffer,
            back_buffer_view: frame.back_buffer_view,
        })
    }

    /// Present the frame, check the device and move to the next slot.
    pub fn present(&mut self, token: FrameToken) -> RendererResult<()> {
        if token.slot != self.current {
            return Err(RendererError::Hazard(format!(
                "frame {} presented from slot {} while slot {} is current",
                token.frame_number, token.slot, self.current
            )));
        }

        let result = self.ctx.backend().present(token.back_buffer);
        if let Err(err) = result {
            let reason = match err {
                crate::backend::BackendError::DeviceLost(reason) => {
                    DeviceLossReason::Removed(reason)
                }
                other => DeviceLossReason::PresentFailed(other.to_string()),
            };
            return Err(self.mark_lost(reason));
        }
        self.last_presented = Some(token.back_buffer);

        self.validate_device()?;
        self.advance_frame()
    }

    /// Compare the device against the platform's current state.
    ///
    /// Records the loss and fails if the device was removed or the default
    /// adapter changed since creation.
    pub fn validate_device(&mut self) -> RendererResult<()> {
        let (status, current_adapter) = {
            let mut backend = self.ctx.backend();
            (backend.device_status(), backend.current_adapter_identity())
        };

        if let crate::backend::DeviceStatus::Removed(reason) = status {
            return Err(self.mark_lost(DeviceLossReason::Removed(reason)));
        }

        let recorded = self.ctx.adapter_identity();
        match current_adapter {
            Some(current) if &current != recorded => {
                let reason = DeviceLossReason::AdapterChanged {
                    recorded: recorded.to_string(),
                    current: current.to_string(),
                };
                Err(self.mark_lost(reason))
            }
            _ => Ok(()),
        }
    }

    /// Block until the GPU finished all work tagged with the current value,
    /// then increment it.
    pub fn wait_for_gpu(&mut self) -> RendererResult<()> {
        let value = self.frames[self.current].fence_value;
        self.signal(value)?;
        if let Err(err) = self.ctx.wait_for(&self.frame_fence, value) {
            return Err(self.mark_lost(err.into()));
        }
        self.frames[self.current].fence_value += 1;
        Ok(())
    }

    /// Rotate to the next slot, waiting until its previous frame finished.
    pub fn advance_frame(&mut self) -> RendererResult<()> {
        let current_value = self.frames[self.current].fence_value;
        self.signal(current_value)?;

        self.current = (self.current + 1) % self.frames.len();

        let target = self.frames[self.current].fence_value;
        if !self.frame_fence.is_reached(target) {
            log::trace!(
                "Slot {} busy, waiting for fence value {} (completed {})",
                self.current,
                target,
                self.frame_fence.completed_value()
            );
            if let Err(err) = self.ctx.wait_for(&self.frame_fence, target) {
                return Err(self.mark_lost(err.into()));
            }
        }

        self.release_slot(self.current);
        self.frames[self.current].fence_value = current_value + 1;
        Ok(())
    }

    /// Recreate the back buffers for a new size.
    ///
    /// The GPU is drained first, then every slot restarts from the current
    /// fence value at slot 0.
    pub fn resize(&mut self, width: u32, height: u32) -> RendererResult<()> {
        if width == 0 || height == 0 {
            return Err(RendererError::Config(format!(
                "cannot resize to {width}x{height}"
            )));
        }
        self.wait_for_gpu()?;

        for index in 0..self.frames.len() {
            self.release_slot(index);
            let old = self.frames[index].back_buffer;
            self.ctx.backend().destroy_texture(old);
            let (texture, view) = Self::create_back_buffer(&self.ctx, index, width, height)?;
            self.frames[index].back_buffer = texture;
            self.frames[index].back_buffer_view = view;
        }

        let value = self.frames[self.current].fence_value;
        for frame in &mut self.frames {
            frame.fence_value = value;
        }
        self.current = 0;
        self.last_presented = None;
        self.width = width;
        self.height = height;

        log::debug!("frame manager resized to {}x{}", width, height);
        Ok(())
    }

    /// Wait for every frame signalled so far.
    pub fn wait_idle(&mut self) -> RendererResult<()> {
        let target = self.frame_fence.submitted_value();
        log::trace!("Waiting for GPU idle (fence value {})", target);
        if let Err(err) = self.ctx.wait_for(&self.frame_fence, target) {
            return Err(self.mark_lost(err.into()));
        }
        for index in 0..self.frames.len() {
            self.release_slot(index);
        }
        log::trace!("GPU idle");
        Ok(())
    }

    /// Read back the most recently presented back buffer after the GPU has
    /// finished with it. `None` before the first present and after a resize.
    pub fn capture_last_frame(&mut self) -> RendererResult<Option<FrameCapture>> {
        let Some(texture) = self.last_presented else {
            return Ok(None);
        };
        self.wait_idle()?;
        let rgba = self.ctx.backend().read_texture(texture)?;
        Ok(Some(FrameCapture {
            width: self.width,
            height: self.height,
            rgba,
        }))
    }

    /// Destroy `resource` once the frames that may read it have finished.
    pub fn defer_release(&mut self, resource: DeferredRelease) {
        self.frames[self.current].deferred.push(resource);
    }

    fn release_slot(&mut self, slot: usize) {
        let deferred = std::mem::take(&mut self.frames[slot].deferred);
        if deferred.is_empty() {
            return;
        }
        log::trace!("Releasing {} deferred resources from slot {}", deferred.len(), slot);
        let mut backend = self.ctx.backend();
        for resource in deferred {
            match resource {
                DeferredRelease::Buffer(buffer) => backend.destroy_buffer(buffer),
                DeferredRelease::BindGroup(group) => backend.destroy_bind_group(group),
                DeferredRelease::Bundle(bundle) => backend.destroy_render_bundle(bundle),
                DeferredRelease::Texture(texture) => backend.destroy_texture(texture),
            }
        }
    }

    fn signal(&mut self, value: u64) -> RendererResult<()> {
        let list = CommandList::new(QueueKind::Graphics, "frame fence");
        let info = SubmitInfo::new().signal(FenceSignal {
            fence: self.frame_fence.clone(),
            value,
        });
        self.ctx.submit(list, info).map_err(|err| {
            let err: RendererError = err.into();
            if let RendererError::DeviceLost(reason) = &err {
                self.device_loss = Some(reason.clone());
            }
            err
        })
    }

    /// Record a loss detected outside the frame manager, e.g. by a failed submit.
    pub fn record_device_loss(&mut self, reason: DeviceLossReason) {
        if self.device_loss.is_none() {
            log::error!("GPU device lost: {}", reason);
            self.device_loss = Some(reason);
        }
    }

    fn mark_lost(&mut self, reason: DeviceLossReason) -> RendererError {
        log::error!("GPU device lost: {}", reason);
        self.device_loss = Some(reason.clone());
        RendererError::DeviceLost(reason)
    }

    pub fn is_device_removed(&self) -> bool {
        self.device_loss.is_some()
    }

    pub fn device_loss(&self) -> Option<&DeviceLossReason> {
        self.device_loss.as_ref()
    }

    /// Graphics queue frame timeline
    pub fn frame_fence(&self) -> &TimelineFence {
        &self.frame_fence
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn current_frame(&self) -> &FrameResources {
        &self.frames[self.current]
    }

    /// Frames begun so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl std::fmt::Debug for FrameManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameManager")
            .field("frames_in_flight", &self.frames.len())
            .field("current", &self.current)
            .field("frame_count", &self.frame_count)
            .field("frame_fence", &self.frame_fence)
            .field("device_loss", &self.device_loss)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferDescriptor, BufferUsage, DummyBackend};
    use std::time::Duration;

    fn manager(frames: usize) -> (FrameManager, crate::backend::DummyGpu) {
        let backend = DummyBackend::new();
        let gpu = backend.gpu();
        let ctx = GpuContext::new(Box::new(backend), Duration::from_secs(5));
        (FrameManager::new(ctx, frames, 64, 64).unwrap(), gpu)
    }

    #[test]
    fn test_zero_frames_rejected() {
        let backend = DummyBackend::new();
        let ctx = GpuContext::new(Box::new(backend), Duration::from_secs(1));
        assert!(FrameManager::new(ctx, 0, 64, 64).is_err());
    }

    #[test]
    fn test_slots_rotate() {
        let (mut frames, gpu) = manager(3);
        for expected in [0, 1, 2, 0, 1] {
            let token = frames.begin_frame().unwrap();
            assert_eq!(token.slot(), expected);
            frames.present(token).unwrap();
        }
        assert_eq!(frames.frame_count(), 5);
        assert_eq!(gpu.present_count(), 5);
    }

    #[test]
    fn test_fence_values_follow_protocol() {
        let (mut frames, _gpu) = manager(3);
        assert_eq!(frames.current_frame().fence_value(), 1);

        frames.advance_frame().unwrap();
        assert_eq!(frames.current_slot(), 1);
        assert_eq!(frames.current_frame().fence_value(), 2);
        assert_eq!(frames.frame_fence().completed_value(), 1);
    }

    #[test]
    fn test_wait_for_gpu_increments_value() {
        let (mut frames, _gpu) = manager(2);
        let before = frames.current_frame().fence_value();
        frames.wait_for_gpu().unwrap();
        assert_eq!(frames.current_frame().fence_value(), before + 1);
        assert!(frames.frame_fence().is_reached(before));
    }

    #[test]
    fn test_resize_resets_slots() {
        let (mut frames, _gpu) = manager(3);
        frames.advance_frame().unwrap();
        frames.resize(128, 32).unwrap();
        assert_eq!(frames.current_slot(), 0);
        assert_eq!(frames.size(), (128, 32));
        let value = frames.current_frame().fence_value();
        assert!(frames.frames.iter().all(|f| f.fence_value == value));
    }

    #[test]
    fn test_deferred_release_waits_for_slot_reuse() {
        let (mut frames, gpu) = manager(2);
        let buffer = frames
            .ctx
            .backend()
            .create_buffer(&BufferDescriptor::new("old", 16, BufferUsage::VERTEX))
            .unwrap();

        frames.defer_release(DeferredRelease::Buffer(buffer));
        frames.advance_frame().unwrap();
        assert!(gpu.is_buffer_alive(buffer));

        frames.advance_frame().unwrap();
        assert!(!gpu.is_buffer_alive(buffer));
    }

    #[test]
    fn test_device_removal_detected_on_present() {
        let (mut frames, gpu) = manager(2);
        let token = frames.begin_frame().unwrap();
        gpu.remove_device("driver reset");

        let err = frames.present(token).unwrap_err();
        assert!(err.is_device_lost());
        assert!(frames.is_device_removed());
        assert!(frames.begin_frame().unwrap_err().is_device_lost());
    }

    #[test]
    fn test_adapter_change_detected_on_present() {
        let (mut frames, gpu) = manager(2);
        let mut other = DummyBackend::default_adapter();
        other.device = 0x1234;
        gpu.set_current_adapter(other);

        let token = frames.begin_frame().unwrap();
        let err = frames.present(token).unwrap_err();
        assert!(matches!(
            err,
            RendererError::DeviceLost(DeviceLossReason::AdapterChanged { .. })
        ));
    }

    fn manual_manager(frames: usize, timeout: Duration) -> (FrameManager, crate::backend::DummyGpu) {
        let backend = DummyBackend::new_manual();
        let gpu = backend.gpu();
        let ctx = GpuContext::new(Box::new(backend), timeout);
        (FrameManager::new(ctx, frames, 64, 64).unwrap(), gpu)
    }

    fn present_next(frames: &mut FrameManager) -> RendererResult<()> {
        let token = frames.begin_frame()?;
        frames.present(token)
    }

    #[test]
    fn test_only_n_minus_one_frames_run_ahead() {
        let (mut frames, gpu) = manual_manager(3, Duration::from_millis(50));

        let results: Vec<bool> = (0..3).map(|_| present_next(&mut frames).is_ok()).collect();
        assert_eq!(results, vec![true, true, false]);
        assert_eq!(frames.frame_fence().completed_value(), 0);
        assert_eq!(gpu.pending_count(), 3);

        match frames.device_loss() {
            Some(DeviceLossReason::WaitTimeout { fence, target, .. }) => {
                assert_eq!(fence, "frame");
                assert_eq!(*target, 1);
            }
            other => panic!("expected a frame fence timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_signalled_frame_releases_frame_n_later() {
        let (mut frames, gpu) = manual_manager(3, Duration::from_secs(5));
        present_next(&mut frames).unwrap();
        present_next(&mut frames).unwrap();

        for frame in 1..=6u64 {
            // Complete exactly the frame N earlier; the next present must not wait for more.
            assert!(gpu.complete_next());
            assert_eq!(frames.frame_fence().completed_value(), frame);
            present_next(&mut frames).unwrap();
            assert_eq!(
                frames.frame_fence().submitted_value() - frames.frame_fence().completed_value(),
                2
            );
        }
    }

    #[test]
    fn test_blocked_present_resumes_when_the_gpu_catches_up() {
        let (mut frames, gpu) = manual_manager(2, Duration::from_secs(5));
        present_next(&mut frames).unwrap();

        let stepper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            gpu.complete_next()
        });
        let started = std::time::Instant::now();
        present_next(&mut frames).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(stepper.join().unwrap());
        assert_eq!(frames.frame_fence().completed_value(), 1);
        assert!(!frames.is_device_removed());
    }

    #[test]
    fn test_capture_follows_presents() {
        let (mut frames, _gpu) = manager(2);
        assert_eq!(frames.capture_last_frame().unwrap(), None);

        let token = frames.begin_frame().unwrap();
        frames.present(token).unwrap();
        let capture = frames.capture_last_frame().unwrap().unwrap();
        assert_eq!((capture.width, capture.height), (64, 64));
        assert_eq!(capture.rgba.len(), 64 * 64 * 4);
        assert_eq!(capture.pixel(63, 63), Some([0, 0, 0, 0]));
        assert_eq!(capture.pixel(64, 0), None);

        frames.resize(32, 32).unwrap();
        assert_eq!(frames.capture_last_frame().unwrap(), None);
    }

    #[test]
    fn test_capture_writes_ppm() {
        let capture = FrameCapture {
            width: 2,
            height: 1,
            rgba: vec![255, 0, 0, 255, 0, 128, 255, 255],
        };
        let mut out = Vec::new();
        capture.write_ppm(&mut out).unwrap();
        assert_eq!(&out[..11], b"P6\n2 1\n255\n");
        assert_eq!(&out[11..], &[255, 0, 0, 0, 128, 255]);
    }
}
