// SPDX-License-Identifier: CEPL-1.0
//! Ownership of the presentable chain and the targets sized from it.
//!
//! The chain, the depth buffer and the HDR target are built and destroyed as
//! one unit. Rebuilding is destroy-then-create and needs an idle device, which
//! is why only [`crate::FrameScheduler::begin_frame`] triggers it.

use std::sync::Arc;
use std::time::Duration;

use portable_atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::backend::SwapchainBackend;
use crate::error::FrameError;
use crate::image_state::{
    Access, ImageAspect, ImageId, ImageLayout, ImageState, ImageStateTracker, PipelineStages,
};
use crate::wait::{wait_in_slices, CancelToken, WaitPolicy};
use crate::RenderSize;

/// State a presentable image is registered in after (re)creation. The layout
/// is undefined; the stage is where the acquire semaphore is waited on, so the
/// first transition is ordered after the presentation engine releases it.
pub const PRESENTABLE_UNDEFINED: ImageState = ImageState::new(
    ImageLayout::Undefined,
    PipelineStages::COLOR_ATTACHMENT_OUTPUT,
    Access::empty(),
);

/// Window-side view of the drawable area.
pub trait ExtentSource {
    /// Current drawable size in pixels. Zero while minimized.
    fn extent(&self) -> RenderSize;

    /// Blocks for at most `timeout` or until the size may have changed.
    fn wait_for_change(&self, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}

impl<T: ExtentSource + ?Sized> ExtentSource for Box<T> {
    fn extent(&self) -> RenderSize {
        (**self).extent()
    }

    fn wait_for_change(&self, timeout: Duration) {
        (**self).wait_for_change(timeout)
    }
}

/// Coalescing resize flag. Any number of requests between two checks
/// collapse into one rebuild. Clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct ResizeRequests(Arc<AtomicBool>);

impl ResizeRequests {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleReason {
    AcquireOutOfDate,
    AcquireSuboptimal,
    PresentOutOfDate,
    PresentSuboptimal,
    BuildFailed,
    FrameAbandoned,
}

/// Tracked images of the current chain and its dependent targets.
#[derive(Debug, Clone)]
pub struct SwapchainState {
    pub images: Vec<ImageId>,
    pub depth: ImageId,
    pub hdr: ImageId,
    pub extent: RenderSize,
}

impl SwapchainState {
    /// Every tracked image whose size follows the surface.
    pub fn tracked_images(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.images.iter().copied().chain([self.depth, self.hdr])
    }
}

#[derive(Debug)]
pub struct SwapchainLifecycle {
    state: Option<SwapchainState>,
    stale: Option<StaleReason>,
    resize: ResizeRequests,
    minimized: WaitPolicy,
    rebuilds: u64,
}

impl SwapchainLifecycle {
    pub fn create<B: SwapchainBackend, E: ExtentSource + ?Sized>(
        backend: &mut B,
        tracker: &mut ImageStateTracker<B::Image>,
        source: &E,
        minimized: WaitPolicy,
        token: &CancelToken,
    ) -> Result<Self, FrameError> {
        let mut lifecycle = Self {
            state: None,
            stale: None,
            resize: ResizeRequests::default(),
            minimized,
            rebuilds: 0,
        };
        lifecycle.build(backend, tracker, source, token)?;
        Ok(lifecycle)
    }

    /// Tears the current chain down and builds a new one. The device must not
    /// have frames in flight; this waits for idle before touching anything.
    pub fn recreate<B: SwapchainBackend, E: ExtentSource + ?Sized>(
        &mut self,
        backend: &mut B,
        tracker: &mut ImageStateTracker<B::Image>,
        source: &E,
        token: &CancelToken,
    ) -> Result<&SwapchainState, FrameError> {
        let reason = self.stale.take();
        let resized = self.resize.take();
        debug!(?reason, resized, "swapchain rebuild requested");
        backend.wait_idle()?;
        self.destroy(backend, tracker);
        self.build(backend, tracker, source, token)?;
        self.rebuilds += 1;
        self.state.as_ref().ok_or(FrameError::NoSwapchain)
    }

    pub fn destroy<B: SwapchainBackend>(
        &mut self,
        backend: &mut B,
        tracker: &mut ImageStateTracker<B::Image>,
    ) {
        let Some(state) = self.state.take() else {
            return;
        };
        for id in state.tracked_images() {
            if let Err(e) = tracker.retire(id) {
                warn!("retiring swapchain image: {e}");
            }
        }
        backend.destroy_targets();
        backend.destroy_swapchain();
    }

    pub fn mark_stale(&mut self, reason: StaleReason) {
        if self.stale.is_none() {
            debug!(?reason, "swapchain marked stale");
            self.stale = Some(reason);
        }
    }

    pub fn needs_rebuild(&self) -> bool {
        self.state.is_none() || self.stale.is_some() || self.resize.pending()
    }

    pub fn resize_requests(&self) -> &ResizeRequests {
        &self.resize
    }

    pub fn state(&self) -> Option<&SwapchainState> {
        self.state.as_ref()
    }

    /// Number of rebuilds after the initial build.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    fn build<B: SwapchainBackend, E: ExtentSource + ?Sized>(
        &mut self,
        backend: &mut B,
        tracker: &mut ImageStateTracker<B::Image>,
        source: &E,
        token: &CancelToken,
    ) -> Result<&SwapchainState, FrameError> {
        let extent = self.wait_for_extent(backend, source, token)?;

        let chain = match backend.create_swapchain(extent) {
            Ok(c) => c,
            Err(e) => {
                self.stale = Some(StaleReason::BuildFailed);
                return Err(e.into());
            }
        };
        let targets = match backend.create_targets(chain.extent) {
            Ok(t) => t,
            Err(e) => {
                backend.destroy_swapchain();
                self.stale = Some(StaleReason::BuildFailed);
                return Err(e.into());
            }
        };

        let images = chain
            .images
            .iter()
            .enumerate()
            .map(|(i, &image)| {
                tracker.register_in(image, ImageAspect::Color, format!("swapchain[{i}]"), PRESENTABLE_UNDEFINED)
            })
            .collect::<Vec<_>>();
        let depth = tracker.register(targets.depth, ImageAspect::Depth, "depth");
        let hdr = tracker.register(targets.hdr, ImageAspect::Color, "hdr");

        info!(
            "swapchain ready: {}x{}, {} images",
            chain.extent.width,
            chain.extent.height,
            images.len()
        );
        self.stale = None;
        Ok(self.state.insert(SwapchainState {
            images,
            depth,
            hdr,
            extent: chain.extent,
        }))
    }

    /// Polls until both the window and the surface report a non-zero extent.
    /// The window is checked first since some surfaces clamp a zero size up to
    /// their minimum. No frame is in flight here so blocking is fine.
    fn wait_for_extent<B: SwapchainBackend, E: ExtentSource + ?Sized>(
        &self,
        backend: &mut B,
        source: &E,
        token: &CancelToken,
    ) -> Result<RenderSize, FrameError> {
        let mut parked = false;
        wait_in_slices(&self.minimized, token, |slice| {
            let window = source.extent();
            let extent = if window.is_empty() {
                window
            } else {
                backend.surface_extent(window)?
            };
            if !extent.is_empty() {
                if parked {
                    info!("surface restored to {}x{}", extent.width, extent.height);
                }
                return Ok(Some(extent));
            }
            if !parked {
                info!("surface has zero extent, waiting for the window to be restored");
                parked = true;
            }
            source.wait_for_change(slice);
            Ok(None)
        })
        .map_err(|e| FrameError::wait("a non-zero surface extent", e))
    }
}
