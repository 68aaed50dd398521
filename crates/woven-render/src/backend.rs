// SPDX-License-Identifier: CEPL-1.0
//! The seam between the frame machinery and a concrete graphics API.
//!
//! Slots are addressed by index `0..FRAMES_IN_FLIGHT`. Implementations own the
//! per-slot command buffers, semaphores and fences; the scheduler only decides
//! when each of them is used.

use std::fmt;
use std::time::Duration;

use crate::error::BackendError;
use crate::image_state::ImageBarrier;
use crate::RenderSize;

/// Images of a freshly built presentable chain.
#[derive(Debug, Clone)]
pub struct ChainImages<H> {
    pub images: Vec<H>,
    pub extent: RenderSize,
}

/// Extent-dependent render targets built alongside the chain.
#[derive(Debug, Clone, Copy)]
pub struct TargetImages<H> {
    pub depth: H,
    pub hdr: H,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
    /// Nothing became available within the time slice.
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Presented,
    Suboptimal,
    OutOfDate,
}

pub trait SwapchainBackend {
    type Image: Copy + fmt::Debug;

    /// Blocks until the device has no work in flight.
    fn wait_idle(&mut self) -> Result<(), BackendError>;
    /// Extent the surface will accept given the window's own size. Zero when
    /// the window is minimized.
    fn surface_extent(&mut self, hint: RenderSize) -> Result<RenderSize, BackendError>;
    fn create_swapchain(&mut self, extent: RenderSize) -> Result<ChainImages<Self::Image>, BackendError>;
    fn destroy_swapchain(&mut self);
    fn create_targets(&mut self, extent: RenderSize) -> Result<TargetImages<Self::Image>, BackendError>;
    fn destroy_targets(&mut self);
}

pub trait FrameBackend: SwapchainBackend {
    /// Waits up to `timeout` for the slot's completion marker. `Ok(false)`
    /// means it is still pending.
    fn wait_slot(&mut self, slot: usize, timeout: Duration) -> Result<bool, BackendError>;
    fn reset_slot(&mut self, slot: usize) -> Result<(), BackendError>;
    /// Requests the next image, signalling the slot's acquire semaphore.
    fn acquire_image(&mut self, slot: usize, timeout: Duration) -> Result<AcquireResult, BackendError>;
    fn begin_commands(&mut self, slot: usize) -> Result<(), BackendError>;
    fn record_barrier(&mut self, slot: usize, barrier: &ImageBarrier<Self::Image>);
    fn end_commands(&mut self, slot: usize) -> Result<(), BackendError>;
    fn submit(&mut self, slot: usize) -> Result<(), BackendError>;
    /// Gives up on the slot's frame without running its commands. Closes the
    /// command buffer when `recording`, consumes the acquire semaphore and
    /// signals the completion marker so the slot can be waited on again.
    fn release_slot(&mut self, slot: usize, recording: bool) -> Result<(), BackendError>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentResult, BackendError>;
}
