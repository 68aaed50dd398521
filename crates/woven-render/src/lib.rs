// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Backend-agnostic frame execution: slot scheduling, swapchain lifecycle,
//! image state tracking, the bindless table and shader compilation.

pub mod backend;
pub mod bindless;
pub mod config;
pub mod error;
pub mod frame;
pub mod image_state;
pub mod push;
pub mod shader;
pub mod swapchain;
pub mod wait;

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub use backend::{AcquireResult, ChainImages, FrameBackend, PresentResult, SwapchainBackend, TargetImages};
pub use bindless::{BindlessCapacities, BindlessCategory, BindlessError, BindlessTable, DescriptorSink};
pub use config::RenderConfig;
pub use error::{BackendError, FrameError};
pub use frame::{FrameOutcome, FrameScheduler, FrameTicket, FRAMES_IN_FLIGHT};
pub use image_state::{ImageId, ImageState, ImageStateTracker, ImageUsage};
pub use push::{PushBlock, PUSH_CONSTANT_BYTES};
pub use swapchain::{ExtentSource, ResizeRequests, SwapchainLifecycle, SwapchainState};
pub use wait::{CancelToken, FrameTimeouts, WaitPolicy};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either side is zero, e.g. a minimized window.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        extent: Box<dyn ExtentSource>,
        config: &RenderConfig,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Flag the window side raises when its size changes. Coalesced; applied
    /// at the start of the next frame.
    fn resize_handle(&self) -> ResizeRequests;
    /// Records and presents one frame. `time` is seconds since startup.
    fn render(&mut self, time: f32) -> Result<FrameOutcome<()>, FrameError>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
}
