// SPDX-License-Identifier: CEPL-1.0
//! Window-side collaborator of the renderer.
//!
//! winit delivers size changes on the event-loop thread; the renderer asks for
//! the drawable extent when it rebuilds. [`WindowSignals`] sits between them:
//! event handlers push the latest size in, and the renderer reads it through
//! [`ExtentSource`].

pub use winit;

use std::sync::Arc;
use std::time::Duration;

use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;
use winit::dpi::PhysicalSize;
use woven_render::{ExtentSource, RenderSize, ResizeRequests};

pub const DEFAULT_TITLE: &str = "Woven Core";
pub const DEFAULT_SIZE: RenderSize = RenderSize::new(1920, 1080);

#[derive(Debug, Default)]
struct Shared {
    // width in the high half, height in the low half, so both change together
    extent: AtomicU64,
    occluded: AtomicBool,
}

#[derive(Clone, Debug, Default)]
pub struct WindowSignals {
    shared: Arc<Shared>,
    resize: Option<ResizeRequests>,
}

impl WindowSignals {
    pub fn new(size: PhysicalSize<u32>) -> Self {
        let signals = Self::default();
        signals.store(size.width, size.height);
        signals
    }

    /// Forwards every size change to `resize` as well.
    pub fn with_resize_requests(mut self, resize: ResizeRequests) -> Self {
        self.resize = Some(resize);
        self
    }

    pub fn on_resized(&self, size: PhysicalSize<u32>) {
        self.store(size.width, size.height);
        debug!("window extent now {}x{}", size.width, size.height);
        if let Some(resize) = &self.resize {
            resize.request();
        }
    }

    pub fn on_occluded(&self, occluded: bool) {
        self.shared.occluded.store(occluded, Ordering::Release);
    }

    /// Zero-sized or hidden: nothing should be rendered.
    pub fn is_paused(&self) -> bool {
        self.extent().is_empty() || self.shared.occluded.load(Ordering::Acquire)
    }

    fn store(&self, width: u32, height: u32) {
        let packed = (u64::from(width) << 32) | u64::from(height);
        self.shared.extent.store(packed, Ordering::Release);
    }
}

impl ExtentSource for WindowSignals {
    fn extent(&self) -> RenderSize {
        let packed = self.shared.extent.load(Ordering::Acquire);
        RenderSize::new((packed >> 32) as u32, packed as u32)
    }

    fn wait_for_change(&self, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_round_trips_through_packing() {
        let s = WindowSignals::new(PhysicalSize::new(1920, 1080));
        assert_eq!(s.extent(), RenderSize::new(1920, 1080));
        s.on_resized(PhysicalSize::new(u32::MAX, 7));
        assert_eq!(s.extent(), RenderSize::new(u32::MAX, 7));
    }

    #[test]
    fn resize_events_raise_one_coalesced_request() {
        let requests = ResizeRequests::default();
        let s = WindowSignals::new(PhysicalSize::new(10, 10)).with_resize_requests(requests.clone());
        let remote = s.clone();
        std::thread::spawn(move || {
            remote.on_resized(PhysicalSize::new(20, 20));
            remote.on_resized(PhysicalSize::new(30, 30));
        })
        .join()
        .unwrap();
        assert_eq!(s.extent(), RenderSize::new(30, 30));
        assert!(requests.take());
        assert!(!requests.pending());
    }

    #[test]
    fn minimized_or_occluded_pauses() {
        let s = WindowSignals::new(PhysicalSize::new(800, 600));
        assert!(!s.is_paused());
        s.on_resized(PhysicalSize::new(0, 600));
        assert!(s.is_paused());
        s.on_resized(PhysicalSize::new(800, 600));
        s.on_occluded(true);
        assert!(s.is_paused());
    }
}
