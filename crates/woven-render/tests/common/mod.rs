// SPDX-License-Identifier: CEPL-1.0
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use woven_render::backend::{AcquireResult, ChainImages, FrameBackend, PresentResult, SwapchainBackend, TargetImages};
use woven_render::image_state::ImageBarrier;
use woven_render::{BackendError, ExtentSource, RenderSize, FRAMES_IN_FLIGHT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    WaitIdle,
    SurfaceExtent,
    CreateSwapchain(RenderSize),
    DestroySwapchain,
    CreateTargets(RenderSize),
    DestroyTargets,
    WaitSlot(usize, bool),
    ResetSlot(usize),
    Acquire(usize),
    Begin(usize),
    Barrier(usize),
    End(usize),
    Submit(usize),
    Release(usize),
    Present(usize, u32),
}

/// In-memory stand-in for a device and swapchain. Fences complete on submit
/// unless `gpu_hung` is set. With `surface_min` set the surface clamps the
/// window size up to it, as surfaces without a fixed current extent do.
#[derive(Debug)]
pub struct FakeBackend {
    pub calls: Vec<Call>,
    pub fences: [bool; FRAMES_IN_FLIGHT],
    pub gpu_hung: bool,
    pub image_count: u32,
    pub acquire_script: VecDeque<AcquireResult>,
    pub present_script: VecDeque<PresentResult>,
    pub barriers: Vec<ImageBarrier<u64>>,
    pub fail_targets: bool,
    pub fail_submit: bool,
    pub fail_present: bool,
    pub surface_min: Option<RenderSize>,
    pub next_image: u32,
    pub next_handle: u64,
    pub chain: Option<Vec<u64>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            fences: [true; FRAMES_IN_FLIGHT],
            gpu_hung: false,
            image_count: 3,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            barriers: Vec::new(),
            fail_targets: false,
            fail_submit: false,
            fail_present: false,
            surface_min: None,
            next_image: 0,
            next_handle: 100,
            chain: None,
        }
    }
}

impl FakeBackend {
    pub fn count(&self, want: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| want(c)).count()
    }

    pub fn chains_created(&self) -> usize {
        self.count(|c| matches!(c, Call::CreateSwapchain(_)))
    }

    pub fn position(&self, call: Call) -> Option<usize> {
        self.calls.iter().position(|c| *c == call)
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl SwapchainBackend for FakeBackend {
    type Image = u64;

    fn wait_idle(&mut self) -> Result<(), BackendError> {
        self.calls.push(Call::WaitIdle);
        Ok(())
    }

    fn surface_extent(&mut self, hint: RenderSize) -> Result<RenderSize, BackendError> {
        self.calls.push(Call::SurfaceExtent);
        Ok(match self.surface_min {
            Some(min) => RenderSize::new(hint.width.max(min.width), hint.height.max(min.height)),
            None => hint,
        })
    }

    fn create_swapchain(&mut self, extent: RenderSize) -> Result<ChainImages<u64>, BackendError> {
        self.calls.push(Call::CreateSwapchain(extent));
        let images: Vec<u64> = (0..self.image_count).map(|_| self.handle()).collect();
        self.chain = Some(images.clone());
        self.next_image = 0;
        Ok(ChainImages { images, extent })
    }

    fn destroy_swapchain(&mut self) {
        self.calls.push(Call::DestroySwapchain);
        self.chain = None;
    }

    fn create_targets(&mut self, extent: RenderSize) -> Result<TargetImages<u64>, BackendError> {
        self.calls.push(Call::CreateTargets(extent));
        if self.fail_targets {
            return Err(BackendError::call("create_image", "out of device memory"));
        }
        Ok(TargetImages {
            depth: self.handle(),
            hdr: self.handle(),
        })
    }

    fn destroy_targets(&mut self) {
        self.calls.push(Call::DestroyTargets);
    }
}

impl FrameBackend for FakeBackend {
    fn wait_slot(&mut self, slot: usize, timeout: Duration) -> Result<bool, BackendError> {
        let signaled = self.fences[slot];
        if !signaled {
            std::thread::sleep(timeout);
        }
        self.calls.push(Call::WaitSlot(slot, signaled));
        Ok(signaled)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<(), BackendError> {
        self.calls.push(Call::ResetSlot(slot));
        self.fences[slot] = false;
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize, _timeout: Duration) -> Result<AcquireResult, BackendError> {
        self.calls.push(Call::Acquire(slot));
        if let Some(scripted) = self.acquire_script.pop_front() {
            return Ok(scripted);
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(AcquireResult::Acquired {
            index,
            suboptimal: false,
        })
    }

    fn begin_commands(&mut self, slot: usize) -> Result<(), BackendError> {
        self.calls.push(Call::Begin(slot));
        Ok(())
    }

    fn record_barrier(&mut self, slot: usize, barrier: &ImageBarrier<u64>) {
        self.calls.push(Call::Barrier(slot));
        self.barriers.push(*barrier);
    }

    fn end_commands(&mut self, slot: usize) -> Result<(), BackendError> {
        self.calls.push(Call::End(slot));
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<(), BackendError> {
        self.calls.push(Call::Submit(slot));
        if self.fail_submit {
            return Err(BackendError::call("queue_submit", "out of host memory"));
        }
        if !self.gpu_hung {
            self.fences[slot] = true;
        }
        Ok(())
    }

    fn release_slot(&mut self, slot: usize, _recording: bool) -> Result<(), BackendError> {
        self.calls.push(Call::Release(slot));
        self.fences[slot] = true;
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentResult, BackendError> {
        self.calls.push(Call::Present(slot, image_index));
        if self.fail_present {
            return Err(BackendError::SurfaceLost("queue_present"));
        }
        Ok(self.present_script.pop_front().unwrap_or(PresentResult::Presented))
    }
}

/// Scriptable window. Clones share state so a test can keep a handle after
/// moving one into the scheduler.
#[derive(Clone, Debug)]
pub struct FakeWindow(Rc<WindowState>);

#[derive(Debug)]
pub struct WindowState {
    current: Cell<RenderSize>,
    script: RefCell<VecDeque<RenderSize>>,
    waits: Cell<u32>,
}

impl FakeWindow {
    pub fn new(width: u32, height: u32) -> Self {
        FakeWindow(Rc::new(WindowState {
            current: Cell::new(RenderSize::new(width, height)),
            script: RefCell::new(VecDeque::new()),
            waits: Cell::new(0),
        }))
    }

    pub fn resize(&self, width: u32, height: u32) {
        self.0.current.set(RenderSize::new(width, height));
    }

    /// Extents reported by successive queries before settling on the last.
    pub fn script(&self, sizes: &[(u32, u32)]) {
        self.0
            .script
            .borrow_mut()
            .extend(sizes.iter().map(|&(w, h)| RenderSize::new(w, h)));
    }

    pub fn waits(&self) -> u32 {
        self.0.waits.get()
    }
}

impl ExtentSource for FakeWindow {
    fn extent(&self) -> RenderSize {
        if let Some(next) = self.0.script.borrow_mut().pop_front() {
            self.0.current.set(next);
        }
        self.0.current.get()
    }

    fn wait_for_change(&self, _timeout: Duration) {
        self.0.waits.set(self.0.waits.get() + 1);
    }
}
