// SPDX-License-Identifier: CEPL-1.0
//! Per-frame state machine over a fixed ring of frame slots.
//!
//! A slot's fence is waited on before the slot is reused, which bounds the CPU
//! to [`FRAMES_IN_FLIGHT`] frames ahead of the GPU. Everything else is ordered
//! on the GPU through the slot's semaphores.

use tracing::{debug, error, warn};

use crate::backend::{AcquireResult, FrameBackend, PresentResult};
use crate::error::FrameError;
use crate::image_state::{BarrierSink, ImageBarrier, ImageId, ImageState, ImageStateTracker};
use crate::swapchain::{ExtentSource, ResizeRequests, StaleReason, SwapchainLifecycle, SwapchainState};
use crate::wait::{wait_in_slices, CancelToken, FrameTimeouts};
use crate::RenderSize;

pub const FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome<T> {
    Ready(T),
    /// The surface went stale; nothing was recorded. Call again.
    Retry,
}

impl<T> FrameOutcome<T> {
    pub fn is_retry(&self) -> bool {
        matches!(self, FrameOutcome::Retry)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            FrameOutcome::Ready(v) => Some(v),
            FrameOutcome::Retry => None,
        }
    }
}

/// Proof that a frame is being recorded. Consumed by `end_frame`.
#[derive(Debug)]
pub struct FrameTicket {
    slot: usize,
    image_index: u32,
    frame_number: u64,
}

impl FrameTicket {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }
}

struct SlotRecorder<'a, B> {
    backend: &'a mut B,
    slot: usize,
}

impl<B: FrameBackend> BarrierSink<B::Image> for SlotRecorder<'_, B> {
    fn image_barrier(&mut self, barrier: &ImageBarrier<B::Image>) {
        self.backend.record_barrier(self.slot, barrier);
    }
}

pub struct FrameScheduler<B: FrameBackend, E> {
    backend: B,
    source: E,
    tracker: ImageStateTracker<B::Image>,
    lifecycle: SwapchainLifecycle,
    timeouts: FrameTimeouts,
    cancel: CancelToken,
    frame_number: u64,
    recording: Option<usize>,
}

impl<B: FrameBackend, E: ExtentSource> FrameScheduler<B, E> {
    /// Builds the initial chain. Blocks while the window is minimized.
    pub fn new(
        mut backend: B,
        source: E,
        timeouts: FrameTimeouts,
        cancel: CancelToken,
    ) -> Result<Self, FrameError> {
        let mut tracker = ImageStateTracker::new();
        let lifecycle =
            SwapchainLifecycle::create(&mut backend, &mut tracker, &source, timeouts.minimized(), &cancel)?;
        Ok(Self {
            backend,
            source,
            tracker,
            lifecycle,
            timeouts,
            cancel,
            frame_number: 0,
            recording: None,
        })
    }

    pub fn begin_frame(&mut self) -> Result<FrameOutcome<FrameTicket>, FrameError> {
        if let Some(slot) = self.recording {
            return Err(FrameError::AlreadyRecording(slot));
        }
        if self.lifecycle.needs_rebuild() {
            self.lifecycle
                .recreate(&mut self.backend, &mut self.tracker, &self.source, &self.cancel)?;
        }

        let slot = self.frame_index();
        let policy = self.timeouts.slot_wait();
        wait_in_slices(&policy, &self.cancel, |slice| {
            Ok(self.backend.wait_slot(slot, slice)?.then_some(()))
        })
        .map_err(|e| FrameError::wait("the frame slot fence", e))?;

        let policy = self.timeouts.acquire();
        let acquired = wait_in_slices(&policy, &self.cancel, |slice| {
            match self.backend.acquire_image(slot, slice)? {
                AcquireResult::NotReady => Ok(None),
                other => Ok(Some(other)),
            }
        })
        .map_err(|e| FrameError::wait("a swapchain image", e))?;

        let image_index = match acquired {
            AcquireResult::Acquired { index, suboptimal } => {
                if suboptimal {
                    self.lifecycle.mark_stale(StaleReason::AcquireSuboptimal);
                }
                index
            }
            AcquireResult::OutOfDate | AcquireResult::NotReady => {
                self.lifecycle.mark_stale(StaleReason::AcquireOutOfDate);
                debug!(slot, "acquire reported out of date; retrying next frame");
                return Ok(FrameOutcome::Retry);
            }
        };
        let len = self.state()?.images.len();
        if image_index as usize >= len {
            return Err(FrameError::ImageIndex { index: image_index, len });
        }

        // The fence is reset only once an image is in hand, so a Retry above
        // leaves the slot signaled and the next attempt does not block on it.
        self.backend.reset_slot(slot)?;
        self.backend.begin_commands(slot)?;
        self.recording = Some(slot);
        Ok(FrameOutcome::Ready(FrameTicket {
            slot,
            image_index,
            frame_number: self.frame_number,
        }))
    }

    pub fn end_frame(&mut self, ticket: FrameTicket) -> Result<FrameOutcome<()>, FrameError> {
        self.check_ticket(&ticket)?;
        let slot = ticket.slot;

        let submitted = self
            .backend
            .end_commands(slot)
            .and_then(|()| self.backend.submit(slot));
        if let Err(e) = submitted {
            error!(slot, "submit failed, abandoning frame {}: {e}", ticket.frame_number);
            self.release(slot, false);
            return Err(e.into());
        }
        self.recording = None;
        // The slot's work is queued from here on, whatever present reports.
        self.frame_number += 1;
        let presented = self.backend.present(slot, ticket.image_index)?;

        match presented {
            PresentResult::Presented => {}
            PresentResult::Suboptimal => self.lifecycle.mark_stale(StaleReason::PresentSuboptimal),
            PresentResult::OutOfDate => self.lifecycle.mark_stale(StaleReason::PresentOutOfDate),
        }
        Ok(if self.lifecycle.needs_rebuild() {
            FrameOutcome::Retry
        } else {
            FrameOutcome::Ready(())
        })
    }

    /// Drops the frame `ticket` was issued for after a recording failure.
    /// Nothing is presented; the slot is left signaled and the chain is
    /// rebuilt on the next `begin_frame` to return the acquired image.
    pub fn abandon_frame(&mut self, ticket: FrameTicket) -> Result<(), FrameError> {
        self.check_ticket(&ticket)?;
        warn!(slot = ticket.slot, frame = ticket.frame_number, "frame abandoned");
        self.release(ticket.slot, true);
        Ok(())
    }

    /// Moves `image` into `to` inside the current frame, recording a barrier
    /// only if its tracked state differs.
    pub fn transition(
        &mut self,
        ticket: &FrameTicket,
        image: ImageId,
        to: impl Into<ImageState>,
    ) -> Result<bool, FrameError> {
        self.check_ticket(ticket)?;
        let mut sink = SlotRecorder {
            backend: &mut self.backend,
            slot: ticket.slot,
        };
        self.tracker.transition(image, to, &mut sink).map_err(|e| {
            error!(slot = ticket.slot, "image transition rejected: {e}");
            FrameError::from(e)
        })
    }

    /// Marks `image`'s contents as disposable before it is rewritten.
    pub fn discard(&mut self, image: ImageId) -> Result<(), FrameError> {
        Ok(self.tracker.discard(image)?)
    }

    /// The tracked presentable image the ticket acquired.
    pub fn present_image(&self, ticket: &FrameTicket) -> Result<ImageId, FrameError> {
        let state = self.state()?;
        state
            .images
            .get(ticket.image_index as usize)
            .copied()
            .ok_or(FrameError::ImageIndex {
                index: ticket.image_index,
                len: state.images.len(),
            })
    }

    pub fn depth_target(&self) -> Result<ImageId, FrameError> {
        Ok(self.state()?.depth)
    }

    pub fn hdr_target(&self) -> Result<ImageId, FrameError> {
        Ok(self.state()?.hdr)
    }

    pub fn state(&self) -> Result<&SwapchainState, FrameError> {
        self.lifecycle.state().ok_or(FrameError::NoSwapchain)
    }

    pub fn extent(&self) -> Option<RenderSize> {
        self.lifecycle.state().map(|s| s.extent)
    }

    /// Frames submitted so far. Abandoned frames do not count.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Slot the next `begin_frame` will use.
    pub fn frame_index(&self) -> usize {
        (self.frame_number % FRAMES_IN_FLIGHT as u64) as usize
    }

    pub fn rebuild_count(&self) -> u64 {
        self.lifecycle.rebuild_count()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Handle other threads can use to request a resize.
    pub fn resize_handle(&self) -> ResizeRequests {
        self.lifecycle.resize_requests().clone()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn tracker(&self) -> &ImageStateTracker<B::Image> {
        &self.tracker
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Waits for the device and releases the chain. The scheduler can be
    /// dropped afterwards; a later `begin_frame` would rebuild.
    pub fn shutdown(&mut self) -> Result<(), FrameError> {
        self.recording = None;
        self.backend.wait_idle()?;
        self.lifecycle.destroy(&mut self.backend, &mut self.tracker);
        Ok(())
    }

    fn release(&mut self, slot: usize, recording: bool) {
        self.recording = None;
        self.lifecycle.mark_stale(StaleReason::FrameAbandoned);
        if let Err(e) = self.backend.release_slot(slot, recording) {
            error!(slot, "releasing abandoned slot: {e}");
        }
    }

    fn check_ticket(&self, ticket: &FrameTicket) -> Result<(), FrameError> {
        match self.recording {
            None => Err(FrameError::NotRecording),
            Some(slot) if slot != ticket.slot => Err(FrameError::TicketMismatch {
                ticket: ticket.slot,
                recording: slot,
            }),
            Some(_) => Ok(()),
        }
    }
}
