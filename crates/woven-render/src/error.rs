// SPDX-License-Identifier: CEPL-1.0
use std::fmt;
use std::time::Duration;

use crate::image_state::TrackerError;
use crate::wait::WaitError;

/// Failure reported by a GPU backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("{op} failed: {message}")]
    Call { op: &'static str, message: String },
    #[error("device lost during {0}")]
    DeviceLost(&'static str),
    #[error("surface lost during {0}")]
    SurfaceLost(&'static str),
    #[error("surface reports no usable {0}")]
    Unsupported(&'static str),
}

impl BackendError {
    pub fn call(op: &'static str, err: impl fmt::Display) -> Self {
        BackendError::Call {
            op,
            message: err.to_string(),
        }
    }
}

/// Fatal outcome of a scheduler call. Stale surfaces are not errors; they
/// surface as [`crate::FrameOutcome::Retry`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },
    #[error("cancelled while waiting for {what}")]
    Cancelled { what: &'static str },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("no frame is being recorded")]
    NotRecording,
    #[error("slot {0} is still recording; end_frame was never called")]
    AlreadyRecording(usize),
    #[error("ticket for slot {ticket} does not belong to the frame recording in slot {recording}")]
    TicketMismatch { ticket: usize, recording: usize },
    #[error("acquired image index {index} but the chain has {len} images")]
    ImageIndex { index: u32, len: usize },
    #[error("no swapchain is built")]
    NoSwapchain,
}

impl FrameError {
    pub(crate) fn wait(what: &'static str, err: WaitError) -> Self {
        match err {
            WaitError::TimedOut(after) => FrameError::Timeout { what, after },
            WaitError::Cancelled => FrameError::Cancelled { what },
            WaitError::Backend(e) => FrameError::Backend(e),
        }
    }

    /// Errors caused by misuse of the API rather than by the device.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            FrameError::Tracker(_)
                | FrameError::NotRecording
                | FrameError::AlreadyRecording(_)
                | FrameError::TicketMismatch { .. }
        )
    }
}
