// SPDX-License-Identifier: CEPL-1.0
//! Cancellation-aware blocking waits.
//!
//! Every wait the engine performs (slot fences, image acquisition, a minimized
//! surface) is split into short slices so a [`CancelToken`] is observed between
//! slices and an overall deadline can be enforced even when the underlying
//! call would block forever.

use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_atomic::{AtomicBool, Ordering};
use serde::Deserialize;

use crate::error::BackendError;

/// Shared flag that aborts in-progress waits. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag so the token can be reused after a handled cancellation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bounds for one kind of wait. `timeout: None` waits until cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Option<Duration>,
    pub slice: Duration,
}

impl WaitPolicy {
    pub const DEFAULT_SLICE: Duration = Duration::from_millis(10);

    pub fn bounded(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            slice: Self::DEFAULT_SLICE.min(timeout),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            timeout: None,
            slice: Self::DEFAULT_SLICE,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Repeatedly calls `poll` with a slice budget until it yields a value, the
/// token is cancelled, or the policy's timeout elapses.
///
/// `poll` is expected to block for at most the slice it is given and return
/// `Ok(None)` when nothing happened within it.
pub fn wait_in_slices<T>(
    policy: &WaitPolicy,
    token: &CancelToken,
    mut poll: impl FnMut(Duration) -> Result<Option<T>, BackendError>,
) -> Result<T, WaitError> {
    let start = Instant::now();
    loop {
        if token.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let slice = match policy.timeout {
            Some(limit) => {
                let left = limit.saturating_sub(start.elapsed());
                if left.is_zero() {
                    return Err(WaitError::TimedOut(limit));
                }
                policy.slice.min(left)
            }
            None => policy.slice,
        };
        if let Some(value) = poll(slice)? {
            return Ok(value);
        }
    }
}

/// Millisecond limits for the scheduler's waits, as read from config.
/// A limit of 0 means "no timeout, cancellation only".
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FrameTimeouts {
    pub slot_wait_ms: u64,
    pub acquire_ms: u64,
    pub minimized_poll_ms: u64,
}

impl Default for FrameTimeouts {
    fn default() -> Self {
        Self {
            slot_wait_ms: 5_000,
            acquire_ms: 5_000,
            minimized_poll_ms: 50,
        }
    }
}

impl FrameTimeouts {
    pub fn slot_wait(&self) -> WaitPolicy {
        policy_from_ms(self.slot_wait_ms)
    }

    pub fn acquire(&self) -> WaitPolicy {
        policy_from_ms(self.acquire_ms)
    }

    /// Waiting for a minimized window has no deadline; only the poll rate is
    /// configurable.
    pub fn minimized(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: None,
            slice: Duration::from_millis(self.minimized_poll_ms.max(1)),
        }
    }
}

fn policy_from_ms(ms: u64) -> WaitPolicy {
    if ms == 0 {
        WaitPolicy::unbounded()
    } else {
        WaitPolicy::bounded(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_first_value() {
        let mut calls = 0;
        let got = wait_in_slices(&WaitPolicy::unbounded(), &CancelToken::new(), |_| {
            calls += 1;
            Ok((calls == 3).then_some(calls))
        })
        .unwrap();
        assert_eq!(got, 3);
    }

    #[test]
    fn times_out() {
        let policy = WaitPolicy::bounded(Duration::from_millis(20));
        let err = wait_in_slices::<()>(&policy, &CancelToken::new(), |slice| {
            std::thread::sleep(slice);
            Ok(None)
        })
        .unwrap_err();
        assert!(matches!(err, WaitError::TimedOut(d) if d == Duration::from_millis(20)));
    }

    #[test]
    fn slices_never_exceed_budget() {
        let policy = WaitPolicy::bounded(Duration::from_millis(15));
        let mut seen = Vec::new();
        let _ = wait_in_slices::<()>(&policy, &CancelToken::new(), |slice| {
            seen.push(slice);
            std::thread::sleep(slice);
            Ok(None)
        });
        assert!(seen.iter().all(|s| *s <= Duration::from_millis(10)));
    }

    #[test]
    fn cancelled_before_polling() {
        let token = CancelToken::new();
        token.cancel();
        let err = wait_in_slices::<()>(&WaitPolicy::unbounded(), &token, |_| {
            panic!("poll must not run once cancelled")
        })
        .unwrap_err();
        assert!(matches!(err, WaitError::Cancelled));
    }

    #[test]
    fn cancel_from_another_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let err = wait_in_slices::<()>(&WaitPolicy::unbounded(), &token, |slice| {
            std::thread::sleep(slice);
            Ok(None)
        })
        .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, WaitError::Cancelled));
    }

    #[test]
    fn backend_errors_propagate() {
        let err = wait_in_slices::<()>(&WaitPolicy::unbounded(), &CancelToken::new(), |_| {
            Err(BackendError::DeviceLost("fence wait"))
        })
        .unwrap_err();
        assert!(matches!(err, WaitError::Backend(BackendError::DeviceLost(_))));
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let t = FrameTimeouts {
            slot_wait_ms: 0,
            ..FrameTimeouts::default()
        };
        assert_eq!(t.slot_wait().timeout, None);
        assert_eq!(t.acquire().timeout, Some(Duration::from_millis(5_000)));
    }
}
