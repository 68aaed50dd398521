// SPDX-License-Identifier: CEPL-1.0
mod common;

use std::time::Duration;

use common::{Call, FakeBackend, FakeWindow};
use woven_render::backend::{AcquireResult, PresentResult};
use woven_render::image_state::ImageLayout;
use woven_render::{
    CancelToken, FrameError, FrameOutcome, FrameScheduler, FrameTicket, FrameTimeouts, ImageUsage, RenderSize,
    FRAMES_IN_FLIGHT,
};

type Scheduler = FrameScheduler<FakeBackend, FakeWindow>;

fn quick_timeouts() -> FrameTimeouts {
    FrameTimeouts {
        slot_wait_ms: 40,
        acquire_ms: 40,
        minimized_poll_ms: 1,
    }
}

fn scheduler(window: &FakeWindow, backend: FakeBackend) -> Scheduler {
    FrameScheduler::new(backend, window.clone(), quick_timeouts(), CancelToken::new()).unwrap()
}

fn begin(s: &mut Scheduler) -> FrameTicket {
    match s.begin_frame().unwrap() {
        FrameOutcome::Ready(t) => t,
        FrameOutcome::Retry => panic!("unexpected retry"),
    }
}

/// Depth + HDR color draw, then copy to the presentable image.
fn record_draw(s: &mut Scheduler, ticket: &FrameTicket) {
    let depth = s.depth_target().unwrap();
    let hdr = s.hdr_target().unwrap();
    let target = s.present_image(ticket).unwrap();
    s.discard(depth).unwrap();
    s.transition(ticket, depth, ImageUsage::DepthAttachment).unwrap();
    s.transition(ticket, hdr, ImageUsage::ColorAttachment).unwrap();
    s.transition(ticket, hdr, ImageUsage::TransferSrc).unwrap();
    s.transition(ticket, target, ImageUsage::TransferDst).unwrap();
    s.transition(ticket, target, ImageUsage::Presented).unwrap();
}

fn run_frame(s: &mut Scheduler) -> FrameOutcome<()> {
    let ticket = begin(s);
    record_draw(s, &ticket);
    s.end_frame(ticket).unwrap()
}

#[test]
fn first_frame_at_1080p() {
    let window = FakeWindow::new(1920, 1080);
    let mut s = scheduler(&window, FakeBackend::default());
    assert_eq!(s.extent(), Some(RenderSize::new(1920, 1080)));

    let ticket = begin(&mut s);
    assert_eq!(ticket.slot(), 0);
    assert!(ticket.image_index() < s.backend().image_count);

    record_draw(&mut s, &ticket);
    assert_eq!(s.end_frame(ticket).unwrap(), FrameOutcome::Ready(()));
    assert_eq!(s.frame_number(), 1);
    assert_eq!(s.frame_index(), 1);

    let b = s.backend();
    assert_eq!(b.barriers.len(), 5);
    assert_eq!(b.barriers[0].src.layout, ImageLayout::Undefined);
    assert_eq!(b.barriers[4].dst.layout, ImageLayout::PresentSrc);
    assert!(b.position(Call::Submit(0)).unwrap() < b.position(Call::Present(0, 0)).unwrap());
}

#[test]
fn slots_cycle_and_wait_before_acquire() {
    let window = FakeWindow::new(640, 480);
    let mut s = scheduler(&window, FakeBackend::default());

    for k in 0..6u64 {
        let start = s.backend().calls.len();
        let ticket = begin(&mut s);
        assert_eq!(ticket.slot(), (k % FRAMES_IN_FLIGHT as u64) as usize);
        assert_eq!(ticket.frame_number(), k);

        let calls = &s.backend().calls[start..];
        let waited = calls.iter().position(|c| *c == Call::WaitSlot(ticket.slot(), true)).unwrap();
        let acquired = calls.iter().position(|c| *c == Call::Acquire(ticket.slot())).unwrap();
        let reset = calls.iter().position(|c| *c == Call::ResetSlot(ticket.slot())).unwrap();
        assert!(waited < acquired && acquired < reset);

        record_draw(&mut s, &ticket);
        s.end_frame(ticket).unwrap();
    }
    assert_eq!(s.frame_number(), 6);
}

#[test]
fn busy_slot_is_not_reused() {
    let window = FakeWindow::new(640, 480);
    let mut s = scheduler(&window, FakeBackend::default());
    s.backend_mut().gpu_hung = true;

    // Both slots start signaled, so the first lap never blocks.
    for _ in 0..FRAMES_IN_FLIGHT {
        run_frame(&mut s);
    }
    let before = s.backend().count(|c| matches!(c, Call::Acquire(_)));
    let err = s.begin_frame().unwrap_err();
    assert!(matches!(err, FrameError::Timeout { .. }), "{err}");
    assert_eq!(s.backend().count(|c| matches!(c, Call::Acquire(_))), before);

    // The GPU catches up: slot 0 is usable again.
    s.backend_mut().fences[0] = true;
    let ticket = begin(&mut s);
    assert_eq!(ticket.slot(), 0);
}

#[test]
fn out_of_date_present_rebuilds_exactly_once() {
    let window = FakeWindow::new(1280, 720);
    let mut s = scheduler(&window, FakeBackend::default());
    let old_depth = s.depth_target().unwrap();

    s.backend_mut().present_script.push_back(PresentResult::OutOfDate);
    assert_eq!(run_frame(&mut s), FrameOutcome::Retry);
    assert_eq!(s.backend().chains_created(), 1);

    window.resize(1024, 768);
    let mark = s.backend().calls.len();
    let ticket = begin(&mut s);
    let calls = s.backend().calls[mark..].to_vec();

    assert_eq!(s.backend().chains_created(), 2);
    assert_eq!(s.rebuild_count(), 1);
    assert_eq!(calls[0], Call::WaitIdle);
    let destroyed = calls.iter().position(|c| *c == Call::DestroySwapchain).unwrap();
    let queried = calls.iter().position(|c| *c == Call::SurfaceExtent).unwrap();
    let created = calls.iter().position(|c| matches!(c, Call::CreateSwapchain(_))).unwrap();
    let acquired = calls.iter().position(|c| matches!(c, Call::Acquire(_))).unwrap();
    assert!(destroyed < queried && queried < created && created < acquired);
    assert_eq!(calls[created], Call::CreateSwapchain(RenderSize::new(1024, 768)));

    let state = s.state().unwrap();
    assert_eq!(state.extent, RenderSize::new(1024, 768));
    for id in state.tracked_images() {
        assert_eq!(s.tracker().get(id).unwrap().layout, ImageLayout::Undefined);
    }
    assert!(s.tracker().get(old_depth).is_err());

    record_draw(&mut s, &ticket);
    assert_eq!(s.end_frame(ticket).unwrap(), FrameOutcome::Ready(()));
    assert_eq!(s.backend().chains_created(), 2);
}

#[test]
fn out_of_date_acquire_retries_without_consuming_the_slot() {
    let window = FakeWindow::new(800, 600);
    let mut s = scheduler(&window, FakeBackend::default());
    s.backend_mut().acquire_script.push_back(AcquireResult::OutOfDate);

    assert!(s.begin_frame().unwrap().is_retry());
    assert!(!s.is_recording());
    assert_eq!(s.backend().count(|c| matches!(c, Call::ResetSlot(_))), 0);
    assert_eq!(s.frame_number(), 0);

    let ticket = begin(&mut s);
    assert_eq!(ticket.slot(), 0);
    assert_eq!(s.rebuild_count(), 1);
}

#[test]
fn suboptimal_acquire_finishes_the_frame_then_rebuilds() {
    let window = FakeWindow::new(800, 600);
    let mut s = scheduler(&window, FakeBackend::default());
    s.backend_mut().acquire_script.push_back(AcquireResult::Acquired {
        index: 1,
        suboptimal: true,
    });

    let ticket = begin(&mut s);
    assert_eq!(ticket.image_index(), 1);
    record_draw(&mut s, &ticket);
    assert_eq!(s.end_frame(ticket).unwrap(), FrameOutcome::Retry);
    assert_eq!(s.backend().count(|c| matches!(c, Call::Present(..))), 1);

    begin(&mut s);
    assert_eq!(s.rebuild_count(), 1);
}

#[test]
fn minimized_window_blocks_rebuild_until_restored() {
    let window = FakeWindow::new(1920, 1080);
    let mut s = scheduler(&window, FakeBackend::default());

    s.resize_handle().request();
    window.script(&[(0, 0), (0, 0), (0, 0), (800, 600)]);
    let ticket = begin(&mut s);

    assert_eq!(window.waits(), 3);
    assert_eq!(s.backend().chains_created(), 2);
    assert!(!s
        .backend()
        .calls
        .iter()
        .any(|c| matches!(c, Call::CreateSwapchain(e) if e.width == 0 || e.height == 0)));
    assert_eq!(s.extent(), Some(RenderSize::new(800, 600)));
    record_draw(&mut s, &ticket);
    assert_eq!(s.end_frame(ticket).unwrap(), FrameOutcome::Ready(()));
}

#[test]
fn minimized_window_blocks_even_when_the_surface_clamps() {
    let window = FakeWindow::new(1920, 1080);
    let backend = FakeBackend {
        surface_min: Some(RenderSize::new(1, 1)),
        ..FakeBackend::default()
    };
    let mut s = scheduler(&window, backend);

    s.resize_handle().request();
    window.script(&[(0, 0), (0, 0), (800, 600)]);
    let ticket = begin(&mut s);

    assert_eq!(window.waits(), 2);
    assert_eq!(s.backend().chains_created(), 2);
    assert!(!s
        .backend()
        .calls
        .iter()
        .any(|c| matches!(c, Call::CreateSwapchain(e) if *e == RenderSize::new(1, 1))));
    assert_eq!(s.extent(), Some(RenderSize::new(800, 600)));
    record_draw(&mut s, &ticket);
    assert_eq!(s.end_frame(ticket).unwrap(), FrameOutcome::Ready(()));
}

#[test]
fn startup_while_minimized_waits_for_extent() {
    let window = FakeWindow::new(0, 0);
    window.script(&[(0, 0), (0, 0), (320, 200)]);
    let s = scheduler(&window, FakeBackend::default());
    assert_eq!(window.waits(), 2);
    assert_eq!(s.extent(), Some(RenderSize::new(320, 200)));
}

#[test]
fn resize_requests_coalesce() {
    let window = FakeWindow::new(1920, 1080);
    let mut s = scheduler(&window, FakeBackend::default());

    let ticket = begin(&mut s);
    record_draw(&mut s, &ticket);
    s.resize_handle().request();
    let handle = s.resize_handle();
    std::thread::spawn(move || {
        handle.request();
        handle.request();
    })
    .join()
    .unwrap();
    // A resize landing mid-frame is only flagged; the frame still presents.
    assert_eq!(s.end_frame(ticket).unwrap(), FrameOutcome::Retry);
    assert_eq!(s.backend().chains_created(), 1);

    run_frame(&mut s);
    run_frame(&mut s);
    assert_eq!(s.backend().chains_created(), 2);
    assert_eq!(s.rebuild_count(), 1);
}

#[test]
fn cancel_token_aborts_a_hung_wait() {
    let window = FakeWindow::new(640, 480);
    let token = CancelToken::new();
    let unbounded = FrameTimeouts {
        slot_wait_ms: 0,
        acquire_ms: 0,
        minimized_poll_ms: 1,
    };
    let mut s = FrameScheduler::new(FakeBackend::default(), window, unbounded, token.clone()).unwrap();
    s.backend_mut().gpu_hung = true;
    for _ in 0..FRAMES_IN_FLIGHT {
        run_frame(&mut s);
    }

    let remote = token.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        remote.cancel();
    });
    let err = s.begin_frame().unwrap_err();
    canceller.join().unwrap();
    assert!(matches!(err, FrameError::Cancelled { .. }), "{err}");
    assert!(!err.is_programmer_error());
}

#[test]
fn misuse_is_reported_as_programmer_error() {
    let window = FakeWindow::new(640, 480);
    let mut s = scheduler(&window, FakeBackend::default());
    let old_hdr = s.hdr_target().unwrap();

    let ticket = begin(&mut s);
    let err = s.begin_frame().unwrap_err();
    assert!(matches!(err, FrameError::AlreadyRecording(0)));
    assert!(err.is_programmer_error());
    record_draw(&mut s, &ticket);
    s.end_frame(ticket).unwrap();

    s.resize_handle().request();
    let ticket = begin(&mut s);
    let err = s.transition(&ticket, old_hdr, ImageUsage::ColorAttachment).unwrap_err();
    assert!(matches!(err, FrameError::Tracker(_)));
    assert!(err.is_programmer_error());
}

#[test]
fn failed_target_build_is_retried_next_frame() {
    let window = FakeWindow::new(640, 480);
    let mut s = scheduler(&window, FakeBackend::default());

    s.resize_handle().request();
    s.backend_mut().fail_targets = true;
    assert!(matches!(s.begin_frame(), Err(FrameError::Backend(_))));
    assert!(s.state().is_err());

    s.backend_mut().fail_targets = false;
    let ticket = begin(&mut s);
    record_draw(&mut s, &ticket);
    assert_eq!(s.end_frame(ticket).unwrap(), FrameOutcome::Ready(()));
}

#[test]
fn shutdown_releases_the_chain() {
    let window = FakeWindow::new(640, 480);
    let mut s = scheduler(&window, FakeBackend::default());
    run_frame(&mut s);
    s.shutdown().unwrap();
    assert!(s.tracker().is_empty());
    let b = s.backend();
    assert_eq!(b.count(|c| *c == Call::DestroySwapchain), 1);
    assert_eq!(b.count(|c| *c == Call::DestroyTargets), 1);
}

#[test]
fn abandoned_frame_releases_the_slot() {
    let window = FakeWindow::new(640, 480);
    let mut s = scheduler(&window, FakeBackend::default());
    let stale_hdr = s.hdr_target().unwrap();
    s.resize_handle().request();

    // Recording fails half way: the id belongs to the chain just replaced.
    let ticket = begin(&mut s);
    assert_eq!(ticket.slot(), 0);
    assert!(s.transition(&ticket, stale_hdr, ImageUsage::ColorAttachment).is_err());
    s.abandon_frame(ticket).unwrap();

    assert!(!s.is_recording());
    assert_eq!(s.frame_number(), 0);
    assert_eq!(s.backend().count(|c| *c == Call::Release(0)), 1);
    assert_eq!(s.backend().count(|c| matches!(c, Call::Present(..))), 0);

    let mark = s.backend().calls.len();
    let ticket = begin(&mut s);
    assert_eq!(ticket.slot(), 0);
    assert_eq!(s.rebuild_count(), 2);
    assert!(s.backend().calls[mark..].contains(&Call::WaitSlot(0, true)));
    record_draw(&mut s, &ticket);
    assert_eq!(s.end_frame(ticket).unwrap(), FrameOutcome::Ready(()));
}

#[test]
fn failed_submit_abandons_the_frame() {
    let window = FakeWindow::new(640, 480);
    let mut s = scheduler(&window, FakeBackend::default());
    s.backend_mut().fail_submit = true;

    let ticket = begin(&mut s);
    record_draw(&mut s, &ticket);
    assert!(matches!(s.end_frame(ticket), Err(FrameError::Backend(_))));
    assert!(!s.is_recording());
    assert_eq!(s.frame_number(), 0);
    assert!(s.backend().fences[0]);
    assert_eq!(s.backend().count(|c| *c == Call::Release(0)), 1);

    s.backend_mut().fail_submit = false;
    assert_eq!(run_frame(&mut s), FrameOutcome::Ready(()));
    assert_eq!(s.frame_number(), 1);
}

#[test]
fn failed_present_still_counts_the_submitted_frame() {
    let window = FakeWindow::new(640, 480);
    let mut s = scheduler(&window, FakeBackend::default());
    s.backend_mut().fail_present = true;

    let ticket = begin(&mut s);
    record_draw(&mut s, &ticket);
    assert!(matches!(s.end_frame(ticket), Err(FrameError::Backend(_))));
    assert!(!s.is_recording());
    assert_eq!(s.frame_number(), 1);
    assert_eq!(s.frame_index(), 1);
    assert_eq!(s.backend().count(|c| matches!(c, Call::Release(_))), 0);
}
