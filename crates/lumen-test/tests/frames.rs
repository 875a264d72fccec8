//! Multi-frame runs against the headless device.

use ash::vk;
use lumen_gpu::{GpuError, RawDevice, SubmitMode};
use lumen_test::{FrameHarness, HarnessConfig, TestError};

fn harness(mode: SubmitMode) -> FrameHarness {
    FrameHarness::new(HarnessConfig {
        mode,
        ..HarnessConfig::default()
    })
    .unwrap()
}

#[test]
fn synchronous_frames_keep_pools_bounded() {
    let mut harness = harness(SubmitMode::Synchronous);
    let stats = harness.run(30).unwrap();

    assert_eq!(stats.frames, 30);
    assert_eq!(stats.presents, 30);
    assert_eq!(harness.queue().fences().allocated(), 1);
    // Three per frame, plus one present signal parked per swapchain image
    // until that image is rendered again.
    assert!(harness.queue().semaphores().allocated() <= 3 + 3);
}

#[test]
fn asynchronous_frames_respect_frames_in_flight() {
    let mut harness = harness(SubmitMode::Asynchronous);
    harness.run(50).unwrap();

    assert!(harness.queue().fences().allocated() <= 2);
    assert!(harness.queue().inflight_submissions() <= 2);
    harness.finish().unwrap();
}

#[test]
fn every_present_waits_on_the_work_that_rendered_its_image() {
    let mut harness = harness(SubmitMode::Asynchronous);
    harness.run(12).unwrap();

    let device = harness.device().clone();
    let submits = device.submits();
    let presents = device.presents();
    assert_eq!(presents.len(), 12);

    for (i, present) in presents.iter().enumerate() {
        assert_eq!(present.waits.len(), 1, "present {i}");
        let semaphore = present.waits[0];
        let signaled_by = submits
            .iter()
            .filter(|submit| submit.signals.contains(&semaphore))
            .count();
        assert!(signaled_by >= 1, "present {i} waits on a semaphore no submission signals");
    }
    harness.finish().unwrap();
}

#[test]
fn transient_buffers_outlive_their_submission() {
    let mut harness = FrameHarness::new(HarnessConfig {
        manual_completion: true,
        ..HarnessConfig::default()
    })
    .unwrap();

    let report = harness.render_frame().unwrap();
    assert!(!report.destroyed_immediately);
    assert!(harness.queue().is_inflight(report.transient));
    assert!(!harness.device().was_destroyed(report.transient));

    harness.device().complete_all();
    report.token.wait().unwrap();
    assert!(harness.device().was_destroyed(report.transient));
    assert_eq!(harness.queue().deferred_count(), 0);
}

#[test]
fn frames_in_flight_block_until_the_oldest_completes() {
    let mut harness = FrameHarness::new(HarnessConfig {
        manual_completion: true,
        frames_in_flight: 2,
        ..HarnessConfig::default()
    })
    .unwrap();

    let first = harness.render_frame().unwrap();
    let second = harness.render_frame().unwrap();
    assert!(!first.token.is_complete());
    assert!(!second.token.is_complete());

    let device = harness.device().clone();
    let third = std::thread::scope(|scope| {
        let frame = scope.spawn(|| harness.render_frame());
        device.complete_next();
        frame.join().unwrap()
    })
    .unwrap();

    assert!(first.token.is_complete());
    assert!(!third.token.is_complete());
    device.complete_all();
    harness.finish().unwrap();
}

#[test]
fn out_of_date_present_recreates_the_swapchain() {
    let mut harness = harness(SubmitMode::Synchronous);
    harness.run(2).unwrap();
    let old = harness.swapchain().handle();

    harness
        .device()
        .fail_next_present(vk::Result::ERROR_OUT_OF_DATE_KHR);
    let report = harness.render_frame().unwrap();
    assert!(report.recreated);
    assert_ne!(harness.swapchain().handle(), old);
    assert_eq!(harness.queue().submitter().pending_present_count(), 0);

    let stats = harness.run(5).unwrap();
    assert_eq!(stats.recreations, 1);
    assert_eq!(stats.presents, 7);
    harness.finish().unwrap();
}

#[test]
fn lost_device_on_present_is_fatal() {
    let mut harness = harness(SubmitMode::Synchronous);
    harness
        .device()
        .fail_next_present(vk::Result::ERROR_DEVICE_LOST);

    let err = harness.render_frame().unwrap_err();
    assert!(matches!(
        err,
        TestError::Gpu(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
    ));
}

#[test]
fn finish_releases_every_primitive() {
    let mut harness = harness(SubmitMode::Asynchronous);
    harness.run(20).unwrap();
    let device = harness.device().clone();

    let stats = harness.finish().unwrap();

    assert_eq!(stats.frames, 20);
    assert_eq!(device.live_fences(), 0);
    assert_eq!(device.live_semaphores(), 0);
    assert!(device.wait_idle().is_ok());
}

#[test]
fn invalid_configurations_are_rejected() {
    let zero_images = FrameHarness::new(HarnessConfig {
        swapchain_images: 0,
        ..HarnessConfig::default()
    });
    assert!(matches!(zero_images, Err(TestError::InvalidConfig(_))));

    let zero_frames = FrameHarness::new(HarnessConfig {
        frames_in_flight: 0,
        ..HarnessConfig::default()
    });
    assert!(matches!(zero_frames, Err(TestError::InvalidConfig(_))));
}
