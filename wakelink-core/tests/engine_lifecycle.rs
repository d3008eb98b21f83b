mod common;

use std::time::Duration;

use common::{harness, wait_until, Chunk, FakeCapture};
use wakelink_core::audio::PermissionState;
use wakelink_core::config::BYTES_PER_FRAME;
use wakelink_core::{PipelineStatus, WakelinkError};

const WAIT: Duration = Duration::from_secs(3);

#[test]
fn denied_permission_fails_initialize_and_blocks_listening() {
    let h = harness(FakeCapture {
        permission: PermissionState::Denied,
        ..FakeCapture::default()
    });

    let err = h.engine.initialize().unwrap_err();
    assert!(matches!(err, WakelinkError::PermissionDenied));
    assert_eq!(h.engine.status(), PipelineStatus::Error);
    assert!(matches!(
        h.engine.start_listening(),
        Err(WakelinkError::NotInitialized)
    ));
    assert_eq!(h.capture.probe.opens.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn device_init_failure_is_retried_once() {
    let capture = FakeCapture::default();
    capture
        .fail_min_buffer_once
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let h = harness(capture);

    h.engine.initialize().expect("initialize after retry");
    assert!(h.engine.is_initialized());
    assert_eq!(h.engine.diagnostics().reinit_attempts, 1);
    assert_eq!(h.engine.status(), PipelineStatus::Ready);
}

#[test]
fn initialize_publishes_status_transitions() {
    let h = harness(FakeCapture::default());
    let mut status = h.engine.subscribe_status();

    h.engine.initialize().unwrap();
    assert_eq!(status.try_recv().unwrap().status, PipelineStatus::Initializing);
    assert_eq!(status.try_recv().unwrap().status, PipelineStatus::Ready);

    // Second call is a no-op.
    h.engine.initialize().unwrap();
    assert!(status.try_recv().is_err());
}

#[test]
fn silent_frames_never_produce_detections() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    let rx = h.engine.start_listening().unwrap();

    h.capture.push(Chunk::Silent, 100);
    assert!(wait_until(WAIT, || h.engine.diagnostics().frames_captured == 100));

    assert!(rx.try_recv().is_err());
    assert_eq!(h.engine.diagnostics().detections, 0);
    h.engine.stop_listening().unwrap();
}

#[test]
fn loud_utterance_is_detected_once() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    let rx = h.engine.start_listening().unwrap();

    h.capture.push(Chunk::Loud, 5);
    let event = rx.recv_timeout(WAIT).expect("detection");
    assert_eq!(event.keyword, "hey link");
    assert_eq!(event.seq, 0);

    assert!(wait_until(WAIT, || h.engine.diagnostics().frames_captured == 5));
    assert!(rx.try_recv().is_err());
}

#[test]
fn read_errors_do_not_stop_the_loop() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    let _rx = h.engine.start_listening().unwrap();

    h.capture.push(Chunk::Fail, 2);
    h.capture.push(Chunk::Silent, 2);
    assert!(wait_until(WAIT, || h.engine.diagnostics().frames_captured == 2));

    assert_eq!(h.engine.diagnostics().read_errors, 2);
    assert!(h.engine.is_listening());
}

#[test]
fn stop_during_blocking_read_releases_device_once() {
    let h = harness(FakeCapture {
        read_delay: Duration::from_millis(150),
        ..FakeCapture::default()
    });
    h.engine.initialize().unwrap();
    let _rx = h.engine.start_listening().unwrap();
    assert!(wait_until(WAIT, || {
        h.capture.probe.reads.load(std::sync::atomic::Ordering::SeqCst) > 0
    }));

    h.engine.stop_listening().unwrap();
    let probe = &h.capture.probe;
    assert_eq!(probe.stops.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(probe.drops.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(!h.engine.is_listening());
    assert_eq!(h.engine.status(), PipelineStatus::Stopped);

    h.engine.stop_listening().unwrap();
    h.engine.release();
    assert_eq!(probe.stops.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(probe.drops.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn starting_twice_is_rejected() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    let _rx = h.engine.start_listening().unwrap();
    assert!(matches!(
        h.engine.start_listening(),
        Err(WakelinkError::AlreadyRunning)
    ));
}

#[test]
fn set_threshold_preserves_listening_and_receiver() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    let rx = h.engine.start_listening().unwrap();

    h.capture.push(Chunk::Loud, 3);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().seq, 0);

    h.engine.set_threshold(0.3).unwrap();
    assert!(h.engine.is_listening());
    assert!((h.engine.threshold() - 0.3).abs() < f32::EPSILON);
    assert_eq!(h.capture.probe.opens.load(std::sync::atomic::Ordering::SeqCst), 2);

    h.capture.push(Chunk::Loud, 3);
    let event = rx.recv_timeout(WAIT).expect("detection after rebuild");
    assert_eq!(event.seq, 1);
}

#[test]
fn set_threshold_while_stopped_stays_stopped() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();

    h.engine.set_threshold(5.0).unwrap();
    assert!(!h.engine.is_listening());
    assert!((h.engine.threshold() - 0.99).abs() < f32::EPSILON);
    assert_eq!(h.capture.probe.opens.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn null_stream_on_keyword_change_pauses_detection() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    let rx = h.engine.start_listening().unwrap();
    let mut status = h.engine.subscribe_status();

    let err = h.engine.set_keywords("   ").unwrap_err();
    assert!(matches!(err, WakelinkError::EngineConfig(_)));
    assert_eq!(status.try_recv().unwrap().status, PipelineStatus::Error);
    assert!(h.engine.is_listening());

    h.capture.push(Chunk::Loud, 3);
    assert!(wait_until(WAIT, || h.engine.diagnostics().frames_captured == 3));
    assert!(rx.try_recv().is_err());
    assert_eq!(h.engine.diagnostics().engine_errors, 0);

    h.engine.set_keywords("hey link").unwrap();
    h.capture.push(Chunk::Loud, 3);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().keyword, "hey link");
}

#[test]
fn threshold_rebuild_after_failed_keyword_change_stays_paused() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    let rx = h.engine.start_listening().unwrap();

    assert!(h.engine.set_keywords("   ").is_err());
    assert_eq!(h.engine.keywords(), "");

    let err = h.engine.set_threshold(0.3).unwrap_err();
    assert!(matches!(err, WakelinkError::EngineConfig(_)));
    assert!(h.engine.is_listening());
    assert_eq!(h.engine.status(), PipelineStatus::Error);

    h.capture.push(Chunk::Loud, 3);
    assert!(wait_until(WAIT, || h.engine.diagnostics().frames_captured == 3));
    assert!(rx.try_recv().is_err());

    h.engine.set_keywords("open sesame").unwrap();
    h.capture.push(Chunk::Loud, 3);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().keyword, "open sesame");
}

#[test]
fn keywords_can_change_while_stopped() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    h.engine.set_keywords("open sesame / other").unwrap();
    assert_eq!(h.engine.keywords(), "open sesame / other");

    let rx = h.engine.start_listening().unwrap();
    h.capture.push(Chunk::Loud, 3);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().keyword, "open sesame");
}

#[test]
fn captured_frames_are_encoded_for_subscribers() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    let mut encoded = h.engine.subscribe_encoded();
    let _rx = h.engine.start_listening().unwrap();

    h.capture.push(Chunk::Silent, 2);
    let frame = h
        .rt
        .block_on(async { tokio::time::timeout(WAIT, encoded.recv()).await })
        .expect("encoded frame in time")
        .expect("encoded channel open");
    // Raw codec: one frame of PCM bytes.
    assert_eq!(frame.len(), BYTES_PER_FRAME);
}

#[test]
fn release_allows_reinitialization() {
    let h = harness(FakeCapture::default());
    h.engine.initialize().unwrap();
    let _rx = h.engine.start_listening().unwrap();

    h.engine.release();
    assert!(!h.engine.is_initialized());
    assert!(!h.engine.is_listening());
    assert_eq!(h.engine.status(), PipelineStatus::Idle);
    h.engine.release();

    h.engine.initialize().unwrap();
    let rx = h.engine.start_listening().unwrap();
    h.capture.push(Chunk::Loud, 3);
    assert!(rx.recv_timeout(WAIT).is_ok());
}
