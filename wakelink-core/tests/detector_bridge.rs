use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::bounded;
use wakelink_core::detector::{
    DetectorBridge, KeywordResult, KeywordSpotter, SpotterConfig, SpotterFactory, StreamHandle,
    StreamSlot,
};
use wakelink_core::engine::pipeline::PipelineDiagnostics;
use wakelink_core::{PcmFrame, StubSpotterFactory, WakelinkError};

fn loud_frame() -> PcmFrame {
    PcmFrame::from_samples(vec![16_384; 960])
}

fn bridge_with(factory: Arc<dyn SpotterFactory>) -> (DetectorBridge, Arc<PipelineDiagnostics>) {
    let diagnostics = Arc::new(PipelineDiagnostics::default());
    let bridge = DetectorBridge::new(
        factory,
        1.5,
        Arc::new(AtomicU64::new(0)),
        Arc::clone(&diagnostics),
    );
    (bridge, diagnostics)
}

fn stub_bridge() -> (DetectorBridge, Arc<PipelineDiagnostics>) {
    bridge_with(Arc::new(StubSpotterFactory::default()))
}

#[test]
fn stream_is_reset_after_each_detection() {
    let (mut bridge, diagnostics) = stub_bridge();
    bridge.configure("hey link", 0.25).unwrap();
    let (tx, rx) = bounded(8);
    bridge.attach_events(tx);

    // Without a reset the loud run would keep firing on frames 4 and 5.
    let detections: usize = (0..5).map(|_| bridge.submit(&loud_frame())).sum();
    assert_eq!(detections, 1);
    assert_eq!(rx.try_iter().count(), 1);

    let more: usize = (0..3).map(|_| bridge.submit(&loud_frame())).sum();
    assert_eq!(more, 1);
    let event = rx.try_recv().unwrap();
    assert_eq!(event.seq, 1);
    assert_eq!(diagnostics.snapshot().detections, 2);
}

#[test]
fn full_channel_drops_and_counts_detections() {
    let (mut bridge, diagnostics) = stub_bridge();
    bridge.configure("hey link", 0.25).unwrap();
    let (tx, rx) = bounded(1);
    bridge.attach_events(tx);

    for _ in 0..6 {
        bridge.submit(&loud_frame());
    }
    let snap = diagnostics.snapshot();
    assert_eq!(snap.detections, 2);
    assert_eq!(snap.detections_dropped, 1);
    assert_eq!(rx.try_recv().unwrap().seq, 0);
}

#[test]
fn empty_frames_are_ignored() {
    let (mut bridge, diagnostics) = stub_bridge();
    bridge.configure("hey link", 0.25).unwrap();
    assert_eq!(bridge.submit(&PcmFrame::from_samples(Vec::new())), 0);
    assert_eq!(diagnostics.snapshot().engine_errors, 0);
}

#[test]
fn null_stream_on_configure_is_fatal() {
    let (mut bridge, _) = stub_bridge();
    let err = bridge.configure("  ", 0.25).unwrap_err();
    assert!(matches!(err, WakelinkError::EngineConfig(_)));
    assert!(!bridge.is_configured());
}

#[test]
fn null_stream_on_reconfigure_pauses_without_errors() {
    let (mut bridge, diagnostics) = stub_bridge();
    bridge.configure("hey link", 0.25).unwrap();

    assert!(bridge.reconfigure("").is_err());
    assert_eq!(bridge.stream(), StreamSlot::Invalid);
    for _ in 0..5 {
        assert_eq!(bridge.submit(&loud_frame()), 0);
    }
    assert_eq!(diagnostics.snapshot().engine_errors, 0);

    bridge.reconfigure("hey link").unwrap();
    assert!(bridge.is_configured());
}

#[test]
fn threshold_change_retries_the_last_requested_keywords() {
    let (mut bridge, _) = stub_bridge();
    bridge.configure("hey link", 0.25).unwrap();
    assert!(bridge.reconfigure("").is_err());
    assert_eq!(bridge.keywords(), "");

    assert!(bridge.set_threshold(0.4).is_err());
    assert!(!bridge.is_configured());
    assert_eq!(bridge.submit(&loud_frame()), 0);

    bridge.reconfigure("hey link").unwrap();
    assert!(bridge.is_configured());
    assert!((bridge.threshold() - 0.4).abs() < f32::EPSILON);
}

#[test]
fn threshold_change_rebuilds_with_same_keywords() {
    let (mut bridge, _) = stub_bridge();
    bridge.configure("hey link", 0.25).unwrap();
    bridge.set_threshold(1.5).unwrap();
    assert!((bridge.threshold() - 0.99).abs() < f32::EPSILON);
    assert_eq!(bridge.keywords(), "hey link");
    assert!(bridge.is_configured());
}

/// Spotter whose every call past stream creation fails.
struct BrokenSpotter;

impl KeywordSpotter for BrokenSpotter {
    fn create_stream(&mut self, _keywords: &str) -> wakelink_core::Result<StreamSlot> {
        Ok(StreamSlot::from_raw(1))
    }

    fn accept_waveform(
        &mut self,
        _stream: StreamHandle,
        _samples: &[f32],
        _sample_rate: u32,
    ) -> wakelink_core::Result<()> {
        Err(WakelinkError::Engine("decoder crashed".into()))
    }

    fn is_ready(&mut self, _stream: StreamHandle) -> wakelink_core::Result<bool> {
        Ok(false)
    }

    fn decode_step(&mut self, _stream: StreamHandle) -> wakelink_core::Result<()> {
        Ok(())
    }

    fn get_result(&mut self, _stream: StreamHandle) -> wakelink_core::Result<KeywordResult> {
        Ok(KeywordResult::default())
    }

    fn reset(&mut self, _stream: StreamHandle) -> wakelink_core::Result<()> {
        Ok(())
    }

    fn release_stream(&mut self, _stream: StreamHandle) {}
}

struct BrokenFactory {
    created: AtomicU64,
}

impl SpotterFactory for BrokenFactory {
    fn create(&self, _config: &SpotterConfig) -> wakelink_core::Result<Box<dyn KeywordSpotter>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(BrokenSpotter))
    }
}

#[test]
fn engine_errors_are_counted_per_frame() {
    let factory = Arc::new(BrokenFactory {
        created: AtomicU64::new(0),
    });
    let (mut bridge, diagnostics) = bridge_with(factory.clone());
    bridge.configure("hey link", 0.25).unwrap();

    for _ in 0..3 {
        assert_eq!(bridge.submit(&loud_frame()), 0);
    }
    assert_eq!(diagnostics.snapshot().engine_errors, 3);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
}
