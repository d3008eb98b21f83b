mod common;

use std::sync::{atomic::Ordering, Arc};

use common::{CountingBackend, COUNTING_SAMPLES};

use wakelink_core::codec::{raw::RawBackend, DecodeOutcome, FrameVerdict, Transcoder};
use wakelink_core::config::{DecodeGuards, BYTES_PER_FRAME, SAMPLES_PER_FRAME};
use wakelink_core::buffering::frame::le_bytes_to_samples;

fn raw_transcoder() -> Transcoder {
    Transcoder::new(Arc::new(RawBackend), DecodeGuards::default()).expect("raw transcoder")
}

#[test]
fn short_input_is_zero_padded_to_one_frame() {
    let t = raw_transcoder();
    let pcm: Vec<u8> = [1000i16, -1000, 42]
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();

    let frame = t.encode(&pcm).expect("encoded");
    assert_eq!(frame.len(), BYTES_PER_FRAME);

    let samples = le_bytes_to_samples(frame.as_bytes());
    assert_eq!(&samples[..3], &[1000, -1000, 42]);
    assert!(samples[3..].iter().all(|&s| s == 0));
}

#[test]
fn long_input_is_truncated_to_one_frame() {
    let t = raw_transcoder();
    let pcm: Vec<u8> = (0..SAMPLES_PER_FRAME * 2)
        .flat_map(|i| (i as i16).to_le_bytes())
        .collect();

    let frame = t.encode(&pcm).expect("encoded");
    let samples = le_bytes_to_samples(frame.as_bytes());
    assert_eq!(samples.len(), SAMPLES_PER_FRAME);
    assert_eq!(samples[SAMPLES_PER_FRAME - 1], (SAMPLES_PER_FRAME - 1) as i16);
}

#[test]
fn empty_input_encodes_to_nothing() {
    assert!(raw_transcoder().encode(&[]).is_none());
}

#[test]
fn decode_applies_guards_before_the_decoder() {
    let t = raw_transcoder();
    assert!(matches!(
        t.decode_checked(&[0x11; 960]),
        DecodeOutcome::Rejected(FrameVerdict::RejectedLength)
    ));
    assert!(matches!(
        t.decode_checked(&[0u8; 120]),
        DecodeOutcome::Rejected(FrameVerdict::RejectedHeader)
    ));

    let mut header_ok = vec![0u8; 120];
    header_ok[0] = 9;
    let decoded = t.decode(&header_ok).expect("accepted frame");
    assert_eq!(decoded.len(), 60);
}

#[test]
fn disabled_guards_let_960_byte_frames_through() {
    let t = Transcoder::new(Arc::new(RawBackend), DecodeGuards::disabled()).unwrap();
    let decoded = t.decode(&[0x01; 960]).expect("decoded");
    assert_eq!(decoded.len(), 480);
}

#[test]
fn reinitialize_keeps_the_transcoder_usable() {
    let t = raw_transcoder();
    t.reinitialize().unwrap();
    assert!(t.encode(&[0u8; BYTES_PER_FRAME]).is_some());
}

#[test]
fn decoder_history_persists_until_reinitialize() {
    let backend = Arc::new(CountingBackend::default());
    let t = Transcoder::new(backend.clone(), DecodeGuards::disabled()).unwrap();
    let frame = [3u8; 8];

    let first_samples: Vec<i16> = (0..3)
        .map(|_| t.decode(&frame).expect("decoded").samples()[0])
        .collect();
    assert_eq!(first_samples, vec![1, 2, 3]);
    assert_eq!(backend.decoders_created.load(Ordering::SeqCst), 1);

    t.reinitialize().unwrap();
    let pcm = t.decode(&frame).expect("decoded after reinit");
    assert_eq!(pcm.len(), COUNTING_SAMPLES);
    assert_eq!(pcm.samples()[0], 1);
    assert_eq!(backend.decoders_created.load(Ordering::SeqCst), 2);
}

#[test]
fn raw_self_test_round_trips_one_second() {
    let report = raw_transcoder().self_test().unwrap();
    assert_eq!(report.codec, "raw");
    // 16000 samples / 960 per frame, last frame padded.
    assert_eq!(report.frames, 17);
    assert_eq!(report.decoded_samples, 17 * SAMPLES_PER_FRAME);
}

#[cfg(feature = "codec-opus")]
mod opus {
    use super::*;
    use wakelink_core::codec::opus_codec::OpusBackend;

    #[test]
    fn silence_round_trips_through_opus() {
        let t = Transcoder::new(Arc::new(OpusBackend::default()), DecodeGuards::default())
            .expect("opus transcoder");

        for _ in 0..5 {
            let frame = t.encode(&vec![0u8; BYTES_PER_FRAME]).expect("encoded");
            assert!(!frame.is_empty());
            assert!(frame.len() < BYTES_PER_FRAME);

            let pcm = t.decode(frame.as_bytes()).expect("decoded");
            assert_eq!(pcm.len(), SAMPLES_PER_FRAME);
            assert!(pcm.samples().iter().all(|s| s.unsigned_abs() < 64));
        }
    }

    #[test]
    fn opus_self_test_passes() {
        let t = Transcoder::new(Arc::new(OpusBackend::default()), DecodeGuards::default())
            .unwrap();
        let report = t.self_test().unwrap();
        assert_eq!(report.codec, "opus");
        assert_eq!(report.frames, 17);
    }
}
