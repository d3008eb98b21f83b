//! Lock-free SPSC rings between cpal callbacks and blocking device calls, plus
//! the `PcmFrame` unit that flows through the pipeline.
//!
//! The rings carry f32 samples at the *device* rate. Conversion to the fixed
//! 16 kHz / i16 pipeline format happens on the reader (capture) or writer
//! (playback) side, never inside the audio callback.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half — held by whichever side feeds samples in.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half — held by whichever side drains samples out.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Floor for ring capacity: four frames at 48 kHz.
pub const MIN_RING_CAPACITY: usize = 4 * 2_880;

/// Create a matched producer/consumer pair with at least `capacity` slots.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(capacity.max(MIN_RING_CAPACITY)).split()
}
