//! Time-ordered 64-bit message IDs.
//!
//! An ID packs, from the high bit down, 41 bits of milliseconds since the
//! service epoch, an 8-bit worker number, and a 14-bit per-millisecond
//! sequence. Sorting by ID sorts by creation time, which is what thread
//! history pagination relies on.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds from the Unix epoch to 2025-07-01T00:00:00Z. Counting from
/// here keeps IDs positive `i64`s for roughly 69 years.
const SERVICE_EPOCH_MS: u64 = 1_751_328_000_000;

const WORKER_BITS: u32 = 8;
const SEQUENCE_BITS: u32 = 14;

const MAX_WORKER: u16 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

struct Clock {
    millis: u64,
    sequence: u64,
}

/// Message ID generator. IDs from one generator are strictly increasing;
/// generators with distinct worker numbers never collide.
pub struct SnowflakeGenerator {
    worker: u64,
    clock: Mutex<Clock>,
}

impl SnowflakeGenerator {
    /// Panics if `worker` does not fit in the worker field, which would make
    /// IDs collide across instances.
    pub fn new(worker: u16) -> Self {
        assert!(
            worker <= MAX_WORKER,
            "worker number must fit in {WORKER_BITS} bits"
        );
        Self {
            worker: u64::from(worker),
            clock: Mutex::new(Clock {
                millis: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> i64 {
        let mut clock = self.clock.lock().unwrap();

        // Hold the clock at its high-water mark so a backwards step of the
        // system clock cannot reissue a timestamp.
        let now = unix_millis().max(clock.millis);
        if now > clock.millis {
            clock.millis = now;
            clock.sequence = 0;
        } else if clock.sequence < MAX_SEQUENCE {
            clock.sequence += 1;
        } else {
            // Sequence exhausted for this millisecond; wait for the next one.
            let mut next = unix_millis();
            while next <= clock.millis {
                std::hint::spin_loop();
                next = unix_millis();
            }
            clock.millis = next;
            clock.sequence = 0;
        }

        let elapsed = clock.millis - SERVICE_EPOCH_MS;
        let id = (elapsed << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker << SEQUENCE_BITS)
            | clock.sequence;
        id as i64
    }
}

/// The millisecond Unix timestamp embedded in a message ID.
pub fn id_timestamp_ms(id: i64) -> u64 {
    ((id as u64) >> (WORKER_BITS + SEQUENCE_BITS)) + SERVICE_EPOCH_MS
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the Unix epoch")
        .as_millis() as u64
}
