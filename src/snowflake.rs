//! Snowflake identifier generator.
//!
//! Produces time-ordered 64-bit ids without central coordination:
//! 41 bits of milliseconds since a fixed epoch, 5 bits of datacenter id,
//! 5 bits of worker id, and a 12-bit per-millisecond sequence. A single
//! mutex guards the (last timestamp, sequence) pair, so ids from one
//! generator are strictly increasing.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{RagError, Result};

/// Custom epoch: 2024-01-01T00:00:00Z, in milliseconds.
pub const EPOCH_MS: i64 = 1_704_067_200_000;

const WORKER_ID_BITS: u8 = 5;
const DATACENTER_ID_BITS: u8 = 5;
const SEQUENCE_BITS: u8 = 12;

const MAX_WORKER_ID: i64 = (1 << WORKER_ID_BITS) - 1;
const MAX_DATACENTER_ID: i64 = (1 << DATACENTER_ID_BITS) - 1;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;

const WORKER_ID_SHIFT: u8 = SEQUENCE_BITS;
const DATACENTER_ID_SHIFT: u8 = SEQUENCE_BITS + WORKER_ID_BITS;
const TIMESTAMP_SHIFT: u8 = SEQUENCE_BITS + WORKER_ID_BITS + DATACENTER_ID_BITS;

/// Components recovered from an id by [`IdGenerator::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    /// Milliseconds since the Unix epoch (custom epoch already added back).
    pub timestamp_ms: i64,
    pub datacenter_id: i64,
    pub worker_id: i64,
    pub sequence: i64,
}

struct GeneratorState {
    last_timestamp: i64,
    sequence: i64,
}

/// Thread-safe snowflake id generator.
pub struct IdGenerator {
    worker_id: i64,
    datacenter_id: i64,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// Create a generator for the given datacenter/worker pair.
    ///
    /// Both ids must fit in 5 bits (0..=31).
    pub fn new(datacenter_id: i64, worker_id: i64) -> Result<Self> {
        if !(0..=MAX_WORKER_ID).contains(&worker_id) {
            return Err(RagError::Validation(format!(
                "worker_id must be between 0 and {MAX_WORKER_ID}, got {worker_id}"
            )));
        }
        if !(0..=MAX_DATACENTER_ID).contains(&datacenter_id) {
            return Err(RagError::Validation(format!(
                "datacenter_id must be between 0 and {MAX_DATACENTER_ID}, got {datacenter_id}"
            )));
        }
        Ok(Self {
            worker_id,
            datacenter_id,
            state: Mutex::new(GeneratorState {
                last_timestamp: -1,
                sequence: 0,
            }),
        })
    }

    /// Generate the next id.
    ///
    /// On sequence exhaustion within one millisecond this spins until the
    /// next millisecond. Fails with [`RagError::ClockSkew`] if the wall
    /// clock is behind the last generated timestamp.
    pub fn next_id(&self) -> Result<i64> {
        let mut state = self.state.lock().expect("id generator mutex poisoned");

        let mut timestamp = current_millis();
        if timestamp < state.last_timestamp {
            return Err(RagError::ClockSkew);
        }

        if timestamp == state.last_timestamp {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                timestamp = wait_next_millis(state.last_timestamp);
            }
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = timestamp;

        Ok(((timestamp - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.datacenter_id << DATACENTER_ID_SHIFT)
            | (self.worker_id << WORKER_ID_SHIFT)
            | state.sequence)
    }

    /// Recover the components of an id. Useful for debugging and tests.
    pub fn parse(id: i64) -> IdParts {
        IdParts {
            timestamp_ms: (id >> TIMESTAMP_SHIFT) + EPOCH_MS,
            datacenter_id: (id >> DATACENTER_ID_SHIFT) & MAX_DATACENTER_ID,
            worker_id: (id >> WORKER_ID_SHIFT) & MAX_WORKER_ID,
            sequence: id & MAX_SEQUENCE,
        }
    }
}

fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_millis() as i64
}

fn wait_next_millis(last: i64) -> i64 {
    let mut ts = current_millis();
    while ts <= last {
        std::hint::spin_loop();
        ts = current_millis();
    }
    ts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_rejects_out_of_range_ids() {
        assert!(IdGenerator::new(0, 32).is_err());
        assert!(IdGenerator::new(-1, 0).is_err());
        assert!(IdGenerator::new(31, 31).is_ok());
    }

    #[test]
    fn test_ids_strictly_increasing() {
        let gen = IdGenerator::new(1, 1).unwrap();
        let mut last = 0;
        for _ in 0..5000 {
            let id = gen.next_id().unwrap();
            assert!(id > last, "ids must be strictly increasing");
            last = id;
        }
    }

    #[test]
    fn test_parse_roundtrip() {
        let gen = IdGenerator::new(3, 17).unwrap();
        let before = current_millis();
        let id = gen.next_id().unwrap();
        let parts = IdGenerator::parse(id);
        assert_eq!(parts.datacenter_id, 3);
        assert_eq!(parts.worker_id, 17);
        assert!(parts.timestamp_ms >= before);
        assert!(parts.timestamp_ms <= current_millis());
        assert!(parts.sequence <= MAX_SEQUENCE);
    }

    #[test]
    fn test_concurrent_generation_distinct() {
        let gen = Arc::new(IdGenerator::new(1, 1).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gen = Arc::clone(&gen);
            handles.push(std::thread::spawn(move || {
                let mut ids = Vec::with_capacity(2500);
                let mut last = 0;
                for _ in 0..2500 {
                    let id = gen.next_id().unwrap();
                    assert!(id > last, "per-thread ids must increase");
                    last = id;
                    ids.push(id);
                }
                ids
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate id generated");
            }
        }
        assert_eq!(all.len(), 10_000);
    }
}
