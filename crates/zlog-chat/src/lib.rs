//! Sliding-window chat deduplication.
//!
//! Keyed by `(rider_id, msg)` over a fixed 3-second horizon. Timestamps come
//! from the chat event's own `time` field, not wall clock, so replaying a
//! recorded log is deterministic regardless of how fast it's replayed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

const DEDUP_WINDOW_SECS: i64 = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChatTimeError {
    #[error("invalid hh:mm:ss time: {0}")]
    InvalidFormat(String),
}

/// Parses a spec-grammar `hh:mm:ss` chat timestamp into seconds-since-midnight.
pub fn parse_hms(time: &str) -> Result<i64, ChatTimeError> {
    let parts: Vec<&str> = time.split(':').collect();
    if parts.len() != 3 {
        return Err(ChatTimeError::InvalidFormat(time.to_owned()));
    }
    let h: i64 = parts[0]
        .parse()
        .map_err(|_| ChatTimeError::InvalidFormat(time.to_owned()))?;
    let m: i64 = parts[1]
        .parse()
        .map_err(|_| ChatTimeError::InvalidFormat(time.to_owned()))?;
    let s: i64 = parts[2]
        .parse()
        .map_err(|_| ChatTimeError::InvalidFormat(time.to_owned()))?;
    Ok(h * 3600 + m * 60 + s)
}

type Signature = (u64, String);

/// A min-heap-backed sliding window over chat signatures.
pub struct ChatDeduper {
    heap: BinaryHeap<Reverse<(i64, Signature)>>,
    seen: HashSet<Signature>,
}

impl Default for ChatDeduper {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatDeduper {
    pub fn new() -> Self {
        ChatDeduper {
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
        }
    }

    /// Evicts entries older than `now - 3s`, then tests (and records) the
    /// incoming signature. Returns `true` if the event is unique within the
    /// window and should be forwarded, `false` if it's a duplicate to drop.
    pub fn offer(&mut self, now_secs: i64, rider_id: u64, msg: &str) -> bool {
        self.evict_older_than(now_secs - DEDUP_WINDOW_SECS);

        let sig: Signature = (rider_id, msg.to_owned());
        if self.seen.contains(&sig) {
            return false;
        }
        self.seen.insert(sig.clone());
        self.heap.push(Reverse((now_secs, sig)));
        true
    }

    fn evict_older_than(&mut self, cutoff_secs: i64) {
        while let Some(Reverse((ts, _))) = self.heap.peek() {
            if *ts < cutoff_secs {
                if let Some(Reverse((_, sig))) = self.heap.pop() {
                    self.seen.remove(&sig);
                }
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
