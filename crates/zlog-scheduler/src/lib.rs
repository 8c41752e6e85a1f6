//! Min-heap scheduler for subgroup rider-profile retrieval jobs.
//!
//! Pure scheduling core plus a small driver loop; the actual retrieval
//! work (an HTTP call against an upstream profile API) is supplied by the
//! caller as a [`RetrievalJob`] so this crate stays free of any particular
//! HTTP client.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tracing::debug;

/// Seconds past a subgroup's start at which a retrieval fires, before the
/// race-event delay is applied.
const RETRIEVAL_OFFSETS_SECS: [i64; 7] = [0, 900, 1800, 2700, 3600, 4500, 5400];
const RACE_EVENT_DELAY_SECS: i64 = 60;
const NON_RACE_DELAY_SECS: i64 = 60;
const HORIZON_MS: i64 = 2 * 60 * 60 * 1000;
const DEFAULT_SLEEP_MS: u64 = 60_000;
const MAX_SLEEP_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Subgroup {
    pub subgroup_id: u64,
    pub event_name: String,
    pub zwift_event_id: u64,
    pub start_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubgroupRetrieval {
    pub due_at_ms: i64,
    pub subgroup_id: u64,
    pub event_name: String,
    pub zwift_event_id: u64,
}

fn is_race_event(name: &str) -> bool {
    name.to_lowercase().contains("race")
}

/// Enumerates every retrieval due time for one subgroup:
/// seven offsets plus a 60 s race delay for race-named events, or a
/// single `start + 60s` retrieval otherwise.
pub fn due_times_for(subgroup: &Subgroup) -> Vec<SubgroupRetrieval> {
    let mk = |due_at_ms: i64| SubgroupRetrieval {
        due_at_ms,
        subgroup_id: subgroup.subgroup_id,
        event_name: subgroup.event_name.clone(),
        zwift_event_id: subgroup.zwift_event_id,
    };

    if is_race_event(&subgroup.event_name) {
        RETRIEVAL_OFFSETS_SECS
            .iter()
            .map(|offset_secs| {
                mk(subgroup.start_ms + (RACE_EVENT_DELAY_SECS + offset_secs) * 1000)
            })
            .collect()
    } else {
        vec![mk(subgroup.start_ms + NON_RACE_DELAY_SECS * 1000)]
    }
}

struct HeapEntry(SubgroupRetrieval);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.due_at_ms == other.0.due_at_ms
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.due_at_ms.cmp(&other.0.due_at_ms)
    }
}

/// Min-heap of pending retrievals, keyed by due time.
#[derive(Default)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            heap: BinaryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Scans `subgroups` for those starting within the horizon of `now_ms`
    /// and pushes every future-due retrieval onto the heap.
    pub fn enqueue_window(&mut self, now_ms: i64, subgroups: &[Subgroup]) {
        for sg in subgroups {
            if sg.start_ms < now_ms || sg.start_ms > now_ms + HORIZON_MS {
                continue;
            }
            for retrieval in due_times_for(sg) {
                if retrieval.due_at_ms > now_ms {
                    self.heap.push(Reverse(HeapEntry(retrieval)));
                }
            }
        }
    }

    pub fn push(&mut self, retrieval: SubgroupRetrieval) {
        self.heap.push(Reverse(HeapEntry(retrieval)));
    }

    /// Pops and returns every entry whose due time is `<= now_ms`, in
    /// ascending due-time order.
    pub fn pop_due(&mut self, now_ms: i64) -> Vec<SubgroupRetrieval> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.0.due_at_ms > now_ms {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            due.push(entry.0);
        }
        due
    }

    /// Milliseconds until the next due entry, capped at 60 s, or the
    /// default 60 s sleep when the heap is empty.
    pub fn next_sleep(&self, now_ms: i64) -> Duration {
        match self.heap.peek() {
            Some(Reverse(entry)) => {
                let delta = (entry.0.due_at_ms - now_ms).max(0) as u64;
                Duration::from_millis(delta.min(MAX_SLEEP_MS))
            }
            None => Duration::from_millis(DEFAULT_SLEEP_MS),
        }
    }
}

/// A single retrieval job, invoked once per due `SubgroupRetrieval`.
pub trait RetrievalJob {
    fn run(&mut self, retrieval: &SubgroupRetrieval);
}

/// Drives the scheduler forever: pops due entries, runs the job, sleeps
/// until the next due time. `now_ms` is supplied by the caller so this
/// loop stays free of a wall-clock dependency.
pub async fn run_loop<J, N>(mut scheduler: Scheduler, mut job: J, mut now_ms: N)
where
    J: RetrievalJob,
    N: FnMut() -> i64,
{
    loop {
        let now = now_ms();
        let due = scheduler.pop_due(now);
        for retrieval in &due {
            debug!(subgroup_id = retrieval.subgroup_id, due_at_ms = retrieval.due_at_ms, "running retrieval job");
            job.run(retrieval);
        }
        let sleep_for = scheduler.next_sleep(now_ms());
        tokio::time::sleep(sleep_for).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn race_event_due_times_match_offsets_plus_delay() {
        let sg = Subgroup {
            subgroup_id: 1,
            event_name: "Tuesday Race".into(),
            zwift_event_id: 42,
            start_ms: 120_000,
        };
        let due: Vec<i64> = due_times_for(&sg).into_iter().map(|r| r.due_at_ms).collect();
        assert_eq!(
            due,
            vec![180_000, 1_080_000, 1_980_000, 2_880_000, 3_780_000, 4_680_000, 5_580_000]
        );
    }

    #[test]
    fn non_race_event_has_single_retrieval_at_start_plus_60s() {
        let sg = Subgroup {
            subgroup_id: 2,
            event_name: "Social Ride".into(),
            zwift_event_id: 43,
            start_ms: 0,
        };
        let due = due_times_for(&sg);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].due_at_ms, 60_000);
    }

    #[test]
    fn pop_due_returns_only_entries_at_or_before_now_in_order() {
        let mut sched = Scheduler::new();
        sched.push(SubgroupRetrieval {
            due_at_ms: 100,
            subgroup_id: 1,
            event_name: "a".into(),
            zwift_event_id: 1,
        });
        sched.push(SubgroupRetrieval {
            due_at_ms: 50,
            subgroup_id: 2,
            event_name: "b".into(),
            zwift_event_id: 2,
        });
        sched.push(SubgroupRetrieval {
            due_at_ms: 200,
            subgroup_id: 3,
            event_name: "c".into(),
            zwift_event_id: 3,
        });

        let due = sched.pop_due(100);
        assert_eq!(due.iter().map(|r| r.due_at_ms).collect::<Vec<_>>(), vec![50, 100]);
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn next_sleep_is_capped_at_60s_and_defaults_when_empty() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.next_sleep(0), Duration::from_millis(60_000));
        sched.push(SubgroupRetrieval {
            due_at_ms: 500_000,
            subgroup_id: 1,
            event_name: "a".into(),
            zwift_event_id: 1,
        });
        assert_eq!(sched.next_sleep(0), Duration::from_millis(60_000));
        assert_eq!(sched.next_sleep(470_000), Duration::from_millis(30_000));
    }
}
