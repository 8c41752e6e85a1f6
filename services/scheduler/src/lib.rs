//! Hosts `zlog-scheduler`'s min-heap core against the `zwift_event_subgroups`
//! read model: periodically re-scans the upcoming window,
//! enqueues due retrievals, and drives a pluggable [`zlog_scheduler::RetrievalJob`].
//!
//! The upstream rider-profile retrieval itself stays external per the
//! Non-goals; [`LoggingRetrievalJob`] is the safe default used here and in
//! tests, standing in for the real HTTP client.

use tracing::info;
use zlog_scheduler::{RetrievalJob, Scheduler, Subgroup, SubgroupRetrieval};
use zlog_store::SubgroupRow;

/// Re-scan window the scheduler's own `enqueue_window` further filters by
/// its 2-hour horizon constant; kept equal here so a refresh never misses
/// a subgroup that just entered the horizon.
pub const HORIZON_MS: i64 = 2 * 60 * 60 * 1000;
/// How often the DB is re-polled for newly visible subgroups.
pub const DB_REFRESH_MS: i64 = 5 * 60 * 1000;

pub fn rows_to_subgroups(rows: Vec<SubgroupRow>) -> Vec<Subgroup> {
    rows.into_iter()
        .map(|r| Subgroup {
            subgroup_id: r.subgroup_id,
            event_name: r.name,
            zwift_event_id: r.zwift_event_id,
            start_ms: r.start_ms,
        })
        .collect()
}

/// Default retrieval job: logs what would be retrieved rather than calling
/// the upstream profile API, which stays an external collaborator.
#[derive(Default)]
pub struct LoggingRetrievalJob;

impl RetrievalJob for LoggingRetrievalJob {
    fn run(&mut self, retrieval: &SubgroupRetrieval) {
        info!(
            subgroup_id = retrieval.subgroup_id,
            zwift_event_id = retrieval.zwift_event_id,
            event_name = %retrieval.event_name,
            due_at_ms = retrieval.due_at_ms,
            "retrieval due (upstream profile client is external; logging only)"
        );
    }
}

/// One iteration's worth of work, factored out so tests can drive it
/// without a real clock or database: enqueues newly-visible subgroups,
/// runs every due job, and reports how long to sleep before the next tick.
pub fn tick(
    scheduler: &mut Scheduler,
    job: &mut dyn RetrievalJob,
    now_ms: i64,
    newly_visible: &[Subgroup],
) -> std::time::Duration {
    scheduler.enqueue_window(now_ms, newly_visible);
    for retrieval in scheduler.pop_due(now_ms) {
        job.run(&retrieval);
    }
    scheduler.next_sleep(now_ms)
}

/// CLI surface and run loop, shared between this crate's own binary and
/// the root `zlogger` dispatcher.
pub mod cli {
    use super::{rows_to_subgroups, tick, LoggingRetrievalJob, DB_REFRESH_MS, HORIZON_MS};
    use chrono::Utc;
    use tracing::info;
    use zlog_scheduler::Scheduler;
    use zlog_store::EventStore;

    /// Walks upcoming event subgroups and triggers rider-profile retrieval
    /// jobs at computed offsets before and after each subgroup's start
    /// before and after each subgroup's start.
    #[derive(clap::Args, Debug)]
    pub struct Args {
        /// Postgres connection string.
        #[arg(long, short = 'D', env = "DATABASE_URL")]
        pub database_url: String,

        #[arg(long, short = 'v', action = clap::ArgAction::Count)]
        pub verbose: u8,
    }

    pub async fn run(args: Args) -> anyhow::Result<()> {
        let pool = zlog_store::connect(&args.database_url).await?;
        let mut scheduler = Scheduler::new();
        let mut job = LoggingRetrievalJob;
        let mut last_refresh_ms = i64::MIN;

        loop {
            let now = Utc::now();
            let now_ms = now.timestamp_millis();

            let newly_visible = if now_ms - last_refresh_ms >= DB_REFRESH_MS {
                let store = EventStore::new(&pool);
                let rows = store.subgroups_starting_within(now, HORIZON_MS).await?;
                last_refresh_ms = now_ms;
                info!(count = rows.len(), "refreshed upcoming subgroup window");
                rows_to_subgroups(rows)
            } else {
                Vec::new()
            };

            let sleep_for = tick(&mut scheduler, &mut job, now_ms, &newly_visible);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl+C, shutting down");
                    break;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingJob {
        runs: Vec<u64>,
    }
    impl RetrievalJob for CountingJob {
        fn run(&mut self, retrieval: &SubgroupRetrieval) {
            self.runs.push(retrieval.subgroup_id);
        }
    }

    #[test]
    fn tick_enqueues_and_fires_due_retrievals() {
        let mut scheduler = Scheduler::new();
        let mut job = CountingJob { runs: Vec::new() };
        let subgroups = vec![Subgroup {
            subgroup_id: 1,
            event_name: "Social Ride".into(),
            zwift_event_id: 9,
            start_ms: 0,
        }];
        // single non-race retrieval is due at start + 60s
        tick(&mut scheduler, &mut job, 0, &subgroups);
        assert!(job.runs.is_empty());
        tick(&mut scheduler, &mut job, 60_000, &[]);
        assert_eq!(job.runs, vec![1]);
    }
}
