//! Postgres-backed persistence for chalklines, positions, telemetry and
//! chat, plus a read-only query surface over positions (`PositionStore`).

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use zlog_protocol::{ChatEvent, PositionRecord, TelemetryRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// A registered chalkline row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChalklineRef {
    pub canonical_id: u32,
    pub name: String,
    pub active: bool,
    pub last_monitored_at: Option<DateTime<Utc>>,
}

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    Ok(PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Db(sqlx::Error::Migrate(Box::new(e))))
}

/// Write side of the chalkline table: insertion on first sighting,
/// activity/monitoring flips driven by NEARBY/POS/SHUTDOWN.
pub struct ChalklineWriter<'a> {
    pool: &'a PgPool,
}

impl<'a> ChalklineWriter<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        ChalklineWriter { pool }
    }

    /// Inserts a new chalkline row for a name never seen before and returns
    /// its assigned canonical id.
    pub async fn insert_new(&self, name: &str) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "INSERT INTO chalkline (name, data) VALUES ($1, ''::bytea) RETURNING canonical_id",
        )
        .bind(name)
        .fetch_one(self.pool)
        .await?;
        Ok(row.get::<i32, _>("canonical_id") as u32)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<u32>, StoreError> {
        let row = sqlx::query("SELECT canonical_id FROM chalkline WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i32, _>("canonical_id") as u32))
    }

    pub async fn mark_active(&self, canonical_id: u32, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE chalkline SET active = TRUE, last_monitored_at = $2 WHERE canonical_id = $1")
            .bind(canonical_id as i32)
            .bind(at)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Flips every currently-active chalkline to inactive; used on a
    /// SHUTDOWN event.
    pub async fn mark_all_inactive(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE chalkline SET active = FALSE WHERE active")
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Write side of position/telemetry/chat persistence, used by the
/// ingestion loop.
pub struct RecordWriter<'a> {
    pool: &'a PgPool,
}

impl<'a> RecordWriter<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        RecordWriter { pool }
    }

    /// Upserts a live-results row keyed by (msec, rider, monitor), as
    /// driven by the POS dispatch path.
    pub async fn upsert_position(&self, rec: &PositionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO live_results
                (msec, rider_id, monitor_id, line_id, forward, meters, mwh, duration_ms,
                 elevation, speed_mph_thousandths, hr, lpup, pup, cadence, group_id)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
               ON CONFLICT (msec, rider_id, monitor_id) DO UPDATE SET
                 line_id = EXCLUDED.line_id,
                 forward = EXCLUDED.forward,
                 meters = EXCLUDED.meters,
                 mwh = EXCLUDED.mwh,
                 duration_ms = EXCLUDED.duration_ms,
                 elevation = EXCLUDED.elevation,
                 speed_mph_thousandths = EXCLUDED.speed_mph_thousandths,
                 hr = EXCLUDED.hr,
                 lpup = EXCLUDED.lpup,
                 pup = EXCLUDED.pup,
                 cadence = EXCLUDED.cadence,
                 group_id = EXCLUDED.group_id"#,
        )
        .bind(rec.time_ms)
        .bind(rec.rider_id as i64)
        .bind(rec.monitor_id as i64)
        .bind(rec.line_id.map(|v| v as i32))
        .bind(rec.forward)
        .bind(rec.meters)
        .bind(rec.mwh)
        .bind(rec.duration_ms)
        .bind(rec.elevation)
        .bind(rec.speed_mph_thousandths)
        .bind(rec.hr)
        .bind(rec.lpup)
        .bind(&rec.pup)
        .bind(rec.cadence)
        .bind(rec.group_id as i32)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_telemetry(&self, rec: &TelemetryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO telemetry
                (msec, rider_id, monitor_id, rad, forward, meters, mwh, duration_ms,
                 elevation, speed_mph_thousandths, hr, lpup, pup, cadence, group_id)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
               ON CONFLICT (msec, rider_id, monitor_id) DO NOTHING"#,
        )
        .bind(rec.time_ms)
        .bind(rec.rider_id as i64)
        .bind(rec.monitor_id as i64)
        .bind(rec.rad)
        .bind(rec.forward)
        .bind(rec.meters)
        .bind(rec.mwh)
        .bind(rec.duration_ms)
        .bind(rec.elevation)
        .bind(rec.speed_mph_thousandths)
        .bind(rec.hr)
        .bind(rec.lpup)
        .bind(&rec.pup)
        .bind(rec.cadence)
        .bind(rec.group_id as i32)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_chat(&self, ev: &ChatEvent) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO chat (time_hms, rider_id, partial_name, msg) VALUES ($1,$2,$3,$4)")
            .bind(&ev.time)
            .bind(ev.rider_id as i64)
            .bind(&ev.partial_name)
            .bind(&ev.msg)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

/// A rider profile read-model row: category and body-metric overrides the
/// results engine prefers over the surname regex fallback, plus the
/// Strava/Zwift id linkage joined from `athlete_names`.
#[derive(Debug, Clone, PartialEq)]
pub struct RiderProfile {
    pub rider_id: u64,
    pub fname: String,
    pub lname: String,
    pub cat: Option<char>,
    pub weight_g: i32,
    pub height_mm: i32,
    pub male: bool,
    pub power_type: u8,
    pub strava_id: Option<i64>,
}

/// Read-only interface over persisted positions: a range query, plus
/// chalkline lookup by exact name then prefix.
pub struct PositionStore<'a> {
    pool: &'a PgPool,
}

impl<'a> PositionStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        PositionStore { pool }
    }

    /// All positions with `start_ms <= time_ms <= end_ms`, ordered by rider
    /// then time -- the shape the results pipeline scans per rider.
    pub async fn positions_in_range(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<(u64, PositionRecord)>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT rider_id, msec, line_id, forward, meters, mwh, duration_ms,
                      elevation, speed_mph_thousandths, hr, monitor_id, lpup, pup, cadence, group_id
               FROM live_results
               WHERE msec BETWEEN $1 AND $2
               ORDER BY rider_id, msec"#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let rider_id: i64 = r.get("rider_id");
                (
                    rider_id as u64,
                    PositionRecord {
                        time_ms: r.get("msec"),
                        rider_id: rider_id as u64,
                        line_id: r.get::<Option<i32>, _>("line_id").map(|v| v as u32),
                        forward: r.get("forward"),
                        meters: r.get("meters"),
                        mwh: r.get("mwh"),
                        duration_ms: r.get("duration_ms"),
                        elevation: r.get("elevation"),
                        speed_mph_thousandths: r.get("speed_mph_thousandths"),
                        hr: r.get("hr"),
                        monitor_id: r.get::<i64, _>("monitor_id") as u32,
                        lpup: r.get("lpup"),
                        pup: r.get("pup"),
                        cadence: r.get("cadence"),
                        group_id: r.get::<i32, _>("group_id") as u32,
                    },
                )
            })
            .collect())
    }

    /// Exact match first; falls back to a prefix (`LIKE 'name%'`) match,
    /// returning the first hit ordered by canonical id.
    pub async fn find_line_by_name(&self, name: &str) -> Result<Option<ChalklineRef>, StoreError> {
        if let Some(exact) = self.load_line(name, false).await? {
            return Ok(Some(exact));
        }
        self.load_line(name, true).await
    }

    async fn load_line(&self, name: &str, prefix: bool) -> Result<Option<ChalklineRef>, StoreError> {
        let row = if prefix {
            sqlx::query(
                "SELECT canonical_id, name, active, last_monitored_at FROM chalkline \
                 WHERE name LIKE $1 ORDER BY canonical_id LIMIT 1",
            )
            .bind(format!("{name}%"))
            .fetch_optional(self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT canonical_id, name, active, last_monitored_at FROM chalkline WHERE name = $1",
            )
            .bind(name)
            .fetch_optional(self.pool)
            .await?
        };

        Ok(row.map(|r| ChalklineRef {
            canonical_id: r.get::<i32, _>("canonical_id") as u32,
            name: r.get("name"),
            active: r.get("active"),
            last_monitored_at: r.get("last_monitored_at"),
        }))
    }

    /// Rider profile for the results engine's category-inference step 7
    /// ("category is taken from the database if present"), joined against
    /// `athlete_names` for the linked Strava id.
    pub async fn rider_profile(&self, rider_id: u64) -> Result<Option<RiderProfile>, StoreError> {
        let row = sqlx::query(
            r#"SELECT r.rider_id, r.fname, r.lname, r.cat, r.weight_g, r.height_mm,
                      r.male, r.power_type, a.strava_id
               FROM riders r
               LEFT JOIN athlete_names a ON a.zwift_id = r.rider_id
               WHERE r.rider_id = $1"#,
        )
        .bind(rider_id as i64)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(|r| RiderProfile {
            rider_id: r.get::<i64, _>("rider_id") as u64,
            fname: r.get("fname"),
            lname: r.get("lname"),
            cat: r
                .get::<Option<String>, _>("cat")
                .and_then(|s| s.chars().next()),
            weight_g: r.get("weight_g"),
            height_mm: r.get("height_mm"),
            male: r.get("male"),
            power_type: r.get::<i16, _>("power_type") as u8,
            strava_id: r.get("strava_id"),
        }))
    }
}

/// A subgroup row as read from `zwift_event_subgroups`, the shape
/// `zlog-scheduler`'s [`Scheduler`] walks.
#[derive(Debug, Clone, PartialEq)]
pub struct SubgroupRow {
    pub subgroup_id: u64,
    pub zwift_event_id: u64,
    pub name: String,
    pub start_ms: i64,
}

/// Read-only interface over the upstream event/subgroup tables
/// (`zwift_events`, `zwift_event_subgroups`, `event_detail`).
pub struct EventStore<'a> {
    pool: &'a PgPool,
}

impl<'a> EventStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        EventStore { pool }
    }

    /// Subgroups starting within `[now, now + horizon_ms]`, the window the
    /// scheduler's `enqueue_window` re-filters per its own horizon constant.
    pub async fn subgroups_starting_within(
        &self,
        now: DateTime<Utc>,
        horizon_ms: i64,
    ) -> Result<Vec<SubgroupRow>, StoreError> {
        let until = now + Duration::milliseconds(horizon_ms);
        let rows = sqlx::query(
            r#"SELECT subgroup_id, zwift_event_id, name, start_time
               FROM zwift_event_subgroups
               WHERE start_time BETWEEN $1 AND $2
               ORDER BY start_time"#,
        )
        .bind(now)
        .bind(until)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| SubgroupRow {
                subgroup_id: r.get::<i64, _>("subgroup_id") as u64,
                zwift_event_id: r.get::<i64, _>("zwift_event_id") as u64,
                name: r.get("name"),
                start_ms: r.get::<DateTime<Utc>, _>("start_time").timestamp_millis(),
            })
            .collect())
    }
}
