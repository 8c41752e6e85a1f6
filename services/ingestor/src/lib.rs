//! The ingestion loop: decodes observer log lines, maintains the chalkline
//! registry and chat dedup window, persists to storage, and republishes on
//! the bus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use zlog_chat::ChatDeduper;
use zlog_lines::LineRegistry;
use zlog_protocol::{
    chat_routing_key, pos_routing_key, tele_routing_key, ChatEvent, ChatEventIn, IngestEvent,
    LineEvent, NearbyEvent, PosEvent, PositionRecord, RawRecord, TeleEvent, TelemetryRecord,
    EXCHANGE_ZLOGGER,
};

const STORAGE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(3);
const DEFAULT_UPDATE_INTERVAL_MS: i64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("{0}")]
    Other(String),
}

/// Storage boundary the ingestion loop talks to; implemented by
/// [`zlog-store`] in production and by an in-memory fake in tests.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn find_chalkline_by_name(&self, name: &str) -> Result<Option<u32>, PersistError>;
    async fn insert_chalkline(&self, name: &str) -> Result<u32, PersistError>;
    async fn mark_active(&self, canonical_id: u32, at: DateTime<Utc>) -> Result<(), PersistError>;
    async fn mark_all_inactive(&self) -> Result<u64, PersistError>;
    async fn upsert_position(&self, rec: &PositionRecord) -> Result<(), PersistError>;
    async fn insert_telemetry(&self, rec: &TelemetryRecord) -> Result<(), PersistError>;
    async fn insert_chat(&self, ev: &ChatEvent) -> Result<(), PersistError>;
}

/// Republishing boundary; implemented by [`zlog-bus`] in production.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, routing_key: String, payload: Vec<u8>);
}

pub struct IngestorConfig {
    pub update_interval_ms: i64,
    pub stay_running_after_shutdown: bool,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        IngestorConfig {
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            stay_running_after_shutdown: false,
        }
    }
}

/// What the run loop should do after processing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    /// A SHUTDOWN record was processed and `stay_running_after_shutdown` is
    /// false; the caller should stop reading and optionally rotate the log.
    Shutdown,
}

pub struct Ingestor<P, B> {
    config: IngestorConfig,
    registry: LineRegistry,
    chat: ChatDeduper,
    store: P,
    bus: B,
    last_active_stamp: HashMap<u32, i64>,
}

impl<P: Persistence, B: Publisher> Ingestor<P, B> {
    pub fn new(config: IngestorConfig, store: P, bus: B) -> Self {
        Ingestor {
            config,
            registry: LineRegistry::new(),
            chat: ChatDeduper::new(),
            store,
            bus,
            last_active_stamp: HashMap::new(),
        }
    }

    /// Decodes one raw log line and dispatches it. Database errors are the
    /// caller's responsibility to retry with a backoff; this
    /// method surfaces them instead of sleeping internally, so the run
    /// loop owns the retry policy.
    pub async fn process_line(&mut self, line: &str) -> Result<ControlFlow, PersistError> {
        let raw = match RawRecord::parse_line(line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, payload = %line, "malformed record, skipping");
                return Ok(ControlFlow::Continue);
            }
        };
        let event = match IngestEvent::try_from(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, payload = %line, "unrecognized record, skipping");
                return Ok(ControlFlow::Continue);
            }
        };
        self.dispatch(event).await
    }

    async fn dispatch(&mut self, event: IngestEvent) -> Result<ControlFlow, PersistError> {
        match event {
            IngestEvent::Line(ev) => self.handle_line(ev).await.map(|()| ControlFlow::Continue),
            IngestEvent::Nearby(ev) => self.handle_nearby(ev).await.map(|()| ControlFlow::Continue),
            IngestEvent::Pos(ev) => self.handle_pos(ev).await.map(|()| ControlFlow::Continue),
            IngestEvent::Tele(ev) => self.handle_tele(ev).await.map(|()| ControlFlow::Continue),
            IngestEvent::Chat(ev) => self.handle_chat(ev).await.map(|()| ControlFlow::Continue),
            IngestEvent::Shutdown => {
                self.handle_shutdown().await?;
                if self.config.stay_running_after_shutdown {
                    Ok(ControlFlow::Continue)
                } else {
                    Ok(ControlFlow::Shutdown)
                }
            }
        }
    }

    async fn handle_line(&mut self, ev: LineEvent) -> Result<(), PersistError> {
        if self.registry.add_source(ev.local_line, &ev.name).is_none() {
            let canonical_id = match self.store.find_chalkline_by_name(&ev.name).await? {
                Some(id) => id,
                None => self.store.insert_chalkline(&ev.name).await?,
            };
            self.registry.add_dest(canonical_id, &ev.name);
        }
        Ok(())
    }

    async fn handle_nearby(&mut self, ev: NearbyEvent) -> Result<(), PersistError> {
        let Ok(canonical_id) = self.registry.resolve(ev.local_line) else {
            warn!(local_line = ev.local_line, "NEARBY references unmapped line");
            return Ok(());
        };
        self.store.mark_active(canonical_id, Utc::now()).await?;
        self.last_active_stamp.insert(ev.local_line, Utc::now().timestamp_millis());
        Ok(())
    }

    async fn handle_pos(&mut self, ev: PosEvent) -> Result<(), PersistError> {
        let Ok(canonical_id) = self.registry.resolve(ev.local_line) else {
            warn!(local_line = ev.local_line, "POS references unmapped line");
            return Ok(());
        };

        let last_update = self.last_active_stamp.get(&ev.local_line).copied().unwrap_or(0);
        if ev.time_ms - last_update > self.config.update_interval_ms {
            self.store.mark_active(canonical_id, Utc::now()).await?;
            self.last_active_stamp.insert(ev.local_line, ev.time_ms);
        }

        let record = PositionRecord {
            time_ms: ev.time_ms,
            rider_id: ev.rider_id,
            line_id: Some(canonical_id),
            forward: ev.forward,
            meters: ev.meters,
            mwh: ev.mwh,
            duration_ms: ev.duration_ms,
            elevation: ev.elevation,
            speed_mph_thousandths: ev.speed_mph_thousandths,
            hr: ev.hr,
            monitor_id: ev.monitor_id,
            lpup: ev.lpup,
            pup: ev.pup,
            cadence: ev.cadence,
            group_id: ev.group_id,
        };

        let line_name = self
            .registry
            .name_for_local(ev.local_line)
            .map(str::to_owned)
            .unwrap_or_else(|| ev.local_line.to_string());
        self.bus
            .publish(
                pos_routing_key(&line_name, ev.rider_id),
                serde_json::to_vec(&record).unwrap_or_default(),
            )
            .await;
        self.store.upsert_position(&record).await
    }

    async fn handle_tele(&mut self, ev: TeleEvent) -> Result<(), PersistError> {
        let record = TelemetryRecord {
            time_ms: ev.time_ms,
            rider_id: ev.rider_id,
            rad: ev.rad,
            forward: ev.forward,
            meters: ev.meters,
            mwh: ev.mwh,
            duration_ms: ev.duration_ms,
            elevation: ev.elevation,
            speed_mph_thousandths: ev.speed_mph_thousandths,
            hr: ev.hr,
            monitor_id: ev.monitor_id,
            lpup: ev.lpup,
            pup: ev.pup,
            cadence: ev.cadence,
            group_id: ev.group_id,
        };
        self.bus
            .publish(
                tele_routing_key(ev.rider_id),
                serde_json::to_vec(&record).unwrap_or_default(),
            )
            .await;
        self.store.insert_telemetry(&record).await
    }

    async fn handle_chat(&mut self, ev: ChatEventIn) -> Result<(), PersistError> {
        let Ok(now_secs) = zlog_chat::parse_hms(&ev.time) else {
            warn!(time = %ev.time, "unparseable chat timestamp, skipping");
            return Ok(());
        };
        if !self.chat.offer(now_secs, ev.rider_id, &ev.msg) {
            return Ok(());
        }
        let record = ChatEvent {
            time: ev.time,
            rider_id: ev.rider_id,
            partial_name: ev.partial_name,
            msg: ev.msg,
        };
        self.bus
            .publish(
                chat_routing_key(record.rider_id),
                serde_json::to_vec(&record).unwrap_or_default(),
            )
            .await;
        self.store.insert_chat(&record).await
    }

    async fn handle_shutdown(&mut self) -> Result<(), PersistError> {
        self.store.mark_all_inactive().await?;
        Ok(())
    }
}

/// CLI surface and run loop, shared between this crate's own binary and
/// the root `zlogger` dispatcher.
pub mod cli {
    use super::{rotate_log_file, ControlFlow, Ingestor, IngestorConfig, PersistError, Persistence, Publisher};
    use chrono::{DateTime, Utc};
    use futures::StreamExt;
    use std::path::PathBuf;
    use tracing::{error, info};
    use zlog_bus::SharedBus;
    use zlog_protocol::{ChatEvent, PositionRecord, TelemetryRecord};
    use zlog_store::{ChalklineWriter, RecordWriter};

    /// Tails an observer log and ingests records into storage and the bus.
    #[derive(clap::Args, Debug)]
    pub struct Args {
        /// Observer log file to tail.
        #[arg(long)]
        pub log_path: PathBuf,

        /// Postgres connection string.
        #[arg(long, short = 'D', env = "DATABASE_URL")]
        pub database_url: String,

        /// Message bus URL.
        #[arg(long, env = "BUS_URL", default_value = "nats://localhost:4222")]
        pub bus_url: String,

        /// Milliseconds between forced chalkline-active re-stamps for a line.
        #[arg(long, default_value_t = 30_000)]
        pub update_interval_ms: i64,

        /// Keep the ingestor running after a SHUTDOWN record instead of exiting.
        #[arg(long)]
        pub stay_running_after_shutdown: bool,

        #[arg(long, short = 'v', action = clap::ArgAction::Count)]
        pub verbose: u8,
    }

    struct StorePersistence {
        pool: sqlx::PgPool,
    }

    #[async_trait::async_trait]
    impl Persistence for StorePersistence {
        async fn find_chalkline_by_name(&self, name: &str) -> Result<Option<u32>, PersistError> {
            ChalklineWriter::new(&self.pool)
                .find_by_name(name)
                .await
                .map_err(|e| PersistError::Other(e.to_string()))
        }

        async fn insert_chalkline(&self, name: &str) -> Result<u32, PersistError> {
            ChalklineWriter::new(&self.pool)
                .insert_new(name)
                .await
                .map_err(|e| PersistError::Other(e.to_string()))
        }

        async fn mark_active(&self, canonical_id: u32, at: DateTime<Utc>) -> Result<(), PersistError> {
            ChalklineWriter::new(&self.pool)
                .mark_active(canonical_id, at)
                .await
                .map_err(|e| PersistError::Other(e.to_string()))
        }

        async fn mark_all_inactive(&self) -> Result<u64, PersistError> {
            ChalklineWriter::new(&self.pool)
                .mark_all_inactive()
                .await
                .map_err(|e| PersistError::Other(e.to_string()))
        }

        async fn upsert_position(&self, rec: &PositionRecord) -> Result<(), PersistError> {
            RecordWriter::new(&self.pool)
                .upsert_position(rec)
                .await
                .map_err(|e| PersistError::Other(e.to_string()))
        }

        async fn insert_telemetry(&self, rec: &TelemetryRecord) -> Result<(), PersistError> {
            RecordWriter::new(&self.pool)
                .insert_telemetry(rec)
                .await
                .map_err(|e| PersistError::Other(e.to_string()))
        }

        async fn insert_chat(&self, ev: &ChatEvent) -> Result<(), PersistError> {
            RecordWriter::new(&self.pool)
                .insert_chat(ev)
                .await
                .map_err(|e| PersistError::Other(e.to_string()))
        }
    }

    struct BusPublisher {
        bus: SharedBus,
    }

    #[async_trait::async_trait]
    impl Publisher for BusPublisher {
        async fn publish(&self, routing_key: String, payload: Vec<u8>) {
            if let Err(e) = self.bus.publish(routing_key, payload).await {
                error!(error = %e, "bus publish ultimately failed, continuing");
            }
        }
    }

    /// Runs the ingestion loop to completion (until Ctrl+C or a SHUTDOWN
    /// record with `stay_running_after_shutdown` unset).
    pub async fn run(args: Args) -> anyhow::Result<()> {
        let pool = loop {
            match zlog_store::connect(&args.database_url).await {
                Ok(pool) => break pool,
                Err(e) => {
                    error!(error = %e, "failed to connect to storage, retrying in 3s");
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                }
            }
        };
        zlog_store::run_migrations(&pool).await?;

        let bus = zlog_bus::shared(args.bus_url.as_str());
        let config = IngestorConfig {
            update_interval_ms: args.update_interval_ms,
            stay_running_after_shutdown: args.stay_running_after_shutdown,
        };
        let mut ingestor = Ingestor::new(config, StorePersistence { pool }, BusPublisher { bus });

        info!(path = %args.log_path.display(), "tailing observer log");
        let tailer = zlog_tailer::LogTailer::open(&args.log_path).await?;
        let mut lines = Box::pin(tailer.into_stream());

        'outer: loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl+C, shutting down");
                    break;
                }
                next = lines.next() => {
                    let Some(line) = next else { break };
                    match line {
                        Ok(line) => {
                            loop {
                                match ingestor.process_line(&line).await {
                                    Ok(ControlFlow::Continue) => break,
                                    Ok(ControlFlow::Shutdown) => break 'outer,
                                    Err(e) => {
                                        error!(error = %e, "storage error, retrying in 3s");
                                        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "log tailer I/O error, stopping");
                            break;
                        }
                    }
                }
            }
        }

        if !args.stay_running_after_shutdown {
            if let Ok(rotated) = rotate_log_file(&args.log_path, Utc::now()).await {
                info!(to = %rotated.display(), "rotated consumed log file");
            }
        }
        Ok(())
    }
}

/// Renames the consumed log file with a `YYYY-MM-DD` suffix, appending a
/// numeric disambiguator (`.1`, `.2`, ...) on collision.
pub async fn rotate_log_file(path: &Path, date: DateTime<Utc>) -> std::io::Result<PathBuf> {
    let stamp = date.format("%Y-%m-%d").to_string();
    let mut candidate = PathBuf::from(format!("{}.{stamp}", path.display()));
    let mut suffix = 0u32;
    while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        suffix += 1;
        candidate = PathBuf::from(format!("{}.{stamp}.{suffix}", path.display()));
    }
    tokio::fs::rename(path, &candidate).await?;
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        chalklines: Mutex<HashMap<String, u32>>,
        next_id: Mutex<u32>,
        active: Mutex<Vec<u32>>,
        positions: Mutex<Vec<PositionRecord>>,
        chats: Mutex<Vec<ChatEvent>>,
    }

    #[async_trait]
    impl Persistence for FakeStore {
        async fn find_chalkline_by_name(&self, name: &str) -> Result<Option<u32>, PersistError> {
            Ok(self.chalklines.lock().unwrap().get(name).copied())
        }
        async fn insert_chalkline(&self, name: &str) -> Result<u32, PersistError> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            self.chalklines.lock().unwrap().insert(name.to_owned(), *next);
            Ok(*next)
        }
        async fn mark_active(&self, canonical_id: u32, _at: DateTime<Utc>) -> Result<(), PersistError> {
            self.active.lock().unwrap().push(canonical_id);
            Ok(())
        }
        async fn mark_all_inactive(&self) -> Result<u64, PersistError> {
            let mut active = self.active.lock().unwrap();
            let n = active.len() as u64;
            active.clear();
            Ok(n)
        }
        async fn upsert_position(&self, rec: &PositionRecord) -> Result<(), PersistError> {
            self.positions.lock().unwrap().push(rec.clone());
            Ok(())
        }
        async fn insert_telemetry(&self, _rec: &TelemetryRecord) -> Result<(), PersistError> {
            Ok(())
        }
        async fn insert_chat(&self, ev: &ChatEvent) -> Result<(), PersistError> {
            self.chats.lock().unwrap().push(ev.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Publisher for FakeBus {
        async fn publish(&self, routing_key: String, payload: Vec<u8>) {
            self.published.lock().unwrap().push((routing_key, payload));
        }
    }

    fn ingestor() -> Ingestor<FakeStore, FakeBus> {
        Ingestor::new(IngestorConfig::default(), FakeStore::default(), FakeBus::default())
    }

    #[tokio::test]
    async fn line_then_pos_resolves_canonical_id_and_persists() {
        // LINE then POS for an unseen line name: assigns a canonical id and persists under it
        let mut ing = ingestor();
        ing.process_line(r#"{"e":"LINE","v":{"line":7,"name":"SLStart"}}"#)
            .await
            .unwrap();
        ing.process_line(
            r#"{"e":"POS","msec":1000,"v":{"id":42,"line":7,"fwd":true,"m":0,"mwh":0,"dur":0,"ele":0,"spd":0,"hr":0,"obs":1}}"#,
        )
        .await
        .unwrap();

        let positions = ing.store.positions.lock().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].line_id, Some(1));
        assert_eq!(ing.store.chalklines.lock().unwrap().get("SLStart"), Some(&1));
    }

    #[tokio::test]
    async fn pos_referencing_unmapped_line_logs_and_skips() {
        let mut ing = ingestor();
        ing.process_line(
            r#"{"e":"POS","msec":1000,"v":{"id":1,"line":99,"fwd":true,"m":0,"mwh":0,"dur":0,"ele":0,"spd":0,"hr":0,"obs":1}}"#,
        )
        .await
        .unwrap();
        assert!(ing.store.positions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_skipped_without_error() {
        let mut ing = ingestor();
        assert!(ing.process_line("not json").await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_marks_all_chalklines_inactive() {
        let mut ing = ingestor();
        ing.process_line(r#"{"e":"LINE","v":{"line":7,"name":"Start"}}"#)
            .await
            .unwrap();
        ing.process_line(
            r#"{"e":"NEARBY","v":{"data":7}}"#,
        )
        .await
        .unwrap();
        assert_eq!(ing.store.active.lock().unwrap().len(), 1);
        ing.process_line(r#"{"e":"SHUTDOWN"}"#).await.unwrap();
        assert!(ing.store.active.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_chat_within_window_is_not_persisted_twice() {
        let mut ing = ingestor();
        ing.process_line(r#"{"e":"CHAT","v":{"riderid":1,"msg":"hi","time":"00:00:00"}}"#)
            .await
            .unwrap();
        ing.process_line(r#"{"e":"CHAT","v":{"riderid":1,"msg":"hi","time":"00:00:01"}}"#)
            .await
            .unwrap();
        assert_eq!(ing.store.chats.lock().unwrap().len(), 1);
    }
}
