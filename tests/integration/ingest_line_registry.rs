//! Drives a real `LogTailer` over an appended-to file through the
//! `Ingestor`, exercising chalkline-registry resolution end to end: a
//! `LINE` record teaches the local->name mapping, storage supplies the
//! canonical id, and the following `POS` record must resolve to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use ingestor::{ControlFlow, Ingestor, IngestorConfig, PersistError, Persistence, Publisher};
use std::io::Write;
use std::sync::{Arc, Mutex};
use zlog_protocol::{ChatEvent, PositionRecord, TelemetryRecord};

#[derive(Default, Clone)]
struct FakeStore {
    chalklines: Arc<Mutex<std::collections::HashMap<String, u32>>>,
    positions: Arc<Mutex<Vec<PositionRecord>>>,
}

#[async_trait]
impl Persistence for FakeStore {
    async fn find_chalkline_by_name(&self, name: &str) -> Result<Option<u32>, PersistError> {
        Ok(self.chalklines.lock().unwrap().get(name).copied())
    }

    async fn insert_chalkline(&self, name: &str) -> Result<u32, PersistError> {
        let mut map = self.chalklines.lock().unwrap();
        let id = 100 + map.len() as u32;
        map.insert(name.to_owned(), id);
        Ok(id)
    }

    async fn mark_active(&self, _canonical_id: u32, _at: DateTime<Utc>) -> Result<(), PersistError> {
        Ok(())
    }

    async fn mark_all_inactive(&self) -> Result<u64, PersistError> {
        Ok(0)
    }

    async fn upsert_position(&self, rec: &PositionRecord) -> Result<(), PersistError> {
        self.positions.lock().unwrap().push(rec.clone());
        Ok(())
    }

    async fn insert_telemetry(&self, _rec: &TelemetryRecord) -> Result<(), PersistError> {
        Ok(())
    }

    async fn insert_chat(&self, _ev: &ChatEvent) -> Result<(), PersistError> {
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

#[tokio::test]
async fn line_then_pos_resolves_to_canonical_id_via_tailed_log() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"e":"LINE","v":{{"line":7,"name":"SLStart"}}}}"#).unwrap();
    writeln!(
        file,
        r#"{{"e":"POS","msec":1000,"v":{{"id":42,"line":7,"fwd":true,"m":0,"mwh":0,"dur":1000,"ele":0,"spd":0,"hr":0,"obs":3}}}}"#
    )
    .unwrap();
    file.flush().unwrap();

    let store = FakeStore::default();
    store.chalklines.lock().unwrap().insert("SLStart".to_owned(), 101);
    let store_handle = store.clone();
    let bus = FakeBus::default();

    let mut ingestor = Ingestor::new(IngestorConfig::default(), store, bus);

    let tailer = zlog_tailer::LogTailer::open(file.path()).await.unwrap();
    let mut lines = Box::pin(tailer.into_stream());

    let mut processed = 0;
    while processed < 2 {
        if let Some(line) = lines.next().await {
            let line = line.unwrap();
            let outcome = ingestor.process_line(&line).await.unwrap();
            assert_eq!(outcome, ControlFlow::Continue);
            processed += 1;
        } else {
            break;
        }
    }

    let positions = store_handle.positions.lock().unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].rider_id, 42);
    assert_eq!(positions[0].line_id, Some(101));
}
