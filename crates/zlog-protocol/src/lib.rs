//! Wire-level event records and shared domain types for the telemetry
//! pipeline.
//!
//! [`RawRecord`] is the line-delimited JSON shape emitted by observer
//! clients: a discriminator field `e` plus a free-form `v` attribute map,
//! with `msec` carried at the top level for `POS`/`TELE` records. Decoding
//! a `RawRecord` into an [`IngestEvent`] is the Ingestor's first step; the
//! domain records ([`PositionRecord`], [`TelemetryRecord`], [`ChatEvent`])
//! are what get persisted and republished, and are reused unmodified by the
//! race-results engine.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Exchange name carrying routed rider events.
pub const EXCHANGE_ZLOGGER: &str = "zlogger";
/// Exchange name carrying raw (pre-dedup) chat events.
pub const EXCHANGE_RAW_CHAT: &str = "zlogger.raw_chat";

pub fn pos_routing_key(line_name: &str, rider_id: u64) -> String {
    format!("POS.{line_name}.{rider_id}")
}

pub fn tele_routing_key(rider_id: u64) -> String {
    format!("TELE.{rider_id}")
}

pub fn chat_routing_key(rider_id: u64) -> String {
    format!("CHAT.{rider_id}")
}

/// Raw-chat routing key used by the standalone chat-log parser
/// (`zlogger.raw_chat` exchange).
pub const RAW_CHAT_ROUTING_KEY: &str = "CHAT";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unknown event kind: {0}")]
    UnknownKind(String),
    #[error("missing field `{0}` in `v`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
}

/// The line-delimited JSON shape as it appears in an observer's log file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawRecord {
    pub e: String,
    #[serde(default)]
    pub v: serde_json::Value,
    #[serde(default)]
    pub msec: Option<i64>,
}

impl RawRecord {
    pub fn parse_line(line: &str) -> Result<RawRecord, ParseError> {
        Ok(serde_json::from_str(line)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineEvent {
    pub local_line: u32,
    pub name: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearbyEvent {
    pub local_line: u32,
}

/// Shared fields between `POS` and `TELE`; `POS` maps a local line id,
/// `TELE` carries a radial distance instead.
#[derive(Debug, Clone, PartialEq)]
pub struct PosEvent {
    pub time_ms: i64,
    pub local_line: u32,
    pub rider_id: u64,
    pub forward: bool,
    pub meters: i64,
    pub mwh: i64,
    pub duration_ms: i64,
    pub elevation: i32,
    pub speed_mph_thousandths: i32,
    pub hr: i16,
    pub monitor_id: u32,
    pub lpup: i32,
    pub pup: String,
    pub cadence: i16,
    pub group_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeleEvent {
    pub time_ms: i64,
    pub rad: i32,
    pub rider_id: u64,
    pub forward: bool,
    pub meters: i64,
    pub mwh: i64,
    pub duration_ms: i64,
    pub elevation: i32,
    pub speed_mph_thousandths: i32,
    pub hr: i16,
    pub monitor_id: u32,
    pub lpup: i32,
    pub pup: String,
    pub cadence: i16,
    pub group_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEventIn {
    pub rider_id: u64,
    pub msg: String,
    /// `hh:mm:ss`, the event's own clock — never wall time.
    pub time: String,
    pub partial_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Line(LineEvent),
    Nearby(NearbyEvent),
    Pos(PosEvent),
    Tele(TeleEvent),
    Shutdown,
    Chat(ChatEventIn),
}

fn req_u32(v: &serde_json::Value, field: &'static str) -> Result<u32, ParseError> {
    v.get(field)
        .and_then(|x| x.as_u64())
        .map(|x| x as u32)
        .ok_or(ParseError::MissingField(field))
}

fn req_u64(v: &serde_json::Value, field: &'static str) -> Result<u64, ParseError> {
    v.get(field)
        .and_then(|x| x.as_u64())
        .ok_or(ParseError::MissingField(field))
}

fn req_i64(v: &serde_json::Value, field: &'static str) -> Result<i64, ParseError> {
    v.get(field)
        .and_then(|x| x.as_i64())
        .ok_or(ParseError::MissingField(field))
}

fn req_i32(v: &serde_json::Value, field: &'static str) -> Result<i32, ParseError> {
    Ok(req_i64(v, field)? as i32)
}

fn req_bool(v: &serde_json::Value, field: &'static str) -> Result<bool, ParseError> {
    v.get(field)
        .and_then(|x| x.as_bool())
        .ok_or(ParseError::MissingField(field))
}

fn req_str(v: &serde_json::Value, field: &'static str) -> Result<String, ParseError> {
    v.get(field)
        .and_then(|x| x.as_str())
        .map(String::from)
        .ok_or(ParseError::MissingField(field))
}

fn opt_i32(v: &serde_json::Value, field: &'static str, default: i32) -> i32 {
    v.get(field).and_then(|x| x.as_i64()).map_or(default, |x| x as i32)
}

fn opt_str(v: &serde_json::Value, field: &'static str, default: &str) -> String {
    v.get(field)
        .and_then(|x| x.as_str())
        .map(String::from)
        .unwrap_or_else(|| default.to_owned())
}

fn opt_u32(v: &serde_json::Value, field: &'static str, default: u32) -> u32 {
    v.get(field).and_then(|x| x.as_u64()).map_or(default, |x| x as u32)
}

impl TryFrom<RawRecord> for IngestEvent {
    type Error = ParseError;

    fn try_from(raw: RawRecord) -> Result<Self, ParseError> {
        let v = &raw.v;
        match raw.e.as_str() {
            "LINE" => Ok(IngestEvent::Line(LineEvent {
                local_line: req_u32(v, "line")?,
                name: req_str(v, "name")?,
                data: v.get("data").cloned().unwrap_or(serde_json::Value::Null),
            })),
            "NEARBY" => Ok(IngestEvent::Nearby(NearbyEvent {
                local_line: req_u32(v, "data")?,
            })),
            "POS" => Ok(IngestEvent::Pos(PosEvent {
                time_ms: raw.msec.ok_or(ParseError::MissingField("msec"))?,
                local_line: req_u32(v, "line")?,
                rider_id: req_u64(v, "id")?,
                forward: req_bool(v, "fwd")?,
                meters: req_i64(v, "m")?,
                mwh: req_i64(v, "mwh")?,
                duration_ms: req_i64(v, "dur")?,
                elevation: req_i32(v, "ele")?,
                speed_mph_thousandths: req_i32(v, "spd")?,
                hr: req_i32(v, "hr")? as i16,
                monitor_id: req_u32(v, "obs")?,
                lpup: opt_i32(v, "lpup", 0),
                pup: opt_str(v, "pup", ""),
                cadence: opt_i32(v, "cad", 0) as i16,
                group_id: opt_u32(v, "grp", 0),
            })),
            "TELE" => Ok(IngestEvent::Tele(TeleEvent {
                time_ms: raw.msec.ok_or(ParseError::MissingField("msec"))?,
                rad: req_i32(v, "rad")?,
                rider_id: req_u64(v, "id")?,
                forward: req_bool(v, "fwd")?,
                meters: req_i64(v, "m")?,
                mwh: req_i64(v, "mwh")?,
                duration_ms: req_i64(v, "dur")?,
                elevation: req_i32(v, "ele")?,
                speed_mph_thousandths: req_i32(v, "spd")?,
                hr: req_i32(v, "hr")? as i16,
                monitor_id: req_u32(v, "obs")?,
                lpup: opt_i32(v, "lpup", 0),
                pup: opt_str(v, "pup", ""),
                cadence: opt_i32(v, "cad", 0) as i16,
                group_id: opt_u32(v, "grp", 0),
            })),
            "SHUTDOWN" => Ok(IngestEvent::Shutdown),
            "CHAT" => Ok(IngestEvent::Chat(ChatEventIn {
                rider_id: req_u64(v, "riderid")?,
                msg: req_str(v, "msg")?,
                time: req_str(v, "time")?,
                partial_name: v
                    .get("partialName")
                    .and_then(|x| x.as_str())
                    .map(String::from),
            })),
            other => Err(ParseError::UnknownKind(other.to_owned())),
        }
    }
}

/// A persisted/republished position row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub time_ms: i64,
    pub rider_id: u64,
    pub line_id: Option<u32>,
    pub forward: bool,
    pub meters: i64,
    pub mwh: i64,
    pub duration_ms: i64,
    pub elevation: i32,
    pub speed_mph_thousandths: i32,
    pub hr: i16,
    pub monitor_id: u32,
    pub lpup: i32,
    pub pup: String,
    pub cadence: i16,
    pub group_id: u32,
}

impl PositionRecord {
    /// Distance from the start of the rider's retained trajectory, in
    /// meters; callers compute this relative to a start position, this
    /// helper just expresses the difference clearly at call sites.
    pub fn meters_since(&self, start: &PositionRecord) -> i64 {
        self.meters - start.meters
    }
}

/// A persisted telemetry row; same shape as
/// [`PositionRecord`] but with `rad` (radial distance to nearest observer)
/// instead of a chalkline id, and it never participates in chalkline
/// mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub time_ms: i64,
    pub rider_id: u64,
    pub rad: i32,
    pub forward: bool,
    pub meters: i64,
    pub mwh: i64,
    pub duration_ms: i64,
    pub elevation: i32,
    pub speed_mph_thousandths: i32,
    pub hr: i16,
    pub monitor_id: u32,
    pub lpup: i32,
    pub pup: String,
    pub cadence: i16,
    pub group_id: u32,
}

/// A deduplicated chat event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub time: String,
    pub rider_id: u64,
    pub partial_name: Option<String>,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pos_record() {
        let line = r#"{"e":"POS","msec":123456,"v":{"id":42,"line":7,"fwd":true,"m":1000,"mwh":500,"dur":60000,"ele":10,"spd":25000,"hr":150,"obs":3}}"#;
        let raw = RawRecord::parse_line(line).unwrap();
        let ev = IngestEvent::try_from(raw).unwrap();
        match ev {
            IngestEvent::Pos(p) => {
                assert_eq!(p.rider_id, 42);
                assert_eq!(p.local_line, 7);
                assert!(p.forward);
                assert_eq!(p.time_ms, 123456);
            }
            other => panic!("expected Pos, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_kind() {
        let raw = RawRecord::parse_line(r#"{"e":"BOGUS","v":{}}"#).unwrap();
        assert!(matches!(
            IngestEvent::try_from(raw),
            Err(ParseError::UnknownKind(_))
        ));
    }

    #[test]
    fn missing_field_is_an_error_not_a_panic() {
        let raw = RawRecord::parse_line(r#"{"e":"LINE","v":{"line":7}}"#).unwrap();
        assert!(matches!(
            IngestEvent::try_from(raw),
            Err(ParseError::MissingField("name"))
        ));
    }

    #[test]
    fn shutdown_has_no_value_requirements() {
        let raw = RawRecord::parse_line(r#"{"e":"SHUTDOWN"}"#).unwrap();
        assert_eq!(IngestEvent::try_from(raw).unwrap(), IngestEvent::Shutdown);
    }

    #[test]
    fn routing_keys_match_spec_grammar() {
        assert_eq!(pos_routing_key("Start", 42), "POS.Start.42");
        assert_eq!(tele_routing_key(42), "TELE.42");
        assert_eq!(chat_routing_key(42), "CHAT.42");
    }
}
