//! Parser for the race-configuration file grammar.
//!
//! A keyword-directed, line-oriented format: comments start with `#`, blank
//! lines are ignored, and an unrecognized keyword is silently skipped
//! rather than rejected. Syntax violations on a *recognized*
//! keyword fail fast with a diagnostic naming the offending line and
//! keyword.

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;

const DEFAULT_CUTOFF_MS: i64 = 2 * 60 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("line {line}: {keyword}: {reason}")]
    Syntax {
        line: usize,
        keyword: String,
        reason: String,
    },
    #[error("race config has no BEGIN time; cannot compute start_ms")]
    MissingStart,
}

fn syntax(line: usize, keyword: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Syntax {
        line,
        keyword: keyword.to_owned(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSpec {
    pub name: String,
    pub distance_m: f64,
    pub lead_rider_id: Option<u64>,
    pub delay_ms: Option<i64>,
    pub start_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceConfig {
    pub id: Option<String>,
    pub name: Option<String>,
    pub date: Option<NaiveDate>,
    pub start_ms: i64,
    pub finish_ms: i64,
    pub start_line: String,
    pub start_forward: bool,
    pub corral_line: Option<String>,
    pub corral_forward: Option<bool>,
    pub finish_line: String,
    pub finish_forward: bool,
    pub alternate: bool,
    pub pace_kmh: Option<f64>,
    pub cutoff_ms: Option<i64>,
    pub groups: Vec<GroupSpec>,
}

struct RawGroup {
    name: String,
    distance_m: f64,
    lead_rider_id: Option<u64>,
    delay_ms: Option<i64>,
}

#[derive(Default)]
struct Builder {
    id: Option<String>,
    name: Option<String>,
    date: Option<NaiveDate>,
    start_ms: Option<i64>,
    start_line: Option<(String, bool)>,
    corral_line: Option<(String, bool)>,
    finish_line: Option<(String, bool)>,
    alternate: bool,
    pace_kmh: Option<f64>,
    cutoff_ms: Option<i64>,
    raw_groups: Vec<RawGroup>,
}

pub fn parse(source: &str) -> Result<RaceConfig, ConfigError> {
    let mut b = Builder::default();

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let (keyword, rest) = split_keyword(line);
        match keyword.to_uppercase().as_str() {
            "ID" => b.id = Some(rest.trim().to_owned()),
            "NAME" => b.name = Some(rest.trim().to_owned()),
            "ALTERNATE" => b.alternate = true,
            "START" => {
                b.start_line = Some(parse_line_directive(rest, line_no, "START")?);
            }
            "CORRAL" => {
                b.corral_line = Some(parse_line_directive(rest, line_no, "CORRAL")?);
            }
            "FINISH" => {
                b.finish_line = Some(parse_line_directive(rest, line_no, "FINISH")?);
            }
            "BEGIN" => {
                b.start_ms = Some(parse_begin(rest, line_no)?);
                b.date = extract_date(rest, line_no)?;
            }
            "CUTOFF" => {
                let (pace, cutoff) = parse_cutoff(rest, line_no)?;
                b.pace_kmh = pace.or(b.pace_kmh);
                b.cutoff_ms = cutoff.or(b.cutoff_ms);
            }
            "CAT" => {
                b.raw_groups.push(parse_cat(rest, line_no)?);
            }
            _ => { /* unknown keyword: silently skipped */ }
        }
    }

    let start_ms = b.start_ms.ok_or(ConfigError::MissingStart)?;
    let (start_name, start_forward) = b
        .start_line
        .ok_or_else(|| syntax(0, "START", "no START line configured"))?;
    let (finish_name, finish_forward) = b
        .finish_line
        .ok_or_else(|| syntax(0, "FINISH", "no FINISH line configured"))?;

    let groups: Vec<GroupSpec> = b
        .raw_groups
        .into_iter()
        .map(|g| GroupSpec {
            start_ms: match g.delay_ms {
                Some(delay) => start_ms + delay,
                None => start_ms,
            },
            name: g.name,
            distance_m: g.distance_m,
            lead_rider_id: g.lead_rider_id,
            delay_ms: g.delay_ms,
        })
        .collect();

    let finish_ms = if let Some(cutoff) = b.cutoff_ms {
        start_ms + cutoff
    } else if let Some(pace) = b.pace_kmh {
        let longest_m = groups
            .iter()
            .map(|g| g.distance_m)
            .fold(0.0_f64, f64::max);
        let hours = (longest_m / 1000.0) / pace;
        start_ms + (hours * 3_600_000.0).round() as i64
    } else {
        start_ms + DEFAULT_CUTOFF_MS
    };

    Ok(RaceConfig {
        id: b.id,
        name: b.name,
        date: b.date,
        start_ms,
        finish_ms,
        start_line: start_name,
        start_forward,
        corral_line: b.corral_line.as_ref().map(|(n, _)| n.clone()),
        corral_forward: b.corral_line.map(|(_, f)| f),
        finish_line: finish_name,
        finish_forward,
        alternate: b.alternate,
        pace_kmh: b.pace_kmh,
        cutoff_ms: b.cutoff_ms,
        groups,
    })
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn split_keyword(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(idx) => (&line[..idx], line[idx..].trim_start()),
        None => (line, ""),
    }
}

/// Parses `dir { line name with spaces }` into `(name, forward)`.
fn parse_line_directive(
    rest: &str,
    line_no: usize,
    keyword: &str,
) -> Result<(String, bool), ConfigError> {
    let rest = rest.trim();
    let space = rest
        .find(char::is_whitespace)
        .ok_or_else(|| syntax(line_no, keyword, "expected `<dir> { name }`"))?;
    let dir = &rest[..space];
    let forward = match dir {
        "fwd" => true,
        "rev" => false,
        other => return Err(syntax(line_no, keyword, format!("unknown direction `{other}`"))),
    };
    let brace_body = extract_braces(&rest[space..], line_no, keyword)?;
    Ok((brace_body, forward))
}

fn extract_braces(text: &str, line_no: usize, keyword: &str) -> Result<String, ConfigError> {
    let open = text
        .find('{')
        .ok_or_else(|| syntax(line_no, keyword, "expected `{ ... }`"))?;
    let close = text
        .rfind('}')
        .ok_or_else(|| syntax(line_no, keyword, "unterminated `{ ... }`"))?;
    if close <= open {
        return Err(syntax(line_no, keyword, "unterminated `{ ... }`"));
    }
    Ok(text[open + 1..close].trim().to_owned())
}

fn parse_kv_pairs(rest: &str) -> Vec<(String, String)> {
    rest.split_whitespace()
        .filter_map(|tok| tok.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

fn parse_begin(rest: &str, line_no: usize) -> Result<i64, ConfigError> {
    let kv = parse_kv_pairs(rest);
    let time_str = kv
        .iter()
        .find(|(k, _)| k == "time")
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| syntax(line_no, "BEGIN", "missing `time=HH:MM`"))?;
    let time = NaiveTime::parse_from_str(time_str, "%H:%M")
        .map_err(|e| syntax(line_no, "BEGIN", format!("invalid time: {e}")))?;

    let date = match kv.iter().find(|(k, _)| k == "date") {
        Some((_, v)) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
            .map_err(|e| syntax(line_no, "BEGIN", format!("invalid date: {e}")))?,
        None => Local::now().date_naive(),
    };

    let zone = kv
        .iter()
        .find(|(k, _)| k == "zone")
        .map(|(_, v)| v.as_str())
        .unwrap_or("local");

    let naive = date.and_time(time);
    let utc: DateTime<Utc> = match zone {
        "local" => Local
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| syntax(line_no, "BEGIN", "ambiguous local time"))?
            .with_timezone(&Utc),
        "zulu" => DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc),
        offset_str => {
            let offset = parse_fixed_offset(offset_str)
                .ok_or_else(|| syntax(line_no, "BEGIN", format!("invalid zone `{offset_str}`")))?;
            offset
                .from_local_datetime(&naive)
                .single()
                .ok_or_else(|| syntax(line_no, "BEGIN", "ambiguous offset time"))?
                .with_timezone(&Utc)
        }
    };
    Ok(utc.timestamp_millis())
}

fn extract_date(rest: &str, _line_no: usize) -> Result<Option<NaiveDate>, ConfigError> {
    let kv = parse_kv_pairs(rest);
    Ok(match kv.iter().find(|(k, _)| k == "date") {
        Some((_, v)) => NaiveDate::parse_from_str(v, "%Y-%m-%d").ok(),
        None => Some(Local::now().date_naive()),
    })
}

/// Parses `±HH[:MM]` into a fixed UTC offset.
fn parse_fixed_offset(s: &str) -> Option<FixedOffset> {
    let (sign, body) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (h, m) = match body.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (body.parse::<i32>().ok()?, 0),
    };
    let secs = sign * (h * 3600 + m * 60);
    FixedOffset::east_opt(secs)
}

fn parse_cutoff(rest: &str, line_no: usize) -> Result<(Option<f64>, Option<i64>), ConfigError> {
    let kv = parse_kv_pairs(rest);
    if let Some((_, v)) = kv.iter().find(|(k, _)| k == "pace") {
        let pace: f64 = v
            .parse()
            .map_err(|_| syntax(line_no, "CUTOFF", format!("invalid pace `{v}`")))?;
        return Ok((Some(pace), None));
    }
    if let Some((_, v)) = kv.iter().find(|(k, _)| k == "time") {
        let ms = parse_mmss_or_minutes(v)
            .ok_or_else(|| syntax(line_no, "CUTOFF", format!("invalid time `{v}`")))?;
        return Ok((None, Some(ms)));
    }
    Err(syntax(line_no, "CUTOFF", "expected `pace=` or `time=`"))
}

/// Parses `MM:SS` or a bare number of minutes into milliseconds.
fn parse_mmss_or_minutes(s: &str) -> Option<i64> {
    if let Some((m, sec)) = s.split_once(':') {
        let m: i64 = m.parse().ok()?;
        let sec: i64 = sec.parse().ok()?;
        Some((m * 60 + sec) * 1000)
    } else {
        let minutes: f64 = s.parse().ok()?;
        Some((minutes * 60_000.0).round() as i64)
    }
}

const MILES_TO_KM: f64 = 1.60934;

fn parse_cat(rest: &str, line_no: usize) -> Result<RawGroup, ConfigError> {
    let rest = rest.trim();
    let space = rest
        .find(char::is_whitespace)
        .ok_or_else(|| syntax(line_no, "CAT", "expected `<name> { ... } <unit> <distance>`"))?;
    let name = rest[..space].to_owned();
    let after_name = rest[space..].trim_start();

    let open = after_name
        .find('{')
        .ok_or_else(|| syntax(line_no, "CAT", "expected `{ ... }`"))?;
    let close = after_name
        .find('}')
        .ok_or_else(|| syntax(line_no, "CAT", "unterminated `{ ... }`"))?;
    let attrs = &after_name[open + 1..close];
    let kv = parse_kv_pairs(attrs);

    let lead_rider_id = kv
        .iter()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.parse::<u64>())
        .transpose()
        .map_err(|_| syntax(line_no, "CAT", "invalid `id=`"))?;
    let delay_ms = kv
        .iter()
        .find(|(k, _)| k == "delay")
        .map(|(_, v)| {
            parse_mmss_or_minutes(v)
                .or_else(|| v.parse::<i64>().ok().map(|secs| secs * 1000))
                .ok_or_else(|| syntax(line_no, "CAT", format!("invalid `delay=` `{v}`")))
        })
        .transpose()?;
    if lead_rider_id.is_some() && delay_ms.is_some() {
        return Err(syntax(
            line_no,
            "CAT",
            "only one of `id=` or `delay=` may be set",
        ));
    }

    let tail = after_name[close + 1..].trim();
    let mut tail_tokens = tail.split_whitespace();
    let unit = tail_tokens
        .next()
        .ok_or_else(|| syntax(line_no, "CAT", "expected `<km|mi> <distance>`"))?;
    let distance_str = tail_tokens
        .next()
        .ok_or_else(|| syntax(line_no, "CAT", "expected a distance value"))?;
    let distance: f64 = distance_str
        .parse()
        .map_err(|_| syntax(line_no, "CAT", format!("invalid distance `{distance_str}`")))?;

    let distance_m = match unit {
        "km" => distance * 1000.0,
        "mi" => distance * MILES_TO_KM * 1000.0,
        other => return Err(syntax(line_no, "CAT", format!("unknown unit `{other}`"))),
    };

    Ok(RawGroup {
        name,
        distance_m,
        lead_rider_id,
        delay_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = "\
ID myrace
NAME Club TT
BEGIN time=10:00 date=2026-07-26 zone=zulu
START fwd { Start A }
FINISH fwd { Finish }
CAT all { } km 40
";

    #[test]
    fn parses_basic_config() {
        let cfg = parse(BASIC).unwrap();
        assert_eq!(cfg.id.as_deref(), Some("myrace"));
        assert_eq!(cfg.name.as_deref(), Some("Club TT"));
        assert_eq!(cfg.start_line, "Start A");
        assert!(cfg.start_forward);
        assert_eq!(cfg.finish_line, "Finish");
        assert_eq!(cfg.groups.len(), 1);
        assert_eq!(cfg.groups[0].distance_m, 40_000.0);
        // 2026-07-26T10:00:00Z
        let expected = chrono::Utc
            .with_ymd_and_hms(2026, 7, 26, 10, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(cfg.start_ms, expected);
        // default cutoff: 2 hours
        assert_eq!(cfg.finish_ms - cfg.start_ms, 2 * 3_600_000);
    }

    #[test]
    fn miles_are_converted_to_meters() {
        let src = format!("{BASIC}CAT mi_group {{ }} mi 25\n");
        let cfg = parse(&src).unwrap();
        let mi_group = cfg.groups.iter().find(|g| g.name == "mi_group").unwrap();
        assert!((mi_group.distance_m - 25.0 * 1.60934 * 1000.0).abs() < 1e-6);
    }

    #[test]
    fn unknown_keyword_is_silently_skipped() {
        let src = format!("{BASIC}BOGUS whatever\n");
        assert!(parse(&src).is_ok());
    }

    #[test]
    fn cutoff_time_wins_over_pace() {
        let src = format!("{BASIC}CUTOFF pace=30\nCUTOFF time=45:00\n");
        let cfg = parse(&src).unwrap();
        assert_eq!(cfg.finish_ms - cfg.start_ms, 45 * 60 * 1000);
    }

    #[test]
    fn pace_applies_to_longest_group_distance() {
        let src = format!("{BASIC}CAT longer {{ }} km 80\nCUTOFF pace=40\n");
        let cfg = parse(&src).unwrap();
        // 80km at 40kmh = 2h = 7_200_000ms
        assert_eq!(cfg.finish_ms - cfg.start_ms, 7_200_000);
    }

    #[test]
    fn delay_group_start_is_offset_from_race_start() {
        let src = format!("{BASIC}CAT late {{ delay=5:00 }} km 40\n");
        let cfg = parse(&src).unwrap();
        let late = cfg.groups.iter().find(|g| g.name == "late").unwrap();
        assert_eq!(late.start_ms - cfg.start_ms, 5 * 60 * 1000);
    }

    #[test]
    fn lead_and_delay_together_is_a_syntax_error() {
        let src = format!("{BASIC}CAT bad {{ id=123 delay=60 }} km 40\n");
        assert!(parse(&src).is_err());
    }

    #[test]
    fn alternate_flag_is_recognized() {
        let src = format!("{BASIC}ALTERNATE\n");
        let cfg = parse(&src).unwrap();
        assert!(cfg.alternate);
    }

    #[test]
    fn missing_begin_is_an_error() {
        let src = "ID myrace\nSTART fwd { A }\nFINISH fwd { B }\n";
        assert!(matches!(parse(src), Err(ConfigError::MissingStart)));
    }
}
