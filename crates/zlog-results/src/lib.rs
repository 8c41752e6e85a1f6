//! The results pipeline: start filtering, course trimming,
//! crash trimming, candidate finish construction and selection, ride
//! summary, category inference and placement.
//!
//! Deliberately I/O-free: callers resolve canonical line ids and supply
//! already-loaded position trajectories, so this crate can be exercised
//! with plain in-memory fixtures.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use zlog_config::{GroupSpec, RaceConfig};
use zlog_protocol::PositionRecord;

pub mod output;

/// Canonical line ids resolved ahead of time by the caller (via the line
/// registry / store), since this crate has no registry dependency of its
/// own.
#[derive(Debug, Clone)]
pub struct CourseLines {
    pub start: u32,
    pub start_forward: bool,
    pub corral: Option<u32>,
    pub finish: u32,
    pub finish_forward: bool,
    pub alternate: bool,
}

impl CourseLines {
    pub fn from_config(config: &RaceConfig, start: u32, corral: Option<u32>, finish: u32) -> Self {
        CourseLines {
            start,
            start_forward: config.start_forward,
            corral,
            finish,
            finish_forward: config.finish_forward,
            alternate: config.alternate,
        }
    }
}

const START_WINDOW_MS: i64 = 120_000;
const CORRAL_LATE_START_THRESHOLD_MS: i64 = 20_000;
const CORRAL_MAX_PACE_KMH: f64 = 18.0;
const EARLY_START_THRESHOLD_MS: i64 = 30_000;
const GROUP_EARLY_START_GRACE_MS: i64 = 8_000;

const CATEGORY_LETTERS: &str = "ABCDW";

#[derive(Debug, Clone, Serialize)]
pub struct GroupFinish {
    pub group: GroupSpec,
    pub end_pos: Option<PositionRecord>,
    pub dq_time_ms: Option<i64>,
    pub dq_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RiderInput {
    pub id: u64,
    pub fname: String,
    pub lname: String,
    pub cat: Option<char>,
    pub weight_g: i32,
    pub height_mm: i32,
    pub male: bool,
    pub power_type: u8,
    pub positions: Vec<PositionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rider {
    pub id: u64,
    pub fname: String,
    pub lname: String,
    pub cat: char,
    pub weight_g: i32,
    pub height_mm: i32,
    pub male: bool,
    pub power_type: u8,
    pub positions: Vec<PositionRecord>,
    pub finishes: Vec<GroupFinish>,
    pub selected: Option<GroupFinish>,
    pub end: Option<PositionRecord>,
    pub end_time_ms: Option<i64>,
    pub dq_time_ms: Option<i64>,
    pub dq_reason: Option<String>,
    pub dnf: bool,
    pub dq: bool,
    pub distance: i64,
    pub mwh: i64,
    pub msec: i64,
    pub watts: i32,
    pub wkg: f32,
    pub ecat: char,
}

/// Why a rider produced no [`Rider`] at all -- distinct from a DNF/DQ,
/// which still produces a placed-or-unplaced `Rider`.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    NoStartCrossing,
}

fn set_dq(dq_time_ms: &mut Option<i64>, dq_reason: &mut Option<String>, time_ms: i64, reason: String) {
    if dq_reason.is_none() {
        *dq_time_ms = Some(time_ms);
        *dq_reason = Some(reason);
    }
}

fn format_mmss(total_ms: i64) -> String {
    let total_secs = total_ms / 1000;
    format!("{:02}:{:02}", total_secs / 60, total_secs % 60)
}

/// Index of the rider's trimmed first position: the last start-line
/// crossing within the start window, in the expected direction.
fn start_crossing_index(
    config: &RaceConfig,
    lines: &CourseLines,
    positions: &[PositionRecord],
) -> Option<usize> {
    let window_end = config.start_ms + START_WINDOW_MS;
    positions
        .iter()
        .enumerate()
        .take_while(|(_, p)| p.time_ms <= window_end)
        .filter(|(_, p)| p.line_id == Some(lines.start) && p.forward == lines.start_forward)
        .map(|(i, _)| i)
        .last()
}

/// Step 1 of the pipeline run in isolation: the rider's trimmed start
/// position, or `None` if they never cross the start line on time. Lets a
/// caller resolve a lead-rider group start before running the rest of the
/// pipeline for the field.
pub fn find_start_position(
    config: &RaceConfig,
    lines: &CourseLines,
    positions: &[PositionRecord],
) -> Option<PositionRecord> {
    let mut sorted = positions.to_vec();
    sorted.sort_by_key(|p| p.time_ms);
    let idx = start_crossing_index(config, lines, &sorted)?;
    sorted.into_iter().nth(idx)
}

/// Runs steps 1-6 of the pipeline for a single rider, producing a fully
/// scored `Rider` or a drop reason (step 1's "no start crossing").
pub fn process_rider(
    config: &RaceConfig,
    lines: &CourseLines,
    input: RiderInput,
) -> Result<Rider, DropReason> {
    let mut positions = input.positions;
    positions.sort_by_key(|p| p.time_ms);

    // --- 1. Start filtering ---
    let start_idx =
        start_crossing_index(config, lines, &positions).ok_or(DropReason::NoStartCrossing)?;

    positions.drain(..start_idx);
    let start = positions[0].clone();

    let mut dq_time_ms: Option<i64> = None;
    let mut dq_reason: Option<String> = None;

    let is_late_starter = start.time_ms - config.start_ms > CORRAL_LATE_START_THRESHOLD_MS;
    if let (Some(corral_id), false) = (lines.corral, is_late_starter) {
        let corral_pos = positions
            .iter()
            .take_while(|p| p.time_ms < start.time_ms)
            .filter(|p| p.line_id == Some(corral_id))
            .last();
        if let Some(corral) = corral_pos {
            let duration_h = (start.time_ms - corral.time_ms) as f64 / 3_600_000.0;
            if duration_h > 0.0 {
                let distance_km = (start.meters - corral.meters) as f64 / 1000.0;
                let pace_kmh = distance_km / duration_h;
                if pace_kmh > CORRAL_MAX_PACE_KMH {
                    set_dq(
                        &mut dq_time_ms,
                        &mut dq_reason,
                        start.time_ms,
                        format!("Corral: {pace_kmh:.0} km/h"),
                    );
                }
            }
        }
    }

    if config.start_ms - start.time_ms > EARLY_START_THRESHOLD_MS {
        set_dq(
            &mut dq_time_ms,
            &mut dq_reason,
            start.time_ms,
            format!("Early: -{}", format_mmss(config.start_ms - start.time_ms)),
        );
    }

    // --- 2. Course trimming ---
    let mut expected_forward = lines.finish_forward;
    let mut truncate_at: Option<usize> = None;
    for (i, pos) in positions.iter().enumerate().skip(1) {
        if pos.line_id != Some(lines.finish) {
            continue;
        }
        if pos.forward != expected_forward {
            set_dq(
                &mut dq_time_ms,
                &mut dq_reason,
                pos.time_ms,
                "WRONG COURSE".to_owned(),
            );
            truncate_at = Some(i + 1);
            break;
        }
        if lines.alternate {
            expected_forward = !expected_forward;
        }
    }
    if let Some(cut) = truncate_at {
        positions.truncate(cut);
    }

    // --- 3. Crash trimming ---
    let mut crash_at: Option<usize> = None;
    for i in 1..positions.len() {
        let prev = &positions[i - 1];
        let cur = &positions[i];
        if cur.meters < prev.meters || cur.mwh < prev.mwh || cur.duration_ms < prev.duration_ms {
            crash_at = Some(i);
            break;
        }
    }
    let mut distance_cap: Option<i64> = None;
    if let Some(cut) = crash_at {
        set_dq(
            &mut dq_time_ms,
            &mut dq_reason,
            positions[cut - 1].time_ms,
            "----CRASHED---".to_owned(),
        );
        distance_cap = Some(positions[..cut].iter().map(|p| p.meters).max().unwrap_or(0));
        positions.truncate(cut);
    }

    // --- 4. Candidate finish construction ---
    let finishes: Vec<GroupFinish> = config
        .groups
        .iter()
        .map(|group| {
            let end_pos = positions
                .iter()
                .find(|p| p.meters - start.meters >= group.distance_m.round() as i64)
                .cloned();

            let mut cand_dq_time = None;
            let mut cand_dq_reason = None;
            if end_pos.is_some() && group.start_ms - start.time_ms >= GROUP_EARLY_START_GRACE_MS {
                cand_dq_time = Some(start.time_ms);
                cand_dq_reason = Some(format!(
                    "Early: {}",
                    format_mmss(group.start_ms - start.time_ms)
                ));
            }
            GroupFinish {
                group: group.clone(),
                end_pos,
                dq_time_ms: cand_dq_time,
                dq_reason: cand_dq_reason,
            }
        })
        .collect();

    // --- 5. Finish selection ---
    let category_hint = input.cat;
    let weight_of = |f: &GroupFinish| -> f64 {
        let base = -((f.group.start_ms - start.time_ms).abs() as f64) / 1000.0;
        let finished_bonus = if f.end_pos.is_some() { 10.0 } else { 0.0 };
        let dq_penalty = if f.dq_reason.is_some() { 3.0 } else { 0.0 };
        base + finished_bonus - dq_penalty
    };

    let category_matches: Vec<&GroupFinish> = match category_hint {
        Some(c) => finishes
            .iter()
            .filter(|f| f.group.name.to_uppercase().contains(c))
            .collect(),
        None => Vec::new(),
    };
    let pool: Vec<&GroupFinish> = if category_matches.is_empty() {
        finishes.iter().collect()
    } else {
        category_matches
    };

    let selected = pool
        .into_iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            weight_of(a)
                .partial_cmp(&weight_of(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ib.cmp(ia))
        })
        .map(|(_, f)| f.clone());

    let (end, end_time_ms, mut dnf) = match &selected {
        Some(f) if f.end_pos.is_some() => {
            let end = f.end_pos.clone().unwrap();
            let end_time_ms = end.time_ms;
            (Some(end), Some(end_time_ms), false)
        }
        _ => {
            let last = positions.last().cloned();
            let last_time_ms = last.as_ref().map(|p| p.time_ms);
            (last, last_time_ms, true)
        }
    };

    let (final_dq_time, final_dq_reason) = match &selected {
        Some(f) if f.dq_reason.is_some() => (f.dq_time_ms, f.dq_reason.clone()),
        _ => (dq_time_ms, dq_reason),
    };
    let dq = match (final_dq_time, end_time_ms) {
        (Some(t), Some(et)) => t <= et,
        (Some(_), None) => true,
        _ => false,
    };
    if dq {
        dnf = false;
    }

    // --- 6. Ride summary ---
    let (msec, mwh, meters, watts, wkg) = match end {
        Some(end) => {
            let msec = end.time_ms - start.time_ms;
            let mwh = end.mwh - start.mwh;
            let meters = distance_cap.unwrap_or(end.meters - start.meters);
            if msec <= 0 || input.weight_g <= 0 {
                (msec.max(0), mwh, meters, 0, 0.0)
            } else {
                let watts = ((mwh * 3600) / msec) as i32;
                let wkg = ((watts as f32 * 1000.0 / input.weight_g as f32) * 100.0).round() / 100.0;
                (msec, mwh, meters, watts, wkg)
            }
        }
        None => (0, 0, distance_cap.unwrap_or(0), 0, 0.0),
    };

    let ecat = if wkg == 0.0 {
        'X'
    } else if !input.male {
        'W'
    } else if wkg > 4.0 {
        'A'
    } else if wkg > 3.2 {
        'B'
    } else if wkg > 2.5 {
        'C'
    } else {
        'D'
    };

    Ok(Rider {
        id: input.id,
        fname: input.fname,
        lname: input.lname,
        cat: input.cat.unwrap_or('X'),
        weight_g: input.weight_g,
        height_mm: input.height_mm,
        male: input.male,
        power_type: input.power_type,
        positions,
        finishes,
        selected,
        end,
        end_time_ms,
        dq_time_ms: final_dq_time,
        dq_reason: final_dq_reason,
        dnf,
        dq,
        distance: meters,
        mwh,
        msec,
        watts,
        wkg,
        ecat,
    })
}

/// Ordered sequence of surname-suffix patterns for category inference
/// category inference. First match wins; the captured letter must be one
/// of [`CATEGORY_LETTERS`].
fn category_patterns() -> Vec<Regex> {
    [
        r"\((?P<c>[A-Z])\)$",
        r" (?P<c>[A-Z])$",
        r"-(?P<c>[A-Z])$",
        r" (?P<c>[A-Z])\)$",
        r"-(?P<c>[A-Z])[ )]",
        r"\((?P<c>[A-Z])\)",
        r" (?P<c>[A-Z])\)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static category pattern"))
    .collect()
}

/// Infers a rider's category from their surname when the database has no
/// category on record. Under `no_cat`, every rider collapses to `'X'`.
pub fn infer_category(lname: &str, db_cat: Option<char>, no_cat: bool) -> char {
    if no_cat {
        return 'X';
    }
    if let Some(c) = db_cat {
        return c;
    }
    for pattern in category_patterns() {
        if let Some(caps) = pattern.captures(lname) {
            if let Some(m) = caps.name("c") {
                let letter = m.as_str().chars().next().unwrap_or('X');
                if CATEGORY_LETTERS.contains(letter) {
                    return letter;
                }
            }
        }
    }
    'X'
}

const SAME_TIME_THRESHOLD_MS: i64 = 200;

#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub position: usize,
    pub rider_id: u64,
    pub display_time: String,
}

/// Placement within a single category: sorts finishers by `end_time_ms`
/// ascending, assigns 1..N, and renders a `timepos` relative to the
/// winner's absolute finish time. The first finisher's own elapsed race
/// time is shown bare; subsequent finishers show `+` and the delta from
/// the winner's finish, unless they finished within 200 ms of the
/// *previous* finisher, in which case `--- ST ---` is shown instead.
pub fn place_category(mut finishers: Vec<&Rider>) -> Vec<Placement> {
    finishers.sort_by_key(|r| r.end_time_ms.unwrap_or(i64::MAX));
    let mut base_ms: i64 = 0;
    let mut prev_ms: i64 = 0;
    finishers
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            let display_time = match r.end_time_ms {
                None => "--:--".to_owned(),
                Some(end_ms) => {
                    let timepos = if i == 0 {
                        base_ms = end_ms;
                        let own_start = r.positions.first().map_or(end_ms, |p| p.time_ms);
                        format_timepos(end_ms - own_start, ' ')
                    } else if end_ms - prev_ms < SAME_TIME_THRESHOLD_MS {
                        "--- ST ---".to_owned()
                    } else {
                        format_timepos(end_ms - base_ms, '+')
                    };
                    prev_ms = end_ms;
                    timepos
                }
            };
            Placement {
                position: i + 1,
                rider_id: r.id,
                display_time,
            }
        })
        .collect()
}

/// Splits a millisecond duration into hour/minute/second/tenth-of-second
/// components, rounding up to the nearest tenth.
fn msec_time(ms: i64) -> (i64, i64, i64, i64) {
    let rounded = ((ms + 99) / 100) * 100;
    let hour = rounded / 3_600_000;
    let rem = rounded - hour * 3_600_000;
    let min = rem / 60_000;
    let rem = rem - min * 60_000;
    let sec = rem / 1_000;
    let tenth = (rem - sec * 1_000) / 100;
    (hour, min, sec, tenth)
}

/// Renders a `timepos` string the way the results-engine source does:
/// hour-scale times drop the `mark`/padding entirely, minute- and
/// second-scale times carry it, and an all-zero duration collapses to
/// `--- ST ---` (the caller otherwise only reaches this for i == 0).
fn format_timepos(delta_ms: i64, mark: char) -> String {
    let (h, m, s, t) = msec_time(delta_ms);
    if h != 0 {
        format!("{h}:{m:02}:{s:02}.{t}")
    } else if m != 0 {
        format!("{mark}  {m:2}:{s:02}.{t}")
    } else if s != 0 {
        format!("{mark}    :{s:02}.{t}")
    } else if t != 0 {
        format!("{mark}    :00.{t}")
    } else {
        "--- ST ---".to_owned()
    }
}

/// Groups processed riders by category letter, in insertion order of
/// first appearance.
pub fn group_by_category<'a>(riders: &'a [Rider]) -> HashMap<char, Vec<&'a Rider>> {
    let mut map: HashMap<char, Vec<&Rider>> = HashMap::new();
    for r in riders {
        map.entry(r.cat).or_default().push(r);
    }
    map
}
