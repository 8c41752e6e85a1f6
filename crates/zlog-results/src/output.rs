//! Text and JSON rendering of a completed results run ("Output
//! variants"). HTML and SQL-template rendering are delegated to
//! `zlog-template`, which is driven by the [`JsonRace`] shape produced here.

use crate::{group_by_category, place_category, Rider};
use serde::Serialize;
use zlog_config::RaceConfig;

/// One category's finishers, placed in order.
#[derive(Debug, Clone, Serialize)]
pub struct JsonResult {
    pub position: usize,
    pub rider_id: u64,
    pub rider_name: String,
    pub finish: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonGroup {
    pub name: String,
    pub results: Vec<JsonResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRace {
    pub race: Option<String>,
    pub date: Option<String>,
    pub group: Vec<JsonGroup>,
}

fn rider_name(r: &Rider) -> String {
    format!("{} {}", r.fname, r.lname)
}

/// Builds the category sections shared by the text and JSON renderers: for
/// each distinct category letter seen among finishers (riders with neither
/// `dq` nor `dnf`), a placement-ordered roster.
fn finisher_sections(riders: &[Rider]) -> Vec<(char, Vec<crate::Placement>)> {
    let by_cat = group_by_category(riders);
    let mut cats: Vec<char> = by_cat.keys().copied().collect();
    cats.sort_unstable();

    cats.into_iter()
        .map(|cat| {
            let finishers: Vec<&Rider> = by_cat[&cat]
                .iter()
                .filter(|r| !r.dq && !r.dnf)
                .copied()
                .collect();
            (cat, place_category(finishers))
        })
        .collect()
}

/// Riders not in the normal placement (DQ or DNF), sorted by the maximum
/// distance they reached, descending, excluding zero-distance entries.
fn dq_dnf_section(riders: &[Rider]) -> Vec<&Rider> {
    let mut out: Vec<&Rider> = riders.iter().filter(|r| (r.dq || r.dnf) && r.distance > 0).collect();
    out.sort_by(|a, b| b.distance.cmp(&a.distance));
    out
}

fn format_clock(ms: i64, tz_offset_minutes: i32) -> String {
    let local_ms = ms + i64::from(tz_offset_minutes) * 60_000;
    let secs_since_midnight = ((local_ms % 86_400_000) + 86_400_000) % 86_400_000 / 1000;
    let h = secs_since_midnight / 3600;
    let m = (secs_since_midnight % 3600) / 60;
    format!("{h:02}:{m:02}")
}

/// Renders the header block plus one section per category and a combined
/// DQ/DNF section.
pub fn render_text(config: &RaceConfig, riders: &[Rider], tz_offset_minutes: i32) -> String {
    let mut out = String::new();
    if let Some(date) = config.date {
        out.push_str(&format!("Date: {date}\n"));
    }
    if let Some(id) = &config.id {
        out.push_str(&format!("Race: {id}\n"));
    }
    out.push_str(&format!(
        "Start: {}  Cutoff: {}  (UTC{:+03}:{:02})\n",
        format_clock(config.start_ms, tz_offset_minutes),
        format_clock(config.finish_ms, tz_offset_minutes),
        tz_offset_minutes / 60,
        (tz_offset_minutes.abs()) % 60,
    ));

    let by_cat = group_by_category(riders);
    for (cat, placements) in finisher_sections(riders) {
        out.push_str(&format!("\n--- Category {cat} ---\n"));
        let roster = &by_cat[&cat];
        for p in &placements {
            let r = roster.iter().find(|r| r.id == p.rider_id).expect("placed rider in roster");
            out.push_str(&format!(
                "{:>3}  {:<24} {}\n",
                p.position,
                rider_name(r),
                p.display_time
            ));
        }
    }

    let dq_dnf = dq_dnf_section(riders);
    if !dq_dnf.is_empty() {
        out.push_str("\n--- DQ / DNF ---\n");
        for r in dq_dnf {
            let reason = r.dq_reason.as_deref().unwrap_or("DNF");
            out.push_str(&format!(
                "     {:<24} {reason} ({} m)\n",
                rider_name(r),
                r.distance
            ));
        }
    }

    out
}

/// Renders `{ race, date, group: [ { name, results: [...] } ] }` (spec
/// §4.7 "Output variants", JSON).
pub fn render_json(config: &RaceConfig, riders: &[Rider]) -> JsonRace {
    let by_cat = group_by_category(riders);
    JsonRace {
        race: config.name.clone().or_else(|| config.id.clone()),
        date: config.date.map(|d| d.to_string()),
        group: finisher_sections(riders)
            .into_iter()
            .map(|(cat, placements)| {
                let roster = &by_cat[&cat];
                JsonGroup {
                    name: cat.to_string(),
                    results: placements
                        .into_iter()
                        .map(|p| {
                            let r = roster.iter().find(|r| r.id == p.rider_id).expect("placed rider in roster");
                            JsonResult {
                                position: p.position,
                                rider_id: p.rider_id,
                                rider_name: rider_name(r),
                                finish: p.display_time,
                            }
                        })
                        .collect(),
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{process_rider, CourseLines, RiderInput};
    use zlog_config::GroupSpec;
    use zlog_protocol::PositionRecord;

    fn pos(time_ms: i64, line_id: Option<u32>, forward: bool, meters: i64, mwh: i64) -> PositionRecord {
        PositionRecord {
            time_ms,
            rider_id: 1,
            line_id,
            forward,
            meters,
            mwh,
            duration_ms: time_ms,
            elevation: 0,
            speed_mph_thousandths: 0,
            hr: 0,
            monitor_id: 1,
            lpup: 0,
            pup: String::new(),
            cadence: 0,
            group_id: 0,
        }
    }

    fn config() -> RaceConfig {
        RaceConfig {
            id: Some("myrace".into()),
            name: Some("Club TT".into()),
            date: None,
            start_ms: 0,
            finish_ms: 7_200_000,
            start_line: "Start".into(),
            start_forward: true,
            corral_line: None,
            corral_forward: None,
            finish_line: "Finish".into(),
            finish_forward: true,
            alternate: false,
            pace_kmh: None,
            cutoff_ms: None,
            groups: vec![GroupSpec {
                name: "all".into(),
                distance_m: 1_000.0,
                lead_rider_id: None,
                delay_ms: None,
                start_ms: 0,
            }],
        }
    }

    fn rider(id: u64, finish_ms: i64) -> Rider {
        let lines = CourseLines {
            start: 1,
            start_forward: true,
            corral: None,
            finish: 2,
            finish_forward: true,
            alternate: false,
        };
        let lname = format!("Rider{id} (A)");
        let cat = crate::infer_category(&lname, None, false);
        let input = RiderInput {
            id,
            fname: "A".into(),
            lname,
            cat: Some(cat),
            weight_g: 70_000,
            height_mm: 1_800,
            male: true,
            power_type: 0,
            positions: vec![pos(0, Some(1), true, 0, 0), pos(finish_ms, None, true, 1_100, 10_000)],
        };
        process_rider(&config(), &lines, input).unwrap()
    }

    #[test]
    fn text_output_places_finishers_under_their_inferred_category() {
        let riders = vec![rider(1, 60_000), rider(2, 65_000)];
        let text = render_text(&config(), &riders, 0);
        assert!(text.contains("Category A"));
        assert!(text.contains("Rider1"));
        assert!(text.contains("Rider2"));
    }

    #[test]
    fn json_output_carries_placement_order() {
        let riders = vec![rider(1, 60_000), rider(2, 65_000)];
        let json = render_json(&config(), &riders);
        assert_eq!(json.group.len(), 1);
        assert_eq!(json.group[0].results[0].position, 1);
        assert_eq!(json.group[0].results[0].rider_id, 1);
    }

    #[test]
    fn dq_and_dnf_riders_are_excluded_from_category_sections() {
        let mut r = rider(3, 60_000);
        r.dq = true;
        r.dq_reason = Some("WRONG COURSE".into());
        let json = render_json(&config(), std::slice::from_ref(&r));
        assert!(json.group.is_empty());
        let text = render_text(&config(), std::slice::from_ref(&r), 0);
        assert!(text.contains("WRONG COURSE"));
    }
}
