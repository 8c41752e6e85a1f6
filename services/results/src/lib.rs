//! Runs the race-results pipeline against a loaded position history and
//! produces text/JSON output; HTML/SQL-template output is
//! delegated to `zlog-template`.

use std::collections::HashMap;
use tracing::warn;
use zlog_config::RaceConfig;
use zlog_protocol::PositionRecord;
use zlog_results::{
    find_start_position, infer_category, process_rider, CourseLines, DropReason, Rider, RiderInput,
};

/// A loaded rider profile, whatever its source (database row or a
/// synthesized default for riders with no `riders` table entry).
#[derive(Debug, Clone)]
pub struct ProfileInput {
    pub rider_id: u64,
    pub fname: String,
    pub lname: String,
    pub cat: Option<char>,
    pub weight_g: i32,
    pub height_mm: i32,
    pub male: bool,
    pub power_type: u8,
}

impl ProfileInput {
    /// A placeholder profile for a rider seen in the position stream but
    /// absent from the `riders` table; category falls back entirely to the
    /// surname regex, which yields `X` for a blank name.
    pub fn unknown(rider_id: u64) -> Self {
        ProfileInput {
            rider_id,
            fname: String::new(),
            lname: String::new(),
            cat: None,
            weight_g: 0,
            height_mm: 0,
            male: true,
            power_type: 0,
        }
    }
}

/// Canonical line ids resolved ahead of time against the chalkline
/// registry, in the shape `process_all` needs.
pub struct ResolvedLines {
    pub start: u32,
    pub corral: Option<u32>,
    pub finish: u32,
}

/// Runs the full per-rider pipeline over a grouped position history,
/// returning the successfully processed riders. Riders with no in-window
/// start crossing are dropped silently.
pub fn process_all(
    config: &RaceConfig,
    lines: &ResolvedLines,
    positions_by_rider: HashMap<u64, Vec<PositionRecord>>,
    profiles_by_rider: &HashMap<u64, ProfileInput>,
    no_cat: bool,
) -> Vec<Rider> {
    let course = CourseLines::from_config(config, lines.start, lines.corral, lines.finish);
    let config = resolve_group_starts(config, &course, &positions_by_rider);

    let mut riders = Vec::new();
    for (rider_id, positions) in positions_by_rider {
        let profile = profiles_by_rider
            .get(&rider_id)
            .cloned()
            .unwrap_or_else(|| ProfileInput::unknown(rider_id));

        let cat = infer_category(&profile.lname, profile.cat, no_cat);
        let input = RiderInput {
            id: rider_id,
            fname: profile.fname,
            lname: profile.lname,
            cat: Some(cat),
            weight_g: profile.weight_g,
            height_mm: profile.height_mm,
            male: profile.male,
            power_type: profile.power_type,
            positions,
        };

        match process_rider(&config, &course, input) {
            Ok(rider) => riders.push(rider),
            Err(DropReason::NoStartCrossing) => {
                warn!(rider_id, "no in-window start crossing, dropping rider");
            }
        }
    }
    riders
}

/// Overrides each group's delay-based `start_ms` with its lead rider's
/// own trimmed start-crossing time, for groups naming a lead rider present
/// in the field. Groups with no lead rider, or one that never crosses the
/// start line in the window, keep the delay-based start the config parser
/// already computed.
fn resolve_group_starts(
    config: &RaceConfig,
    course: &CourseLines,
    positions_by_rider: &HashMap<u64, Vec<PositionRecord>>,
) -> RaceConfig {
    let mut resolved = config.clone();
    for group in &mut resolved.groups {
        let Some(lead_id) = group.lead_rider_id else { continue };
        let Some(lead_positions) = positions_by_rider.get(&lead_id) else { continue };
        if let Some(start) = find_start_position(config, course, lead_positions) {
            group.start_ms = start.time_ms;
        }
    }
    resolved
}

/// Groups a flat range-query result into per-rider trajectories.
pub fn group_by_rider(rows: Vec<(u64, PositionRecord)>) -> HashMap<u64, Vec<PositionRecord>> {
    let mut map: HashMap<u64, Vec<PositionRecord>> = HashMap::new();
    for (rider_id, pos) in rows {
        map.entry(rider_id).or_default().push(pos);
    }
    map
}

/// CLI surface and run loop, shared between this crate's own binary and
/// the root `zlogger` dispatcher.
pub mod cli {
    use super::{group_by_rider, process_all, ProfileInput, ResolvedLines};
    use clap::ValueEnum;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tracing::info;
    use zlog_results::output::{render_json, render_text};

    const START_LOOKBACK_MS: i64 = 2 * 60 * 1000;

    #[derive(Copy, Clone, Debug, ValueEnum)]
    pub enum OutputFormat {
        Text,
        Json,
        Html,
        Sql,
    }

    /// Runs the race-results engine against a race config and the position
    /// store, producing text/JSON/HTML/SQL-template output.
    #[derive(clap::Args, Debug)]
    pub struct Args {
        /// Path to the race-configuration file.
        #[arg(long)]
        pub config: PathBuf,

        /// Postgres connection string.
        #[arg(long, short = 'D', env = "DATABASE_URL")]
        pub database_url: String,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        pub format: OutputFormat,

        /// Field-mapping document path, required for `--format html|sql`.
        #[arg(long)]
        pub template: Option<PathBuf>,

        /// Collapse every rider into category `X`.
        #[arg(long)]
        pub no_cat: bool,

        /// Minutes east of UTC to render clock times in (text output header).
        #[arg(long, default_value_t = 0)]
        pub tz_offset_minutes: i32,

        #[arg(long, short = 'v', action = clap::ArgAction::Count)]
        pub verbose: u8,
    }

    pub async fn run(args: Args) -> anyhow::Result<()> {
        let source = std::fs::read_to_string(&args.config)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", args.config.display()))?;
        let config = zlog_config::parse(&source)?;

        let pool = zlog_store::connect(&args.database_url).await?;
        let store = zlog_store::PositionStore::new(&pool);

        let start = store
            .find_line_by_name(&config.start_line)
            .await?
            .ok_or_else(|| anyhow::anyhow!("start line `{}` not found in chalkline registry", config.start_line))?;
        let finish = store
            .find_line_by_name(&config.finish_line)
            .await?
            .ok_or_else(|| anyhow::anyhow!("finish line `{}` not found in chalkline registry", config.finish_line))?;
        let corral = match &config.corral_line {
            Some(name) => store.find_line_by_name(name).await?.map(|c| c.canonical_id),
            None => None,
        };
        let lines = ResolvedLines {
            start: start.canonical_id,
            corral,
            finish: finish.canonical_id,
        };

        info!(start = config.start_ms, finish = config.finish_ms, "loading position history");
        let rows = store
            .positions_in_range(config.start_ms - START_LOOKBACK_MS, config.finish_ms)
            .await?;
        let positions_by_rider = group_by_rider(rows);

        let mut profiles: HashMap<u64, ProfileInput> = HashMap::new();
        for &rider_id in positions_by_rider.keys() {
            if let Some(p) = store.rider_profile(rider_id).await? {
                profiles.insert(
                    rider_id,
                    ProfileInput {
                        rider_id: p.rider_id,
                        fname: p.fname,
                        lname: p.lname,
                        cat: p.cat,
                        weight_g: p.weight_g,
                        height_mm: p.height_mm,
                        male: p.male,
                        power_type: p.power_type,
                    },
                );
            }
        }

        let riders = process_all(&config, &lines, positions_by_rider, &profiles, args.no_cat);
        info!(count = riders.len(), "processed riders");

        match args.format {
            OutputFormat::Text => {
                print!("{}", render_text(&config, &riders, args.tz_offset_minutes));
            }
            OutputFormat::Json => {
                let json = render_json(&config, &riders);
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
            OutputFormat::Html => {
                let template = load_template(&args)?;
                let categories = json_categories(&config, &riders);
                println!("{}", zlog_template::render_html(&template, &categories)?);
            }
            OutputFormat::Sql => {
                let template = load_template(&args)?;
                let table = template
                    .table
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("template has no `table` for SQL output"))?;
                let rows: Vec<serde_json::Value> = json_categories(&config, &riders)
                    .into_iter()
                    .flat_map(|(_, rows)| rows)
                    .collect();
                println!("{}", zlog_template::build_create_table(&table, &template.fields));
                let mut qb = zlog_template::build_insert(&table, &template.fields, &rows)?;
                println!("{}", qb.build().sql());
            }
        }

        Ok(())
    }

    fn load_template(args: &Args) -> anyhow::Result<zlog_template::TemplateSpec> {
        let path = args
            .template
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--template is required for --format html|sql"))?;
        let body = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&body)?)
    }

    fn json_categories(
        config: &zlog_config::RaceConfig,
        riders: &[zlog_results::Rider],
    ) -> Vec<(String, Vec<serde_json::Value>)> {
        let race_json = render_json(config, riders);
        race_json
            .group
            .into_iter()
            .map(|g| {
                let rows = g
                    .results
                    .into_iter()
                    .map(|r| serde_json::to_value(r).unwrap_or_default())
                    .collect();
                (g.name, rows)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zlog_config::GroupSpec;

    fn pos(time_ms: i64, rider_id: u64, line_id: Option<u32>, meters: i64) -> PositionRecord {
        PositionRecord {
            time_ms,
            rider_id,
            line_id,
            forward: true,
            meters,
            mwh: meters * 10,
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
            id: Some("r".into()),
            name: None,
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

    #[test]
    fn groups_flat_rows_by_rider() {
        let rows = vec![(1, pos(0, 1, Some(1), 0)), (2, pos(0, 2, Some(1), 0)), (1, pos(1000, 1, None, 500))];
        let grouped = group_by_rider(rows);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&1].len(), 2);
    }

    #[test]
    fn process_all_drops_riders_with_no_start_crossing_and_keeps_the_rest() {
        let mut rows = HashMap::new();
        rows.insert(1, vec![pos(0, 1, Some(1), 0), pos(60_000, 1, None, 1_100)]);
        rows.insert(2, vec![pos(0, 2, Some(9), 0)]); // never crosses the real start line

        let lines = ResolvedLines { start: 1, corral: None, finish: 2 };
        let riders = process_all(&config(), &lines, rows, &HashMap::new(), false);
        assert_eq!(riders.len(), 1);
        assert_eq!(riders[0].id, 1);
    }

    #[test]
    fn lead_rider_group_start_overrides_delay_based_start() {
        let mut rows = HashMap::new();
        rows.insert(1, vec![pos(5_000, 1, Some(1), 0), pos(65_000, 1, None, 1_100)]);
        rows.insert(2, vec![pos(0, 2, Some(1), 0), pos(60_000, 2, None, 1_100)]);

        let mut cfg = config();
        cfg.groups[0].lead_rider_id = Some(1);

        let lines = ResolvedLines { start: 1, corral: None, finish: 2 };
        let riders = process_all(&cfg, &lines, rows, &HashMap::new(), false);

        let r2 = riders.iter().find(|r| r.id == 2).unwrap();
        assert_eq!(r2.finishes[0].group.start_ms, 5_000);
    }

    #[test]
    fn unknown_profile_falls_back_to_category_x() {
        let mut rows = HashMap::new();
        rows.insert(1, vec![pos(0, 1, Some(1), 0), pos(60_000, 1, None, 1_100)]);
        let lines = ResolvedLines { start: 1, corral: None, finish: 2 };
        let riders = process_all(&config(), &lines, rows, &HashMap::new(), false);
        assert_eq!(riders[0].cat, 'X');
    }
}
