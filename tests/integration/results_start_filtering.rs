//! Parses a race config with `zlog-config` and feeds a rider's raw
//! position history through `zlog-results`, exercising the
//! config-to-results pipeline a `results` binary run would drive end to
//! end: a start-line crossing inside the window is kept, a crossing after
//! the window is treated as no start at all and the rider is dropped.

use zlog_results::{process_rider, CourseLines, DropReason, RiderInput};

const CONFIG: &str = "\
ID myrace
NAME Club TT
BEGIN time=10:00 date=2026-07-26 zone=zulu
START fwd { Start A }
FINISH fwd { Finish }
CAT all { } km 40
";

fn pos(time_ms: i64, line_id: Option<u32>, forward: bool, meters: i64) -> zlog_protocol::PositionRecord {
    zlog_protocol::PositionRecord {
        time_ms,
        rider_id: 1,
        line_id,
        forward,
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

fn rider(positions: Vec<zlog_protocol::PositionRecord>) -> RiderInput {
    RiderInput {
        id: 1,
        fname: "Jane".into(),
        lname: "Doe".into(),
        cat: Some('A'),
        weight_g: 70_000,
        height_mm: 1_750,
        male: false,
        power_type: 1,
        positions,
    }
}

#[test]
fn start_crossing_within_window_is_kept() {
    let config = zlog_config::parse(CONFIG).unwrap();
    let lines = CourseLines::from_config(&config, 1, None, 2);

    let positions = vec![
        pos(config.start_ms + 60_000, Some(1), true, 0), // 60s into the 120s window
        pos(config.start_ms + 600_000, None, true, 1_100),
    ];

    let result = process_rider(&config, &lines, rider(positions));
    assert!(result.is_ok());
}

#[test]
fn start_crossing_after_window_drops_the_rider() {
    let config = zlog_config::parse(CONFIG).unwrap();
    let lines = CourseLines::from_config(&config, 1, None, 2);

    let positions = vec![
        pos(config.start_ms + 180_000, Some(1), true, 0), // past the 120s window
        pos(config.start_ms + 600_000, None, true, 1_100),
    ];

    let result = process_rider(&config, &lines, rider(positions));
    assert_eq!(result.unwrap_err(), DropReason::NoStartCrossing);
}
