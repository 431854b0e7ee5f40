//! Window arithmetic properties over a spread of timestamps and widths

use chrono::{DateTime, TimeDelta, Utc};
use kestrel_core::window::{alive_window_buckets, bucket_name, bucket_time, WindowPolicy};
use std::time::Duration;

fn timestamps() -> Vec<DateTime<Utc>> {
    let base = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
    (0..50)
        .map(|i| base + TimeDelta::milliseconds(i * 7_919_333))
        .chain([DateTime::from_timestamp(0, 0).unwrap(), DateTime::from_timestamp(-3601, 5).unwrap()])
        .collect()
}

fn widths() -> Vec<Duration> {
    vec![
        Duration::from_millis(250),
        Duration::from_secs(1),
        Duration::from_secs(60),
        Duration::from_secs(7 * 60),
        Duration::from_secs(3600),
        Duration::from_secs(86400),
    ]
}

#[test]
fn bucket_time_is_truncation() {
    for ts in timestamps() {
        for width in widths() {
            let start = bucket_time(&bucket_name(ts, width), width).unwrap();
            let w = TimeDelta::from_std(width).unwrap();
            assert!(start <= ts, "{ts} / {width:?}");
            assert!(ts < start + w, "{ts} / {width:?}");
            let nanos = start.timestamp_nanos_opt().unwrap();
            assert_eq!(nanos.rem_euclid(width.as_nanos() as i64), 0);
        }
    }
}

#[test]
fn alive_and_dead_windows_are_disjoint_and_contiguous() {
    let policy = WindowPolicy::new(Duration::from_secs(8 * 60));
    for now in timestamps() {
        for width in widths() {
            let staleness = width * 4;
            let alive = alive_window_buckets(now, staleness, width);
            let dead = policy.dead_window_buckets(now, staleness, width);

            assert_eq!(alive.len(), 4);
            assert!(!dead.is_empty());
            assert!(dead.iter().all(|d| !alive.contains(d)));

            let oldest_alive = bucket_time(alive.last().unwrap(), width).unwrap();
            let newest_dead = bucket_time(&dead[0], width).unwrap();
            assert_eq!(newest_dead + TimeDelta::from_std(width).unwrap(), oldest_alive);
        }
    }
}
