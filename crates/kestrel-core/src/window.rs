//! Bucket arithmetic for windowed features
//!
//! Windowed features accumulate into fixed-width time buckets. The bucket
//! width is the feature's freshness; a bucket is named by the base-34
//! encoding of `floor(unix_nanos / width_nanos)`.
//!
//! ```text
//!           dead buckets                 alive buckets
//!  ◄── DeadGracePeriod ──►◄──────────── staleness ────────────►
//! ┌────┬────┬────┬────┬────┬────┬────┬────┬────┬────┬────┬────┐
//! │ d3 │ d2 │ d1 │ d0 │ a5 │ a4 │ a3 │ a2 │ a1 │ a0 │    │    │
//! └────┴────┴────┴────┴────┴────┴────┴────┴────┴────┴────┴────┘
//!                                                 ▲ now
//! ```
//!
//! A bucket stays in the state for `staleness + DeadGracePeriod`, so the
//! historian has the grace period to drain it after it leaves the window.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const BASE34_ALPHABET: &[u8; 34] = b"0123456789abcdefghijklmnopqrstuvwx";

/// Default extra time a bucket is kept on top of the feature's staleness
pub const DEFAULT_DEAD_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Bucket-retention policy shared by the state, the engine and the historian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPolicy {
    #[serde(with = "duration_str")]
    pub dead_grace_period: Duration,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            dead_grace_period: DEFAULT_DEAD_GRACE_PERIOD,
        }
    }
}

impl WindowPolicy {
    pub fn new(dead_grace_period: Duration) -> Self {
        Self { dead_grace_period }
    }

    /// Total time a bucket lives in the state
    pub fn bucket_ttl(&self, staleness: Duration) -> Duration {
        staleness + self.dead_grace_period
    }

    /// The instant at which a bucket is removed from the state
    pub fn bucket_dead_time(&self, name: &str, width: Duration, staleness: Duration) -> Result<DateTime<Utc>> {
        Ok(bucket_time(name, width)? + to_delta(self.bucket_ttl(staleness)))
    }

    /// Bucket names immediately older than the alive window, covering the grace period
    pub fn dead_window_buckets(&self, now: DateTime<Utc>, staleness: Duration, width: Duration) -> Vec<String> {
        let alive = alive_window_buckets(now, staleness, width);
        let Some(oldest) = alive.last() else {
            return Vec::new();
        };
        let Ok(oldest_start) = bucket_time(oldest, width) else {
            return Vec::new();
        };
        let dead_time = oldest_start - TimeDelta::nanoseconds(1);

        (0..bucket_count(self.dead_grace_period, width))
            .map(|i| bucket_name(dead_time - to_delta(width * i), width))
            .collect()
    }

    /// Interval between historian drain cycles
    pub fn sync_period(&self) -> Duration {
        self.dead_grace_period.div_f64(2.5)
    }

    /// How long a drained dead bucket is remembered
    pub fn handled_ttl(&self) -> Duration {
        self.dead_grace_period + Duration::from_secs(60)
    }
}

/// Encodes a signed integer with the `0-9a-x` alphabet
pub fn encode_base34(n: i64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let negative = n < 0;
    let mut v = n.unsigned_abs();
    let mut digits = Vec::with_capacity(13);
    while v > 0 {
        digits.push(BASE34_ALPHABET[(v % 34) as usize]);
        v /= 34;
    }
    if negative {
        digits.push(b'-');
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Decodes a base-34 string, rejecting anything outside `-?[0-9a-x]+`
pub fn decode_base34(s: &str) -> Result<i64> {
    let invalid = || Error::internal(format!("invalid bucket name '{}'", s));
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() {
        return Err(invalid());
    }

    let mut acc: i64 = 0;
    for b in digits.bytes() {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'x' => b - b'a' + 10,
            _ => return Err(invalid()),
        };
        acc = acc
            .checked_mul(34)
            .and_then(|v| v.checked_add(i64::from(d)))
            .ok_or_else(invalid)?;
    }
    Ok(if negative { -acc } else { acc })
}

/// Name of the bucket of width `width` that contains `ts`
pub fn bucket_name(ts: DateTime<Utc>, width: Duration) -> String {
    let width = width_nanos(width);
    let nanos = ts.timestamp_nanos_opt().unwrap_or(i64::MAX);
    encode_base34(nanos.div_euclid(width))
}

/// Start instant of a named bucket
pub fn bucket_time(name: &str, width: Duration) -> Result<DateTime<Utc>> {
    let index = decode_base34(name)?;
    let nanos = index
        .checked_mul(width_nanos(width))
        .ok_or_else(|| Error::internal(format!("bucket '{}' is out of range", name)))?;
    Ok(DateTime::from_timestamp_nanos(nanos))
}

/// The buckets covering the last `staleness`, newest first
pub fn alive_window_buckets(now: DateTime<Utc>, staleness: Duration, width: Duration) -> Vec<String> {
    (0..bucket_count(staleness, width))
        .map(|i| bucket_name(now - to_delta(width * i), width))
        .collect()
}

/// 90% of the time left until the current bucket closes
pub fn time_till_next_bucket(now: DateTime<Utc>, width: Duration) -> Duration {
    let start = bucket_time(&bucket_name(now, width), width).unwrap_or(now);
    let end = start + to_delta(width);
    (end - now).to_std().unwrap_or_default().mul_f64(0.9)
}

/// Key layout `{fqn}/{bucket}:{entity_id}` shared by state keys and the dedup cache
pub fn bucket_key(fqn: &str, bucket: &str, entity_id: &str) -> String {
    format!("{}/{}:{}", fqn, bucket, entity_id)
}

/// Splits a bucket key at the first `/` and the first `:` after it
///
/// Bucket names are base-34 and never contain `:`, so the first colon after
/// the slash always ends the bucket. Splitting at the last colon instead
/// would cut entity ids such as `tenant:7`; for ids without a colon both
/// splits agree.
pub fn parse_bucket_key(key: &str) -> Option<(&str, &str, &str)> {
    let slash = key.find('/')?;
    let colon = slash + 1 + key[slash + 1..].find(':')?;
    Some((&key[..slash], &key[slash + 1..colon], &key[colon + 1..]))
}

fn width_nanos(width: Duration) -> i64 {
    i64::try_from(width.as_nanos()).unwrap_or(i64::MAX).max(1)
}

fn bucket_count(span: Duration, width: Duration) -> u32 {
    let width = width.as_nanos().max(1);
    u32::try_from(span.as_nanos().div_ceil(width)).unwrap_or(u32::MAX)
}

/// Converts a std duration into a chrono delta, saturating on overflow
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Parses durations like `500ms`, `10s`, `5m`, `1h30m`, `2d`
///
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::config("empty duration"));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(rest.len());
        if digits == 0 {
            return Err(Error::config(format!("invalid duration '{}'", input)));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| Error::config(format!("invalid duration '{}'", input)))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ns" => Duration::from_nanos(1),
            "us" | "µs" => Duration::from_micros(1),
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            "d" => Duration::from_secs(86400),
            other => return Err(Error::config(format!("unknown duration unit '{}' in '{}'", other, input))),
        };
        rest = &rest[unit_len..];
        total += unit.mul_f64(value);
    }
    Ok(total)
}

/// Formats a duration with the largest unit that divides it evenly
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    const UNITS: [(&str, u128); 7] = [
        ("d", 86_400_000_000_000),
        ("h", 3_600_000_000_000),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
        ("ns", 1),
    ];
    for (suffix, size) in UNITS {
        if nanos % size == 0 {
            return format!("{}{}", nanos / size, suffix);
        }
    }
    format!("{}ns", nanos)
}

/// Serde adapter storing durations as human-readable strings (`"10m"`)
pub mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Secs(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => parse_duration(&s).map_err(de::Error::custom),
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
        }
    }
}
