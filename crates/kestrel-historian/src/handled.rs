//! Dedup cache of dead buckets already drained into the historical store
//!
//! Keys follow the state layout `{fqn}/{bucket}:{entity_id}`. Entries expire
//! once the bucket itself is gone from the state, so the cache never grows
//! past one grace period worth of buckets.

use chrono::{DateTime, Utc};
use kestrel_core::window::{parse_bucket_key, to_delta};
use kestrel_core::{RawBucket, SharedClock};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

#[derive(Debug)]
pub struct HandledBuckets {
    clock: SharedClock,
    ttl: Duration,
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl HandledBuckets {
    pub fn new(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: impl Into<String>) {
        let expires_at = self.clock.now() + to_delta(self.ttl);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.into(), expires_at);
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).is_some_and(|exp| *exp > now)
    }

    /// Unexpired buckets of one feature, in the shape the state expects as an ignore list
    pub fn buckets_of(&self, fqn: &str) -> Vec<RawBucket> {
        let now = self.clock.now();
        let prefix = format!("{}/", fqn);
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|(key, exp)| **exp > now && key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let (fqn, bucket, entity_id) = parse_bucket_key(key)?;
                Some(RawBucket {
                    fqn: fqn.to_string(),
                    bucket: bucket.to_string(),
                    entity_id: entity_id.to_string(),
                    data: Default::default(),
                })
            })
            .collect()
    }

    /// Drops expired entries, returning how many were removed
    pub fn purge(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, exp| *exp > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use kestrel_core::ManualClock;
    use std::sync::Arc;

    fn cache() -> (Arc<ManualClock>, HandledBuckets) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()));
        let handled = HandledBuckets::new(clock.clone(), Duration::from_secs(660));
        (clock, handled)
    }

    #[test]
    fn test_entries_expire() {
        let (clock, handled) = cache();
        handled.insert("ns.clicks/1a:u1");
        assert!(handled.contains("ns.clicks/1a:u1"));

        clock.advance(TimeDelta::minutes(11));
        assert!(!handled.contains("ns.clicks/1a:u1"));
        assert_eq!(handled.purge(), 1);
        assert!(handled.is_empty());
    }

    #[test]
    fn test_buckets_of_feature() {
        let (_, handled) = cache();
        handled.insert("ns.clicks/1a:u1");
        handled.insert("ns.clicks/1b:u:2");
        handled.insert("ns.clicks_total/1a:u1");

        let mut buckets = handled.buckets_of("ns.clicks");
        buckets.sort_by(|a, b| a.bucket.cmp(&b.bucket));
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket, "1a");
        assert_eq!(buckets[1].entity_id, "u:2");
        assert_eq!(buckets[1].key(), "ns.clicks/1b:u:2");
    }
}
