//! In-process state provider
//!
//! Keeps primitives and window buckets in two hash maps behind a single
//! lock, so every compound update is atomic by construction. Expired entries
//! are invisible to readers and purged periodically by writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_core::state::{check_primitive_write, check_staleness, is_fresh};
use kestrel_core::window::{alive_window_buckets, bucket_key, bucket_name, to_delta};
use kestrel_core::{
    reduce_buckets, AggrFn, Error, FeatureDescriptor, Payload, RawBucket, Result, Scalar, SharedClock, State,
    Value, WindowPolicy, WindowResultMap,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

const PURGE_EVERY_WRITES: u64 = 1024;

#[derive(Debug, Clone)]
struct Entry {
    payload: Payload,
    ts: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct BucketEntry {
    fqn: String,
    bucket: String,
    entity_id: String,
    data: WindowResultMap,
    ts: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    primitives: HashMap<String, Entry>,
    buckets: HashMap<String, BucketEntry>,
}

#[derive(Debug)]
pub struct MemoryState {
    clock: SharedClock,
    window: WindowPolicy,
    inner: RwLock<Inner>,
    writes: AtomicU64,
}

impl MemoryState {
    pub fn new(clock: SharedClock, window: WindowPolicy) -> Self {
        Self {
            clock,
            window,
            inner: RwLock::new(Inner::default()),
            writes: AtomicU64::new(0),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| Error::internal("memory state lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        let guard = self.inner.write().map_err(|_| Error::internal("memory state lock poisoned"))?;
        Ok(guard)
    }

    fn primitive_key(fd: &FeatureDescriptor, entity_id: &str) -> String {
        format!("{}:{}", fd.fqn, entity_id)
    }

    fn expiry(&self, fd: &FeatureDescriptor) -> Option<DateTime<Utc>> {
        (!fd.staleness.is_zero()).then(|| self.clock.now() + to_delta(fd.staleness))
    }

    /// Removes every expired entry
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut inner = self.write()?;
        let before = inner.primitives.len() + inner.buckets.len();
        inner.primitives.retain(|_, e| e.expires_at.is_none_or(|x| x > now));
        inner.buckets.retain(|_, b| b.expires_at > now);
        Ok(before - inner.primitives.len() - inner.buckets.len())
    }

    fn after_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY_WRITES == PURGE_EVERY_WRITES - 1 {
            if let Ok(n) = self.purge_expired() {
                tracing::debug!(purged = n, "memory state purge");
            }
        }
    }

    fn upsert<F>(&self, fd: &FeatureDescriptor, entity_id: &str, ts: DateTime<Utc>, f: F) -> Result<()>
    where
        F: FnOnce(Option<Payload>) -> Result<Payload>,
    {
        let now = self.clock.now();
        let key = Self::primitive_key(fd, entity_id);
        let expires_at = self.expiry(fd);
        {
            let mut inner = self.write()?;
            let current = inner
                .primitives
                .get(&key)
                .filter(|e| e.expires_at.is_none_or(|x| x > now))
                .cloned();
            let (previous, previous_ts) = match current {
                Some(e) => (Some(e.payload), Some(e.ts)),
                None => (None, None),
            };
            let payload = f(previous)?;
            inner.primitives.insert(
                key,
                Entry {
                    payload,
                    ts: previous_ts.map_or(ts, |p| p.max(ts)),
                    expires_at,
                },
            );
        }
        self.after_write();
        Ok(())
    }

    fn snapshot(&self, key: &str, now: DateTime<Utc>) -> Result<Option<RawBucket>> {
        let inner = self.read()?;
        Ok(inner
            .buckets
            .get(key)
            .filter(|b| b.expires_at > now && !b.data.is_empty())
            .map(|b| RawBucket {
                fqn: b.fqn.clone(),
                bucket: b.bucket.clone(),
                entity_id: b.entity_id.clone(),
                data: b.data.clone(),
            }))
    }
}

#[async_trait]
impl State for MemoryState {
    async fn get(&self, fd: &FeatureDescriptor, entity_id: &str) -> Result<Option<Value>> {
        let now = self.clock.now();
        if fd.is_windowed() {
            let names = alive_window_buckets(now, fd.staleness, fd.freshness);
            let buckets = self.window_buckets(fd, entity_id, &names).await?;
            let map = reduce_buckets(&buckets);
            if map.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Value::new(Payload::Window(map), now).fresh(true)));
        }

        let inner = self.read()?;
        let Some(entry) = inner.primitives.get(&Self::primitive_key(fd, entity_id)) else {
            return Ok(None);
        };
        if entry.expires_at.is_some_and(|x| x <= now) {
            return Ok(None);
        }
        Ok(Some(Value {
            payload: entry.payload.clone(),
            timestamp: entry.ts,
            fresh: is_fresh(fd, entry.ts, now),
        }))
    }

    async fn set(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>) -> Result<()> {
        if fd.is_windowed() {
            return self.window_add(fd, entity_id, value, ts).await;
        }
        check_primitive_write(fd, "set", ts, self.clock.now())?;
        match (fd.primitive.is_list(), value) {
            (false, Payload::Scalar(_)) | (true, Payload::List(_)) => {}
            _ => return Err(Error::type_mismatch(fd.primitive, "incompatible payload")),
        }
        self.upsert(fd, entity_id, ts, |_| Ok(value.clone()))
    }

    async fn append(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>) -> Result<()> {
        if fd.is_windowed() {
            return Err(Error::UnsupportedOperation("cannot append to a windowed feature".into()));
        }
        if !fd.primitive.is_list() {
            return Err(Error::UnsupportedOperation("append only supports list features".into()));
        }
        check_primitive_write(fd, "append", ts, self.clock.now())?;
        let items: Vec<Scalar> = match value {
            Payload::List(items) => items.clone(),
            Payload::Scalar(s) => vec![s.clone()],
            _ => return Err(Error::type_mismatch(fd.primitive, "incompatible payload")),
        };
        if items.is_empty() {
            return Ok(());
        }
        self.upsert(fd, entity_id, ts, |previous| {
            let mut list = match previous {
                Some(Payload::List(existing)) => existing,
                _ => Vec::new(),
            };
            list.extend(items);
            Ok(Payload::List(list))
        })
    }

    async fn incr(&self, fd: &FeatureDescriptor, entity_id: &str, by: &Payload, ts: DateTime<Utc>) -> Result<()> {
        if fd.is_windowed() {
            return Err(Error::UnsupportedOperation("cannot increment a windowed feature".into()));
        }
        if !fd.primitive.is_numeric() {
            return Err(Error::UnsupportedOperation("incr only supports numeric scalars".into()));
        }
        check_primitive_write(fd, "incr", ts, self.clock.now())?;
        let by = by
            .as_scalar()
            .cloned()
            .ok_or_else(|| Error::type_mismatch(fd.primitive, "non-scalar payload"))?;

        self.upsert(fd, entity_id, ts, |previous| {
            let current = previous.as_ref().and_then(Payload::as_scalar);
            let next = match (current, &by) {
                (None, Scalar::Int(b)) => Scalar::Int(*b),
                (None, Scalar::Float(b)) => Scalar::Float(*b),
                (Some(Scalar::Int(a)), Scalar::Int(b)) => Scalar::Int(a.checked_add(*b).ok_or_else(|| {
                    Error::UnsupportedOperation("increment would overflow".into())
                })?),
                (Some(Scalar::Float(a)), Scalar::Float(b)) => Scalar::Float(a + b),
                _ => return Err(Error::type_mismatch(fd.primitive, "non-numeric increment")),
            };
            Ok(Payload::Scalar(next))
        })
    }

    async fn window_add(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>)
        -> Result<()> {
        if !fd.is_windowed() {
            return Err(Error::UnsupportedOperation(format!("{} is not a windowed feature", fd.fqn)));
        }
        check_staleness(fd, ts, self.clock.now())?;
        let v = value
            .as_f64()
            .ok_or_else(|| Error::type_mismatch(fd.primitive, "non-numeric window value"))?;

        let bucket = bucket_name(ts, fd.freshness);
        let expires_at = self.window.bucket_dead_time(&bucket, fd.freshness, fd.staleness)?;
        let key = bucket_key(&fd.fqn, &bucket, entity_id);
        let now = self.clock.now();
        {
            let mut inner = self.write()?;
            let entry = inner.buckets.entry(key).or_insert_with(|| BucketEntry {
                fqn: fd.fqn.clone(),
                bucket: bucket.clone(),
                entity_id: entity_id.to_string(),
                data: WindowResultMap::new(),
                ts,
                expires_at,
            });
            if entry.expires_at <= now {
                entry.data.clear();
            }
            for fn_ in fd.tracked_aggregators() {
                match fn_ {
                    AggrFn::Sum => *entry.data.entry(AggrFn::Sum).or_insert(0.0) += v,
                    AggrFn::Count => *entry.data.entry(AggrFn::Count).or_insert(0.0) += 1.0,
                    AggrFn::Min => {
                        let m = entry.data.entry(AggrFn::Min).or_insert(v);
                        *m = m.min(v);
                    }
                    AggrFn::Max => {
                        let m = entry.data.entry(AggrFn::Max).or_insert(v);
                        *m = m.max(v);
                    }
                    AggrFn::Avg => {}
                }
            }
            entry.ts = entry.ts.max(ts);
            entry.expires_at = expires_at;
        }
        self.after_write();
        Ok(())
    }

    async fn window_buckets(&self, fd: &FeatureDescriptor, entity_id: &str, buckets: &[String])
        -> Result<Vec<RawBucket>> {
        let now = self.clock.now();
        let mut out = Vec::with_capacity(buckets.len());
        for name in buckets {
            if let Some(b) = self.snapshot(&bucket_key(&fd.fqn, name, entity_id), now)? {
                out.push(b);
            }
        }
        Ok(out)
    }

    async fn dead_window_buckets(&self, fd: &FeatureDescriptor, ignore: &[RawBucket]) -> Result<Vec<RawBucket>> {
        let now = self.clock.now();
        let dead: HashSet<String> = self
            .window
            .dead_window_buckets(now, fd.staleness, fd.freshness)
            .into_iter()
            .collect();
        let ignore: HashSet<String> = ignore.iter().map(RawBucket::key).collect();

        let inner = self.read()?;
        let mut out: Vec<RawBucket> = inner
            .buckets
            .iter()
            .filter(|(key, b)| {
                b.fqn == fd.fqn
                    && b.expires_at > now
                    && !b.data.is_empty()
                    && dead.contains(&b.bucket)
                    && !ignore.contains(*key)
            })
            .map(|(_, b)| RawBucket {
                fqn: b.fqn.clone(),
                bucket: b.bucket.clone(),
                entity_id: b.entity_id.clone(),
                data: b.data.clone(),
            })
            .collect();
        out.sort_by(|a, b| (&a.bucket, &a.entity_id).cmp(&(&b.bucket, &b.entity_id)));
        Ok(out)
    }

    async fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    fn provider(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use kestrel_core::{ManualClock, Primitive};
    use std::sync::Arc;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn state() -> (Arc<ManualClock>, MemoryState) {
        let clock = Arc::new(ManualClock::new(t0()));
        let state = MemoryState::new(clock.clone(), WindowPolicy::default());
        (clock, state)
    }

    fn int_fd() -> FeatureDescriptor {
        FeatureDescriptor::new("ns.a", Primitive::Int)
            .with_freshness(Duration::from_secs(10))
            .with_staleness(Duration::from_secs(60))
    }

    fn window_fd() -> FeatureDescriptor {
        FeatureDescriptor::new("ns.b", Primitive::Float)
            .with_aggr([AggrFn::Sum, AggrFn::Count, AggrFn::Min, AggrFn::Max])
            .with_freshness(Duration::from_secs(60))
            .with_staleness(Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_, state) = state();
        assert!(state.get(&int_fd(), "e1").await.unwrap().is_none());
        assert!(state.get(&window_fd(), "e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_get_freshness_and_expiry() {
        let (clock, state) = state();
        let fd = int_fd();
        state.set(&fd, "e1", &Payload::from(7i64), t0()).await.unwrap();

        clock.advance(TimeDelta::seconds(1));
        let v = state.get(&fd, "e1").await.unwrap().unwrap();
        assert_eq!(v.payload, Payload::from(7i64));
        assert_eq!(v.timestamp, t0());
        assert!(v.fresh);

        clock.advance(TimeDelta::seconds(10));
        assert!(!state.get(&fd, "e1").await.unwrap().unwrap().fresh);

        clock.advance(TimeDelta::seconds(50));
        assert!(state.get(&fd, "e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_write_leaves_state_unchanged() {
        let (clock, state) = state();
        let fd = int_fd();
        state.set(&fd, "e1", &Payload::from(3i64), t0()).await.unwrap();
        clock.advance(TimeDelta::seconds(30));

        let err = state
            .set(&fd, "e1", &Payload::from(1i64), t0() - TimeDelta::seconds(120))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleWrite { .. }));
        assert_eq!(state.get(&fd, "e1").await.unwrap().unwrap().payload, Payload::from(3i64));
    }

    #[tokio::test]
    async fn test_timestamp_never_regresses() {
        let (_, state) = state();
        let fd = int_fd();
        state.set(&fd, "e1", &Payload::from(1i64), t0()).await.unwrap();
        state
            .set(&fd, "e1", &Payload::from(2i64), t0() - TimeDelta::seconds(5))
            .await
            .unwrap();
        let v = state.get(&fd, "e1").await.unwrap().unwrap();
        assert_eq!(v.timestamp, t0());
        assert_eq!(v.payload, Payload::from(2i64));
    }

    #[tokio::test]
    async fn test_append_and_replace_list() {
        let (_, state) = state();
        let fd = FeatureDescriptor::new("ns.l", Primitive::StringList).with_staleness(Duration::from_secs(60));
        let list = |xs: &[&str]| Payload::List(xs.iter().map(|s| Scalar::String(s.to_string())).collect());

        state.append(&fd, "e1", &Payload::List(Vec::new()), t0()).await.unwrap();
        assert!(state.get(&fd, "e1").await.unwrap().is_none());

        state.append(&fd, "e1", &list(&["a"]), t0()).await.unwrap();
        state.append(&fd, "e1", &list(&["b", "c"]), t0()).await.unwrap();
        assert_eq!(state.get(&fd, "e1").await.unwrap().unwrap().payload, list(&["a", "b", "c"]));

        state.set(&fd, "e1", &list(&["z"]), t0()).await.unwrap();
        assert_eq!(state.get(&fd, "e1").await.unwrap().unwrap().payload, list(&["z"]));

        let err = state.append(&int_fd(), "e1", &Payload::from(1i64), t0()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn test_incr() {
        let (_, state) = state();
        let fd = int_fd();
        state.incr(&fd, "e1", &Payload::from(2i64), t0()).await.unwrap();
        state.incr(&fd, "e1", &Payload::from(5i64), t0()).await.unwrap();
        assert_eq!(state.get(&fd, "e1").await.unwrap().unwrap().payload, Payload::from(7i64));
    }

    #[tokio::test]
    async fn test_update_dispatch() {
        let (_, state) = state();
        let fd = FeatureDescriptor::new("ns.l", Primitive::IntList).with_staleness(Duration::from_secs(60));
        state.update(&fd, "e1", &Payload::List(vec![Scalar::Int(1)]), t0()).await.unwrap();
        state.update(&fd, "e1", &Payload::List(vec![Scalar::Int(2)]), t0()).await.unwrap();
        assert_eq!(
            state.get(&fd, "e1").await.unwrap().unwrap().payload,
            Payload::List(vec![Scalar::Int(1), Scalar::Int(2)])
        );
    }

    #[tokio::test]
    async fn test_window_aggregation_across_buckets() {
        let (clock, state) = state();
        let fd = window_fd();
        state.window_add(&fd, "e1", &Payload::from(1.0), t0()).await.unwrap();
        clock.set(t0() + TimeDelta::seconds(10));
        state
            .window_add(&fd, "e1", &Payload::from(3.0), t0() + TimeDelta::seconds(10))
            .await
            .unwrap();
        clock.set(t0() + TimeDelta::seconds(90));
        state
            .set(&fd, "e1", &Payload::from(5.0), t0() + TimeDelta::seconds(90))
            .await
            .unwrap();

        clock.set(t0() + TimeDelta::minutes(2));
        let v = state.get(&fd, "e1").await.unwrap().unwrap();
        let map = v.payload.as_window().unwrap();
        assert_eq!(map[&AggrFn::Sum], 9.0);
        assert_eq!(map[&AggrFn::Count], 3.0);
        assert_eq!(map[&AggrFn::Min], 1.0);
        assert_eq!(map[&AggrFn::Max], 5.0);
        assert_eq!(map[&AggrFn::Avg], 3.0);
        assert!(v.fresh);
    }

    #[tokio::test]
    async fn test_dead_window_buckets() {
        let (clock, state) = state();
        let fd = window_fd();
        state.window_add(&fd, "e1", &Payload::from(1.0), t0()).await.unwrap();
        state.window_add(&fd, "e2", &Payload::from(2.0), t0()).await.unwrap();

        // still alive
        assert!(state.dead_window_buckets(&fd, &[]).await.unwrap().is_empty());

        clock.set(t0() + TimeDelta::minutes(6));
        let dead = state.dead_window_buckets(&fd, &[]).await.unwrap();
        assert_eq!(dead.len(), 2);
        assert!(state.get(&fd, "e1").await.unwrap().is_none());

        let ignored = state.dead_window_buckets(&fd, &dead[..1]).await.unwrap();
        assert_eq!(ignored.len(), 1);
        assert_eq!(ignored[0], dead[1]);

        // gone after staleness + grace
        clock.set(t0() + TimeDelta::minutes(16));
        assert!(state.dead_window_buckets(&fd, &[]).await.unwrap().is_empty());
        assert!(state.window_buckets(&fd, "e1", &[dead[0].bucket.clone()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, state) = state();
        state.set(&int_fd(), "e1", &Payload::from(1i64), t0()).await.unwrap();
        clock.advance(TimeDelta::minutes(5));
        assert_eq!(state.purge_expired().unwrap(), 1);
    }
}
