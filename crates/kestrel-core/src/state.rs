//! State provider contract
//!
//! The state is the low-latency store behind the engine. It holds the latest
//! value of every primitive feature and the per-bucket aggregators of every
//! windowed feature.
//!
//! ## Key layout
//!
//! ```text
//! primitive   {fqn}:{entity_id}            scalar or list, TTL = staleness
//!             _ts:{fqn}:{entity_id}        last write time (CAS-max)
//! window      {fqn}/{bucket}:{entity_id}   hash of aggregators plus a `_ts` field,
//!                                          TTL = staleness + grace
//! ```
//!
//! ## Policies every implementation enforces
//!
//! 1. A write with `now - ts > staleness` fails with `StaleWrite`, leaving the state unchanged
//! 2. The stored timestamp never moves backwards
//! 3. A bucket update (aggregators + expiry + timestamp) is atomic
//! 4. A list write replaces the list and refreshes the expiry atomically
//!
//! Cancellation is expressed by dropping the returned future; implementations
//! must not leave partial writes behind when that happens mid-call.

use crate::error::{Error, Result};
use crate::types::{FeatureDescriptor, Payload, RawBucket, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait State: Send + Sync {
    /// Latest value of a feature for an entity, `None` when absent
    ///
    /// Windowed features return the reduction of the alive buckets.
    async fn get(&self, fd: &FeatureDescriptor, entity_id: &str) -> Result<Option<Value>>;

    /// Replaces a scalar or a list; windowed features alias to [`State::window_add`]
    async fn set(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>) -> Result<()>;

    /// Appends to a list feature
    async fn append(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>) -> Result<()>;

    /// Increments a numeric scalar feature
    async fn incr(&self, fd: &FeatureDescriptor, entity_id: &str, by: &Payload, ts: DateTime<Utc>) -> Result<()>;

    /// Folds a value into the bucket containing `ts`
    async fn window_add(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>)
        -> Result<()>;

    /// Reads named buckets of one entity; missing buckets are skipped
    async fn window_buckets(&self, fd: &FeatureDescriptor, entity_id: &str, buckets: &[String])
        -> Result<Vec<RawBucket>>;

    /// Every dead bucket of a feature across all entities, minus `ignore`
    async fn dead_window_buckets(&self, fd: &FeatureDescriptor, ignore: &[RawBucket]) -> Result<Vec<RawBucket>>;

    /// Liveness check
    async fn ping(&self) -> Result<()>;

    /// Provider name, for logs
    fn provider(&self) -> &'static str;

    /// Window add if windowed, set if scalar, append if list
    async fn update(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>) -> Result<()> {
        if fd.is_windowed() {
            self.window_add(fd, entity_id, value, ts).await
        } else if fd.primitive.is_scalar() {
            self.set(fd, entity_id, value, ts).await
        } else {
            self.append(fd, entity_id, value, ts).await
        }
    }
}

/// Fails with `StaleWrite` when `now - ts > staleness`
pub fn check_staleness(fd: &FeatureDescriptor, ts: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    let age = now.signed_duration_since(ts);
    match age.to_std() {
        Ok(age) if age > fd.staleness => Err(Error::StaleWrite {
            ts,
            staleness: fd.staleness,
        }),
        _ => Ok(()),
    }
}

/// A stored value is fresh while `now - ts < freshness`
pub fn is_fresh(fd: &FeatureDescriptor, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match now.signed_duration_since(ts).to_std() {
        Ok(age) => age < fd.freshness,
        // written "in the future": treat as just written
        Err(_) => !fd.freshness.is_zero(),
    }
}

/// Whether a stored value is still returnable at `now`
pub fn is_expired(fd: &FeatureDescriptor, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match now.signed_duration_since(ts).to_std() {
        Ok(age) => age > fd.staleness,
        Err(_) => false,
    }
}

/// Shared preconditions for primitive writes
pub fn check_primitive_write(fd: &FeatureDescriptor, op: &str, ts: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if fd.is_headless() {
        return Err(Error::UnsupportedOperation(format!("cannot {} a headless feature", op)));
    }
    check_staleness(fd, ts, now)
}
