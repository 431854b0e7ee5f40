//! Messages exchanged between the engine and the historian

use crate::error::{Error, Result};
use crate::types::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Bucket marker asking the historian to sweep every dead bucket of a feature
pub const DEAD_BUCKET_MARKER: &str = "*dead*";

/// A message type that can travel through a [`Notifier`](crate::notifier::Notifier)
pub trait Notification: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Short name, used for channel names and log fields
    const KIND: &'static str;

    /// Rejects messages that must never be published
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// A feature value changed and should be harvested into the historical store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectNotification {
    pub fqn: String,
    #[serde(default)]
    pub entity_id: String,
    /// Bucket name for windowed features, empty otherwise
    #[serde(default)]
    pub bucket: String,
}

impl CollectNotification {
    pub fn new(fqn: impl Into<String>, entity_id: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            fqn: fqn.into(),
            entity_id: entity_id.into(),
            bucket: bucket.into(),
        }
    }

    /// A request to sweep the dead buckets of `fqn`
    pub fn dead_sweep(fqn: impl Into<String>) -> Self {
        Self::new(fqn, "", DEAD_BUCKET_MARKER)
    }

    pub fn is_dead_sweep(&self) -> bool {
        self.bucket == DEAD_BUCKET_MARKER
    }
}

impl Notification for CollectNotification {
    const KIND: &'static str = "collect";
}

/// A materialized value on its way to the historical writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteNotification {
    pub fqn: String,
    pub entity_id: String,
    pub value: Option<Value>,
    #[serde(default)]
    pub bucket: String,
    /// False once the bucket has left the alive window
    #[serde(default)]
    pub active_bucket: bool,
}

impl WriteNotification {
    pub fn new(fqn: impl Into<String>, entity_id: impl Into<String>, value: Value) -> Self {
        Self {
            fqn: fqn.into(),
            entity_id: entity_id.into(),
            value: Some(value),
            bucket: String::new(),
            active_bucket: false,
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>, active: bool) -> Self {
        self.bucket = bucket.into();
        self.active_bucket = active;
        self
    }

    pub fn is_dead_bucket(&self) -> bool {
        !self.bucket.is_empty() && !self.active_bucket
    }
}

impl Notification for WriteNotification {
    const KIND: &'static str = "write";

    fn validate(&self) -> Result<()> {
        if self.value.is_none() {
            return Err(Error::internal(format!(
                "write notification for {} ({}) has no value",
                self.fqn, self.entity_id
            )));
        }
        Ok(())
    }
}

/// Hand-off point from the request path to the historian
///
/// Implementations enqueue and return immediately; delivery happens in the
/// background with retries.
pub trait NotificationSink: Send + Sync {
    fn add_collect(&self, notification: CollectNotification) -> Result<()>;

    fn add_write(&self, notification: WriteNotification) -> Result<()>;
}
