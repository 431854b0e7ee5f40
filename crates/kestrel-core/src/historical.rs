//! Historical writer contract
//!
//! The historical writer persists every materialized value for offline use.
//! It receives [`WriteNotification`]s from a single historian worker, buffers
//! them and partitions the output by feature, date and alive/dead bucket.

use crate::error::Result;
use crate::notification::WriteNotification;
use crate::types::FeatureDescriptor;
use async_trait::async_trait;

/// Resolves descriptors of other bound features (e.g. feature-set members)
pub trait DescriptorLookup: Send + Sync {
    fn descriptor(&self, fqn: &str) -> Result<FeatureDescriptor>;
}

#[async_trait]
pub trait HistoricalWriter: Send + Sync {
    /// Buffers one notification
    async fn commit(&self, notification: WriteNotification) -> Result<()>;

    /// Makes everything buffered for `fqn` durable
    async fn flush(&self, fqn: &str) -> Result<()>;

    async fn flush_all(&self) -> Result<()>;

    /// Flushes and releases resources; further commits fail
    async fn close(&self) -> Result<()>;

    /// Lets the writer prepare a layout for a feature before its first commit
    ///
    /// `feature_set` lists the members when the feature is a feature set.
    async fn bind_feature(
        &self,
        _fd: &FeatureDescriptor,
        _feature_set: Option<&[String]>,
        _lookup: &dyn DescriptorLookup,
    ) -> Result<()> {
        Ok(())
    }

    fn provider(&self) -> &'static str;
}
