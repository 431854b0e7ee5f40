//! Historian server: harvests the state into the historical store
//!
//! ## Pipeline
//!
//! ```text
//!  collect notifier ──► collects queue ──► N collect workers ──┐
//!                                            (read the state)   │ WriteNotification
//!  write notifier ────► writes queue ◄──────────────────────────┘
//!                            │
//!                            ▼
//!                     1 write worker ──► HistoricalWriter::commit
//!                            │ every sync period
//!                            └──────────► HistoricalWriter::flush_all
//! ```
//!
//! Collect and write workers only run on the elected leader. The write pool
//! is pinned to a single worker since writers are not required to be safe
//! for concurrent commits.
//!
//! ## Dead buckets
//!
//! Binding a windowed feature schedules a dead sweep for it. A sweep reads
//! every bucket that left the alive window but is still kept by the state,
//! skipping the ones already drained (`handled`), and writes them once with
//! `active_bucket = false`. The next sweep is scheduled shortly before the
//! current bucket closes.

use crate::handled::HandledBuckets;
use crate::queue::{QueueHandler, WorkQueue};
use crate::subscription::pump;
use async_trait::async_trait;
use kestrel_core::fqn::normalize_fqn;
use kestrel_core::window::{bucket_key, bucket_time, time_till_next_bucket};
use kestrel_core::{
    CollectNotification, DescriptorLookup, Error, FeatureDescriptor, HistoricalWriter, Notifier, Payload, Result,
    Runnable, SharedClock, State, Value, WindowPolicy, WriteNotification,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorianConfig {
    pub collect_workers: usize,
    /// Must be 1
    pub write_workers: usize,
    pub window: WindowPolicy,
}

impl Default for HistorianConfig {
    fn default() -> Self {
        Self {
            collect_workers: 5,
            write_workers: 1,
            window: WindowPolicy::default(),
        }
    }
}

impl HistorianConfig {
    pub fn validate(&self) -> Result<()> {
        if self.write_workers != 1 {
            return Err(Error::config(format!(
                "write_workers must be 1, got {}",
                self.write_workers
            )));
        }
        if self.collect_workers == 0 {
            return Err(Error::config("collect_workers must be at least 1"));
        }
        Ok(())
    }
}

/// External services the historian talks to
pub struct HistorianDeps {
    pub state: Arc<dyn State>,
    pub writer: Arc<dyn HistoricalWriter>,
    pub collect_notifier: Arc<dyn Notifier<CollectNotification>>,
    pub write_notifier: Arc<dyn Notifier<WriteNotification>>,
    pub clock: SharedClock,
}

struct Inner {
    config: HistorianConfig,
    deps: HistorianDeps,
    metadata: RwLock<HashMap<String, FeatureDescriptor>>,
    collects: Arc<WorkQueue<CollectNotification>>,
    writes: Arc<WorkQueue<WriteNotification>>,
    handled: HandledBuckets,
    commits: AtomicU64,
}

#[derive(Clone)]
pub struct HistorianServer {
    inner: Arc<Inner>,
}

impl HistorianServer {
    pub fn new(config: HistorianConfig, deps: HistorianDeps) -> Result<Self> {
        config.validate()?;
        let handled = HandledBuckets::new(deps.clock.clone(), config.window.handled_ttl());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                deps,
                metadata: RwLock::new(HashMap::new()),
                collects: Arc::new(WorkQueue::new("collect-tasks")),
                writes: Arc::new(WorkQueue::new("write-tasks")),
                handled,
                commits: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &HistorianConfig {
        &self.inner.config
    }

    /// Dedup cache of drained dead buckets
    pub fn handled(&self) -> &HandledBuckets {
        &self.inner.handled
    }

    /// Collect notifications waiting for a worker
    pub fn pending_collects(&self) -> usize {
        self.inner.collects.len()
    }

    /// Write notifications waiting for the writer
    pub fn pending_writes(&self) -> usize {
        self.inner.writes.len()
    }

    // ----- feature manager -----

    /// Registers a feature for harvesting
    ///
    /// The writer sees the feature first so it can prepare its layout.
    /// Headless features have nothing to harvest and are not kept.
    pub async fn bind(&self, fd: FeatureDescriptor) -> Result<()> {
        fd.validate()?;
        let members = fd.set_members()?;
        self.inner
            .deps
            .writer
            .bind_feature(&fd, members.as_deref(), self)
            .await?;

        if fd.is_headless() {
            debug!(fqn = %fd.fqn, "headless feature is not stored");
            return Ok(());
        }
        // a rebound feature keeps its running sweep chain
        if fd.is_windowed() && !self.has(&fd.fqn) {
            self.inner.collects.add(CollectNotification::dead_sweep(&fd.fqn))?;
        }

        info!(fqn = %fd.fqn, "feature bound");
        self.metadata_mut().insert(fd.fqn.clone(), fd);
        Ok(())
    }

    pub fn unbind(&self, fqn: &str) {
        self.metadata_mut().remove(fqn);
        info!(fqn = %fqn, "feature unbound");
    }

    pub fn has(&self, fqn: &str) -> bool {
        self.metadata_ref().contains_key(fqn)
    }

    pub fn metadata(&self, fqn: &str) -> Result<FeatureDescriptor> {
        self.metadata_ref()
            .get(fqn)
            .cloned()
            .ok_or_else(|| Error::FeatureNotFound(fqn.to_string()))
    }

    fn metadata_ref(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, FeatureDescriptor>> {
        self.inner.metadata.read().unwrap_or_else(|e| e.into_inner())
    }

    fn metadata_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, FeatureDescriptor>> {
        self.inner.metadata.write().unwrap_or_else(|e| e.into_inner())
    }

    // ----- collect -----

    /// Turns a collect notification into write notifications
    pub async fn dispatch_collect(&self, cn: &CollectNotification) -> Result<()> {
        let fd = match self.metadata(&cn.fqn) {
            Ok(fd) => fd,
            Err(_) if cn.is_dead_sweep() => {
                debug!(fqn = %cn.fqn, "feature unbound, stopping dead sweeps");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let state = &self.inner.deps.state;

        if cn.is_dead_sweep() {
            if !fd.is_windowed() {
                debug!(fqn = %fd.fqn, "feature is no longer windowed, stopping dead sweeps");
                return Ok(());
            }
            return self.dispatch_dead_sweep(&fd).await;
        }
        if !fd.is_windowed() {
            let Some(value) = state.get(&fd, &cn.entity_id).await? else {
                debug!(fqn = %fd.fqn, entity_id = %cn.entity_id, "nothing to collect");
                return Ok(());
            };
            return self
                .inner
                .writes
                .add(WriteNotification::new(&fd.fqn, &cn.entity_id, value));
        }

        if cn.bucket.is_empty() {
            return Err(Error::InvalidPipelineContext(format!(
                "collect notification for windowed feature {} has no bucket",
                fd.fqn
            )));
        }

        let now = self.inner.deps.clock.now();
        let dead: HashSet<String> = self
            .inner
            .config
            .window
            .dead_window_buckets(now, fd.staleness, fd.freshness)
            .into_iter()
            .collect();
        let buckets = state
            .window_buckets(&fd, &cn.entity_id, std::slice::from_ref(&cn.bucket))
            .await?;

        for b in buckets {
            let active = !dead.contains(&b.bucket);
            if !active {
                self.inner.handled.insert(b.key());
            }
            let wn = WriteNotification::new(&fd.fqn, &b.entity_id, Value::new(Payload::Window(b.data), now))
                .with_bucket(b.bucket, active);
            self.inner.writes.add(wn)?;
        }
        Ok(())
    }

    async fn dispatch_dead_sweep(&self, fd: &FeatureDescriptor) -> Result<()> {
        let ignore = self.inner.handled.buckets_of(&fd.fqn);
        let dead = self.inner.deps.state.dead_window_buckets(fd, &ignore).await?;
        if !dead.is_empty() {
            info!(fqn = %fd.fqn, buckets = dead.len(), "collecting dead buckets");
        }

        for b in dead {
            let key = b.key();
            let ts = bucket_time(&b.bucket, fd.freshness)?;
            let wn = WriteNotification::new(&fd.fqn, &b.entity_id, Value::new(Payload::Window(b.data), ts))
                .with_bucket(b.bucket, false);
            self.inner.writes.add(wn)?;
            self.inner.handled.insert(key);
        }

        let next = time_till_next_bucket(self.inner.deps.clock.now(), fd.freshness);
        self.inner
            .collects
            .add_after(CollectNotification::dead_sweep(&fd.fqn), next)
    }

    // ----- write -----

    /// Commits one write notification to the historical writer
    pub async fn dispatch_write(&self, wn: &WriteNotification) -> Result<()> {
        let mut wn = wn.clone();
        if matches!(&wn.value, Some(Value { payload: Payload::List(items), .. }) if items.is_empty()) {
            wn.value = None;
        }

        let dead_key = wn.is_dead_bucket().then(|| bucket_key(&wn.fqn, &wn.bucket, &wn.entity_id));
        self.inner.deps.writer.commit(wn).await?;
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        if let Some(key) = dead_key {
            self.inner.handled.insert(key);
        }
        Ok(())
    }

    /// Successful commits not yet reported by a flush
    pub fn unflushed_commits(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Flushes the writer and reports the commits since the last flush
    pub async fn finalize_writes(&self) {
        if let Err(e) = self.inner.deps.writer.flush_all().await {
            error!(error = %e, "failed to flush historical logs to storage");
            return;
        }
        let commits = self.inner.commits.swap(0, Ordering::SeqCst);
        if commits > 0 {
            info!(writes = commits, "successfully flushed historical logs to storage");
        }
        self.inner.handled.purge();
    }

    // ----- runnables -----

    /// Both leader-only components: the collector and the writer
    pub fn runnables(&self) -> Vec<Arc<dyn Runnable>> {
        vec![
            Arc::new(Collector { server: self.clone() }),
            Arc::new(Writer { server: self.clone() }),
        ]
    }
}

impl DescriptorLookup for HistorianServer {
    fn descriptor(&self, fqn: &str) -> Result<FeatureDescriptor> {
        let fqn = normalize_fqn(fqn, "")?;
        self.metadata(&fqn)
    }
}

struct CollectHandler(HistorianServer);

#[async_trait]
impl QueueHandler<CollectNotification> for CollectHandler {
    async fn handle(&self, item: &CollectNotification) -> Result<()> {
        self.0.dispatch_collect(item).await
    }
}

struct WriteHandler(HistorianServer);

#[async_trait]
impl QueueHandler<WriteNotification> for WriteHandler {
    async fn handle(&self, item: &WriteNotification) -> Result<()> {
        self.0.dispatch_write(item).await
    }
}

/// Subscribes to collect notifications and runs the collect workers
struct Collector {
    server: HistorianServer,
}

#[async_trait]
impl Runnable for Collector {
    fn name(&self) -> &str {
        "historian-collector"
    }

    fn needs_leader(&self) -> bool {
        true
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let inner = &self.server.inner;
        info!(workers = inner.config.collect_workers, "starting historian collector");
        let subscriber = pump(inner.deps.collect_notifier.clone(), inner.collects.clone(), cancel.clone());
        let workers = inner.collects.clone().run(
            Arc::new(CollectHandler(self.server.clone())),
            inner.config.collect_workers,
            cancel,
        );
        tokio::join!(subscriber, workers);
        Ok(())
    }
}

/// Subscribes to write notifications and drains them into the writer
///
/// Draining happens in cycles: every sync period the queue is emptied and
/// the writer flushed. Cancellation runs one last cycle.
struct Writer {
    server: HistorianServer,
}

#[async_trait]
impl Runnable for Writer {
    fn name(&self) -> &str {
        "historian-writer"
    }

    fn needs_leader(&self) -> bool {
        true
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let inner = &self.server.inner;
        let period = inner.config.window.sync_period();
        info!(sync_period = ?period, "starting historian writer");

        let subscriber = pump(inner.deps.write_notifier.clone(), inner.writes.clone(), cancel.clone());
        let handler = WriteHandler(self.server.clone());
        let cycles = async {
            loop {
                while inner.writes.process_ready(&handler).await {}
                self.server.finalize_writes().await;
                if cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(period) => {}
                }
            }
        };
        tokio::join!(subscriber, cycles);

        inner.writes.shut_down();
        if let Err(e) = inner.deps.writer.close().await {
            error!(error = %e, "failed to close historical writer");
        }
        info!("historian writer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kestrel_core::{ManualClock, Primitive};
    use kestrel_providers::{MemoryNotifier, MemoryState, MemoryWriter};
    use std::time::Duration;

    fn server() -> (HistorianServer, Arc<MemoryWriter>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()));
        let writer = Arc::new(MemoryWriter::new());
        let deps = HistorianDeps {
            state: Arc::new(MemoryState::new(clock.clone(), WindowPolicy::default())),
            writer: writer.clone(),
            collect_notifier: Arc::new(MemoryNotifier::<CollectNotification>::default()),
            write_notifier: Arc::new(MemoryNotifier::<WriteNotification>::default()),
            clock,
        };
        (HistorianServer::new(HistorianConfig::default(), deps).unwrap(), writer)
    }

    #[test]
    fn test_write_workers_pinned_to_one() {
        let config = HistorianConfig {
            write_workers: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(HistorianConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_bind_windowed_schedules_dead_sweep() {
        let (server, writer) = server();
        let fd = FeatureDescriptor::new("ns.clicks", Primitive::Float)
            .with_aggr([kestrel_core::AggrFn::Sum])
            .with_freshness(Duration::from_secs(60))
            .with_staleness(Duration::from_secs(300));

        server.bind(fd).await.unwrap();
        assert!(server.has("ns.clicks"));
        assert_eq!(server.pending_collects(), 1);
        assert!(writer.bound().contains_key("ns.clicks"));

        server.unbind("ns.clicks");
        assert!(!server.has("ns.clicks"));
    }

    #[tokio::test]
    async fn test_headless_features_are_not_kept() {
        let (server, writer) = server();
        server
            .bind(FeatureDescriptor::new("ns.score", Primitive::Headless).with_builder("headless", serde_json::Value::Null))
            .await
            .unwrap();

        assert!(!server.has("ns.score"));
        assert!(writer.bound().contains_key("ns.score"));
    }

    #[tokio::test]
    async fn test_unknown_feature_collect_fails() {
        let (server, _) = server();
        let err = server
            .dispatch_collect(&CollectNotification::new("ns.missing", "e1", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FeatureNotFound(_)));

        // sweeps of unbound features just stop
        assert!(server
            .dispatch_collect(&CollectNotification::dead_sweep("ns.missing"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_write_normalizes_empty_list() {
        let (server, writer) = server();
        let wn = WriteNotification::new(
            "ns.tags",
            "e1",
            Value::new(Payload::List(Vec::new()), Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()),
        );

        server.dispatch_write(&wn).await.unwrap();
        let buffered = writer.buffered();
        assert_eq!(buffered.len(), 1);
        assert!(buffered[0].value.is_none());
    }

    #[tokio::test]
    async fn test_dead_commit_marks_bucket_handled() {
        let (server, writer) = server();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let wn = WriteNotification::new("ns.clicks", "e1", Value::new(Payload::from(1.0), ts)).with_bucket("1a", false);

        server.dispatch_write(&wn).await.unwrap();
        assert!(server.handled().contains("ns.clicks/1a:e1"));

        server.finalize_writes().await;
        assert_eq!(writer.persisted().len(), 1);
        assert_eq!(writer.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_is_not_counted() {
        let (server, writer) = server();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let alive = WriteNotification::new("ns.a", "e1", Value::new(Payload::from(1i64), ts));
        server.dispatch_write(&alive).await.unwrap();
        assert_eq!(server.unflushed_commits(), 1);

        writer.close().await.unwrap();
        let dead = WriteNotification::new("ns.clicks", "e1", Value::new(Payload::from(1.0), ts)).with_bucket("1a", false);
        assert!(server.dispatch_write(&dead).await.is_err());
        assert_eq!(server.unflushed_commits(), 1);
        assert!(!server.handled().contains("ns.clicks/1a:e1"));
    }
}
