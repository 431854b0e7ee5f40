//! Historian client: the engine-side end of the collect/write pipeline
//!
//! The engine hands notifications to the client through
//! [`NotificationSink`]; the call only enqueues. Worker pools then publish
//! them on the notifiers, retrying with backoff while the bus is down.

use crate::queue::{QueueHandler, WorkQueue};
use async_trait::async_trait;
use kestrel_core::{
    CollectNotification, Notification, NotificationSink, Notifier, Result, Runnable, WriteNotification,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorianClientConfig {
    pub collect_notif_workers: usize,
    pub write_notif_workers: usize,
}

impl Default for HistorianClientConfig {
    fn default() -> Self {
        Self {
            collect_notif_workers: 5,
            write_notif_workers: 5,
        }
    }
}

struct Publish<T: Notification> {
    notifier: Arc<dyn Notifier<T>>,
}

#[async_trait]
impl<T: Notification> QueueHandler<T> for Publish<T> {
    async fn handle(&self, item: &T) -> Result<()> {
        self.notifier.notify(item.clone()).await
    }
}

pub struct HistorianClient {
    config: HistorianClientConfig,
    collects: Arc<WorkQueue<CollectNotification>>,
    writes: Arc<WorkQueue<WriteNotification>>,
    collect_notifier: Arc<dyn Notifier<CollectNotification>>,
    write_notifier: Arc<dyn Notifier<WriteNotification>>,
}

impl HistorianClient {
    pub fn new(
        config: HistorianClientConfig,
        collect_notifier: Arc<dyn Notifier<CollectNotification>>,
        write_notifier: Arc<dyn Notifier<WriteNotification>>,
    ) -> Self {
        Self {
            config,
            collects: Arc::new(WorkQueue::new("pending-collects")),
            writes: Arc::new(WorkQueue::new("pending-writes")),
            collect_notifier,
            write_notifier,
        }
    }

    /// Notifications waiting to be published
    pub fn pending(&self) -> usize {
        self.collects.len() + self.writes.len()
    }
}

impl NotificationSink for HistorianClient {
    fn add_collect(&self, notification: CollectNotification) -> Result<()> {
        notification.validate()?;
        self.collects.add(notification)
    }

    fn add_write(&self, notification: WriteNotification) -> Result<()> {
        notification.validate()?;
        self.writes.add(notification)
    }
}

#[async_trait]
impl Runnable for HistorianClient {
    fn name(&self) -> &str {
        "historian-client"
    }

    fn needs_leader(&self) -> bool {
        false
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            collect_workers = self.config.collect_notif_workers,
            write_workers = self.config.write_notif_workers,
            "starting historian client"
        );
        let collects = self.collects.clone().run(
            Arc::new(Publish {
                notifier: self.collect_notifier.clone(),
            }),
            self.config.collect_notif_workers,
            cancel.clone(),
        );
        let writes = self.writes.clone().run(
            Arc::new(Publish {
                notifier: self.write_notifier.clone(),
            }),
            self.config.write_notif_workers,
            cancel,
        );
        tokio::join!(collects, writes);
        Ok(())
    }
}
