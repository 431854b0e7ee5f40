//! Notification bus contract
//!
//! A [`Notifier`] carries one kind of [`Notification`] between processes.
//! Delivery is at-least-once with no ordering guarantee, so subscribers must
//! be idempotent. Publishing a message that fails
//! [`Notification::validate`] is an error.

use crate::error::Result;
use crate::notification::Notification;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Notifier<T: Notification>: Send + Sync {
    /// Publishes a notification
    async fn notify(&self, notification: T) -> Result<()>;

    /// Opens a subscription; the receiver closes when `cancel` fires or the
    /// underlying connection is lost
    async fn subscribe(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<T>>;

    /// Provider name, for logs
    fn provider(&self) -> &'static str;
}
