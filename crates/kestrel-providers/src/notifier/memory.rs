//! In-process notifier over a tokio broadcast channel
//!
//! Every subscriber gets a copy of every notification. A subscriber that
//! lags behind the channel capacity loses the oldest messages; the loss is
//! logged and the subscription carries on.

use async_trait::async_trait;
use kestrel_core::{Error, Notification, Notifier, Result};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct MemoryNotifier<T: Notification> {
    tx: broadcast::Sender<T>,
}

impl<T: Notification> Default for MemoryNotifier<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T: Notification> MemoryNotifier<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl<T: Notification> Notifier<T> for MemoryNotifier<T> {
    async fn notify(&self, notification: T) -> Result<()> {
        notification.validate()?;
        self.tx
            .send(notification)
            .map(|_| ())
            .map_err(|_| Error::notifier(format!("{}: no subscriber available", T::KIND)))
    }

    async fn subscribe(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<T>> {
        let mut rx = self.tx.subscribe();
        let (out, ret) = mpsc::channel(DEFAULT_CAPACITY);
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => msg,
                };
                match msg {
                    Ok(n) => {
                        if out.send(n).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(kind = T::KIND, missed, "memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(ret)
    }

    fn provider(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{CollectNotification, Payload, Value, WriteNotification};

    #[tokio::test]
    async fn test_notify_without_subscriber_fails() {
        let n = MemoryNotifier::<CollectNotification>::default();
        let err = n.notify(CollectNotification::new("ns.a", "e1", "")).await.unwrap_err();
        assert!(err.to_string().contains("no subscriber available"));
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let n = MemoryNotifier::<CollectNotification>::default();
        let cancel = CancellationToken::new();
        let mut a = n.subscribe(cancel.clone()).await.unwrap();
        let mut b = n.subscribe(cancel.clone()).await.unwrap();

        let msg = CollectNotification::new("ns.a", "e1", "");
        n.notify(msg.clone()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), msg);
        assert_eq!(b.recv().await.unwrap(), msg);

        cancel.cancel();
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_notification_rejected() {
        let n = MemoryNotifier::<WriteNotification>::default();
        let _rx = n.subscribe(CancellationToken::new()).await.unwrap();
        let mut wn = WriteNotification::new("ns.a", "e1", Value::new(Payload::from(1i64), chrono::Utc::now()));
        wn.value = None;
        assert!(n.notify(wn).await.is_err());
    }
}
