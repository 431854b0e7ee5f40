//! Feeds a notifier subscription into a work queue

use crate::queue::WorkQueue;
use kestrel_core::{Notification, Notifier};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Subscribes to `notifier` and adds every message to `queue` until `cancel` fires
///
/// A subscription that fails or closes is reopened after a short pause.
pub async fn pump<T: Notification>(notifier: Arc<dyn Notifier<T>>, queue: Arc<WorkQueue<T>>, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        match notifier.subscribe(cancel.child_token()).await {
            Ok(mut subscription) => loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = subscription.recv() => msg,
                };
                let Some(notification) = msg else {
                    warn!(kind = T::KIND, provider = notifier.provider(), "subscription closed");
                    break;
                };
                if let Err(e) = queue.add(notification) {
                    debug!(kind = T::KIND, error = %e, "dropping notification");
                    return;
                }
            },
            Err(e) => error!(kind = T::KIND, provider = notifier.provider(), error = %e, "failed to subscribe to notifications"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
        }
    }
}
