//! Rate-limited work queue with per-item exponential backoff
//!
//! Items are handed to a pool of workers. A failed item is put back after a
//! delay that doubles with every failed attempt ([`RetryPolicy::queue`]),
//! and every requeue also waits on a shared token bucket so a burst of
//! failures cannot hammer the backing services.
//!
//! ```text
//!   add ──► inbox ──► worker ──► handler ──► ok: done
//!             ▲                     │
//!             └── backoff + bucket ◄┘ err: requeue (attempt + 1)
//! ```
//!
//! Shutting down is draining: once the worker pool's token fires, workers
//! keep pulling until the inbox is empty, then the queue is closed and any
//! still-delayed retries are dropped.

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use kestrel_core::retry::RetryPolicy;
use kestrel_core::{Error, ErrorKind, Result};
use std::fmt::Debug;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Overall requeue rate shared by every item of a queue
pub const REQUEUE_PER_SECOND: u32 = 10;
pub const REQUEUE_BURST: u32 = 100;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Processes one queued item
#[async_trait]
pub trait QueueHandler<T>: Send + Sync {
    async fn handle(&self, item: &T) -> Result<()>;
}

#[derive(Debug)]
struct Entry<T> {
    item: T,
    attempt: usize,
}

/// Sending half of the queue; cheap to clone into delayed tasks
struct Inbox<T> {
    tx: mpsc::UnboundedSender<Entry<T>>,
    len: Arc<AtomicUsize>,
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            len: self.len.clone(),
        }
    }
}

impl<T> Inbox<T> {
    fn push(&self, entry: Entry<T>) -> bool {
        self.len.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(entry).is_err() {
            self.len.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }
}

pub struct WorkQueue<T> {
    name: &'static str,
    inbox: Inbox<T>,
    rx: Mutex<mpsc::UnboundedReceiver<Entry<T>>>,
    limiter: Arc<Limiter>,
    backoff: RetryPolicy,
    closed: CancellationToken,
}

impl<T> WorkQueue<T>
where
    T: Debug + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self::with_backoff(name, RetryPolicy::queue())
    }

    pub fn with_backoff(name: &'static str, backoff: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let quota = Quota::per_second(NonZeroU32::new(REQUEUE_PER_SECOND).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(REQUEUE_BURST).unwrap_or(NonZeroU32::MIN));
        Self {
            name,
            inbox: Inbox {
                tx,
                len: Arc::new(AtomicUsize::new(0)),
            },
            rx: Mutex::new(rx),
            limiter: Arc::new(RateLimiter::direct(quota)),
            backoff,
            closed: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Items ready to be processed; delayed retries are not counted
    pub fn len(&self) -> usize {
        self.inbox.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Enqueues an item for immediate processing
    pub fn add(&self, item: T) -> Result<()> {
        if self.is_closed() || !self.inbox.push(Entry { item, attempt: 0 }) {
            return Err(Error::internal(format!("queue {} is shut down", self.name)));
        }
        Ok(())
    }

    /// Enqueues an item once `delay` has passed
    pub fn add_after(&self, item: T, delay: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::internal(format!("queue {} is shut down", self.name)));
        }
        self.schedule(Entry { item, attempt: 0 }, delay, false);
        Ok(())
    }

    fn requeue(&self, entry: Entry<T>) {
        let delay = self.backoff.backoff_delay(entry.attempt.saturating_sub(1));
        self.schedule(entry, delay, true);
    }

    fn schedule(&self, entry: Entry<T>, delay: Duration, rate_limited: bool) {
        let inbox = self.inbox.clone();
        let limiter = self.limiter.clone();
        let closed = self.closed.clone();
        let name = self.name;
        tokio::spawn(async move {
            let wait = async {
                tokio::time::sleep(delay).await;
                if rate_limited {
                    limiter.until_ready().await;
                }
            };
            tokio::select! {
                _ = closed.cancelled() => debug!(queue = name, item = ?entry.item, "queue closed, dropping delayed item"),
                _ = wait => {
                    inbox.push(entry);
                }
            }
        });
    }

    /// Closes the queue; delayed items are dropped and further adds fail
    pub fn shut_down(&self) {
        self.closed.cancel();
    }

    /// Waits for the next item; after `stop` fires only already queued items are returned
    async fn next(&self, stop: &CancellationToken) -> Option<Entry<T>> {
        let mut rx = self.rx.lock().await;
        let entry = tokio::select! {
            biased;
            entry = rx.recv() => entry,
            _ = stop.cancelled() => rx.try_recv().ok(),
        };
        if entry.is_some() {
            self.inbox.len.fetch_sub(1, Ordering::SeqCst);
        }
        entry
    }

    async fn try_next(&self) -> Option<Entry<T>> {
        let entry = self.rx.lock().await.try_recv().ok();
        if entry.is_some() {
            self.inbox.len.fetch_sub(1, Ordering::SeqCst);
        }
        entry
    }

    async fn dispatch(&self, mut entry: Entry<T>, handler: &dyn QueueHandler<T>) {
        let Err(error) = handler.handle(&entry.item).await else {
            return;
        };
        if error.kind() == ErrorKind::InvalidPipelineContext {
            warn!(queue = self.name, item = ?entry.item, %error, "dropping irrecoverable item");
            return;
        }
        if self.is_closed() {
            warn!(queue = self.name, item = ?entry.item, %error, "failed to process, queue closed, dropping item");
            return;
        }
        entry.attempt += 1;
        warn!(
            queue = self.name,
            item = ?entry.item,
            attempt = entry.attempt,
            %error,
            "failed to process, requeuing item"
        );
        self.requeue(entry);
    }

    /// Processes one item, waiting for it if needed
    ///
    /// Returns false once `stop` has fired and nothing is left to drain.
    pub async fn process_next(&self, handler: &dyn QueueHandler<T>, stop: &CancellationToken) -> bool {
        match self.next(stop).await {
            Some(entry) => {
                self.dispatch(entry, handler).await;
                true
            }
            None => false,
        }
    }

    /// Processes one item if one is ready; false when the queue is drained
    pub async fn process_ready(&self, handler: &dyn QueueHandler<T>) -> bool {
        match self.try_next().await {
            Some(entry) => {
                self.dispatch(entry, handler).await;
                true
            }
            None => false,
        }
    }

    /// Runs `workers` workers until `cancel` fires, drains, then closes the queue
    pub async fn run(self: Arc<Self>, handler: Arc<dyn QueueHandler<T>>, workers: usize, cancel: CancellationToken) {
        let mut pool = JoinSet::new();
        for _ in 0..workers.max(1) {
            let queue = self.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            pool.spawn(async move { while queue.process_next(handler.as_ref(), &cancel).await {} });
        }

        cancel.cancelled().await;
        info!(queue = self.name, pending = self.len(), "shutdown signal received, waiting for all workers to finish");
        while pool.join_next().await.is_some() {}
        self.shut_down();
        info!(queue = self.name, "all workers finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: usize::MAX,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Fails each item `failures` times before accepting it
    struct Flaky {
        failures: usize,
        seen: StdMutex<Vec<u32>>,
        error: fn() -> Error,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                seen: StdMutex::new(Vec::new()),
                error: || Error::notifier("bus down"),
            }
        }

        fn seen(&self) -> Vec<u32> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueueHandler<u32> for Flaky {
        async fn handle(&self, item: &u32) -> Result<()> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(*item);
            if seen.iter().filter(|i| *i == item).count() <= self.failures {
                return Err((self.error)());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_items_are_retried() {
        let queue = Arc::new(WorkQueue::with_backoff("test", fast()));
        let handler = Arc::new(Flaky::new(2));
        let cancel = CancellationToken::new();

        queue.add(7).unwrap();
        let run = tokio::spawn(queue.clone().run(handler.clone(), 2, cancel.clone()));

        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.seen().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        run.await.unwrap();
        assert_eq!(handler.seen(), vec![7, 7, 7]);
    }

    #[tokio::test]
    async fn test_irrecoverable_items_are_dropped() {
        let queue = WorkQueue::with_backoff("test", fast());
        let handler = Flaky {
            failures: usize::MAX,
            seen: StdMutex::new(Vec::new()),
            error: || Error::InvalidPipelineContext("missing bucket".into()),
        };

        queue.add(1).unwrap();
        assert!(queue.process_ready(&handler).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queue.process_ready(&handler).await);
        assert_eq!(handler.seen(), vec![1]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_items() {
        let queue = Arc::new(WorkQueue::with_backoff("test", fast()));
        let handler = Arc::new(Flaky::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        for i in 0..10 {
            queue.add(i).unwrap();
        }
        queue.clone().run(handler.clone(), 3, cancel).await;

        let mut seen = handler.seen();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert!(queue.add(11).is_err());
    }

    #[tokio::test]
    async fn test_add_after_delays_item() {
        let queue = WorkQueue::with_backoff("test", fast());
        let handler = Flaky::new(0);

        queue.add_after(5, Duration::from_millis(30)).unwrap();
        assert!(!queue.process_ready(&handler).await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.len(), 1);
        assert!(queue.process_ready(&handler).await);
        assert_eq!(handler.seen(), vec![5]);
    }

    #[tokio::test]
    async fn test_delayed_items_dropped_on_close() {
        let queue = WorkQueue::with_backoff("test", fast());
        queue.add_after(5, Duration::from_millis(20)).unwrap();
        queue.shut_down();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(queue.is_empty());
    }
}
