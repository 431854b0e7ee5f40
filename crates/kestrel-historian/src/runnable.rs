//! Starts runnables, gating the leader-only ones on an election

use futures::future::join_all;
use kestrel_core::{Error, LeaderElector, Result, Runnable};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Manager {
    runnables: Vec<Arc<dyn Runnable>>,
    elector: Arc<dyn LeaderElector>,
}

impl Manager {
    pub fn new(elector: Arc<dyn LeaderElector>) -> Self {
        Self {
            runnables: Vec::new(),
            elector,
        }
    }

    pub fn add(&mut self, runnable: Arc<dyn Runnable>) {
        self.runnables.push(runnable);
    }

    pub fn extend(&mut self, runnables: impl IntoIterator<Item = Arc<dyn Runnable>>) {
        self.runnables.extend(runnables);
    }

    /// Runs everything until `cancel` fires
    ///
    /// Runnables that do not need leadership start right away; the others
    /// start once the elector grants it. Losing leadership or a failing
    /// runnable cancels the rest and is returned as an error.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let (leaders, others): (Vec<_>, Vec<_>) = self.runnables.iter().cloned().partition(|r| r.needs_leader());

        let mut tasks = JoinSet::new();
        for runnable in others {
            let token = cancel.child_token();
            tasks.spawn(async move { run_one(runnable, token).await });
        }
        if !leaders.is_empty() {
            let elector = self.elector.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { lead(elector, leaders, cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| Error::internal(format!("runnable task failed: {}", e))).and_then(|r| r);
            if let Err(e) = result {
                error!(error = %e, "stopping all runnables");
                cancel.cancel();
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn run_one(runnable: Arc<dyn Runnable>, cancel: CancellationToken) -> Result<()> {
    info!(runnable = runnable.name(), leader_only = runnable.needs_leader(), "starting runnable");
    let result = runnable.run(cancel).await;
    match &result {
        Ok(()) => info!(runnable = runnable.name(), "runnable stopped"),
        Err(e) => error!(runnable = runnable.name(), error = %e, "runnable failed"),
    }
    result
}

async fn lead(elector: Arc<dyn LeaderElector>, runnables: Vec<Arc<dyn Runnable>>, cancel: CancellationToken) -> Result<()> {
    let Some(lease) = elector.acquire(cancel.clone()).await? else {
        return Ok(());
    };
    info!(runnables = runnables.len(), "leadership acquired");

    let results = join_all(runnables.into_iter().map(|r| {
        let lease = lease.clone();
        async move {
            let result = run_one(r, lease.clone()).await;
            if result.is_err() {
                lease.cancel();
            }
            result
        }
    }))
    .await;
    results.into_iter().collect::<Result<Vec<()>>>()?;

    if !cancel.is_cancelled() {
        return Err(Error::internal("leadership lost"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kestrel_core::AlwaysLeader;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Probe {
        leader: bool,
        started: AtomicBool,
        fail: bool,
    }

    impl Probe {
        fn new(leader: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                leader,
                started: AtomicBool::new(false),
                fail,
            })
        }
    }

    #[async_trait]
    impl Runnable for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn needs_leader(&self) -> bool {
            self.leader
        }

        async fn run(&self, cancel: CancellationToken) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            if self.fail {
                return Err(Error::internal("boom"));
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    /// Never grants leadership
    struct Follower;

    #[async_trait]
    impl LeaderElector for Follower {
        async fn acquire(&self, cancel: CancellationToken) -> Result<Option<CancellationToken>> {
            cancel.cancelled().await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_leader_runnables_wait_for_election() {
        let plain = Probe::new(false, false);
        let leader = Probe::new(true, false);
        let mut manager = Manager::new(Arc::new(Follower));
        manager.extend([plain.clone() as Arc<dyn Runnable>, leader.clone() as Arc<dyn Runnable>]);

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });
        manager.start(cancel).await.unwrap();

        assert!(plain.started.load(Ordering::SeqCst));
        assert!(!leader.started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_stops_everything() {
        let healthy = Probe::new(true, false);
        let mut manager = Manager::new(Arc::new(AlwaysLeader));
        manager.add(healthy.clone());
        manager.add(Probe::new(false, true));

        let err = tokio::time::timeout(Duration::from_secs(1), manager.start(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
