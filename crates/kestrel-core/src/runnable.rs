//! Long-running process components
//!
//! Every background loop (queue workers, subscribers, servers) is a
//! [`Runnable`]. Some of them must only run on one replica of the cluster;
//! those report `needs_leader() == true` and are started once a
//! [`LeaderElector`] grants leadership.

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    /// Only the elected leader runs this component
    fn needs_leader(&self) -> bool;

    /// Runs until `cancel` fires; must block until fully stopped
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Waits until this process holds leadership
    ///
    /// The returned token is cancelled when leadership is lost. Returns
    /// `Ok(None)` if `cancel` fired first.
    async fn acquire(&self, cancel: CancellationToken) -> Result<Option<CancellationToken>>;
}

/// Single-replica deployments: this process is always the leader
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysLeader;

#[async_trait]
impl LeaderElector for AlwaysLeader {
    async fn acquire(&self, cancel: CancellationToken) -> Result<Option<CancellationToken>> {
        Ok(Some(cancel.child_token()))
    }
}
