//! Leader election over a Redis lease
//!
//! The leader holds `SET key <id> NX PX ttl` and renews it every third of
//! the TTL. A failed renewal (the key expired or another replica took it)
//! cancels the leadership token.

use async_trait::async_trait;
use kestrel_core::{Error, LeaderElector, Result};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const RENEW_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

static RENEW: LazyLock<Script> = LazyLock::new(|| Script::new(RENEW_LUA));
static RELEASE: LazyLock<Script> = LazyLock::new(|| Script::new(RELEASE_LUA));

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub url: String,
    pub key: String,
    #[serde(with = "kestrel_core::window::duration_str")]
    pub ttl: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key: "kestrel:leader".to_string(),
            ttl: Duration::from_secs(15),
        }
    }
}

pub struct RedisLeaseElector {
    conn: ConnectionManager,
    key: String,
    ttl: Duration,
    id: String,
}

impl RedisLeaseElector {
    pub async fn new(config: LeaseConfig) -> Result<Self> {
        let client = Client::open(config.url.clone()).map_err(|e| Error::config(format!("redis url: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::state(format!("redis connection manager error: {}", e)))?;
        Ok(Self {
            conn,
            key: config.key,
            ttl: config.ttl,
            id: Uuid::new_v4().to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    async fn try_acquire(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.id)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms())
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::state(format!("redis SET NX error: {}", e)))?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl LeaderElector for RedisLeaseElector {
    async fn acquire(&self, cancel: CancellationToken) -> Result<Option<CancellationToken>> {
        let period = self.ttl / 3;
        loop {
            match self.try_acquire().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "leader election attempt failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(period) => {}
            }
        }
        tracing::info!(id = %self.id, key = %self.key, "acquired leadership");

        let lease = cancel.child_token();
        let token = lease.clone();
        let mut conn = self.conn.clone();
        let (key, id, ttl_ms) = (self.key.clone(), self.id.clone(), self.ttl_ms());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let renewed: redis::RedisResult<i64> =
                    RENEW.key(&key).arg(&id).arg(ttl_ms).invoke_async(&mut conn).await;
                match renewed {
                    Ok(1) => {}
                    Ok(_) => {
                        tracing::error!(id = %id, "leadership lease lost");
                        token.cancel();
                        return;
                    }
                    Err(e) => {
                        tracing::error!(id = %id, error = %e, "leadership renewal failed");
                        token.cancel();
                        return;
                    }
                }
            }
            let released: redis::RedisResult<i64> = RELEASE.key(&key).arg(&id).invoke_async(&mut conn).await;
            if let Err(e) = released {
                tracing::warn!(error = %e, "failed to release leadership lease");
            }
        });
        Ok(Some(lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_config_default() {
        let c = LeaseConfig::default();
        assert_eq!(c.key, "kestrel:leader");
        assert_eq!(c.ttl, Duration::from_secs(15));
    }

    #[test]
    fn test_lease_config_from_yaml_style_json() {
        let c: LeaseConfig = serde_json::from_value(serde_json::json!({"ttl": "30s"})).unwrap();
        assert_eq!(c.ttl, Duration::from_secs(30));
        assert_eq!(c.url, "redis://localhost:6379");
    }
}
