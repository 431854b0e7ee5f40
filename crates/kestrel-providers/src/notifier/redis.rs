//! Redis pub/sub notifier
//!
//! Notifications are JSON-encoded and published on
//! `_kestrel:notification:{KIND}`. Redis pub/sub is fire-and-forget, so a
//! publish that reaches no subscriber is reported as an error and left to
//! the caller's retry policy.

use super::channel_name;
use async_trait::async_trait;
use futures::StreamExt;
use kestrel_core::{Error, Notification, Notifier, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::Deserialize;
use std::marker::PhantomData;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisNotifierConfig {
    pub url: String,
}

impl Default for RedisNotifierConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

pub struct RedisNotifier<T: Notification> {
    client: Client,
    conn: ConnectionManager,
    channel: String,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Notification> RedisNotifier<T> {
    pub async fn new(config: RedisNotifierConfig) -> Result<Self> {
        let client = Client::open(config.url.clone()).map_err(|e| Error::config(format!("redis url: {}", e)))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::notifier(format!("redis connection manager error: {}", e)))?;
        Ok(Self {
            client,
            conn,
            channel: channel_name::<T>(),
            _kind: PhantomData,
        })
    }
}

#[async_trait]
impl<T: Notification> Notifier<T> for RedisNotifier<T> {
    async fn notify(&self, notification: T) -> Result<()> {
        notification.validate()?;
        let payload = serde_json::to_string(&notification)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| Error::notifier(format!("redis PUBLISH error: {}", e)))?;
        if receivers == 0 {
            return Err(Error::notifier(format!("{}: no subscriber available", T::KIND)));
        }
        Ok(())
    }

    async fn subscribe(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<T>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::notifier(format!("redis pubsub connection error: {}", e)))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| Error::notifier(format!("redis SUBSCRIBE error: {}", e)))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = messages.next() => msg,
                };
                let Some(msg) = msg else {
                    tracing::warn!(channel = %channel, "redis subscription closed");
                    break;
                };
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!(channel = %channel, error = %e, "unreadable notification payload");
                        continue;
                    }
                };
                match serde_json::from_str::<T>(&payload) {
                    Ok(n) => {
                        if tx.send(n).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(channel = %channel, error = %e, "failed to decode notification");
                    }
                }
            }
        });

        tracing::info!(channel = %self.channel, "subscribed to redis notifications");
        Ok(rx)
    }

    fn provider(&self) -> &'static str {
        "redis"
    }
}
