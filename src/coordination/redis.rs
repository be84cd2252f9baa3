//! Redis-backed coordination store.
//!
//! The connection manager is built lazily, exactly once: the first caller
//! holds the initialization mutex across connect and liveness probe, so
//! concurrent initializers serialize and share the same pool. Pub/sub uses
//! a dedicated connection per subscription, torn down when the
//! [`Subscription`] is dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::{CoordinationStore, Subscription};
use crate::error::{ControlError, ControlResult};

const SUBSCRIPTION_BUFFER: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const SCAN_BATCH: usize = 100;

/// Connection settings for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(15),
        }
    }
}

/// Coordination store speaking to a Redis server.
pub struct RedisStore {
    client: redis::Client,
    settings: RedisSettings,
    manager: Mutex<Option<ConnectionManager>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.settings.url)
            .finish()
    }
}

fn store_err(err: redis::RedisError) -> ControlError {
    ControlError::StoreUnavailable(err.to_string())
}

impl RedisStore {
    /// Parse the URL and prepare a store. No connection is made until the
    /// first operation (or an explicit [`ping`](CoordinationStore::ping)).
    pub fn new(settings: RedisSettings) -> ControlResult<Self> {
        let client = redis::Client::open(settings.url.as_str()).map_err(store_err)?;
        Ok(Self {
            client,
            settings,
            manager: Mutex::new(None),
        })
    }

    /// Single-flight handle acquisition. The mutex is held across connect
    /// and probe so only one connection pool is ever built.
    async fn handle(&self) -> ControlResult<ConnectionManager> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }

        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(self.settings.connect_timeout)
            .set_response_timeout(self.settings.response_timeout);
        let mut manager = self
            .client
            .get_connection_manager_with_config(config)
            .await
            .map_err(store_err)?;

        // Liveness probe before marking the handle ready.
        let ping_cmd = redis::cmd("PING");
        let probe = ping_cmd.query_async::<String>(&mut manager);
        match tokio::time::timeout(self.settings.response_timeout, probe).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(store_err(err)),
            Err(_) => {
                return Err(ControlError::StoreUnavailable(
                    "liveness probe timed out".to_string(),
                ));
            }
        }

        debug!(url = %self.settings.url, "coordination store connected");
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn ping(&self) -> ControlResult<()> {
        let mut conn = self.handle().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> ControlResult<Option<String>> {
        let mut conn = self.handle().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> ControlResult<bool> {
        let mut conn = self.handle().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        if only_if_absent {
            cmd.arg("NX");
        }
        // With NX the reply is nil when the key already exists.
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> ControlResult<u64> {
        let mut conn = self.handle().await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> ControlResult<bool> {
        let mut conn = self.handle().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ControlResult<bool> {
        let mut conn = self.handle().await?;
        let applied: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(applied)
    }

    async fn scan(&self, pattern: &str) -> ControlResult<Vec<String>> {
        let mut conn = self.handle().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn incr(&self, key: &str) -> ControlResult<i64> {
        let mut conn = self.handle().await?;
        let value: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> ControlResult<i64> {
        let mut conn = self.handle().await?;
        let value: i64 = redis::cmd("DECR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(value)
    }

    async fn publish(&self, topic: &str, message: &str) -> ControlResult<u64> {
        let mut conn = self.handle().await?;
        let delivered: u64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> ControlResult<Subscription> {
        let connect = self.client.get_async_pubsub();
        let mut pubsub = match tokio::time::timeout(self.settings.connect_timeout, connect).await {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(err)) => return Err(store_err(err)),
            Err(_) => {
                return Err(ControlError::StoreUnavailable(
                    "pub/sub connect timed out".to_string(),
                ));
            }
        };
        pubsub.subscribe(topic).await.map_err(store_err)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(rx, forwarder))
    }

    async fn close(&self) {
        match tokio::time::timeout(CLOSE_GRACE, self.manager.lock()).await {
            Ok(mut guard) => {
                if guard.take().is_some() {
                    debug!("coordination store connection released");
                }
            }
            Err(_) => {
                warn!("timed out waiting for coordination store shutdown");
            }
        }
    }
}
