//! In-memory coordination store for tests and single-node runs.
//!
//! Mirrors the Redis-backed store's observable behavior: per-key expiry
//! (checked lazily on access), `*` glob scans, and FIFO topic delivery to
//! live subscribers only.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::{CoordinationStore, Subscription};
use crate::error::{ControlError, ControlResult};

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Coordination store backed by process-local maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: Mutex<HashMap<String, Entry>>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries and return a guard over the live keyspace.
    fn live_keys(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        let now = Instant::now();
        let mut keys = self.keys.lock().expect("keyspace lock poisoned");
        keys.retain(|_, entry| !entry.is_expired(now));
        keys
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock().expect("topic lock poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> ControlResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> ControlResult<Option<String>> {
        Ok(self.live_keys().get(key).map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> ControlResult<bool> {
        let mut keys = self.live_keys();
        if only_if_absent && keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> ControlResult<u64> {
        Ok(u64::from(self.live_keys().remove(key).is_some()))
    }

    async fn exists(&self, key: &str) -> ControlResult<bool> {
        Ok(self.live_keys().contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ControlResult<bool> {
        let mut keys = self.live_keys();
        match keys.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan(&self, pattern: &str) -> ControlResult<Vec<String>> {
        Ok(self
            .live_keys()
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    async fn incr(&self, key: &str) -> ControlResult<i64> {
        self.add(key, 1)
    }

    async fn decr(&self, key: &str) -> ControlResult<i64> {
        self.add(key, -1)
    }

    async fn publish(&self, topic: &str, message: &str) -> ControlResult<u64> {
        let sender = self.topic_sender(topic);
        let delivered = sender.receiver_count() as u64;
        if delivered > 0 {
            // Send only fails with zero receivers, which we already checked.
            let _ = sender.send(message.to_string());
        }
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> ControlResult<Subscription> {
        let source = self.topic_sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(TOPIC_CAPACITY);
        let forwarder = tokio::spawn(async move {
            let mut messages = BroadcastStream::new(source);
            while let Some(item) = messages.next().await {
                match item {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscription lagged, messages dropped");
                    }
                }
            }
        });
        Ok(Subscription::new(rx, forwarder))
    }

    async fn close(&self) {
        tracing::debug!("memory coordination store closed");
    }
}

impl MemoryStore {
    fn add(&self, key: &str, delta: i64) -> ControlResult<i64> {
        let mut keys = self.live_keys();
        let entry = keys.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = entry.value.parse().map_err(|_| {
            ControlError::StoreUnavailable(format!("key {key} holds a non-integer value"))
        })?;
        let next = current + delta;
        entry.value = next.to_string();
        Ok(next)
    }
}

/// Match `text` against a glob `pattern` where `*` matches any (possibly
/// empty) substring. The only metacharacter the key scheme uses.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = match text.strip_prefix(parts[0]) {
        Some(_) => parts[0].len(),
        None => return false,
    };
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }

    let last = parts[parts.len() - 1];
    last.is_empty() || (text.len() >= pos + last.len() && text[pos..].ends_with(last))
}
