//! Shared coordination store: key/value with TTL plus topic pub/sub.
//!
//! This is the only communication channel between independent processes.
//! The pub/sub side is fire-and-forget: messages reach listeners that are
//! subscribed at the moment of publish, FIFO per topic, with no delivery
//! guarantee beyond that. The durable run record store, not this layer,
//! is the source of truth for run state.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ControlResult;

pub mod keys;
pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// The single cooperative-cancellation token published on control topics.
pub const STOP_SIGNAL: &str = "STOP";

/// Contract for the shared coordination store.
///
/// Every operation fails with [`ControlError::StoreUnavailable`] when the
/// store is unreachable; callers decide per operation whether that is fatal
/// (surfaced) or not (admission control fails open, cleanup paths log and
/// swallow).
///
/// [`ControlError::StoreUnavailable`]: crate::error::ControlError::StoreUnavailable
#[async_trait]
pub trait CoordinationStore: Send + Sync + std::fmt::Debug {
    /// Liveness probe against the underlying store.
    async fn ping(&self) -> ControlResult<()>;

    async fn get(&self, key: &str) -> ControlResult<Option<String>>;

    /// Set a key. Returns `false` when `only_if_absent` is requested and
    /// the key already exists.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> ControlResult<bool>;

    /// Delete a key, returning the number of keys removed.
    async fn delete(&self, key: &str) -> ControlResult<u64>;

    async fn exists(&self, key: &str) -> ControlResult<bool>;

    /// Set or refresh a key's TTL. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> ControlResult<bool>;

    /// Enumerate keys matching a `*` glob pattern.
    ///
    /// O(keyspace) on every backend; reserved for the stop/cleanup paths,
    /// never per-request hot paths.
    async fn scan(&self, pattern: &str) -> ControlResult<Vec<String>>;

    async fn incr(&self, key: &str) -> ControlResult<i64>;

    async fn decr(&self, key: &str) -> ControlResult<i64>;

    /// Publish a message to a topic, returning the number of subscribers
    /// that received it.
    async fn publish(&self, topic: &str, message: &str) -> ControlResult<u64>;

    /// Subscribe to a topic. The returned [`Subscription`] is a cancellable,
    /// non-terminating sequence; dropping it unsubscribes.
    async fn subscribe(&self, topic: &str) -> ControlResult<Subscription>;

    /// Best-effort graceful shutdown. Failures are logged, not raised,
    /// because shutdown must always proceed.
    async fn close(&self);
}

/// A live subscription to a coordination topic.
///
/// Messages arrive in publish order. Dropping the subscription aborts the
/// background forwarder and releases the underlying connection.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<String>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<String>, forwarder: JoinHandle<()>) -> Self {
        Self { rx, forwarder }
    }

    /// Await the next message. Returns `None` if the publishing side of the
    /// store went away.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking poll for a pending message.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
