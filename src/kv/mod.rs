//! # KV — Queue Store Abstraction
//!
//! The ingestion queue lives in a key-value store exposing hash, list and
//! pub/sub primitives. Jobs and the worker pool only see [`KvStore`]; the
//! concrete store is chosen at startup.
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`RedisKv`] | production, `redis` connection manager |
//! | [`MemoryKv`] | tests and local dry runs |
//!
//! The shared handle is used concurrently by every runner. Blocking pops
//! take a connection of their own through [`KvStore::dedicated`] so an idle
//! runner never stalls the other runners' commands.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()>;

    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn hexists(&self, key: &str, field: &str) -> Result<bool>;

    async fn rpush(&self, key: &str, value: &str) -> Result<()>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Pop the head of the first non-empty list among `keys`, waiting up to
    /// `timeout`. Returns `(list, value)`.
    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>>;

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// A handle backed by its own connection, for blocking commands.
    async fn dedicated(&self) -> Result<Arc<dyn KvStore>>;
}
