//! In-process [`KvStore`] for tests and dry runs.
//!
//! Blocking pops wait on a [`Notify`] woken by every push. Published
//! messages are kept so tests can assert on acknowledgements.

use super::KvStore;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    hashes: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    lists: BTreeMap<String, VecDeque<String>>,
    published: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<Inner>>,
    pushed: Arc<Notify>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge the others.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Messages published so far, as `(channel, message)`.
    pub fn published(&self) -> Vec<(String, String)> {
        self.lock().published.clone()
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.lock()
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn hash(&self, key: &str) -> BTreeMap<String, Vec<u8>> {
        self.lock().hashes.get(key).cloned().unwrap_or_default()
    }

    fn try_pop(&self, keys: &[String]) -> Option<(String, String)> {
        let mut inner = self.lock();
        for key in keys {
            if let Some(value) = inner.lists.get_mut(key).and_then(|l| l.pop_front()) {
                return Some((key.clone(), value));
            }
        }
        None
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        if let Some(h) = self.lock().hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .map(|h| h.contains_key(field))
            .unwrap_or(false))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.lock().lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();
            if let Some(popped) = self.try_pop(keys) {
                return Ok(Some(popped));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.lock()
            .published
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn dedicated(&self) -> Result<Arc<dyn KvStore>> {
        Ok(Arc::new(self.clone()))
    }
}
