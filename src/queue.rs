//! # Queue — Pending-Dedup Work Queue
//!
//! Each work kind owns a set of keys in the KV store:
//!
//! | Key | Type | Content |
//! |-----|------|---------|
//! | `<kind>DataH` | hash | work key → latest raw payload |
//! | `<kind>PendingH` | hash | work key → pending marker |
//! | `<kind>Q` | list | queued work keys |
//! | `<kind>ChangesH` | hash | work key → space-joined change tokens |
//! | `<kind>Processed` | channel | work keys acknowledged after processing |
//!
//! A work key is queued at most once while its pending marker is set. The
//! worker drops the marker when the job *starts*, so a post arriving during
//! processing queues a fresh run, and a failed job leaves nothing behind.
//!
//! ## Race
//!
//! The pending check and the marker write are two round trips, not one
//! atomic conditional set. Two producers posting the same key at the same
//! instant can both enqueue it. The duplicate run is harmless: the
//! transition log only extends or appends.

use crate::kv::KvStore;
use anyhow::{Context, Result};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub kind: String,
    pub data: String,
    pub pending: String,
    pub queue: String,
    pub changes: String,
    pub processed: String,
}

impl QueueKeys {
    pub fn for_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            data: format!("{}DataH", kind),
            pending: format!("{}PendingH", kind),
            queue: format!("{}Q", kind),
            changes: format!("{}ChangesH", kind),
            processed: format!("{}Processed", kind),
        }
    }

    /// Recover the kind from a queue list name (`daemonStatusQ` → `daemonStatus`).
    pub fn kind_of_queue(queue: &str) -> Option<&str> {
        queue.strip_suffix('Q').filter(|k| !k.is_empty())
    }
}

/// Push `value` onto `queue_key` unless it is already pending.
/// Returns true when pushed.
pub async fn enqueue_if_absent(
    kv: &dyn KvStore,
    pending_key: &str,
    queue_key: &str,
    value: &str,
) -> Result<bool> {
    if kv.hexists(pending_key, value).await? {
        return Ok(false);
    }
    kv.hset(pending_key, value, value.as_bytes()).await?;
    kv.rpush(queue_key, value).await?;
    Ok(true)
}

pub async fn drop_pending(kv: &dyn KvStore, pending_key: &str, value: &str) -> Result<()> {
    kv.hdel(pending_key, value).await
}

/// Ingress side: store the payload (last write wins), merge change tokens,
/// then queue the work key.
pub async fn post(
    kv: &dyn KvStore,
    keys: &QueueKeys,
    work_key: &str,
    payload: &[u8],
    changes: &[String],
) -> Result<bool> {
    kv.hset(&keys.data, work_key, payload)
        .await
        .context("storing payload")?;
    if !changes.is_empty() {
        let previous = kv.hget(&keys.changes, work_key).await?;
        let previous = previous
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        let merged = merge_changes(&previous, changes);
        kv.hset(&keys.changes, work_key, merged.as_bytes()).await?;
    }
    enqueue_if_absent(kv, &keys.pending, &keys.queue, work_key).await
}

/// Sorted, space-joined union of existing and new change tokens.
pub fn merge_changes(existing: &str, new: &[String]) -> String {
    existing
        .split_whitespace()
        .map(str::to_string)
        .chain(new.iter().flat_map(|c| c.split_whitespace().map(str::to_string)))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read and clear the merged change tokens of a work key.
pub async fn take_changes(kv: &dyn KvStore, keys: &QueueKeys, work_key: &str) -> Result<Vec<String>> {
    let Some(raw) = kv.hget(&keys.changes, work_key).await? else {
        return Ok(Vec::new());
    };
    kv.hdel(&keys.changes, work_key).await?;
    Ok(String::from_utf8_lossy(&raw)
        .split_whitespace()
        .map(str::to_string)
        .collect())
}

pub async fn fetch_payload(kv: &dyn KvStore, keys: &QueueKeys, work_key: &str) -> Result<Option<Vec<u8>>> {
    kv.hget(&keys.data, work_key).await
}
