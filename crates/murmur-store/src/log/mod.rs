//! Replicated log contract.
//!
//! A log is append-only, multi-writer and eventually consistent. Every log
//! kind (channel, certificate, directory, thread) goes through the same
//! [`LogHandle`] interface; what differs is the [`AccessPolicy`] passed at
//! open time.
//!
//! Entries are content addressed: the hash covers the writing replica, its
//! logical clock and the payload, so merging an entry twice is a no-op.
//! Two distinct entries carrying the same *logical* id are both kept; the
//! registries deduplicate on top.

pub mod hub;
pub mod replica;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::gate::AccessGate;

pub use hub::ReplicationHub;
pub use replica::{LocalSubstrate, ReplicaLog};

/// Lifecycle signals raised by a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    /// The local replica finished loading.
    Ready,
    /// A local append completed.
    Write,
    /// Entries from a peer were merged.
    Replicated,
}

/// One admitted entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub hash: String,
    /// Replica id of the writer.
    pub origin: String,
    pub clock: u64,
    pub payload: Value,
}

impl LogEntry {
    pub fn new(origin: &str, clock: u64, payload: Value) -> Self {
        Self {
            hash: content_hash(origin, clock, &payload),
            origin: origin.to_string(),
            clock,
            payload,
        }
    }

    /// Whether `hash` matches the entry's content.
    pub fn is_intact(&self) -> bool {
        self.hash == content_hash(&self.origin, self.clock, &self.payload)
    }
}

fn content_hash(origin: &str, clock: u64, payload: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(origin.as_bytes());
    hasher.update(&[0]);
    hasher.update(&clock.to_le_bytes());
    hasher.update(payload.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Result of a local append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Admitted,
    /// Refused by the access gate. Not an error.
    Rejected,
}

pub type LogListener = Arc<dyn Fn(LogEvent) + Send + Sync>;

/// Admission policy of a log.
#[derive(Clone)]
pub enum AccessPolicy {
    /// Any entry is admitted.
    Open,
    /// Entries are admitted only if the gate accepts them.
    Gated(Arc<dyn AccessGate>),
}

impl fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("Open"),
            Self::Gated(_) => f.write_str("Gated"),
        }
    }
}

impl AccessPolicy {
    pub async fn admits(&self, payload: &Value) -> bool {
        match self {
            Self::Open => true,
            Self::Gated(gate) => gate.can_append(payload).await,
        }
    }
}

/// Handle to one replicated log.
#[async_trait]
pub trait LogHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Load the local replica and pull from peers, bounded by `timeout`.
    ///
    /// On timeout the log stays usable with local data only.
    async fn load(&self, timeout: Duration) -> Result<()>;

    async fn append(&self, payload: Value) -> Result<AppendOutcome>;

    /// Ingest entries received from a peer. Returns how many were admitted.
    async fn merge(&self, entries: Vec<LogEntry>) -> Result<usize>;

    /// Admitted entries in local order.
    fn entries(&self) -> Vec<LogEntry>;

    fn on(&self, listener: LogListener);

    fn listener_count(&self) -> usize;

    async fn close(&self) -> Result<()>;
}

/// Provider of replicated logs for one community.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Open (or return the already open) log called `name`.
    async fn open_log(&self, name: &str, policy: AccessPolicy) -> Result<Arc<dyn LogHandle>>;

    async fn open_map(&self, name: &str, policy: AccessPolicy) -> Result<ReplicatedMap> {
        let log = self.open_log(name, policy).await?;
        Ok(ReplicatedMap::new(log))
    }

    async fn stop(&self) -> Result<()>;
}

/// A replicated key/value map built on a log of put operations.
///
/// Values are immutable: the first put of a key in local order wins.
#[derive(Clone)]
pub struct ReplicatedMap {
    log: Arc<dyn LogHandle>,
}

impl ReplicatedMap {
    pub fn new(log: Arc<dyn LogHandle>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<dyn LogHandle> {
        &self.log
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<AppendOutcome> {
        self.log.append(json!({ "key": key, "value": value })).await
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.log
            .entries()
            .into_iter()
            .find_map(|entry| decode_put(entry.payload).filter(|(k, _)| k == key))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Materialized `(key, value)` pairs in first-put order.
    pub fn all(&self) -> Vec<(String, Value)> {
        let mut seen = std::collections::HashSet::new();
        self.log
            .entries()
            .into_iter()
            .filter_map(|entry| decode_put(entry.payload))
            .filter(|(key, _)| seen.insert(key.clone()))
            .collect()
    }
}

fn decode_put(payload: Value) -> Option<(String, Value)> {
    match payload {
        Value::Object(mut obj) => {
            let key = obj.remove("key")?.as_str()?.to_string();
            let value = obj.remove("value")?;
            Some((key, value))
        }
        _ => None,
    }
}

/// Opens and loads logs of one kind; cloneable so init tasks can carry it.
#[derive(Clone)]
pub struct LogOpener {
    substrate: Arc<dyn Substrate>,
    policy: AccessPolicy,
    timeout: Duration,
}

impl LogOpener {
    pub fn new(substrate: Arc<dyn Substrate>, policy: AccessPolicy, timeout: Duration) -> Self {
        Self {
            substrate,
            policy,
            timeout,
        }
    }

    pub async fn open(&self, name: &str) -> Result<Arc<dyn LogHandle>> {
        let log = self.substrate.open_log(name, self.policy.clone()).await?;
        log.load(self.timeout).await?;
        Ok(log)
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_hash_covers_content() {
        let a = LogEntry::new("r1", 1, json!({"id": "m1"}));
        let b = LogEntry::new("r2", 1, json!({"id": "m1"}));
        let c = LogEntry::new("r1", 2, json!({"id": "m1"}));
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert_eq!(a.hash, LogEntry::new("r1", 1, json!({"id": "m1"})).hash);

        let mut tampered = a.clone();
        tampered.payload = json!({"id": "m2"});
        assert!(a.is_intact());
        assert!(!tampered.is_intact());
    }

    #[tokio::test]
    async fn test_map_first_put_wins() {
        let substrate = LocalSubstrate::in_memory();
        let map = substrate.open_map("dir", AccessPolicy::Open).await.unwrap();

        map.put("general", json!("first")).await.unwrap();
        map.put("random", json!("other")).await.unwrap();
        map.put("general", json!("second")).await.unwrap();

        assert_eq!(map.get("general"), Some(json!("first")));
        assert!(map.contains("random"));
        assert!(!map.contains("missing"));
        let keys: Vec<_> = map.all().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["general", "random"]);
    }
}
