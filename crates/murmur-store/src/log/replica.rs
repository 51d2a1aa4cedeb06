//! In-process log substrate.
//!
//! Each [`LocalSubstrate`] is one replica: it keeps its logs in memory,
//! optionally persists admitted entries to SQLite, and optionally joins a
//! [`ReplicationHub`] to exchange entries with other replicas.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::hub::ReplicationHub;
use super::{lock, AccessPolicy, AppendOutcome, LogEntry, LogEvent, LogHandle, LogListener, Substrate};
use crate::database::Database;
use crate::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// Substrate
// ---------------------------------------------------------------------------

pub struct LocalSubstrate {
    replica_id: String,
    db: Option<Arc<Mutex<Database>>>,
    hub: Option<Arc<ReplicationHub>>,
    state: Mutex<SubstrateState>,
}

#[derive(Default)]
struct SubstrateState {
    logs: HashMap<String, Arc<ReplicaLog>>,
    stopped: bool,
}

impl LocalSubstrate {
    /// A volatile replica with a fresh id.
    pub fn in_memory() -> Self {
        Self::with_parts(uuid::Uuid::new_v4().to_string(), None)
    }

    /// A replica persisted under `dir`, keeping its id across restarts.
    pub fn open(dir: &Path) -> Result<Self> {
        let db = Database::open_in_dir(dir)?;
        let replica_id = db.replica_id()?;
        info!(replica = %replica_id, dir = %dir.display(), "opened persistent substrate");
        Ok(Self::with_parts(replica_id, Some(db)))
    }

    fn with_parts(replica_id: String, db: Option<Database>) -> Self {
        Self {
            replica_id,
            db: db.map(|db| Arc::new(Mutex::new(db))),
            hub: None,
            state: Mutex::new(SubstrateState::default()),
        }
    }

    /// Join a replication hub. Logs opened afterwards replicate through it.
    pub fn with_hub(mut self, hub: Arc<ReplicationHub>) -> Self {
        hub.join(&self.replica_id);
        self.hub = Some(hub);
        self
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }
}

#[async_trait]
impl Substrate for LocalSubstrate {
    async fn open_log(&self, name: &str, policy: AccessPolicy) -> Result<Arc<dyn LogHandle>> {
        let mut state = lock(&self.state);
        if state.stopped {
            return Err(StoreError::Infrastructure(format!(
                "cannot open {name}: substrate stopped"
            )));
        }

        if let Some(existing) = state.logs.get(name).filter(|log| !log.is_closed()) {
            let handle: Arc<dyn LogHandle> = existing.clone();
            return Ok(handle);
        }

        let log = Arc::new(ReplicaLog {
            name: name.to_string(),
            replica_id: self.replica_id.clone(),
            policy,
            db: self.db.clone(),
            hub: self.hub.clone(),
            state: Mutex::new(LogState::default()),
        });
        if let Some(hub) = &self.hub {
            hub.register(&self.replica_id, name, Arc::downgrade(&log));
        }
        state.logs.insert(name.to_string(), log.clone());
        debug!(log = name, replica = %self.replica_id, "opened log");

        let handle: Arc<dyn LogHandle> = log;
        Ok(handle)
    }

    async fn stop(&self) -> Result<()> {
        let logs: Vec<Arc<ReplicaLog>> = {
            let mut state = lock(&self.state);
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            state.logs.drain().map(|(_, log)| log).collect()
        };

        for log in logs {
            if let Err(e) = log.close().await {
                warn!(log = %log.name, error = %e, "failed to close log");
            }
        }
        if let Some(hub) = &self.hub {
            hub.leave(&self.replica_id);
        }

        info!(replica = %self.replica_id, "substrate stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log replica
// ---------------------------------------------------------------------------

pub struct ReplicaLog {
    name: String,
    replica_id: String,
    policy: AccessPolicy,
    db: Option<Arc<Mutex<Database>>>,
    hub: Option<Arc<ReplicationHub>>,
    state: Mutex<LogState>,
}

#[derive(Default)]
struct LogState {
    entries: Vec<LogEntry>,
    hashes: HashSet<String>,
    /// Highest clock seen, local or remote.
    clock: u64,
    listeners: Vec<LogListener>,
    restored: bool,
    closed: bool,
}

impl ReplicaLog {
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn ensure_open(&self) -> Result<()> {
        if lock(&self.state).closed {
            return Err(StoreError::Infrastructure(format!("log {} is closed", self.name)));
        }
        Ok(())
    }

    fn emit(&self, event: LogEvent) {
        let listeners = lock(&self.state).listeners.clone();
        for listener in listeners {
            listener(event);
        }
    }

    fn contains(&self, hash: &str) -> bool {
        lock(&self.state).hashes.contains(hash)
    }

    pub(crate) fn snapshot(&self) -> Vec<LogEntry> {
        lock(&self.state).entries.clone()
    }

    /// Persist and record an entry that passed admission.
    fn admit(&self, entry: LogEntry) -> Result<bool> {
        if self.contains(&entry.hash) {
            return Ok(false);
        }
        if let Some(db) = &self.db {
            lock(db).insert_entry(&self.name, &entry)?;
        }

        let mut state = lock(&self.state);
        if state.closed {
            return Err(StoreError::Infrastructure(format!("log {} is closed", self.name)));
        }
        if !state.hashes.insert(entry.hash.clone()) {
            return Ok(false);
        }
        state.clock = state.clock.max(entry.clock);
        state.entries.push(entry);
        Ok(true)
    }

    /// Bring persisted entries back into memory, once.
    fn restore(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        if lock(&self.state).restored {
            return Ok(0);
        }
        let persisted = lock(db).load_entries(&self.name)?;

        let mut state = lock(&self.state);
        state.restored = true;
        let mut restored = 0;
        for entry in persisted {
            if state.hashes.insert(entry.hash.clone()) {
                state.clock = state.clock.max(entry.clock);
                state.entries.push(entry);
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Run remote entries through admission. Returns how many were admitted.
    async fn ingest(&self, entries: Vec<LogEntry>) -> usize {
        let mut admitted = 0;
        for entry in entries {
            if self.contains(&entry.hash) {
                continue;
            }
            if !entry.is_intact() {
                debug!(log = %self.name, hash = %entry.hash, "dropping entry with bad hash");
                continue;
            }
            if !self.policy.admits(&entry.payload).await {
                debug!(log = %self.name, origin = %entry.origin, "replicated entry rejected by gate");
                continue;
            }
            match self.admit(entry) {
                Ok(true) => admitted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(log = %self.name, error = %e, "failed to store replicated entry");
                }
            }
        }
        admitted
    }
}

#[async_trait]
impl LogHandle for ReplicaLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        let restored = self.restore()?;

        if let Some(hub) = &self.hub {
            let pull = async {
                let remote = hub.pull(&self.replica_id, &self.name).await;
                self.ingest(remote).await
            };
            match tokio::time::timeout(timeout, pull).await {
                Ok(pulled) => debug!(log = %self.name, restored, pulled, "log loaded"),
                Err(_) => warn!(
                    log = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "load timed out, continuing with local replica"
                ),
            }
        } else {
            debug!(log = %self.name, restored, "log loaded");
        }

        self.emit(LogEvent::Ready);
        Ok(())
    }

    async fn append(&self, payload: Value) -> Result<AppendOutcome> {
        self.ensure_open()?;
        if !self.policy.admits(&payload).await {
            debug!(log = %self.name, "append rejected by gate");
            return Ok(AppendOutcome::Rejected);
        }

        let entry = {
            let state = lock(&self.state);
            LogEntry::new(&self.replica_id, state.clock + 1, payload)
        };
        self.admit(entry.clone())?;
        self.emit(LogEvent::Write);

        if let Some(hub) = &self.hub {
            hub.publish(&self.replica_id, &self.name, vec![entry]).await;
        }
        Ok(AppendOutcome::Admitted)
    }

    async fn merge(&self, entries: Vec<LogEntry>) -> Result<usize> {
        self.ensure_open()?;
        let admitted = self.ingest(entries).await;
        if admitted > 0 {
            debug!(log = %self.name, admitted, "merged replicated entries");
            self.emit(LogEvent::Replicated);
        }
        Ok(admitted)
    }

    fn entries(&self) -> Vec<LogEntry> {
        self.snapshot()
    }

    fn on(&self, listener: LogListener) {
        lock(&self.state).listeners.push(listener);
    }

    fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.closed {
            state.closed = true;
            state.listeners.clear();
            debug!(log = %self.name, "log closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::gate::AccessGate;

    /// Admits objects whose `ok` field is true.
    struct FlagGate;

    #[async_trait]
    impl AccessGate for FlagGate {
        async fn can_append(&self, entry: &Value) -> bool {
            entry.get("ok").and_then(Value::as_bool).unwrap_or(false)
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> LogListener {
        let counter = counter.clone();
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_append_read_after_write() {
        let substrate = LocalSubstrate::in_memory();
        let log = substrate.open_log("l", AccessPolicy::Open).await.unwrap();

        let writes = Arc::new(AtomicUsize::new(0));
        log.on(counting(&writes));

        assert_eq!(
            log.append(json!({"n": 1})).await.unwrap(),
            AppendOutcome::Admitted
        );
        assert_eq!(log.entries().len(), 1);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gated_append_and_merge() {
        let substrate = LocalSubstrate::in_memory();
        let log = substrate
            .open_log("gated", AccessPolicy::Gated(Arc::new(FlagGate)))
            .await
            .unwrap();

        assert_eq!(
            log.append(json!({"ok": false})).await.unwrap(),
            AppendOutcome::Rejected
        );
        assert!(log.entries().is_empty());

        let remote = vec![
            LogEntry::new("peer", 1, json!({"ok": true})),
            LogEntry::new("peer", 2, json!({"ok": false})),
        ];
        assert_eq!(log.merge(remote.clone()).await.unwrap(), 1);
        // Idempotent
        assert_eq!(log.merge(remote).await.unwrap(), 0);
        assert_eq!(log.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_drops_tampered_entries() {
        let substrate = LocalSubstrate::in_memory();
        let log = substrate.open_log("l", AccessPolicy::Open).await.unwrap();

        let mut entry = LogEntry::new("peer", 1, json!("a"));
        entry.payload = json!("b");
        assert_eq!(log.merge(vec![entry]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_same_name_returns_same_log() {
        let substrate = LocalSubstrate::in_memory();
        let a = substrate.open_log("l", AccessPolicy::Open).await.unwrap();
        let b = substrate.open_log("l", AccessPolicy::Open).await.unwrap();
        a.append(json!(1)).await.unwrap();
        assert_eq!(b.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_substrate_refuses() {
        let substrate = LocalSubstrate::in_memory();
        let log = substrate.open_log("l", AccessPolicy::Open).await.unwrap();
        substrate.stop().await.unwrap();

        let err = substrate.open_log("other", AccessPolicy::Open).await.err().unwrap();
        assert!(matches!(err, StoreError::Infrastructure(_)));
        assert!(log.append(json!(1)).await.is_err());
        // Second stop is a no-op
        substrate.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_after_close_gives_fresh_log() {
        let substrate = LocalSubstrate::in_memory();
        let log = substrate.open_log("l", AccessPolicy::Open).await.unwrap();
        log.close().await.unwrap();

        let reopened = substrate.open_log("l", AccessPolicy::Open).await.unwrap();
        assert!(reopened.append(json!(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_persisted_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let replica_id = {
            let substrate = LocalSubstrate::open(dir.path()).unwrap();
            let log = substrate.open_log("l", AccessPolicy::Open).await.unwrap();
            log.load(Duration::from_millis(10)).await.unwrap();
            log.append(json!("first")).await.unwrap();
            log.append(json!("second")).await.unwrap();
            substrate.stop().await.unwrap();
            substrate.replica_id().to_string()
        };

        let substrate = LocalSubstrate::open(dir.path()).unwrap();
        assert_eq!(substrate.replica_id(), replica_id);
        let log = substrate.open_log("l", AccessPolicy::Open).await.unwrap();

        let ready = Arc::new(AtomicUsize::new(0));
        log.on(counting(&ready));
        log.load(Duration::from_millis(10)).await.unwrap();

        let payloads: Vec<_> = log.entries().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![json!("first"), json!("second")]);
        assert_eq!(ready.load(Ordering::SeqCst), 1);

        // Clock continues after restored entries
        log.append(json!("third")).await.unwrap();
        assert_eq!(log.entries()[2].clock, 3);
    }
}
