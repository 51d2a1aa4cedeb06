//! In-process replication between [`LocalSubstrate`](super::LocalSubstrate)
//! replicas.
//!
//! The hub is a full mesh: an admitted local append is delivered to the
//! same-named log of every other connected replica, where it goes through
//! that replica's own access policy. Replicas can be disconnected to model a
//! partition; reconnecting runs anti-entropy on every log of the replica.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info};

use super::replica::ReplicaLog;
use super::{lock, LogEntry, LogHandle};

#[derive(Default)]
pub struct ReplicationHub {
    replicas: Mutex<HashMap<String, ReplicaSlot>>,
    /// Artificial latency applied to initial pulls.
    pull_delay: Mutex<Duration>,
}

#[derive(Default)]
struct ReplicaSlot {
    connected: bool,
    logs: HashMap<String, Weak<ReplicaLog>>,
}

impl ReplicationHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        *lock(&self.pull_delay) = delay;
    }

    pub(crate) fn join(&self, replica_id: &str) {
        lock(&self.replicas)
            .entry(replica_id.to_string())
            .or_default()
            .connected = true;
        debug!(replica = replica_id, "replica joined hub");
    }

    pub(crate) fn leave(&self, replica_id: &str) {
        lock(&self.replicas).remove(replica_id);
        debug!(replica = replica_id, "replica left hub");
    }

    pub(crate) fn register(&self, replica_id: &str, name: &str, log: Weak<ReplicaLog>) {
        if let Some(slot) = lock(&self.replicas).get_mut(replica_id) {
            slot.logs.insert(name.to_string(), log);
        }
    }

    pub fn is_connected(&self, replica_id: &str) -> bool {
        lock(&self.replicas)
            .get(replica_id)
            .is_some_and(|slot| slot.connected)
    }

    /// Cut a replica off from its peers.
    pub fn disconnect(&self, replica_id: &str) {
        if let Some(slot) = lock(&self.replicas).get_mut(replica_id) {
            slot.connected = false;
            info!(replica = replica_id, "replica disconnected");
        }
    }

    /// Reconnect a replica and exchange everything it missed.
    pub async fn reconnect(&self, replica_id: &str) {
        let local_logs: Vec<(String, Arc<ReplicaLog>)> = {
            let mut replicas = lock(&self.replicas);
            let Some(slot) = replicas.get_mut(replica_id) else {
                return;
            };
            slot.connected = true;
            slot.logs
                .iter()
                .filter_map(|(name, log)| log.upgrade().map(|log| (name.clone(), log)))
                .collect()
        };

        let mut exchanged = 0;
        for (name, local) in local_logs {
            for peer in self.peers(replica_id, &name) {
                exchanged += local.merge(peer.snapshot()).await.unwrap_or(0);
                exchanged += peer.merge(local.snapshot()).await.unwrap_or(0);
            }
        }
        info!(replica = replica_id, exchanged, "replica reconnected");
    }

    /// Open same-named logs of every other connected replica.
    fn peers(&self, replica_id: &str, name: &str) -> Vec<Arc<ReplicaLog>> {
        lock(&self.replicas)
            .iter()
            .filter(|(id, slot)| id.as_str() != replica_id && slot.connected)
            .filter_map(|(_, slot)| slot.logs.get(name).and_then(Weak::upgrade))
            .collect()
    }

    pub(crate) async fn publish(&self, from: &str, name: &str, entries: Vec<LogEntry>) {
        if !self.is_connected(from) {
            return;
        }
        for peer in self.peers(from, name) {
            if let Err(e) = peer.merge(entries.clone()).await {
                debug!(log = name, error = %e, "peer did not take entries");
            }
        }
    }

    /// Everything connected peers hold for `name`.
    pub(crate) async fn pull(&self, replica_id: &str, name: &str) -> Vec<LogEntry> {
        let delay = *lock(&self.pull_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_connected(replica_id) {
            return Vec::new();
        }
        self.peers(replica_id, name)
            .iter()
            .flat_map(|peer| peer.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::log::{AccessPolicy, LocalSubstrate, Substrate};

    fn replicas(hub: &Arc<ReplicationHub>) -> (LocalSubstrate, LocalSubstrate) {
        (
            LocalSubstrate::in_memory().with_hub(hub.clone()),
            LocalSubstrate::in_memory().with_hub(hub.clone()),
        )
    }

    #[tokio::test]
    async fn test_append_reaches_connected_peer() {
        let hub = ReplicationHub::new();
        let (a, b) = replicas(&hub);
        let log_a = a.open_log("l", AccessPolicy::Open).await.unwrap();
        let log_b = b.open_log("l", AccessPolicy::Open).await.unwrap();

        log_a.append(json!("hello")).await.unwrap();
        assert_eq!(log_b.entries().len(), 1);
        assert_eq!(log_b.entries()[0].origin, a.replica_id());
    }

    #[tokio::test]
    async fn test_partition_and_anti_entropy() {
        let hub = ReplicationHub::new();
        let (a, b) = replicas(&hub);
        let log_a = a.open_log("l", AccessPolicy::Open).await.unwrap();
        let log_b = b.open_log("l", AccessPolicy::Open).await.unwrap();

        hub.disconnect(a.replica_id());
        assert!(!hub.is_connected(a.replica_id()));
        log_a.append(json!("from a")).await.unwrap();
        log_b.append(json!("from b")).await.unwrap();
        assert_eq!(log_a.entries().len(), 1);
        assert_eq!(log_b.entries().len(), 1);

        hub.reconnect(a.replica_id()).await;
        assert_eq!(log_a.entries().len(), 2);
        assert_eq!(log_b.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_load_pulls_from_peers() {
        let hub = ReplicationHub::new();
        let (a, b) = replicas(&hub);
        let log_a = a.open_log("l", AccessPolicy::Open).await.unwrap();
        log_a.append(json!(1)).await.unwrap();
        log_a.append(json!(2)).await.unwrap();

        let log_b = b.open_log("l", AccessPolicy::Open).await.unwrap();
        log_b.load(Duration::from_secs(1)).await.unwrap();
        assert_eq!(log_b.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_load_timeout_keeps_log_usable() {
        let hub = ReplicationHub::new();
        let (a, b) = replicas(&hub);
        let log_a = a.open_log("l", AccessPolicy::Open).await.unwrap();
        log_a.append(json!(1)).await.unwrap();

        hub.set_pull_delay(Duration::from_millis(200));
        let log_b = b.open_log("l", AccessPolicy::Open).await.unwrap();
        log_b.load(Duration::from_millis(10)).await.unwrap();
        assert!(log_b.entries().is_empty());

        log_b.append(json!(2)).await.unwrap();
        assert_eq!(log_b.entries().len(), 1);
    }
}
