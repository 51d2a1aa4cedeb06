//! Direct-message threads: a replicated directory of thread phrases and one
//! log of opaque, already-encrypted messages per thread.

use std::collections::HashMap;
use std::sync::Arc;

use murmur_shared::error::ValidationError;
use murmur_shared::types::{thread_log_name, Conversation};
use murmur_shared::validation::{validate_conversation, validate_direct_message};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channels::Attachment;
use crate::error::Result;
use crate::events::{forward_to, publish, EventSink, LogSource, SignalSender, StorageEvent};
use crate::log::{LogEvent, LogHandle, LogOpener, ReplicatedMap};

struct ThreadRepo {
    log: Arc<dyn LogHandle>,
    attachment: Attachment,
}

pub struct DirectMessageRegistry {
    /// address -> encrypted phrase
    directory: ReplicatedMap,
    threads: HashMap<String, ThreadRepo>,
    opener: LogOpener,
    signals: SignalSender,
    events: EventSink,
}

impl DirectMessageRegistry {
    pub fn new(
        directory: ReplicatedMap,
        opener: LogOpener,
        signals: SignalSender,
        events: EventSink,
    ) -> Self {
        Self {
            directory,
            threads: HashMap::new(),
            opener,
            signals,
            events,
        }
    }

    pub fn opener(&self) -> &LogOpener {
        &self.opener
    }

    pub fn directory(&self) -> &ReplicatedMap {
        &self.directory
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.directory
            .all()
            .into_iter()
            .filter_map(|(address, value)| match value {
                Value::String(encrypted_phrase) => Some(Conversation {
                    address,
                    encrypted_phrase,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn is_open(&self, address: &str) -> bool {
        self.threads.contains_key(address)
    }

    pub fn attachment(&self, address: &str) -> Option<Attachment> {
        self.threads.get(address).map(|repo| repo.attachment)
    }

    /// Known threads whose log is not open yet.
    pub fn unopened(&self) -> Vec<String> {
        self.conversations()
            .into_iter()
            .map(|c| c.address)
            .filter(|address| !self.threads.contains_key(address))
            .collect()
    }

    pub fn logs(&self) -> Vec<Arc<dyn LogHandle>> {
        self.threads.values().map(|repo| repo.log.clone()).collect()
    }

    /// Opaque thread messages, in log order.
    pub fn messages(&self, address: &str) -> Vec<String> {
        let Some(repo) = self.threads.get(address) else {
            return Vec::new();
        };
        repo.log
            .entries()
            .into_iter()
            .filter_map(|entry| match entry.payload {
                Value::String(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    async fn ensure_thread(&mut self, address: &str) -> Result<Arc<dyn LogHandle>> {
        if let Some(repo) = self.threads.get(address) {
            return Ok(repo.log.clone());
        }
        let log = self.opener.open(&thread_log_name(address)).await?;
        self.threads.insert(
            address.to_string(),
            ThreadRepo {
                log: log.clone(),
                attachment: Attachment::Unattached,
            },
        );
        Ok(log)
    }

    pub async fn initialize_conversation(
        &mut self,
        address: &str,
        encrypted_phrase: &str,
    ) -> Result<()> {
        validate_conversation(address, encrypted_phrase)?;
        self.ensure_thread(address).await?;
        if !self.directory.contains(address) {
            self.directory
                .put(address, Value::String(encrypted_phrase.to_string()))
                .await?;
            info!(thread = address, "conversation initialized");
        }
        self.subscribe_thread(address).await
    }

    /// Open the thread and attach its listener exactly once.
    pub async fn subscribe_thread(&mut self, address: &str) -> Result<()> {
        if address.trim().is_empty() {
            return Err(ValidationError::MissingField("address").into());
        }
        self.ensure_thread(address).await?;
        self.attach(address);
        Ok(())
    }

    /// Subscribe every thread; one failure does not stop the others.
    pub async fn subscribe_all(&mut self, addresses: &[String]) {
        for address in addresses {
            if let Err(e) = self.subscribe_thread(address).await {
                warn!(thread = %address, error = %e, "failed to subscribe thread");
            }
        }
    }

    pub fn adopt(&mut self, address: String, log: Arc<dyn LogHandle>) {
        self.threads.entry(address.clone()).or_insert(ThreadRepo {
            log,
            attachment: Attachment::Unattached,
        });
        self.attach(&address);
    }

    fn attach(&mut self, address: &str) {
        let Some(repo) = self.threads.get_mut(address) else {
            return;
        };
        if repo.attachment == Attachment::Attached {
            return;
        }
        repo.log
            .on(forward_to(&self.signals, LogSource::Thread(address.to_string())));
        repo.attachment = Attachment::Attached;
        debug!(thread = address, "thread listeners attached");

        self.publish_messages(address);
    }

    pub async fn send_direct_message(&mut self, address: &str, message: &str) -> Result<()> {
        validate_direct_message(address, message)?;
        self.subscribe_thread(address).await?;
        let log = self.ensure_thread(address).await?;
        log.append(Value::String(message.to_string())).await?;
        Ok(())
    }

    /// Publish the thread directory.
    pub fn private_conversations(&self) -> Vec<Conversation> {
        let conversations = self.conversations();
        publish(
            &self.events,
            StorageEvent::PrivateConversationsLoaded(conversations.clone()),
        );
        conversations
    }

    fn publish_messages(&self, address: &str) {
        publish(
            &self.events,
            StorageEvent::DirectMessagesLoaded {
                address: address.to_string(),
                messages: self.messages(address),
            },
        );
    }

    pub fn handle_thread_event(&self, address: &str, event: LogEvent) {
        if self.attachment(address) == Some(Attachment::Attached) {
            debug!(thread = address, ?event, "thread log event");
            self.publish_messages(address);
        }
    }

    /// React to a directory event. Returns threads that still need opening.
    pub fn handle_directory_event(&self, event: LogEvent) -> Vec<String> {
        if event != LogEvent::Replicated {
            return Vec::new();
        }
        self.private_conversations();
        self.unopened()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::events::StorageSignal;
    use crate::log::{AccessPolicy, LocalSubstrate, Substrate};

    async fn registry() -> (
        DirectMessageRegistry,
        mpsc::UnboundedReceiver<StorageEvent>,
        mpsc::UnboundedReceiver<StorageSignal>,
    ) {
        let substrate: Arc<dyn Substrate> = Arc::new(LocalSubstrate::in_memory());
        let directory = substrate
            .open_map("msg-threads", AccessPolicy::Open)
            .await
            .unwrap();
        let opener = LogOpener::new(substrate, AccessPolicy::Open, Duration::from_millis(10));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            DirectMessageRegistry::new(directory, opener, signal_tx, event_tx),
            event_rx,
            signal_rx,
        )
    }

    #[tokio::test]
    async fn test_initialize_conversation() {
        let (mut registry, mut events, _signals) = registry().await;
        registry
            .initialize_conversation("bob-address", "sealed-phrase")
            .await
            .unwrap();

        assert_eq!(
            registry.conversations(),
            vec![Conversation {
                address: "bob-address".into(),
                encrypted_phrase: "sealed-phrase".into(),
            }]
        );
        assert_eq!(registry.attachment("bob-address"), Some(Attachment::Attached));
        assert!(matches!(
            events.try_recv().unwrap(),
            StorageEvent::DirectMessagesLoaded { .. }
        ));

        // First phrase wins
        registry
            .initialize_conversation("bob-address", "other-phrase")
            .await
            .unwrap();
        assert_eq!(registry.conversations()[0].encrypted_phrase, "sealed-phrase");
    }

    #[tokio::test]
    async fn test_initialize_requires_fields() {
        let (mut registry, _events, _signals) = registry().await;
        assert!(registry.initialize_conversation("", "phrase").await.is_err());
        assert!(registry.initialize_conversation("addr", "").await.is_err());
        assert!(registry.conversations().is_empty());
    }

    #[tokio::test]
    async fn test_send_and_read_direct_messages() {
        let (mut registry, _events, mut signals) = registry().await;
        registry.send_direct_message("carol", "ciphertext-1").await.unwrap();
        registry.send_direct_message("carol", "ciphertext-2").await.unwrap();

        assert_eq!(registry.messages("carol"), vec!["ciphertext-1", "ciphertext-2"]);

        let mut writes = 0;
        while let Ok(StorageSignal::Log { event, .. }) = signals.try_recv() {
            if event == LogEvent::Write {
                writes += 1;
            }
        }
        assert_eq!(writes, 2);
    }

    #[tokio::test]
    async fn test_subscribe_all_is_idempotent() {
        let (mut registry, _events, _signals) = registry().await;
        let addresses = vec!["a".to_string(), "b".to_string(), "".to_string()];
        registry.subscribe_all(&addresses).await;
        registry.subscribe_all(&addresses).await;

        assert!(registry.is_open("a"));
        assert!(registry.is_open("b"));
        assert!(!registry.is_open(""));
        for log in registry.logs() {
            assert_eq!(log.listener_count(), 1);
        }
    }
}
