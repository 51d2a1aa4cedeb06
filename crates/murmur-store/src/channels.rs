//! Public channels: the replicated channel directory plus one gated message
//! log per channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use murmur_shared::types::{ChannelAddress, ChannelMessage, PublicChannel};
use murmur_shared::validation::{validate_channel, validate_message};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::events::{forward_to, publish, EventSink, LogSource, SignalSender, StorageEvent};
use crate::log::{AppendOutcome, LogEvent, LogHandle, LogOpener, ReplicatedMap};

/// Whether a repo's listeners have been attached in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Unattached,
    Attached,
}

struct ChannelRepo {
    log: Arc<dyn LogHandle>,
    attachment: Attachment,
}

pub struct ChannelRegistry {
    /// address -> [`PublicChannel`]
    directory: ReplicatedMap,
    repos: HashMap<ChannelAddress, ChannelRepo>,
    opener: LogOpener,
    signals: SignalSender,
    events: EventSink,
}

impl ChannelRegistry {
    pub fn new(
        directory: ReplicatedMap,
        opener: LogOpener,
        signals: SignalSender,
        events: EventSink,
    ) -> Self {
        Self {
            directory,
            repos: HashMap::new(),
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

    /// Every channel known to the directory, in first-seen order.
    pub fn channels(&self) -> Vec<PublicChannel> {
        self.directory
            .all()
            .into_iter()
            .filter_map(|(address, value)| match serde_json::from_value(value) {
                Ok(channel) => Some(channel),
                Err(e) => {
                    debug!(channel = %address, error = %e, "skipping undecodable descriptor");
                    None
                }
            })
            .collect()
    }

    pub fn channel(&self, address: &str) -> Option<PublicChannel> {
        self.directory
            .get(address)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn is_open(&self, address: &ChannelAddress) -> bool {
        self.repos.contains_key(address)
    }

    pub fn open_count(&self) -> usize {
        self.repos.len()
    }

    pub fn attachment(&self, address: &ChannelAddress) -> Option<Attachment> {
        self.repos.get(address).map(|repo| repo.attachment)
    }

    /// Known channels whose log is not open yet.
    pub fn unopened(&self) -> Vec<ChannelAddress> {
        self.channels()
            .iter()
            .filter_map(|channel| ChannelAddress::parse(&channel.address).ok())
            .filter(|address| !self.repos.contains_key(address))
            .collect()
    }

    /// Open handles of every channel log.
    pub fn logs(&self) -> Vec<Arc<dyn LogHandle>> {
        self.repos.values().map(|repo| repo.log.clone()).collect()
    }

    /// Resolve the log of a channel, creating it and publishing its
    /// descriptor on first use.
    ///
    /// The descriptor is published before the log is opened, so a failed
    /// put leaves nothing behind and the next call retries it.
    pub async fn create_or_get(&mut self, channel: &PublicChannel) -> Result<Arc<dyn LogHandle>> {
        let address = validate_channel(channel)?;

        if !self.directory.contains(address.as_str()) {
            self.directory
                .put(address.as_str(), serde_json::to_value(channel)?)
                .await?;
            info!(channel = %address, "channel created");
            publish(&self.events, StorageEvent::ChannelCreated(channel.clone()));
        }

        if let Some(repo) = self.repos.get(&address) {
            return Ok(repo.log.clone());
        }

        let log = self.opener.open(&address.log_name()).await?;
        self.repos.insert(
            address,
            ChannelRepo {
                log: log.clone(),
                attachment: Attachment::Unattached,
            },
        );
        Ok(log)
    }

    /// Ensure the channel exists and its listeners are attached exactly once.
    pub async fn subscribe(&mut self, channel: &PublicChannel) -> Result<()> {
        self.create_or_get(channel).await?;
        let address = validate_channel(channel)?;
        self.attach(&address);
        Ok(())
    }

    /// Take over a log opened by an init task.
    pub fn adopt(&mut self, address: ChannelAddress, log: Arc<dyn LogHandle>) {
        self.repos.entry(address.clone()).or_insert(ChannelRepo {
            log,
            attachment: Attachment::Unattached,
        });
        self.attach(&address);
    }

    fn attach(&mut self, address: &ChannelAddress) {
        let Some(repo) = self.repos.get_mut(address) else {
            return;
        };
        if repo.attachment == Attachment::Attached {
            return;
        }
        repo.log
            .on(forward_to(&self.signals, LogSource::Channel(address.clone())));
        repo.attachment = Attachment::Attached;
        debug!(channel = %address, "channel listeners attached");

        self.publish_ids(address);
    }

    pub async fn send(&mut self, message: &ChannelMessage) -> Result<AppendOutcome> {
        let address = validate_message(message)?;
        let log = match self.repos.get(&address) {
            Some(repo) => repo.log.clone(),
            None => match self.channel(address.as_str()) {
                Some(descriptor) => self.create_or_get(&descriptor).await?,
                None => return Err(StoreError::NotFound(format!("channel {address}"))),
            },
        };

        let outcome = log.append(serde_json::to_value(message)?).await?;
        if outcome == AppendOutcome::Rejected {
            debug!(channel = %address, id = %message.id, "message refused by access gate");
        }
        Ok(outcome)
    }

    /// Materialized messages: log order, first entry per id.
    pub fn messages(&self, address: &ChannelAddress) -> Vec<ChannelMessage> {
        let Some(repo) = self.repos.get(address) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        repo.log
            .entries()
            .into_iter()
            .filter_map(
                |entry| match serde_json::from_value::<ChannelMessage>(entry.payload) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        debug!(channel = %address, hash = %entry.hash, error = %e, "skipping undecodable entry");
                        None
                    }
                },
            )
            .filter(|message| message.channel_address == address.as_str())
            .filter(|message| seen.insert(message.id.clone()))
            .collect()
    }

    pub fn message_ids(&self, address: &ChannelAddress) -> Vec<String> {
        self.messages(address).into_iter().map(|m| m.id).collect()
    }

    /// Locally present messages among `ids`, in request order.
    pub fn ask_for_messages(&self, address: &str, ids: &[String]) -> Vec<ChannelMessage> {
        let Ok(address) = ChannelAddress::parse(address) else {
            return Vec::new();
        };
        let messages = self.messages(&address);
        let by_id: HashMap<&str, &ChannelMessage> =
            messages.iter().map(|m| (m.id.as_str(), m)).collect();

        let mut seen = HashSet::new();
        ids.iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| by_id.get(id.as_str()).map(|m| (*m).clone()))
            .collect()
    }

    /// Publish the full materialized list of a channel.
    pub fn load_all_messages(&self, address: &str) -> Result<Vec<ChannelMessage>> {
        let parsed = ChannelAddress::parse(address)?;
        if !self.repos.contains_key(&parsed) {
            return Err(StoreError::NotFound(format!("channel {address}")));
        }
        let messages = self.messages(&parsed);
        publish(
            &self.events,
            StorageEvent::AllMessagesLoaded {
                channel_address: parsed.to_string(),
                messages: messages.clone(),
            },
        );
        Ok(messages)
    }

    fn publish_ids(&self, address: &ChannelAddress) {
        let ids = self.message_ids(address);
        debug!(channel = %address, count = ids.len(), "publishing message ids");
        publish(
            &self.events,
            StorageEvent::MessageIds {
                channel_address: address.to_string(),
                ids,
            },
        );
    }

    pub fn handle_channel_event(&self, address: &ChannelAddress, event: LogEvent) {
        if self.attachment(address) == Some(Attachment::Attached) {
            debug!(channel = %address, ?event, "channel log event");
            self.publish_ids(address);
        }
    }

    /// React to a directory event. Returns channels that still need opening.
    pub fn handle_directory_event(&self, event: LogEvent) -> Vec<ChannelAddress> {
        if event != LogEvent::Replicated {
            return Vec::new();
        }
        let channels = self.channels();
        debug!(count = channels.len(), "channel directory replicated");
        publish(&self.events, StorageEvent::ChannelsReplicated(channels));
        self.unopened()
    }
}
