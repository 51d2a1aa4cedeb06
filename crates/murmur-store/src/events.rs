//! Events flowing out of the storage layer, and signals flowing back into it.

use std::sync::Arc;

use murmur_shared::types::{ChannelAddress, ChannelMessage, Conversation, PublicChannel, UserRecord};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::log::{LogEvent, LogHandle, LogListener};

/// Materialized views published by the registries.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    ChannelCreated(PublicChannel),
    MessageIds {
        channel_address: String,
        ids: Vec<String>,
    },
    CertificatesLoaded {
        certificates: Vec<String>,
        users: Vec<UserRecord>,
    },
    AllMessagesLoaded {
        channel_address: String,
        messages: Vec<ChannelMessage>,
    },
    ChannelsReplicated(Vec<PublicChannel>),
    DirectMessagesLoaded {
        address: String,
        messages: Vec<String>,
    },
    PrivateConversationsLoaded(Vec<Conversation>),
}

pub type EventSink = mpsc::UnboundedSender<StorageEvent>;

/// Which log a [`LogEvent`] came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogSource {
    ChannelDirectory,
    Certificates,
    ThreadDirectory,
    Channel(ChannelAddress),
    Thread(String),
}

/// Work queued for the task that owns the facade.
pub enum StorageSignal {
    Log {
        source: LogSource,
        event: LogEvent,
    },
    /// A fanned-out channel init task finished.
    ChannelOpened {
        address: ChannelAddress,
        result: Result<Arc<dyn LogHandle>>,
    },
    ThreadOpened {
        address: String,
        result: Result<Arc<dyn LogHandle>>,
    },
}

pub type SignalSender = mpsc::UnboundedSender<StorageSignal>;

/// A log listener that only enqueues a signal for the owning task.
pub fn forward_to(signals: &SignalSender, source: LogSource) -> LogListener {
    let signals = signals.clone();
    Arc::new(move |event: LogEvent| {
        let _ = signals.send(StorageSignal::Log {
            source: source.clone(),
            event,
        });
    })
}

pub(crate) fn publish(events: &EventSink, event: StorageEvent) {
    if events.send(event).is_err() {
        tracing::debug!("event receiver dropped");
    }
}
