//! Bridge between the data-socket protocol and a [`StorageFacade`].
//!
//! The bridge runs in a dedicated tokio task that owns the facade. External
//! code talks to it through a command sender and an event receiver, the
//! same shape as a swarm task. No raw error crosses the boundary: failures
//! become `validationError` / `serverError` events or are dropped.

use murmur_shared::protocol::{BridgeCommand, BridgeEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, Result, StoreError};
use crate::events::{StorageEvent, StorageSignal};
use crate::storage::{Lifecycle, StorageFacade};

/// Decode one inbound frame, logging and dropping anything malformed.
pub fn parse_frame(frame: &str) -> Option<BridgeCommand> {
    match BridgeCommand::from_json(frame) {
        Ok(command) => Some(command),
        Err(e) => {
            warn!(error = %e, len = frame.len(), "dropping undecodable frame");
            None
        }
    }
}

/// Spawn the bridge task.
///
/// `storage_events` must be the receiving end of the sink the facade was
/// built with. An uninitialized facade is started by the task.
pub fn spawn_bridge(
    facade: StorageFacade,
    storage_events: mpsc::UnboundedReceiver<StorageEvent>,
) -> (
    mpsc::Sender<BridgeCommand>,
    mpsc::Receiver<BridgeEvent>,
    JoinHandle<()>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<BridgeCommand>(256);
    let (event_tx, event_rx) = mpsc::channel::<BridgeEvent>(256);

    let bridge = ProtocolBridge {
        facade,
        storage_events,
        outbound: event_tx,
    };
    let handle = tokio::spawn(bridge.run(cmd_rx));
    (cmd_tx, event_rx, handle)
}

pub struct ProtocolBridge {
    facade: StorageFacade,
    storage_events: mpsc::UnboundedReceiver<StorageEvent>,
    outbound: mpsc::Sender<BridgeEvent>,
}

enum Step {
    Command(Option<BridgeCommand>),
    Signal(Option<StorageSignal>),
}

impl ProtocolBridge {
    async fn run(mut self, mut commands: mpsc::Receiver<BridgeCommand>) {
        if self.facade.state() == Lifecycle::Uninitialized {
            if let Err(e) = self.facade.start().await {
                self.report("init", e).await;
            }
        }
        self.flush().await;

        loop {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                signal = self.facade.next_signal() => Step::Signal(signal),
            };

            match step {
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => {
                    info!("Command channel closed, shutting down bridge");
                    break;
                }
                Step::Signal(Some(signal)) => self.facade.handle_signal(signal),
                Step::Signal(None) => break,
            }
            self.flush().await;
        }

        self.facade.stop_all().await;
        self.flush().await;
    }

    async fn handle_command(&mut self, command: BridgeCommand) {
        let name = command.name();
        debug!(command = name, "handling command");
        if let Err(e) = self.dispatch(command).await {
            self.report(name, e).await;
        }
    }

    async fn dispatch(&mut self, command: BridgeCommand) -> Result<()> {
        match command {
            BridgeCommand::SubscribeToTopic { channel } => {
                self.facade.subscribe_to_channel(&channel).await
            }
            BridgeCommand::SendMessage { message } => {
                self.facade.send_message(&message).await.map(|_| ())
            }
            BridgeCommand::AskForMessages {
                channel_address,
                ids,
            } => {
                let messages = self.facade.ask_for_messages(&channel_address, &ids)?;
                let event = BridgeEvent::AllMessagesLoaded {
                    channel_address,
                    messages,
                    community_id: self.community_id(),
                };
                self.emit(event).await;
                Ok(())
            }
            BridgeCommand::SaveCertificate {
                certificate,
                root_certificate,
            } => {
                let admitted = self
                    .facade
                    .save_certificate(&certificate, root_certificate.as_deref())
                    .await?;
                if !admitted {
                    debug!("certificate not admitted");
                }
                Ok(())
            }
            BridgeCommand::CreateChannel { channel } => self.facade.create_channel(&channel).await,
            BridgeCommand::FetchAllMessages { channel_address } => {
                self.facade.load_all_messages(&channel_address).map(|_| ())
            }
            BridgeCommand::InitializeConversation {
                address,
                encrypted_phrase,
            } => {
                self.facade
                    .initialize_conversation(&address, &encrypted_phrase)
                    .await
            }
            BridgeCommand::SendDirectMessage {
                channel_address,
                message,
            } => {
                self.facade
                    .send_direct_message(&channel_address, &message)
                    .await
            }
            BridgeCommand::SubscribeToDirectMessageThread { address } => {
                self.facade.subscribe_to_thread(&address).await
            }
            BridgeCommand::SubscribeToAllConversations { conversations } => {
                self.facade
                    .subscribe_to_all_conversations(&conversations)
                    .await
            }
            BridgeCommand::GetPrivateConversations => {
                self.facade.private_conversations().map(|_| ())
            }
            BridgeCommand::Close => {
                self.facade.stop_all().await;
                Ok(())
            }
        }
    }

    fn community_id(&self) -> String {
        self.facade.community_id().to_string()
    }

    async fn report(&mut self, command: &str, e: StoreError) {
        let community_id = self.community_id();
        let event = match e.kind() {
            ErrorKind::Validation | ErrorKind::NotFound => {
                debug!(command, error = %e, "command failed validation");
                BridgeEvent::ValidationError {
                    kind: command.to_string(),
                    message: e.to_string(),
                    community_id,
                }
            }
            ErrorKind::Infrastructure => {
                error!(command, error = %e, "command failed");
                BridgeEvent::ServerError {
                    kind: command.to_string(),
                    message: e.to_string(),
                    community_id,
                }
            }
            ErrorKind::Lifecycle => {
                debug!(command, error = %e, "discarding command");
                return;
            }
        };
        self.emit(event).await;
    }

    /// Forward everything the facade published.
    async fn flush(&mut self) {
        while let Ok(event) = self.storage_events.try_recv() {
            let event = to_bridge_event(event, self.community_id());
            self.emit(event).await;
        }
    }

    async fn emit(&self, event: BridgeEvent) {
        if self.outbound.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}

fn to_bridge_event(event: StorageEvent, community_id: String) -> BridgeEvent {
    match event {
        StorageEvent::ChannelCreated(channel) => BridgeEvent::ChannelCreated {
            channel,
            community_id,
        },
        StorageEvent::MessageIds {
            channel_address,
            ids,
        } => BridgeEvent::MessagesIds {
            channel_address,
            ids,
            community_id,
        },
        StorageEvent::CertificatesLoaded {
            certificates,
            users,
        } => BridgeEvent::CertificatesLoaded {
            certificates,
            users,
            community_id,
        },
        StorageEvent::AllMessagesLoaded {
            channel_address,
            messages,
        } => BridgeEvent::AllMessagesLoaded {
            channel_address,
            messages,
            community_id,
        },
        StorageEvent::ChannelsReplicated(channels) => BridgeEvent::ChannelsReplicated {
            channels,
            community_id,
        },
        StorageEvent::DirectMessagesLoaded { address, messages } => {
            BridgeEvent::DirectMessagesLoaded {
                channel_address: address,
                messages,
                community_id,
            }
        }
        StorageEvent::PrivateConversationsLoaded(conversations) => {
            BridgeEvent::PrivateConversationsLoaded {
                conversations,
                community_id,
            }
        }
    }
}
