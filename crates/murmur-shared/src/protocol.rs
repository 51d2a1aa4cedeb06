use serde::{Deserialize, Serialize};

use crate::types::{ChannelMessage, Conversation, PublicChannel, UserRecord};

/// Commands accepted on the data socket.
///
/// Encoded as `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum BridgeCommand {
    #[serde(rename_all = "camelCase")]
    SubscribeToTopic { channel: PublicChannel },

    #[serde(rename_all = "camelCase")]
    SendMessage { message: ChannelMessage },

    /// Gap-fill: fetch specific messages by id.
    #[serde(rename_all = "camelCase")]
    AskForMessages {
        channel_address: String,
        ids: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    SaveCertificate {
        certificate: String,
        /// Falls back to the configured community root when absent.
        #[serde(default)]
        root_certificate: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    CreateChannel { channel: PublicChannel },

    #[serde(rename_all = "camelCase")]
    FetchAllMessages { channel_address: String },

    #[serde(rename_all = "camelCase")]
    InitializeConversation {
        address: String,
        encrypted_phrase: String,
    },

    #[serde(rename_all = "camelCase")]
    SendDirectMessage {
        channel_address: String,
        message: String,
    },

    #[serde(rename_all = "camelCase")]
    SubscribeToDirectMessageThread { address: String },

    #[serde(rename_all = "camelCase")]
    SubscribeToAllConversations { conversations: Vec<String> },

    GetPrivateConversations,

    /// Shut the community's storage down.
    Close,
}

impl BridgeCommand {
    /// Wire name of the command, echoed in error events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubscribeToTopic { .. } => "subscribeToTopic",
            Self::SendMessage { .. } => "sendMessage",
            Self::AskForMessages { .. } => "askForMessages",
            Self::SaveCertificate { .. } => "saveCertificate",
            Self::CreateChannel { .. } => "createChannel",
            Self::FetchAllMessages { .. } => "fetchAllMessages",
            Self::InitializeConversation { .. } => "initializeConversation",
            Self::SendDirectMessage { .. } => "sendDirectMessage",
            Self::SubscribeToDirectMessageThread { .. } => "subscribeToDirectMessageThread",
            Self::SubscribeToAllConversations { .. } => "subscribeToAllConversations",
            Self::GetPrivateConversations => "getPrivateConversations",
            Self::Close => "close",
        }
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Notifications emitted on the data socket. Every event names its community.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    ChannelCreated {
        channel: PublicChannel,
        community_id: String,
    },

    /// Full id list of a channel's materialized messages.
    #[serde(rename_all = "camelCase")]
    MessagesIds {
        channel_address: String,
        ids: Vec<String>,
        community_id: String,
    },

    #[serde(rename_all = "camelCase")]
    CertificatesLoaded {
        certificates: Vec<String>,
        users: Vec<UserRecord>,
        community_id: String,
    },

    #[serde(rename_all = "camelCase")]
    AllMessagesLoaded {
        channel_address: String,
        messages: Vec<ChannelMessage>,
        community_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ChannelsReplicated {
        channels: Vec<PublicChannel>,
        community_id: String,
    },

    #[serde(rename_all = "camelCase")]
    DirectMessagesLoaded {
        channel_address: String,
        messages: Vec<String>,
        community_id: String,
    },

    #[serde(rename_all = "camelCase")]
    PrivateConversationsLoaded {
        conversations: Vec<Conversation>,
        community_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ServerError {
        #[serde(rename = "type")]
        kind: String,
        message: String,
        community_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ValidationError {
        #[serde(rename = "type")]
        kind: String,
        message: String,
        community_id: String,
    },
}

impl BridgeEvent {
    pub fn community_id(&self) -> &str {
        match self {
            Self::ChannelCreated { community_id, .. }
            | Self::MessagesIds { community_id, .. }
            | Self::CertificatesLoaded { community_id, .. }
            | Self::AllMessagesLoaded { community_id, .. }
            | Self::ChannelsReplicated { community_id, .. }
            | Self::DirectMessagesLoaded { community_id, .. }
            | Self::PrivateConversationsLoaded { community_id, .. }
            | Self::ServerError { community_id, .. }
            | Self::ValidationError { community_id, .. } => community_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let raw = json!({
            "type": "askForMessages",
            "payload": { "channelAddress": "general", "ids": ["m1", "m2"] }
        });
        let cmd: BridgeCommand = serde_json::from_value(raw).unwrap();
        assert_eq!(
            cmd,
            BridgeCommand::AskForMessages {
                channel_address: "general".into(),
                ids: vec!["m1".into(), "m2".into()],
            }
        );
        assert_eq!(cmd.name(), "askForMessages");
    }

    #[test]
    fn test_unit_command_and_optional_root() {
        let cmd = BridgeCommand::from_json(r#"{"type":"close"}"#).unwrap();
        assert_eq!(cmd, BridgeCommand::Close);

        let cmd = BridgeCommand::from_json(
            r#"{"type":"saveCertificate","payload":{"certificate":"pem"}}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            BridgeCommand::SaveCertificate { root_certificate: None, .. }
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(BridgeCommand::from_json(r#"{"type":"dropTables"}"#).is_err());
        assert!(BridgeCommand::from_json("not json").is_err());
    }

    #[test]
    fn test_error_event_shape() {
        let event = BridgeEvent::ValidationError {
            kind: "sendMessage".into(),
            message: "Missing field: id".into(),
            community_id: "c1".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "validationError");
        assert_eq!(value["payload"]["type"], "sendMessage");
        assert_eq!(value["payload"]["communityId"], "c1");
        assert_eq!(event.community_id(), "c1");
    }

    #[test]
    fn test_messages_ids_event_shape() {
        let event = BridgeEvent::MessagesIds {
            channel_address: "general".into(),
            ids: vec!["m1".into()],
            community_id: "c1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "messagesIds");
        assert_eq!(value["payload"]["channelAddress"], "general");
        assert_eq!(value["payload"]["ids"], json!(["m1"]));
    }
}
