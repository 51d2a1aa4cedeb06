use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{CHANNEL_LOG_PREFIX, MAX_CHANNEL_NAME_LEN, THREAD_LOG_PREFIX};
use crate::error::ValidationError;

/// Normalize a human channel name into its address form.
///
/// Trims, lowercases and collapses every run of whitespace into a single `-`.
/// The result is not validated; see [`ChannelAddress::from_name`].
pub fn normalize_channel_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Stable address of a public channel, derived once from its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelAddress(String);

impl ChannelAddress {
    /// Derive the address of a channel called `name`.
    pub fn from_name(name: &str) -> Result<Self, ValidationError> {
        let normalized = normalize_channel_name(name);
        if normalized.is_empty() {
            return Err(ValidationError::EmptyChannelName);
        }
        let len = normalized.chars().count();
        if len > MAX_CHANNEL_NAME_LEN {
            return Err(ValidationError::ChannelNameTooLong {
                len,
                max: MAX_CHANNEL_NAME_LEN,
            });
        }
        if let Some(c) = normalized
            .chars()
            .find(|c| !(c.is_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ValidationError::ForbiddenCharacter(c));
        }
        Ok(Self(normalized))
    }

    /// Accept an address only if it is already in normalized form.
    pub fn parse(address: &str) -> Result<Self, ValidationError> {
        let parsed = Self::from_name(address)?;
        if parsed.0 != address {
            return Err(ValidationError::AddressMismatch {
                address: address.to_string(),
                expected: parsed.0,
            });
        }
        Ok(parsed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic name of this channel's message log.
    pub fn log_name(&self) -> String {
        format!("{CHANNEL_LOG_PREFIX}{}", self.0)
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic name of a direct-message thread log.
pub fn thread_log_name(address: &str) -> String {
    format!("{THREAD_LOG_PREFIX}{address}")
}

/// Descriptor of a public channel, as stored in the channel directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicChannel {
    pub name: String,
    pub description: String,
    pub owner: String,
    pub address: String,
    /// Creation time in Unix milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageType {
    Basic = 1,
    Image = 2,
    Info = 3,
    File = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Basic),
            2 => Ok(Self::Image),
            3 => Ok(Self::Info),
            4 => Ok(Self::File),
            other => Err(format!("unknown message type {other}")),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// Back-reference from a media attachment to the message carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessageRef {
    pub id: String,
    pub channel_address: String,
}

/// Metadata of a file or image attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub cid: String,
    pub name: String,
    pub ext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub message: MediaMessageRef,
}

/// A signed public channel message. The signature covers `message` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaMetadata>,
    /// Creation time in Unix seconds (fractional).
    pub created_at: f64,
    pub channel_address: String,
    /// Hex-encoded Ed25519 signature over `message`.
    pub signature: String,
    /// Hex-encoded Ed25519 public key of the author.
    pub pub_key: String,
}

/// A user derived from an admitted certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub onion_address: String,
    pub peer_id: String,
}

/// A direct-message thread as recorded in the thread directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub address: String,
    pub encrypted_phrase: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_channel_name("  General   Chat "), "general-chat");
        assert_eq!(normalize_channel_name("general"), "general");
    }

    #[test]
    fn test_address_from_name() {
        let a = ChannelAddress::from_name("General").unwrap();
        let b = ChannelAddress::from_name(" general ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.log_name(), "channels.general");
    }

    #[test]
    fn test_address_rejects_forbidden_characters() {
        assert_eq!(
            ChannelAddress::from_name("off/topic"),
            Err(ValidationError::ForbiddenCharacter('/'))
        );
        assert_eq!(
            ChannelAddress::from_name("   "),
            Err(ValidationError::EmptyChannelName)
        );
        assert!(ChannelAddress::from_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_parse_requires_normalized_form() {
        assert!(ChannelAddress::parse("random").is_ok());
        assert!(matches!(
            ChannelAddress::parse("Random"),
            Err(ValidationError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn test_message_json_shape() {
        let msg = ChannelMessage {
            id: "m1".into(),
            kind: MessageType::Basic,
            message: "hi".into(),
            media: None,
            created_at: 1636995488.44,
            channel_address: "general".into(),
            signature: "00".into(),
            pub_key: "11".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], 1);
        assert_eq!(value["channelAddress"], "general");
        assert_eq!(value["pubKey"], "11");
        assert!(value.get("media").is_none());

        let back: ChannelMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let raw = serde_json::json!({
            "id": "m1", "type": 9, "message": "hi", "createdAt": 1.0,
            "channelAddress": "general", "signature": "00", "pubKey": "11"
        });
        assert!(serde_json::from_value::<ChannelMessage>(raw).is_err());
    }
}
