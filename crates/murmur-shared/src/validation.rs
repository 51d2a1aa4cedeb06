//! Shape checks run before anything touches a log.

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::ValidationError;
use crate::types::{ChannelAddress, ChannelMessage, PublicChannel};

/// Validate a channel descriptor and return its normalized address.
///
/// The descriptor's `address` must equal the normalized form of its `name`.
pub fn validate_channel(channel: &PublicChannel) -> Result<ChannelAddress, ValidationError> {
    let address = ChannelAddress::from_name(&channel.name)?;
    if channel.address != address.as_str() {
        return Err(ValidationError::AddressMismatch {
            address: channel.address.clone(),
            expected: address.as_str().to_string(),
        });
    }
    Ok(address)
}

/// Validate an outgoing channel message.
pub fn validate_message(message: &ChannelMessage) -> Result<ChannelAddress, ValidationError> {
    require("id", &message.id)?;
    require("signature", &message.signature)?;
    require("pubKey", &message.pub_key)?;
    require("channelAddress", &message.channel_address)?;

    if message.message.len() > MAX_MESSAGE_SIZE {
        return Err(ValidationError::MessageTooLarge {
            size: message.message.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    if !message.created_at.is_finite() {
        return Err(ValidationError::InvalidField {
            field: "createdAt",
            reason: "not a finite number".into(),
        });
    }

    ChannelAddress::parse(&message.channel_address)
}

pub fn validate_conversation(address: &str, encrypted_phrase: &str) -> Result<(), ValidationError> {
    require("address", address)?;
    require("encryptedPhrase", encrypted_phrase)
}

pub fn validate_direct_message(address: &str, message: &str) -> Result<(), ValidationError> {
    require("channelAddress", address)?;
    require("message", message)?;
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(ValidationError::MessageTooLarge {
            size: message.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;

    fn channel(name: &str, address: &str) -> PublicChannel {
        PublicChannel {
            name: name.into(),
            description: String::new(),
            owner: "owner".into(),
            address: address.into(),
            timestamp: 0,
        }
    }

    fn message(text: &str) -> ChannelMessage {
        ChannelMessage {
            id: "m1".into(),
            kind: MessageType::Basic,
            message: text.into(),
            media: None,
            created_at: 1.5,
            channel_address: "general".into(),
            signature: "aa".into(),
            pub_key: "bb".into(),
        }
    }

    #[test]
    fn test_validate_channel() {
        let address = validate_channel(&channel("General", "general")).unwrap();
        assert_eq!(address.as_str(), "general");

        assert!(matches!(
            validate_channel(&channel("General", "other")),
            Err(ValidationError::AddressMismatch { .. })
        ));
        assert_eq!(
            validate_channel(&channel("", "")),
            Err(ValidationError::EmptyChannelName)
        );
    }

    #[test]
    fn test_validate_message() {
        assert!(validate_message(&message("hi")).is_ok());

        let mut missing = message("hi");
        missing.signature.clear();
        assert_eq!(
            validate_message(&missing),
            Err(ValidationError::MissingField("signature"))
        );

        let huge = message(&"x".repeat(MAX_MESSAGE_SIZE + 1));
        assert!(matches!(
            validate_message(&huge),
            Err(ValidationError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_validate_message_requires_normalized_address() {
        let mut msg = message("hi");
        msg.channel_address = "General".into();
        assert!(validate_message(&msg).is_err());
    }

    #[test]
    fn test_validate_conversation_and_dm() {
        assert!(validate_conversation("abc", "phrase").is_ok());
        assert_eq!(
            validate_conversation("abc", " "),
            Err(ValidationError::MissingField("encryptedPhrase"))
        );
        assert!(validate_direct_message("abc", "cipher").is_ok());
        assert!(validate_direct_message("", "cipher").is_err());
    }
}
