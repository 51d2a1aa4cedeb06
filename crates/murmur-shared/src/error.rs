use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key encoding")]
    InvalidPublicKey,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Signature verification failed")]
    VerificationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("Missing PEM armour")]
    MissingArmour,

    #[error("Base64 decode error")]
    Base64Decode,

    #[error("Invalid certificate format: {0}")]
    InvalidFormat(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Channel name is empty")]
    EmptyChannelName,

    #[error("Channel name is too long ({len} > {max})")]
    ChannelNameTooLong { len: usize, max: usize },

    #[error("Channel name contains forbidden character {0:?}")]
    ForbiddenCharacter(char),

    #[error("Channel address {address:?} does not match normalized name {expected:?}")]
    AddressMismatch { address: String, expected: String },

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
