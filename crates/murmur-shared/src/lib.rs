//! # murmur-shared
//!
//! Types shared by the storage layer and the node: channel and message
//! shapes, validation, the crypto collaborator and the data-socket protocol.

pub mod certificate;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;
pub mod validation;

pub use crypto::{ChainVerification, CryptoProvider, Ed25519Crypto, VerificationKey};
pub use types::*;
