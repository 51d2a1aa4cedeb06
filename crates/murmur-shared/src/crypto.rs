//! Crypto collaborator consumed by the storage layer.
//!
//! The store never performs signature math itself; it goes through
//! [`CryptoProvider`], whose reference implementation is [`Ed25519Crypto`].

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::certificate::{CertField, Certificate};
use crate::constants::*;
use crate::error::{CertificateError, CryptoError};

/// A decoded public key, ready for repeated verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationKey(VerifyingKey);

impl VerificationKey {
    pub fn from_hex(pub_key: &str) -> Result<Self, CryptoError> {
        let bytes: [u8; PUBKEY_SIZE] = hex::decode(pub_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(CryptoError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }
}

/// Outcome of verifying a certificate against a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub result_code: i32,
    pub result_message: String,
}

impl ChainVerification {
    fn ok() -> Self {
        Self {
            result_code: CHAIN_OK,
            result_message: "certificate is valid".into(),
        }
    }

    fn fail(result_code: i32, result_message: impl Into<String>) -> Self {
        Self {
            result_code,
            result_message: result_message.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.result_code == CHAIN_OK
    }
}

/// Parsed view of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate(Certificate);

impl ParsedCertificate {
    pub fn field(&self, field: CertField) -> &str {
        self.0.field(field)
    }
}

#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Derive a verification key from an encoded public key.
    fn import_key(&self, pub_key: &str) -> Result<VerificationKey, CryptoError>;

    /// Check `signature` over `payload`. Never errors; bad input is `false`.
    async fn verify(&self, signature: &str, payload: &str, key: &VerificationKey) -> bool;

    fn parse_certificate(&self, pem: &str) -> Result<ParsedCertificate, CertificateError>;

    /// Verify that `candidate` was issued by `root`.
    async fn chain_verify(&self, root: &str, candidate: &str) -> ChainVerification;
}

/// Ed25519 implementation with hex-encoded keys and signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Crypto;

impl Ed25519Crypto {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CryptoProvider for Ed25519Crypto {
    fn import_key(&self, pub_key: &str) -> Result<VerificationKey, CryptoError> {
        VerificationKey::from_hex(pub_key)
    }

    async fn verify(&self, signature: &str, payload: &str, key: &VerificationKey) -> bool {
        let Some(signature) = hex::decode(signature)
            .ok()
            .filter(|b| b.len() == SIGNATURE_SIZE)
            .and_then(|b| Signature::from_slice(&b).ok())
        else {
            return false;
        };
        key.0.verify(payload.as_bytes(), &signature).is_ok()
    }

    fn parse_certificate(&self, pem: &str) -> Result<ParsedCertificate, CertificateError> {
        Certificate::from_pem(pem).map(ParsedCertificate)
    }

    async fn chain_verify(&self, root: &str, candidate: &str) -> ChainVerification {
        let root = match Certificate::from_pem(root) {
            Ok(root) => root,
            Err(e) => return ChainVerification::fail(CHAIN_BAD_ROOT_FORMAT, e.to_string()),
        };
        let candidate = match Certificate::from_pem(candidate) {
            Ok(candidate) => candidate,
            Err(e) => return ChainVerification::fail(CHAIN_BAD_CANDIDATE_FORMAT, e.to_string()),
        };

        let root_key = match root.subject_key() {
            Ok(key) if root.is_self_signed() && root.is_signed_by(&key) => key,
            _ => return ChainVerification::fail(CHAIN_INVALID_ROOT, "root is not self-signed"),
        };

        if candidate.body.issuer != root.body.common_name {
            return ChainVerification::fail(
                CHAIN_ISSUER_MISMATCH,
                format!(
                    "issuer {:?} does not match root {:?}",
                    candidate.body.issuer, root.body.common_name
                ),
            );
        }

        if !candidate.is_signed_by(&root_key) {
            return ChainVerification::fail(CHAIN_BAD_SIGNATURE, "signature does not match root key");
        }

        let now = Utc::now();
        if !root.is_valid_at(now) || !candidate.is_valid_at(now) {
            return ChainVerification::fail(CHAIN_OUTSIDE_VALIDITY, "outside validity period");
        }

        ChainVerification::ok()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::certificate::CertificateSubject;
    use crate::identity::Identity;

    fn subject(nickname: &str) -> CertificateSubject {
        CertificateSubject {
            common_name: format!("{nickname}.onion"),
            peer_id: format!("peer-{nickname}"),
            nickname: nickname.to_string(),
        }
    }

    #[tokio::test]
    async fn test_verify_message_signature() {
        let crypto = Ed25519Crypto::new();
        let author = Identity::generate();
        let key = crypto.import_key(&author.public_key_hex()).unwrap();

        let signature = author.sign_hex(b"hi");
        assert!(crypto.verify(&signature, "hi", &key).await);
        assert!(!crypto.verify(&signature, "hello", &key).await);
        assert!(!crypto.verify("zz", "hi", &key).await);
        assert!(!crypto.verify("00", "hi", &key).await);
    }

    #[test]
    fn test_import_key_rejects_garbage() {
        let crypto = Ed25519Crypto::new();
        assert_eq!(crypto.import_key("xyz"), Err(CryptoError::InvalidPublicKey));
        assert_eq!(crypto.import_key("abcd"), Err(CryptoError::InvalidPublicKey));
    }

    #[tokio::test]
    async fn test_chain_verify() {
        let crypto = Ed25519Crypto::new();
        let owner = Identity::generate();
        let root = Certificate::issue_root(&owner, "root", Duration::days(365)).unwrap();
        let user = Certificate::issue(
            &owner,
            &root,
            &subject("alice"),
            &Identity::generate(),
            Duration::days(30),
        )
        .unwrap();

        let root_pem = root.to_pem().unwrap();
        let result = crypto.chain_verify(&root_pem, &user.to_pem().unwrap()).await;
        assert!(result.is_valid(), "{}", result.result_message);

        let parsed = crypto.parse_certificate(&user.to_pem().unwrap()).unwrap();
        assert_eq!(parsed.field(CertField::Nickname), "alice");
    }

    #[tokio::test]
    async fn test_chain_verify_foreign_root() {
        let crypto = Ed25519Crypto::new();
        let owner = Identity::generate();
        let root = Certificate::issue_root(&owner, "root", Duration::days(365)).unwrap();

        // Same common name, different key
        let impostor = Identity::generate();
        let fake_root = Certificate::issue_root(&impostor, "root", Duration::days(365)).unwrap();
        let forged = Certificate::issue(
            &impostor,
            &fake_root,
            &subject("mallory"),
            &Identity::generate(),
            Duration::days(30),
        )
        .unwrap();

        let result = crypto
            .chain_verify(&root.to_pem().unwrap(), &forged.to_pem().unwrap())
            .await;
        assert_eq!(result.result_code, CHAIN_BAD_SIGNATURE);
    }

    #[tokio::test]
    async fn test_chain_verify_bad_inputs() {
        let crypto = Ed25519Crypto::new();
        let owner = Identity::generate();
        let root = Certificate::issue_root(&owner, "root", Duration::days(365))
            .unwrap()
            .to_pem()
            .unwrap();

        assert_eq!(
            crypto.chain_verify("nope", &root).await.result_code,
            CHAIN_BAD_ROOT_FORMAT
        );
        assert_eq!(
            crypto.chain_verify(&root, "nope").await.result_code,
            CHAIN_BAD_CANDIDATE_FORMAT
        );
    }

    #[tokio::test]
    async fn test_chain_verify_issuer_mismatch_and_expiry() {
        let crypto = Ed25519Crypto::new();
        let owner = Identity::generate();
        let root = Certificate::issue_root(&owner, "root", Duration::days(365)).unwrap();
        let other_root = Certificate::issue_root(&owner, "other", Duration::days(365)).unwrap();

        let foreign = Certificate::issue(
            &owner,
            &other_root,
            &subject("carol"),
            &Identity::generate(),
            Duration::days(30),
        )
        .unwrap();
        let result = crypto
            .chain_verify(&root.to_pem().unwrap(), &foreign.to_pem().unwrap())
            .await;
        assert_eq!(result.result_code, CHAIN_ISSUER_MISMATCH);

        let expired = Certificate::issue(
            &owner,
            &root,
            &subject("dave"),
            &Identity::generate(),
            Duration::minutes(-10),
        )
        .unwrap();
        let result = crypto
            .chain_verify(&root.to_pem().unwrap(), &expired.to_pem().unwrap())
            .await;
        assert_eq!(result.result_code, CHAIN_OUTSIDE_VALIDITY);
    }
}
