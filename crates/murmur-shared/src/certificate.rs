//! Community certificates.
//!
//! A certificate binds a user's onion address, libp2p peer id and nickname to
//! an Ed25519 subject key, and is signed by the community root. The root is a
//! self-signed certificate whose issuer equals its own common name.
//!
//! Wire form is PEM-style armour around base64 JSON:
//!
//! ```text
//! -----BEGIN MURMUR CERTIFICATE-----
//! eyJib2R5Ijp7InNlcmlhbCI6...
//! -----END MURMUR CERTIFICATE-----
//! ```
//!
//! Only the minimum needed to bootstrap a community and build test fixtures
//! lives here; request generation and CA services are handled elsewhere.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::CERTIFICATE_PEM_LABEL;
use crate::error::CertificateError;
use crate::identity::Identity;

/// Fields a certificate can be queried for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertField {
    /// The user's onion address.
    CommonName,
    PeerId,
    Nickname,
}

/// Identity claims of a certificate subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSubject {
    pub common_name: String,
    pub peer_id: String,
    pub nickname: String,
}

/// The signed part of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateBody {
    pub serial: u64,
    pub common_name: String,
    pub peer_id: String,
    pub nickname: String,
    /// Hex-encoded Ed25519 key of the subject.
    pub subject_key: String,
    /// Common name of the issuing certificate.
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub body: CertificateBody,
    /// Hex-encoded issuer signature over the JSON encoding of `body`.
    pub signature: String,
}

impl Certificate {
    /// Create a self-signed community root.
    pub fn issue_root(
        identity: &Identity,
        common_name: &str,
        validity: Duration,
    ) -> Result<Self, CertificateError> {
        let subject = CertificateSubject {
            common_name: common_name.to_string(),
            peer_id: String::new(),
            nickname: String::new(),
        };
        Self::sign_body(identity, build_body(&subject, identity, common_name, validity))
    }

    /// Issue a certificate for `subject_key` signed by the root identity.
    pub fn issue(
        root_identity: &Identity,
        root: &Certificate,
        subject: &CertificateSubject,
        subject_key: &Identity,
        validity: Duration,
    ) -> Result<Self, CertificateError> {
        let body = build_body(subject, subject_key, &root.body.common_name, validity);
        Self::sign_body(root_identity, body)
    }

    fn sign_body(issuer: &Identity, body: CertificateBody) -> Result<Self, CertificateError> {
        let tbs = serde_json::to_vec(&body)
            .map_err(|e| CertificateError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            body,
            signature: issuer.sign_hex(&tbs),
        })
    }

    /// Encode as an armoured PEM string.
    pub fn to_pem(&self) -> Result<String, CertificateError> {
        let json =
            serde_json::to_vec(self).map_err(|e| CertificateError::InvalidFormat(e.to_string()))?;
        let encoded = STANDARD.encode(json);

        let mut pem = format!("-----BEGIN {CERTIFICATE_PEM_LABEL}-----\n");
        for line in encoded.as_bytes().chunks(64) {
            // base64 output is ASCII
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str(&format!("-----END {CERTIFICATE_PEM_LABEL}-----\n"));
        Ok(pem)
    }

    /// Decode an armoured PEM string.
    pub fn from_pem(pem: &str) -> Result<Self, CertificateError> {
        let begin = format!("-----BEGIN {CERTIFICATE_PEM_LABEL}-----");
        let end = format!("-----END {CERTIFICATE_PEM_LABEL}-----");

        let start = pem.find(&begin).ok_or(CertificateError::MissingArmour)? + begin.len();
        let stop = pem[start..]
            .find(&end)
            .map(|i| start + i)
            .ok_or(CertificateError::MissingArmour)?;

        let b64: String = pem[start..stop]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(b64)
            .map_err(|_| CertificateError::Base64Decode)?;

        serde_json::from_slice(&bytes).map_err(|e| CertificateError::InvalidFormat(e.to_string()))
    }

    pub fn field(&self, field: CertField) -> &str {
        match field {
            CertField::CommonName => &self.body.common_name,
            CertField::PeerId => &self.body.peer_id,
            CertField::Nickname => &self.body.nickname,
        }
    }

    pub fn is_self_signed(&self) -> bool {
        self.body.issuer == self.body.common_name
    }

    /// Decode the subject key.
    pub fn subject_key(&self) -> Result<VerifyingKey, CertificateError> {
        let bytes: [u8; 32] = hex::decode(&self.body.subject_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CertificateError::InvalidFormat("subject key".into()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| CertificateError::InvalidFormat("subject key".into()))
    }

    /// Check the body signature against an issuer key.
    pub fn is_signed_by(&self, issuer_key: &VerifyingKey) -> bool {
        let Ok(tbs) = serde_json::to_vec(&self.body) else {
            return false;
        };
        let Some(signature) = hex::decode(&self.signature)
            .ok()
            .and_then(|b| Signature::from_slice(&b).ok())
        else {
            return false;
        };
        issuer_key.verify(&tbs, &signature).is_ok()
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.body.not_before <= at && at <= self.body.not_after
    }
}

fn build_body(
    subject: &CertificateSubject,
    subject_key: &Identity,
    issuer: &str,
    validity: Duration,
) -> CertificateBody {
    let now = Utc::now();
    CertificateBody {
        serial: rand::rngs::OsRng.next_u64(),
        common_name: subject.common_name.clone(),
        peer_id: subject.peer_id.clone(),
        nickname: subject.nickname.clone(),
        subject_key: subject_key.public_key_hex(),
        issuer: issuer.to_string(),
        not_before: now - Duration::minutes(5),
        not_after: now + validity,
    }
}
