//! Admission predicates run by a log before it accepts an entry.
//!
//! A gate is a local self-protection filter, not consensus: a rejected entry
//! never enters this peer's view, while other peers decide for themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use murmur_shared::crypto::{CryptoProvider, VerificationKey};
use serde_json::Value;
use tracing::debug;

use crate::log::lock;

#[async_trait]
pub trait AccessGate: Send + Sync {
    /// Decide whether `entry` may be admitted. Never fails.
    async fn can_append(&self, entry: &Value) -> bool;
}

/// Admits channel messages whose signature verifies under their own `pubKey`.
pub struct MessageGate {
    crypto: Arc<dyn CryptoProvider>,
    /// Imported keys, cached for the lifetime of the process.
    keys: Mutex<HashMap<String, VerificationKey>>,
}

impl MessageGate {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            crypto,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn key_for(&self, pub_key: &str) -> Option<VerificationKey> {
        let mut keys = lock(&self.keys);
        if let Some(key) = keys.get(pub_key) {
            return Some(*key);
        }
        let key = self.crypto.import_key(pub_key).ok()?;
        keys.insert(pub_key.to_string(), key);
        Some(key)
    }

    pub fn cached_keys(&self) -> usize {
        lock(&self.keys).len()
    }
}

#[async_trait]
impl AccessGate for MessageGate {
    async fn can_append(&self, entry: &Value) -> bool {
        let field = |name: &str| entry.get(name).and_then(Value::as_str);
        let (Some(message), Some(signature), Some(pub_key)) =
            (field("message"), field("signature"), field("pubKey"))
        else {
            debug!("message entry is missing signed fields");
            return false;
        };

        let Some(key) = self.key_for(pub_key) else {
            debug!(pub_key, "undecodable public key");
            return false;
        };

        let verified = self.crypto.verify(signature, message, &key).await;
        if !verified {
            let id = entry.get("id").and_then(Value::as_str).unwrap_or_default();
            debug!(id, "signature verification failed");
        }
        verified
    }
}

/// Admits certificates that chain-verify against the community root.
pub struct CertificateGate {
    crypto: Arc<dyn CryptoProvider>,
    root: String,
}

impl CertificateGate {
    pub fn new(crypto: Arc<dyn CryptoProvider>, root: String) -> Self {
        Self { crypto, root }
    }
}

#[async_trait]
impl AccessGate for CertificateGate {
    async fn can_append(&self, entry: &Value) -> bool {
        let Some(pem) = entry.as_str() else {
            return false;
        };
        let result = self.crypto.chain_verify(&self.root, pem).await;
        if !result.is_valid() {
            debug!(
                code = result.result_code,
                reason = %result.result_message,
                "certificate refused by gate"
            );
        }
        result.is_valid()
    }
}
