//! The community's certificate log and the policies derived from it.

use std::collections::HashSet;
use std::sync::Arc;

use murmur_shared::certificate::CertField;
use murmur_shared::crypto::CryptoProvider;
use murmur_shared::error::ValidationError;
use murmur_shared::types::UserRecord;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{publish, EventSink, StorageEvent};
use crate::log::{AppendOutcome, LogEvent, LogHandle};

pub struct CertificateRegistry {
    log: Arc<dyn LogHandle>,
    crypto: Arc<dyn CryptoProvider>,
    events: EventSink,
}

impl CertificateRegistry {
    pub fn new(log: Arc<dyn LogHandle>, crypto: Arc<dyn CryptoProvider>, events: EventSink) -> Self {
        Self {
            log,
            crypto,
            events,
        }
    }

    pub fn log(&self) -> &Arc<dyn LogHandle> {
        &self.log
    }

    /// Admitted certificates (PEM), first occurrence of each, in log order.
    pub fn certificates(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.log
            .entries()
            .into_iter()
            .filter_map(|entry| match entry.payload {
                Value::String(pem) => Some(pem),
                _ => None,
            })
            .filter(|pem| seen.insert(pem.clone()))
            .collect()
    }

    /// Verify `candidate` against `root` and append it on success.
    ///
    /// Returns `false` without appending when verification fails.
    pub async fn admit(&self, candidate: &str, root: &str) -> Result<bool> {
        if candidate.trim().is_empty() {
            return Err(ValidationError::MissingField("certificate").into());
        }
        if root.trim().is_empty() {
            return Err(ValidationError::MissingField("rootCertificate").into());
        }

        let verification = self.crypto.chain_verify(root, candidate).await;
        if !verification.is_valid() {
            warn!(
                code = verification.result_code,
                reason = %verification.result_message,
                "refusing certificate"
            );
            return Ok(false);
        }

        if self.certificates().iter().any(|pem| pem == candidate) {
            debug!("certificate already admitted");
            return Ok(true);
        }

        match self.log.append(Value::String(candidate.to_string())).await? {
            AppendOutcome::Admitted => {
                info!("certificate admitted");
                Ok(true)
            }
            AppendOutcome::Rejected => {
                warn!("certificate refused by the certificate log gate");
                Ok(false)
            }
        }
    }

    /// Whether any admitted certificate carries `name` as nickname,
    /// ignoring case. Scans the current log on every call.
    pub fn username_exists(&self, name: &str) -> bool {
        let wanted = name.to_lowercase();
        self.certificates().iter().any(|pem| {
            self.crypto
                .parse_certificate(pem)
                .map(|cert| cert.field(CertField::Nickname).to_lowercase() == wanted)
                .unwrap_or(false)
        })
    }

    /// One user per parseable certificate.
    pub fn users(&self) -> Vec<UserRecord> {
        self.certificates()
            .iter()
            .filter_map(|pem| match self.crypto.parse_certificate(pem) {
                Ok(cert) => Some(UserRecord {
                    onion_address: cert.field(CertField::CommonName).to_string(),
                    peer_id: cert.field(CertField::PeerId).to_string(),
                }),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable certificate");
                    None
                }
            })
            .collect()
    }

    pub fn handle_event(&self, event: LogEvent) {
        let certificates = self.certificates();
        debug!(?event, count = certificates.len(), "certificate log event");
        publish(
            &self.events,
            StorageEvent::CertificatesLoaded {
                certificates,
                users: self.users(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as Validity;
    use murmur_shared::certificate::{Certificate, CertificateSubject};
    use murmur_shared::identity::Identity;
    use murmur_shared::Ed25519Crypto;
    use tokio::sync::mpsc;

    use super::*;
    use crate::log::{AccessPolicy, LocalSubstrate, Substrate};

    struct Community {
        owner: Identity,
        root: Certificate,
    }

    impl Community {
        fn new() -> Self {
            let owner = Identity::generate();
            let root = Certificate::issue_root(&owner, "community", Validity::days(365)).unwrap();
            Self { owner, root }
        }

        fn root_pem(&self) -> String {
            self.root.to_pem().unwrap()
        }

        fn member(&self, nickname: &str) -> String {
            let subject = CertificateSubject {
                common_name: format!("{nickname}.onion"),
                peer_id: format!("peer-{nickname}"),
                nickname: nickname.to_string(),
            };
            Certificate::issue(
                &self.owner,
                &self.root,
                &subject,
                &Identity::generate(),
                Validity::days(30),
            )
            .unwrap()
            .to_pem()
            .unwrap()
        }
    }

    async fn registry() -> (CertificateRegistry, mpsc::UnboundedReceiver<StorageEvent>) {
        let substrate = LocalSubstrate::in_memory();
        let log = substrate
            .open_log("certificates", AccessPolicy::Open)
            .await
            .unwrap();
        log.load(Duration::from_millis(10)).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            CertificateRegistry::new(log, Arc::new(Ed25519Crypto::new()), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_admit_and_username_exists() {
        let (registry, _events) = registry().await;
        let community = Community::new();

        assert!(!registry.username_exists("bob"));
        assert!(registry
            .admit(&community.member("Bob"), &community.root_pem())
            .await
            .unwrap());
        assert!(registry.username_exists("bob"));
        assert!(registry.username_exists("BOB"));
        assert!(!registry.username_exists("alice"));

        let users = registry.users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].onion_address, "Bob.onion");
        assert_eq!(users[0].peer_id, "peer-Bob");
    }

    #[tokio::test]
    async fn test_admit_refuses_foreign_certificate() {
        let (registry, _events) = registry().await;
        let community = Community::new();
        let other = Community::new();

        let admitted = registry
            .admit(&other.member("mallory"), &community.root_pem())
            .await
            .unwrap();
        assert!(!admitted);
        assert!(registry.certificates().is_empty());
        assert!(!registry.username_exists("mallory"));
    }

    #[tokio::test]
    async fn test_admit_is_idempotent() {
        let (registry, _events) = registry().await;
        let community = Community::new();
        let pem = community.member("carol");

        assert!(registry.admit(&pem, &community.root_pem()).await.unwrap());
        assert!(registry.admit(&pem, &community.root_pem()).await.unwrap());
        assert_eq!(registry.certificates().len(), 1);
        assert_eq!(registry.log().entries().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_candidate_is_validation_error() {
        let (registry, _events) = registry().await;
        let err = registry.admit("  ", "root").await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_handle_event_publishes_view() {
        let (registry, mut events) = registry().await;
        let community = Community::new();
        registry
            .admit(&community.member("dave"), &community.root_pem())
            .await
            .unwrap();

        registry.handle_event(LogEvent::Write);
        match events.try_recv().unwrap() {
            StorageEvent::CertificatesLoaded {
                certificates,
                users,
            } => {
                assert_eq!(certificates.len(), 1);
                assert_eq!(users.len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
