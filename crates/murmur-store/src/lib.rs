//! # murmur-store
//!
//! Replicated storage for a Murmur community.
//!
//! Every piece of shared state lives in an append-only replicated log: a
//! directory of public channels, the community's certificates, a directory of
//! direct-message threads, and one log per channel and per thread. Logs are
//! persisted in a local SQLite database and exchanged with peer replicas
//! through a [`ReplicationHub`]. Channel logs only admit messages whose
//! signature verifies.
//!
//! [`StorageFacade`] owns one community's logs and lifecycle;
//! [`spawn_bridge`] exposes it over the data-socket protocol.

pub mod bridge;
pub mod certificates;
pub mod channels;
pub mod database;
pub mod entries;
pub mod events;
pub mod gate;
pub mod log;
pub mod migrations;
pub mod storage;
pub mod threads;

mod error;

pub use bridge::{parse_frame, spawn_bridge, ProtocolBridge};
pub use database::Database;
pub use error::{ErrorKind, Result, StoreError};
pub use events::{EventSink, StorageEvent};
pub use gate::{AccessGate, CertificateGate, MessageGate};
pub use log::hub::ReplicationHub;
pub use log::replica::LocalSubstrate;
pub use log::{AccessPolicy, AppendOutcome, LogEntry, LogEvent, LogHandle, Substrate};
pub use storage::{Lifecycle, StorageFacade, StorageOptions};
