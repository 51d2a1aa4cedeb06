/// Application name
pub const APP_NAME: &str = "Murmur";

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Maximum channel message text size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Maximum length of a normalized channel address
pub const MAX_CHANNEL_NAME_LEN: usize = 64;

/// Replicated map holding the community's channel directory
pub const CHANNEL_DIRECTORY_LOG: &str = "public-channels";

/// Append-only log of admitted user certificates
pub const CERTIFICATES_LOG: &str = "certificates";

/// Replicated map holding direct-message thread phrases
pub const THREAD_DIRECTORY_LOG: &str = "msg-threads";

/// Prefix of per-channel message logs (`channels.<address>`)
pub const CHANNEL_LOG_PREFIX: &str = "channels.";

/// Prefix of per-thread direct-message logs (`dms.<address>`)
pub const THREAD_LOG_PREFIX: &str = "dms.";

/// Initial load timeout for the three core logs
pub const CORE_LOAD_TIMEOUT_MS: u64 = 15_000;

/// Initial load timeout for channel and thread logs
pub const CHANNEL_LOAD_TIMEOUT_MS: u64 = 2_000;

/// Default port of the node's data socket
pub const DEFAULT_DATA_PORT: u16 = 4677;

/// PEM armour label of community certificates
pub const CERTIFICATE_PEM_LABEL: &str = "MURMUR CERTIFICATE";

/// Chain verification result codes
pub const CHAIN_OK: i32 = 0;
pub const CHAIN_BAD_ROOT_FORMAT: i32 = 1;
pub const CHAIN_BAD_CANDIDATE_FORMAT: i32 = 2;
pub const CHAIN_ISSUER_MISMATCH: i32 = 3;
pub const CHAIN_BAD_SIGNATURE: i32 = 4;
pub const CHAIN_OUTSIDE_VALIDITY: i32 = 5;
pub const CHAIN_INVALID_ROOT: i32 = 6;
