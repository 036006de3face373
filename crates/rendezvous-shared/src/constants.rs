/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Device and admin auth token size in bytes
pub const AUTH_TOKEN_SIZE: usize = 16;

/// Push notification token size in bytes
pub const PUSH_TOKEN_SIZE: usize = 16;

/// Topic identifier size in bytes
pub const TOPIC_ID_SIZE: usize = 12;

/// Message (file) identifier size in bytes
pub const MESSAGE_ID_SIZE: usize = 12;

/// File content hash size in bytes (SHA-256)
pub const FILE_HASH_SIZE: usize = 32;

/// File authentication tag size in bytes
pub const FILE_TAG_SIZE: usize = 16;

/// Maximum user name length in characters
pub const MAX_NAME_LEN: usize = 32;

/// Maximum application identifier length in characters
pub const MAX_APP_ID_LEN: usize = 10;

/// Topic update metadata must stay below this many bytes
pub const METADATA_LIMIT: usize = 100;

/// Accepted clock skew for timestamped records, in seconds
pub const FRESHNESS_WINDOW_SECS: i64 = 60;

/// Registration pins are drawn from 0..PIN_RANGE
pub const PIN_RANGE: u32 = 100_000;

/// Wrong-pin attempts before an allowed user is evicted
pub const REGISTRATION_TRIES: u32 = 3;

/// Registration pin lifetime in seconds (~7.9 days)
pub const PIN_EXPIRY_SECS: i64 = 60 * 60 * 32 * 7;

/// Topic updates per chain segment file
pub const CHAIN_SEGMENT_LEN: u32 = 1000;
