//! Session persistence on top of the record store.
//!
//! A [`SessionBackend`] is built once per process; each request opens its own
//! [`SessionStore`] from it. Records live in one table keyed by
//! `session_key` and expire lazily on read.

pub mod codec;
pub mod keys;
pub mod store;

pub use codec::{CodecError, JsonCodec, SessionCodec, SignedCodec, MAX_PAYLOAD_BYTES};
pub use keys::{is_valid_session_key, KeyGenerator, UuidKeyGenerator};
pub use store::{SessionBackend, SessionRecord, SessionStore, DEFAULT_MAX_CREATE_ATTEMPTS};

/// Session attributes.
pub type SessionData = serde_json::Map<String, serde_json::Value>;

pub const SESSION_KEY_ATTR: &str = "session_key";
pub const DATA_ATTR: &str = "data";
pub const EXPIRES_AT_ATTR: &str = "expires_at";
pub const LAST_MODIFIED_ATTR: &str = "last_modified";
/// Epoch-seconds copy of `expires_at` for DynamoDB TTL reaping.
pub const TTL_ATTR: &str = "ttl";
