use uuid::Uuid;

pub const MIN_KEY_LEN: usize = 8;
pub const MAX_KEY_LEN: usize = 128;

/// Source of candidate session keys.
pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// 32 lowercase hex characters from a random v4 UUID.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidKeyGenerator;

impl KeyGenerator for UuidKeyGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Whether a client-supplied key is well-formed enough to look up.
pub fn is_valid_session_key(key: &str) -> bool {
    (MIN_KEY_LEN..=MAX_KEY_LEN).contains(&key.len())
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
