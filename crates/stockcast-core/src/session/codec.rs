use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use super::SessionData;

type HmacSha256 = Hmac<Sha256>;

/// Largest encoded payload accepted, keeping items well under DynamoDB's
/// 400 KB item limit.
pub const MAX_PAYLOAD_BYTES: usize = 350 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload signature mismatch")]
    BadSignature,
}

/// Turns a session mapping into the opaque `data` attribute and back.
pub trait SessionCodec: Send + Sync {
    fn encode(&self, data: &SessionData) -> Result<String, CodecError>;
    fn decode(&self, raw: &str) -> Result<SessionData, CodecError>;
}

fn check_size(len: usize) -> Result<(), CodecError> {
    if len > MAX_PAYLOAD_BYTES {
        return Err(CodecError::TooLarge {
            size: len,
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

fn parse_object(bytes: &[u8]) -> Result<SessionData, CodecError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CodecError::Malformed("not a JSON object".to_string())),
        Err(e) => Err(CodecError::Malformed(e.to_string())),
    }
}

/// Plain JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl SessionCodec for JsonCodec {
    fn encode(&self, data: &SessionData) -> Result<String, CodecError> {
        let raw = serde_json::to_string(data).map_err(|e| CodecError::Malformed(e.to_string()))?;
        check_size(raw.len())?;
        Ok(raw)
    }

    fn decode(&self, raw: &str) -> Result<SessionData, CodecError> {
        check_size(raw.len())?;
        parse_object(raw.as_bytes())
    }
}

/// `base64url(json):hex(hmac-sha256)`, keyed by the application secret.
#[derive(Clone)]
pub struct SignedCodec {
    secret: Vec<u8>,
}

impl SignedCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, body: &str) -> Result<HmacSha256, CodecError> {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return Err(CodecError::Malformed("unusable signing key".to_string()));
        };
        mac.update(body.as_bytes());
        Ok(mac)
    }
}

impl std::fmt::Debug for SignedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedCodec").finish_non_exhaustive()
    }
}

impl SessionCodec for SignedCodec {
    fn encode(&self, data: &SessionData) -> Result<String, CodecError> {
        let json = serde_json::to_vec(data).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let body = URL_SAFE_NO_PAD.encode(json);

        let signature = hex::encode(self.mac(&body)?.finalize().into_bytes());

        let raw = format!("{body}:{signature}");
        check_size(raw.len())?;
        Ok(raw)
    }

    fn decode(&self, raw: &str) -> Result<SessionData, CodecError> {
        check_size(raw.len())?;
        let (body, signature) = raw
            .rsplit_once(':')
            .ok_or_else(|| CodecError::Malformed("missing signature".to_string()))?;

        let expected = hex::decode(signature).map_err(|_| CodecError::BadSignature)?;
        self.mac(body)?
            .verify_slice(&expected)
            .map_err(|_| CodecError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        parse_object(&json)
    }
}
