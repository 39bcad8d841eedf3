use std::path::PathBuf;

use crate::session::codec::CodecError;

/// Core error types for stockcast.
#[derive(Debug, thiserror::Error)]
pub enum StockcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Prediction error: {0}")]
    Prediction(#[from] PredictionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure kinds reported by a record store.
///
/// Callers branch on the variant: a `Conflict` is the only signal that a
/// conditional write lost, everything else is a store-side failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conditional write rejected: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode record: {0}")]
    DecodeFailure(String),

    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Why a session could not be created.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("session key already exists: {0}")]
    KeyExists(String),

    #[error("{0}")]
    Store(StoreError),

    #[error("could not encode session: {0}")]
    Encode(CodecError),

    #[error("gave up after {0} attempts")]
    Exhausted(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session could not be created: {0}")]
    CreationFailed(CreateError),

    #[error("Failed to write session: {0}")]
    Write(StoreError),

    #[error("Failed to encode session: {0}")]
    Encode(#[from] CodecError),
}

impl SessionError {
    /// True when a `must_create` write lost against an existing key.
    pub fn is_key_conflict(&self) -> bool {
        matches!(self, SessionError::CreationFailed(CreateError::KeyExists(_)))
    }

    pub fn is_creation_failure(&self) -> bool {
        matches!(self, SessionError::CreationFailed(_))
    }
}

/// Account errors. `Display` is the message shown to the user.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("All fields are required.")]
    MissingFields,

    #[error("Passwords do not match.")]
    PasswordMismatch,

    #[error("Password must be at least 8 characters.")]
    PasswordTooShort,

    #[error("Invalid username.")]
    InvalidUsername,

    #[error("Username already exists.")]
    UsernameTaken,

    #[error("Invalid credentials.")]
    InvalidCredentials,

    #[error("Current password is incorrect.")]
    WrongPassword,

    #[error("Account is disabled.")]
    AccountDisabled,

    #[error("User not found.")]
    UserNotFound,

    #[error("Password hashing failed: {0}")]
    Hash(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Prediction errors. `Display` is the message shown to the user.
#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("Missing {0}")]
    MissingSymbol(&'static str),

    #[error("Invalid {0}. It should be an integer.")]
    NotAnInteger(&'static str),

    #[error("Invalid {0}.")]
    UnknownSymbol(&'static str),

    #[error("Failed to fetch {0} data.")]
    MarketData(&'static str),

    #[error("Model loading failed.")]
    ModelLoad(String),

    #[error("Prediction failed.")]
    Evaluation(String),
}

pub type Result<T> = std::result::Result<T, StockcastError>;
