use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::codec::{CodecError, JsonCodec, SessionCodec, SignedCodec};
use super::keys::{is_valid_session_key, KeyGenerator, UuidKeyGenerator};
use super::{
    SessionData, DATA_ATTR, EXPIRES_AT_ATTR, LAST_MODIFIED_ATTR, SESSION_KEY_ATTR, TTL_ATTR,
};
use crate::config::SessionConfig;
use crate::error::{CreateError, SessionError, StoreError};
use crate::store::{self, get_str, Item, PutCondition, RecordStore};
use crate::util::{format_timestamp, parse_timestamp, Clock, SystemClock};

pub const DEFAULT_MAX_CREATE_ATTEMPTS: u32 = 10;

/// Upper bound on the session lifetime (100 years).
const MAX_LIFETIME_SECS: i64 = 100 * 365 * 24 * 3600;

/// A decoded session row, for inspection tools.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_key: String,
    pub data: SessionData,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_modified: Option<String>,
}

impl SessionRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at <= now)
    }
}

/// Shared session factory.
///
/// Holds the record store handle and every collaborator a session needs.
/// Cloning is cheap; open one [`SessionStore`] per request.
#[derive(Clone)]
pub struct SessionBackend {
    store: Arc<dyn RecordStore>,
    table: String,
    lifetime: Duration,
    codec: Arc<dyn SessionCodec>,
    keys: Arc<dyn KeyGenerator>,
    clock: Arc<dyn Clock>,
    max_create_attempts: u32,
}

impl SessionBackend {
    pub fn new(store: Arc<dyn RecordStore>, table: impl Into<String>, lifetime_secs: u64) -> Self {
        Self {
            store,
            table: table.into(),
            lifetime: Duration::seconds(
                i64::try_from(lifetime_secs)
                    .unwrap_or(MAX_LIFETIME_SECS)
                    .min(MAX_LIFETIME_SECS),
            ),
            codec: Arc::new(JsonCodec),
            keys: Arc::new(UuidKeyGenerator),
            clock: Arc::new(SystemClock),
            max_create_attempts: DEFAULT_MAX_CREATE_ATTEMPTS,
        }
    }

    /// Build from the session section of the config. A non-empty secret
    /// selects the signed codec.
    pub fn from_config(store: Arc<dyn RecordStore>, config: &SessionConfig) -> Self {
        let backend = Self::new(store, &config.table_name, config.cookie_age)
            .with_max_create_attempts(config.max_create_attempts);
        if config.secret_key.is_empty() {
            backend
        } else {
            backend.with_codec(Arc::new(SignedCodec::new(&config.secret_key)))
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn SessionCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_create_attempts(mut self, attempts: u32) -> Self {
        self.max_create_attempts = attempts.max(1);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Session lifetime in seconds.
    pub fn lifetime_secs(&self) -> i64 {
        self.lifetime.num_seconds()
    }

    /// Open a session for one request. No I/O happens here.
    ///
    /// Malformed keys are dropped, so the session starts anonymous.
    pub fn open(&self, key: Option<&str>) -> SessionStore {
        let key = key.and_then(|k| {
            if is_valid_session_key(k) {
                Some(k.to_string())
            } else {
                debug!("Ignoring malformed session key ({} chars)", k.len());
                None
            }
        });
        SessionStore {
            backend: self.clone(),
            key,
            cache: None,
            accessed: false,
            modified: false,
        }
    }

    /// Physical presence of a record, ignoring expiry. Store failures read as
    /// absent.
    pub fn exists(&self, key: &str) -> bool {
        match self.store.get(&self.table, &store::key(SESSION_KEY_ATTR, key)) {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!("Session existence check failed: {}", e);
                false
            }
        }
    }

    /// Read and decode a record without applying expiry.
    pub fn inspect(&self, key: &str) -> Result<Option<SessionRecord>, StoreError> {
        let Some(item) = self.store.get(&self.table, &store::key(SESSION_KEY_ATTR, key))? else {
            return Ok(None);
        };
        let raw = get_str(&item, DATA_ATTR).unwrap_or("{}");
        let data = self
            .codec
            .decode(raw)
            .map_err(|e| StoreError::DecodeFailure(e.to_string()))?;
        Ok(Some(SessionRecord {
            session_key: key.to_string(),
            data,
            expires_at: expires_at(&item),
            last_modified: get_str(&item, LAST_MODIFIED_ATTR).map(String::from),
        }))
    }

    /// Delete a record; absent keys and store failures are not errors.
    pub fn delete(&self, key: &str) {
        if let Err(e) = self.store.delete(&self.table, &store::key(SESSION_KEY_ATTR, key)) {
            warn!("Failed to delete session: {}", e);
        }
    }

    /// Remove every expired record. Returns how many were deleted.
    pub fn clear_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut removed = 0;
        for item in self.store.scan(&self.table)? {
            if !is_expired(&item, now) {
                continue;
            }
            let Some(key) = get_str(&item, SESSION_KEY_ATTR) else {
                continue;
            };
            self.store
                .delete(&self.table, &store::key(SESSION_KEY_ATTR, key))?;
            removed += 1;
        }
        info!("Cleared {} expired sessions from {}", removed, self.table);
        Ok(removed)
    }

    fn record(&self, key: &str, data: &SessionData) -> Result<Item, CodecError> {
        let encoded = self.codec.encode(data)?;
        let now = self.clock.now();
        let expires = now + self.lifetime;

        let mut item = store::key(SESSION_KEY_ATTR, key);
        item.insert(DATA_ATTR.into(), Value::String(encoded));
        item.insert(EXPIRES_AT_ATTR.into(), Value::String(format_timestamp(expires)));
        item.insert(LAST_MODIFIED_ATTR.into(), Value::String(format_timestamp(now)));
        item.insert(TTL_ATTR.into(), Value::from(expires.timestamp()));
        Ok(item)
    }
}

fn expires_at(item: &Item) -> Option<DateTime<Utc>> {
    get_str(item, EXPIRES_AT_ATTR).and_then(parse_timestamp)
}

/// Missing or unreadable expiry counts as expired.
fn is_expired(item: &Item, now: DateTime<Utc>) -> bool {
    expires_at(item).map_or(true, |at| at <= now)
}

/// One request's view of a session.
///
/// Data is loaded lazily on first access and written back by [`save`].
///
/// [`save`]: SessionStore::save
pub struct SessionStore {
    backend: SessionBackend,
    key: Option<String>,
    cache: Option<SessionData>,
    accessed: bool,
    modified: bool,
}

impl SessionStore {
    pub fn session_key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn accessed(&self) -> bool {
        self.accessed
    }

    pub fn modified(&self) -> bool {
        self.modified
    }

    /// Session lifetime in seconds, counted from the next save.
    pub fn expiry_age(&self) -> i64 {
        self.backend.lifetime_secs()
    }

    /// Load the backing record if that has not happened yet. Does not mark
    /// the session as accessed.
    pub fn ensure_loaded(&mut self) {
        if self.cache.is_none() {
            let data = self.load();
            self.cache = Some(data);
        }
    }

    fn data(&mut self) -> &mut SessionData {
        self.accessed = true;
        self.ensure_loaded();
        self.cache.get_or_insert_with(SessionData::new)
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.data().get(key).cloned()
    }

    /// Typed read; values that do not deserialize read as absent.
    pub fn get_as<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let old = self.data().insert(key.into(), value.into());
        self.modified = true;
        old
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let old = self.data().remove(key);
        if old.is_some() {
            self.modified = true;
        }
        old
    }

    pub fn contains_key(&mut self, key: &str) -> bool {
        self.data().contains_key(key)
    }

    pub fn is_empty(&mut self) -> bool {
        self.data().is_empty()
    }

    pub fn keys(&mut self) -> Vec<String> {
        self.data().keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.accessed = true;
        self.cache = Some(SessionData::new());
        self.modified = true;
    }

    /// Read the bound record.
    ///
    /// Never fails: a missing, expired or undecodable record reads as empty.
    /// A missing or expired record also unbinds the key, so a later save
    /// creates a fresh one.
    pub fn load(&mut self) -> SessionData {
        let Some(key) = self.key.clone() else {
            return SessionData::new();
        };
        let backend = &self.backend;

        let item = match backend
            .store
            .get(&backend.table, &store::key(SESSION_KEY_ATTR, key.as_str()))
        {
            Ok(Some(item)) => item,
            Ok(None) => {
                debug!("Session not found, unbinding key");
                self.key = None;
                return SessionData::new();
            }
            Err(e) => {
                warn!("Session load failed, continuing with an empty session: {}", e);
                return SessionData::new();
            }
        };

        if is_expired(&item, backend.clock.now()) {
            debug!("Session expired, deleting record");
            backend.delete(&key);
            self.key = None;
            return SessionData::new();
        }

        let Some(raw) = get_str(&item, DATA_ATTR) else {
            warn!("Session record has no data attribute");
            return SessionData::new();
        };
        match backend.codec.decode(raw) {
            Ok(data) => data,
            Err(e) => {
                warn!("Session data corrupted: {}", e);
                SessionData::new()
            }
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.backend.exists(key)
    }

    /// Bind a new unique key and persist the current data under it.
    ///
    /// Colliding keys are discarded and regenerated, at most
    /// `max_create_attempts` times.
    pub fn create(&mut self) -> Result<String, SessionError> {
        let attempts = self.backend.max_create_attempts;
        for attempt in 1..=attempts {
            let candidate = self.backend.keys.generate();
            if self.backend.exists(&candidate) {
                debug!("Generated session key already in use (attempt {})", attempt);
                continue;
            }

            self.key = Some(candidate.clone());
            match self.save(true) {
                Ok(()) => {
                    self.modified = true;
                    return Ok(candidate);
                }
                Err(e) if e.is_key_conflict() => {
                    debug!("Session key taken concurrently (attempt {})", attempt);
                    self.key = None;
                }
                Err(e) => {
                    self.key = None;
                    return Err(e);
                }
            }
        }

        warn!("Gave up creating a session after {} attempts", attempts);
        self.key = None;
        Err(SessionError::CreationFailed(CreateError::Exhausted(attempts)))
    }

    /// Persist the session with a fresh expiry.
    ///
    /// With `must_create` the write only succeeds if the key is unused, and
    /// the cached data is written without consulting the store. Without a
    /// bound key this creates a new session.
    pub fn save(&mut self, must_create: bool) -> Result<(), SessionError> {
        if !must_create {
            self.ensure_loaded();
        }
        let Some(key) = self.key.clone() else {
            return self.create().map(|_| ());
        };

        let data = self.cache.clone().unwrap_or_default();
        let item = match self.backend.record(&key, &data) {
            Ok(item) => item,
            Err(e) if must_create => {
                return Err(SessionError::CreationFailed(CreateError::Encode(e)));
            }
            Err(e) => return Err(SessionError::Encode(e)),
        };
        let condition = if must_create {
            PutCondition::IfNotExists(SESSION_KEY_ATTR.to_string())
        } else {
            PutCondition::Always
        };

        match self.backend.store.put(&self.backend.table, item, condition) {
            Ok(()) => Ok(()),
            Err(e) if must_create && e.is_conflict() => {
                Err(SessionError::CreationFailed(CreateError::KeyExists(key)))
            }
            Err(e) if must_create => Err(SessionError::CreationFailed(CreateError::Store(e))),
            Err(e) => Err(SessionError::Write(e)),
        }
    }

    /// Delete the record for `key`, or for the bound key.
    pub fn delete(&mut self, key: Option<&str>) {
        if let Some(k) = key.or(self.key.as_deref()) {
            self.backend.delete(k);
        }
    }

    /// Drop all data, delete the record and unbind the key.
    pub fn flush(&mut self) {
        self.clear();
        self.delete(None);
        self.key = None;
    }

    /// Move the current data to a freshly created key and delete the old
    /// record.
    pub fn cycle_key(&mut self) -> Result<(), SessionError> {
        self.ensure_loaded();
        let old = self.key.take();
        if let Err(e) = self.create() {
            self.key = old;
            return Err(e);
        }
        if let Some(old) = old {
            self.backend.delete(&old);
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("table", &self.backend.table)
            .field("bound", &self.key.is_some())
            .field("loaded", &self.cache.is_some())
            .field("accessed", &self.accessed)
            .field("modified", &self.modified)
            .finish()
    }
}
