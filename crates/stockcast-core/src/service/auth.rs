use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{AuthError, StoreError};
use crate::store::{self, Item, PutCondition, RecordStore};

static USERNAME_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.@+-]{1,150}$").ok());

pub const MIN_PASSWORD_LEN: usize = 8;

/// Stored user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: String,
    /// bcrypt hash.
    #[serde(rename = "password")]
    pub password_hash: String,
    pub created_at: String,
    #[serde(default)]
    pub last_login: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl User {
    fn from_item(item: Item) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(item))
            .map_err(|e| StoreError::DecodeFailure(format!("user record: {e}")))
    }

    fn to_item(&self) -> Result<Item, StoreError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StoreError::Invalid("user did not serialize to an object".into())),
            Err(e) => Err(StoreError::Invalid(e.to_string())),
        }
    }
}

pub fn is_valid_username(username: &str) -> bool {
    USERNAME_RE
        .as_ref()
        .is_some_and(|re| re.is_match(username))
}

/// Registration, login and password changes against the users table.
#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn RecordStore>,
    table: String,
    hash_cost: u32,
}

impl AccountService {
    pub fn new(store: Arc<dyn RecordStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            hash_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Override the bcrypt work factor.
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    fn hash(&self, password: &str) -> Result<String, AuthError> {
        bcrypt::hash(password, self.hash_cost).map_err(|e| AuthError::Hash(e.to_string()))
    }

    fn verify(password: &str, hash: &str) -> bool {
        match bcrypt::verify(password, hash) {
            Ok(ok) => ok,
            Err(e) => {
                warn!("Stored password hash is unreadable: {}", e);
                false
            }
        }
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>, AuthError> {
        let found = self.store.get(&self.table, &store::key("username", username))?;
        Ok(found.map(User::from_item).transpose()?)
    }

    pub fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
        confirm: &str,
    ) -> Result<User, AuthError> {
        let username = username.trim();
        let email = email.trim();
        if username.is_empty() || email.is_empty() || password.is_empty() || confirm.is_empty() {
            return Err(AuthError::MissingFields);
        }
        if password != confirm {
            return Err(AuthError::PasswordMismatch);
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::PasswordTooShort);
        }
        if !is_valid_username(username) {
            return Err(AuthError::InvalidUsername);
        }

        let user = User {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: self.hash(password)?,
            created_at: crate::util::timestamp(),
            last_login: None,
            is_active: true,
        };

        match self.store.put(
            &self.table,
            user.to_item()?,
            PutCondition::IfNotExists("username".to_string()),
        ) {
            Ok(()) => {
                info!("Registered user {}", user.username);
                Ok(user)
            }
            Err(e) if e.is_conflict() => Err(AuthError::UsernameTaken),
            Err(e) => Err(e.into()),
        }
    }

    /// Check credentials and stamp `last_login`.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User, AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingFields);
        }

        let Some(mut user) = self.get_user(username)? else {
            return Err(AuthError::InvalidCredentials);
        };
        if !Self::verify(password, &user.password_hash) {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        let now = crate::util::timestamp();
        self.store.update(
            &self.table,
            &store::key("username", username),
            store::key("last_login", now.as_str()),
        )?;
        user.last_login = Some(now);
        Ok(user)
    }

    pub fn change_password(
        &self,
        username: &str,
        current: &str,
        new: &str,
        confirm: &str,
    ) -> Result<(), AuthError> {
        if current.is_empty() || new.is_empty() || confirm.is_empty() {
            return Err(AuthError::MissingFields);
        }
        if new != confirm {
            return Err(AuthError::PasswordMismatch);
        }
        if new.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::PasswordTooShort);
        }

        let Some(user) = self.get_user(username)? else {
            return Err(AuthError::UserNotFound);
        };
        if !Self::verify(current, &user.password_hash) {
            return Err(AuthError::WrongPassword);
        }

        let hash = self.hash(new)?;
        self.store.update(
            &self.table,
            &store::key("username", username),
            store::key("password", hash),
        )?;
        info!("Password changed for {}", username);
        Ok(())
    }

    /// Enable or disable an account.
    pub fn set_active(&self, username: &str, active: bool) -> Result<(), AuthError> {
        if self.get_user(username)?.is_none() {
            return Err(AuthError::UserNotFound);
        }
        self.store.update(
            &self.table,
            &store::key("username", username),
            store::key("is_active", active),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRecordStore, TableSchema};

    fn service() -> AccountService {
        let store = Arc::new(MemoryRecordStore::with_tables(&[TableSchema::new(
            "Users", "username",
        )]));
        AccountService::new(store, "Users").with_hash_cost(4)
    }

    #[test]
    fn test_register_and_authenticate() {
        let svc = service();
        let user = svc
            .register("alice", "alice@example.com", "hunter22", "hunter22")
            .unwrap();
        assert_ne!(user.password_hash, "hunter22");
        assert!(user.last_login.is_none());

        let logged_in = svc.authenticate("alice", "hunter22").unwrap();
        assert!(logged_in.last_login.is_some());

        let stored = svc.get_user("alice").unwrap().unwrap();
        assert_eq!(stored.last_login, logged_in.last_login);
        assert_eq!(stored.email, "alice@example.com");
    }

    #[test]
    fn test_register_validation() {
        let svc = service();
        assert!(matches!(
            svc.register("", "a@x", "password1", "password1"),
            Err(AuthError::MissingFields)
        ));
        assert!(matches!(
            svc.register("bob", "b@x", "password1", "password2"),
            Err(AuthError::PasswordMismatch)
        ));
        assert!(matches!(
            svc.register("bob", "b@x", "short", "short"),
            Err(AuthError::PasswordTooShort)
        ));
        assert!(matches!(
            svc.register("bob smith", "b@x", "password1", "password1"),
            Err(AuthError::InvalidUsername)
        ));
    }

    #[test]
    fn test_duplicate_username() {
        let svc = service();
        svc.register("carol", "c@x", "password1", "password1").unwrap();
        let err = svc
            .register("carol", "other@x", "password2", "password2")
            .unwrap_err();
        assert!(matches!(err, AuthError::UsernameTaken));
        assert_eq!(err.to_string(), "Username already exists.");
        assert_eq!(svc.get_user("carol").unwrap().unwrap().email, "c@x");
    }

    #[test]
    fn test_bad_credentials() {
        let svc = service();
        svc.register("dave", "d@x", "password1", "password1").unwrap();
        assert!(matches!(
            svc.authenticate("dave", "wrongpass"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            svc.authenticate("nobody", "password1"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_disabled_account() {
        let svc = service();
        svc.register("erin", "e@x", "password1", "password1").unwrap();
        svc.set_active("erin", false).unwrap();
        assert!(matches!(
            svc.authenticate("erin", "password1"),
            Err(AuthError::AccountDisabled)
        ));
    }

    #[test]
    fn test_change_password() {
        let svc = service();
        svc.register("frank", "f@x", "password1", "password1").unwrap();

        assert!(matches!(
            svc.change_password("frank", "nope-nope", "newpass123", "newpass123"),
            Err(AuthError::WrongPassword)
        ));
        assert!(matches!(
            svc.change_password("frank", "password1", "newpass123", "newpass124"),
            Err(AuthError::PasswordMismatch)
        ));
        svc.change_password("frank", "password1", "newpass123", "newpass123")
            .unwrap();

        assert!(svc.authenticate("frank", "password1").is_err());
        assert!(svc.authenticate("frank", "newpass123").is_ok());
        assert!(matches!(
            svc.change_password("ghost", "password1", "newpass123", "newpass123"),
            Err(AuthError::UserNotFound)
        ));
    }

    #[test]
    fn test_username_pattern() {
        assert!(is_valid_username("a.b+c@d-e_f"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username(&"x".repeat(151)));
        assert!(!is_valid_username("semi;colon"));
    }
}
