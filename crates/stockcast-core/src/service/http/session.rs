use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{SET_COOKIE, VARY};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{internal_error, AppState};
use crate::config::SessionConfig;
use crate::session::SessionStore;

/// Session key holding the logged-in user.
pub const USER_KEY: &str = "user";
/// Session key holding pending flash messages.
pub const MESSAGES_KEY: &str = "_messages";

/// The request's session, shared between the middleware and handlers.
///
/// The middleware loads the record before the handler runs, so reads and
/// writes through [`with`](SessionHandle::with) never touch the store.
/// Operations that do (`flush`, `cycle_key`) go through
/// [`blocking`](SessionHandle::blocking).
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<SessionStore>>,
}

impl SessionHandle {
    pub fn new(store: SessionStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    fn lock(inner: &Mutex<SessionStore>) -> MutexGuard<'_, SessionStore> {
        inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut SessionStore) -> T) -> T {
        f(&mut Self::lock(&self.inner))
    }

    /// Run store-touching session work on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, Response>
    where
        T: Send + 'static,
        F: FnOnce(&mut SessionStore) -> T + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&mut Self::lock(&inner)))
            .await
            .map_err(|e| {
                error!("Session task failed: {}", e);
                internal_error()
            })
    }

    pub fn user(&self) -> Option<SessionUser> {
        self.with(|s| s.get_as::<SessionUser>(USER_KEY))
            .filter(|u| u.is_authenticated)
    }

    /// Queue a message for the next rendered page.
    pub fn flash(&self, level: Level, text: impl Into<String>) {
        let message = Flash {
            level,
            text: text.into(),
        };
        self.with(|s| {
            let mut messages: Vec<Flash> = s.get_as(MESSAGES_KEY).unwrap_or_default();
            messages.push(message);
            s.insert(MESSAGES_KEY, serde_json::to_value(messages).unwrap_or_default());
        });
    }

    /// Remove and return queued messages.
    pub fn take_messages(&self) -> Vec<Flash> {
        self.with(|s| {
            s.remove(MESSAGES_KEY)
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default()
        })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for SessionHandle {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<SessionHandle>().cloned().ok_or_else(|| {
            error!("Session middleware is not installed");
            internal_error()
        })
    }
}

/// What the session stores about the logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub username: String,
    #[serde(default)]
    pub is_authenticated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Info,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Success => "success",
            Level::Info => "info",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub level: Level,
    pub text: String,
}

/// Extractor for pages that require login. Anonymous requests are sent to
/// the login page with a `next` parameter.
pub struct CurrentUser {
    pub username: String,
    pub session: SessionHandle,
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = SessionHandle::from_request_parts(parts, state).await?;
        match session.user() {
            Some(user) => Ok(CurrentUser {
                username: user.username,
                session,
            }),
            None => {
                let next = parts
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                Err(Redirect::to(&login_url(next)).into_response())
            }
        }
    }
}

/// `/login?next=<path>`, with the path query-encoded.
pub fn login_url(next: &str) -> String {
    let mut url = match reqwest::Url::parse("http://localhost/login") {
        Ok(url) => url,
        Err(_) => return "/login".to_string(),
    };
    url.query_pairs_mut().append_pair("next", next);
    match url.query() {
        Some(query) => format!("/login?{query}"),
        None => "/login".to_string(),
    }
}

fn session_cookie(config: &SessionConfig, key: &str) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), key.to_string()))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(
            i64::try_from(config.cookie_age).unwrap_or(i64::MAX),
        ))
        .secure(config.cookie_secure)
        .build()
}

fn expired_cookie(config: &SessionConfig) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), ""))
        .path("/")
        .max_age(time::Duration::ZERO)
        .expires(time::OffsetDateTime::UNIX_EPOCH)
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(config.cookie_secure)
        .build()
}

enum Outcome {
    Expire,
    Set(String),
    Keep,
    Failed,
}

/// Loads the session before the handler runs and persists it afterwards.
pub async fn session_middleware(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let config = &state.config.session;
    let sent_key = jar.get(&config.cookie_name).map(|c| c.value().to_string());
    let had_cookie = sent_key.is_some();

    let session = state.sessions.open(sent_key.as_deref());
    let session = match tokio::task::spawn_blocking(move || {
        let mut session = session;
        session.ensure_loaded();
        session
    })
    .await
    {
        Ok(session) => session,
        Err(e) => {
            error!("Session load task failed: {}", e);
            return internal_error();
        }
    };

    let handle = SessionHandle::new(session);
    request.extensions_mut().insert(handle.clone());
    let mut response = next.run(request).await;

    let status = response.status();
    let save_every_request = config.save_every_request;
    let result = handle
        .blocking(move |session| {
            let accessed = session.accessed();
            let modified = session.modified();
            let empty = session.is_empty();

            // an unreadable store leaves the key bound; the record may still exist
            let outcome = if had_cookie && empty && session.session_key().is_none() {
                Outcome::Expire
            } else if (modified || save_every_request)
                && !empty
                && status != StatusCode::INTERNAL_SERVER_ERROR
            {
                match session.save(false) {
                    Ok(()) => match session.session_key() {
                        Some(key) => Outcome::Set(key.to_string()),
                        None => Outcome::Failed,
                    },
                    Err(e) => {
                        error!("Failed to save session: {}", e);
                        Outcome::Failed
                    }
                }
            } else {
                Outcome::Keep
            };
            (accessed, outcome)
        })
        .await;

    let (accessed, outcome) = match result {
        Ok(result) => result,
        Err(response) => return response,
    };

    let cookie = match outcome {
        Outcome::Failed => return internal_error(),
        Outcome::Keep => None,
        Outcome::Expire => {
            debug!("Session emptied, expiring cookie");
            Some(expired_cookie(config))
        }
        Outcome::Set(key) => Some(session_cookie(config, &key)),
    };

    let headers = response.headers_mut();
    if let Some(cookie) = cookie {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(e) => {
                error!("Invalid session cookie header: {}", e);
                return internal_error();
            }
        }
    }
    if accessed {
        headers.append(VARY, HeaderValue::from_static("Cookie"));
    }
    response
}
