//! Web layer: routes, handlers and the session middleware.

pub mod pages;
pub mod session;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AuthError, PredictionError};
use crate::service::activity::{kinds, ActivityLog};
use crate::service::auth::AccountService;
use crate::service::market::{MarketDataSource, YahooFinance};
use crate::service::model::ModelStore;
use crate::service::prediction::PredictionService;
use crate::service::sentiment::{GNewsClient, NewsSource, SentimentService};
use crate::service::usage::{ApiUsage, RateLimiter};
use crate::session::SessionBackend;
use crate::store::RecordStore;

use pages::Frame;
use session::{session_middleware, CurrentUser, Level, SessionHandle, SessionUser, USER_KEY};

const RECENT_LIMIT: usize = 10;

/// Shared application state for the web layer.
pub struct AppState {
    pub config: Config,
    pub sessions: SessionBackend,
    pub accounts: AccountService,
    pub activity: ActivityLog,
    pub predictions: PredictionService,
    pub rate_limiter: RateLimiter,
    pub usage: Arc<ApiUsage>,
}

impl AppState {
    /// State backed by Yahoo Finance and GNews.
    pub fn new(config: Config, store: Arc<dyn RecordStore>) -> Self {
        let market = Arc::new(YahooFinance::new(config.prediction.market_base_url.clone()));
        let news = Arc::new(GNewsClient::new(
            config.prediction.gnews_base_url.clone(),
            config.prediction.gnews_api_key.clone(),
        ));
        Self::with_sources(config, store, market, news)
    }

    pub fn with_sources(
        config: Config,
        store: Arc<dyn RecordStore>,
        market: Arc<dyn MarketDataSource>,
        news: Arc<dyn NewsSource>,
    ) -> Self {
        let usage = Arc::new(ApiUsage::new(
            config.prediction.gnews_daily_limit,
            config.prediction.sentiment_monthly_char_limit,
        ));
        let sentiment = Arc::new(SentimentService::new(
            store.clone(),
            &config.tables,
            &config.prediction,
            news,
            usage.clone(),
        ));
        let predictions = PredictionService::new(
            store.clone(),
            &config.tables.predictions,
            ModelStore::new(&config.prediction.model_dir),
            market,
            sentiment,
        );

        Self {
            sessions: SessionBackend::from_config(store.clone(), &config.session),
            accounts: AccountService::new(store.clone(), &config.tables.users),
            activity: ActivityLog::new(store, &config.tables.user_activities),
            predictions,
            rate_limiter: RateLimiter::per_hour(config.prediction.rate_limit_per_hour),
            usage,
            config,
        }
    }
}

/// Generic 500 page. Never leaks the underlying error.
pub fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        pages::error_page("Server error", "Something went wrong. Please try again later."),
    )
        .into_response()
}

/// Run store-touching work on the blocking pool.
async fn run<T, F>(state: &Arc<AppState>, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> T + Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| {
            error!("Blocking task failed: {}", e);
            internal_error()
        })
}

/// Create the axum Router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_home))
        .route("/dashboard", get(handle_dashboard))
        // Accounts
        .route("/login", get(handle_login_form).post(handle_login))
        .route("/register", get(handle_register_form).post(handle_register))
        .route("/logout", get(handle_logout))
        .route("/profile", get(handle_profile))
        .route("/profile/password", post(handle_change_password))
        // Predictions
        .route("/predict_stock", get(handle_stock_form).post(handle_predict_stock))
        .route("/predict_forex", get(handle_forex_form).post(handle_predict_forex))
        .route("/api_usage", get(handle_api_usage))
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(state.clone(), session_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new()),
        )
        .with_state(state)
}

fn frame<'a>(session: &SessionHandle, user: Option<&'a str>) -> Frame<'a> {
    Frame {
        user,
        messages: session.take_messages(),
    }
}

/// Same-site redirect targets only.
fn safe_next(next: Option<&str>) -> &str {
    match next {
        Some(n) if n.starts_with('/') && !n.starts_with("//") && !n.contains('\\') => n,
        _ => "/",
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_default()
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn auth_message(e: &AuthError) -> String {
    match e {
        AuthError::Store(_) | AuthError::Hash(_) => {
            error!("Account operation failed: {}", e);
            "Something went wrong. Please try again.".to_string()
        }
        other => other.to_string(),
    }
}

async fn record_activity(state: &Arc<AppState>, user: &str, activity: &'static str, headers: &HeaderMap) {
    let user = user.to_string();
    let ip = client_ip(headers);
    let agent = user_agent(headers);
    // failures are already logged by the activity log
    let _ = run(state, move |s| s.activity.record(&user, activity, &ip, &agent)).await;
}

/// GET /
async fn handle_home(session: SessionHandle) -> Html<String> {
    let user = session.user();
    pages::home(&frame(&session, user.as_ref().map(|u| u.username.as_str())))
}

/// GET /health
async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        pages::error_page("Page not found", "The page you requested does not exist."),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct NextQuery {
    next: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginForm {
    username: String,
    password: String,
    next: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegisterForm {
    username: String,
    email: String,
    password: String,
    confirm_password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PasswordForm {
    current_password: String,
    new_password: String,
    confirm_password: String,
}

#[derive(Debug, Default, Deserialize)]
struct StockForm {
    company_symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ForexForm {
    forex_symbol: Option<String>,
}

/// GET /login
async fn handle_login_form(session: SessionHandle, Query(query): Query<NextQuery>) -> Response {
    if session.user().is_some() {
        return Redirect::to("/dashboard").into_response();
    }
    let next = safe_next(query.next.as_deref());
    pages::login(&frame(&session, None), next).into_response()
}

/// POST /login. Rotates the session key on success.
async fn handle_login(
    State(state): State<Arc<AppState>>,
    session: SessionHandle,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let (username, password) = (form.username.clone(), form.password);
    let result = match run(&state, move |s| s.accounts.authenticate(&username, &password)).await {
        Ok(result) => result,
        Err(response) => return response,
    };

    let user = match result {
        Ok(user) => user,
        Err(e) => {
            warn!("Login failed for {}: {}", form.username, e);
            session.flash(Level::Error, auth_message(&e));
            let next = safe_next(form.next.as_deref());
            return pages::login(&frame(&session, None), next).into_response();
        }
    };

    match session.blocking(|s| s.cycle_key()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Failed to rotate session key: {}", e);
            return internal_error();
        }
        Err(response) => return response,
    }

    let session_user = SessionUser {
        username: user.username.clone(),
        is_authenticated: true,
    };
    match serde_json::to_value(&session_user) {
        Ok(value) => {
            session.with(|s| s.insert(USER_KEY, value));
        }
        Err(e) => {
            error!("Failed to encode session user: {}", e);
            return internal_error();
        }
    }

    record_activity(&state, &user.username, kinds::LOGIN, &headers).await;
    info!("User {} logged in", user.username);
    session.flash(Level::Success, "Login successful!");
    Redirect::to(safe_next(form.next.as_deref())).into_response()
}

/// GET /register
async fn handle_register_form(session: SessionHandle) -> Html<String> {
    pages::register(&frame(&session, None))
}

/// POST /register
async fn handle_register(
    State(state): State<Arc<AppState>>,
    session: SessionHandle,
    Form(form): Form<RegisterForm>,
) -> Response {
    let result = match run(&state, move |s| {
        s.accounts
            .register(&form.username, &form.email, &form.password, &form.confirm_password)
    })
    .await
    {
        Ok(result) => result,
        Err(response) => return response,
    };

    match result {
        Ok(_) => {
            session.flash(Level::Success, "Registration successful! Please login.");
            Redirect::to("/login").into_response()
        }
        Err(e) => {
            session.flash(Level::Error, auth_message(&e));
            pages::register(&frame(&session, None)).into_response()
        }
    }
}

/// GET /logout
async fn handle_logout(
    State(state): State<Arc<AppState>>,
    session: SessionHandle,
    headers: HeaderMap,
) -> Response {
    if let Some(user) = session.user() {
        record_activity(&state, &user.username, kinds::LOGOUT, &headers).await;
        info!("User {} logged out", user.username);
    }
    if let Err(response) = session.blocking(|s| s.flush()).await {
        return response;
    }
    session.flash(Level::Info, "You have been logged out successfully.");
    Redirect::to("/login").into_response()
}

/// GET /dashboard
async fn handle_dashboard(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    headers: HeaderMap,
) -> Response {
    record_activity(&state, &user.username, kinds::DASHBOARD, &headers).await;

    let username = user.username.clone();
    let recent = match run(&state, move |s| s.predictions.recent(&username, RECENT_LIMIT)).await {
        Ok(recent) => recent.unwrap_or_else(|e| {
            error!("Failed to list predictions: {}", e);
            Vec::new()
        }),
        Err(response) => return response,
    };

    let frame = frame(&user.session, Some(&user.username));
    pages::dashboard(&frame, &user.username, &recent).into_response()
}

/// GET /profile
async fn handle_profile(State(state): State<Arc<AppState>>, user: CurrentUser) -> Response {
    let username = user.username.clone();
    let result = run(&state, move |s| {
        let account = s.accounts.get_user(&username);
        let activities = s.activity.recent(&username, RECENT_LIMIT);
        (account, activities)
    })
    .await;
    let (account, activities) = match result {
        Ok(result) => result,
        Err(response) => return response,
    };

    let email = match account {
        Ok(Some(account)) => account.email,
        Ok(None) => String::new(),
        Err(e) => {
            error!("Failed to load profile for {}: {}", user.username, e);
            return internal_error();
        }
    };
    let activities = activities.unwrap_or_else(|e| {
        error!("Failed to list activities: {}", e);
        Vec::new()
    });

    let frame = frame(&user.session, Some(&user.username));
    pages::profile(&frame, &user.username, &email, &activities).into_response()
}

/// POST /profile/password
async fn handle_change_password(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Form(form): Form<PasswordForm>,
) -> Response {
    let username = user.username.clone();
    let result = match run(&state, move |s| {
        s.accounts.change_password(
            &username,
            &form.current_password,
            &form.new_password,
            &form.confirm_password,
        )
    })
    .await
    {
        Ok(result) => result,
        Err(response) => return response,
    };

    match result {
        Ok(()) => user.session.flash(Level::Success, "Password changed successfully!"),
        Err(e) => user.session.flash(Level::Error, auth_message(&e)),
    }
    Redirect::to("/profile").into_response()
}

fn rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({"error": "Rate limit exceeded"})),
    )
        .into_response()
}

fn prediction_message(e: &PredictionError) -> String {
    match e {
        PredictionError::ModelLoad(detail) | PredictionError::Evaluation(detail) => {
            error!("{}: {}", e, detail);
        }
        _ => {}
    }
    e.to_string()
}

/// GET /predict_stock
async fn handle_stock_form(user: CurrentUser) -> Html<String> {
    pages::predict_stock(&frame(&user.session, Some(&user.username)), None, None)
}

/// POST /predict_stock
async fn handle_predict_stock(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Form(form): Form<StockForm>,
) -> Response {
    if !state.rate_limiter.check(&user.username) {
        warn!("Rate limit exceeded for {}", user.username);
        return rate_limited();
    }

    let username = user.username.clone();
    let result = match run(&state, move |s| {
        s.predictions.predict_stock(&username, form.company_symbol.as_deref())
    })
    .await
    {
        Ok(result) => result,
        Err(response) => return response,
    };

    let frame = frame(&user.session, Some(&user.username));
    match result {
        Ok(prediction) => pages::predict_stock(&frame, Some(&prediction), None).into_response(),
        Err(e) => pages::predict_stock(&frame, None, Some(&prediction_message(&e))).into_response(),
    }
}

/// GET /predict_forex
async fn handle_forex_form(user: CurrentUser) -> Html<String> {
    pages::predict_forex(&frame(&user.session, Some(&user.username)), None, None)
}

/// POST /predict_forex
async fn handle_predict_forex(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Form(form): Form<ForexForm>,
) -> Response {
    if !state.rate_limiter.check(&user.username) {
        warn!("Rate limit exceeded for {}", user.username);
        return rate_limited();
    }

    let username = user.username.clone();
    let result = match run(&state, move |s| {
        s.predictions.predict_forex(&username, form.forex_symbol.as_deref())
    })
    .await
    {
        Ok(result) => result,
        Err(response) => return response,
    };

    let frame = frame(&user.session, Some(&user.username));
    match result {
        Ok(prediction) => pages::predict_forex(&frame, Some(&prediction), None).into_response(),
        Err(e) => pages::predict_forex(&frame, None, Some(&prediction_message(&e))).into_response(),
    }
}

/// GET /api_usage
async fn handle_api_usage(State(state): State<Arc<AppState>>, user: CurrentUser) -> Html<String> {
    let usage = state.usage.snapshot();
    pages::api_usage(&frame(&user.session, Some(&user.username)), &usage)
}

/// Start the HTTP server on the given address.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
