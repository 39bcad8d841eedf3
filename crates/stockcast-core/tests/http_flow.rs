//! End-to-end request flows through the router and session middleware.

#![cfg(feature = "http-api")]

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE, VARY};
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use stockcast_core::config::Config;
use stockcast_core::service::auth::AccountService;
use stockcast_core::service::http::{create_router, AppState};
use stockcast_core::service::market::{Bar, MarketDataSource, MarketError};
use stockcast_core::service::sentiment::{Article, NewsError, NewsSource};
use stockcast_core::store::{app_tables, MemoryRecordStore};

struct FixedMarket;

impl MarketDataSource for FixedMarket {
    fn latest(&self, _symbol: &str) -> Result<Bar, MarketError> {
        Ok(Bar {
            close: 100.0,
            high: 101.0,
            low: 99.0,
            volume: 1000.0,
        })
    }
}

struct NoNews;

impl NewsSource for NoNews {
    fn search(&self, _query: &str) -> Result<Vec<Article>, NewsError> {
        Ok(Vec::new())
    }
}

struct App {
    router: Router,
    store: Arc<MemoryRecordStore>,
    _models: TempDir,
}

fn app() -> App {
    let models = TempDir::new().unwrap();
    std::fs::write(
        models.path().join("stock_price_predictor_model.json"),
        r#"{"features": ["Close_Lagged", "Sentiment_Score", "Company"],
            "coefficients": [1.0, 10.0, 0.0], "intercept": 2.0}"#,
    )
    .unwrap();

    let mut config = Config::default();
    config.prediction.model_dir = models.path().display().to_string();
    config.prediction.rate_limit_per_hour = 1;

    let store = Arc::new(MemoryRecordStore::with_tables(&app_tables(&config)));
    let users = config.tables.users.clone();
    let mut state =
        AppState::with_sources(config, store.clone(), Arc::new(FixedMarket), Arc::new(NoNews));
    state.accounts = AccountService::new(store.clone(), users).with_hash_cost(4);

    App {
        router: create_router(Arc::new(state)),
        store,
        _models: models,
    }
}

impl App {
    async fn get(&self, uri: &str, session: Option<&str>) -> Response<Body> {
        let mut req = Request::builder().uri(uri);
        if let Some(key) = session {
            req = req.header(COOKIE, format!("sessionid={key}"));
        }
        self.router
            .clone()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post(&self, uri: &str, form: &str, session: Option<&str>) -> Response<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(key) = session {
            req = req.header(COOKIE, format!("sessionid={key}"));
        }
        self.router
            .clone()
            .oneshot(req.body(Body::from(form.to_string())).unwrap())
            .await
            .unwrap()
    }
}

fn session_cookie(resp: &Response<Body>) -> Option<String> {
    resp.headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("sessionid="))
        .map(|v| v.to_string())
}

fn session_key(resp: &Response<Body>) -> String {
    let cookie = session_cookie(resp).expect("session cookie");
    cookie["sessionid=".len()..]
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

fn location(resp: &Response<Body>) -> &str {
    resp.headers().get(LOCATION).unwrap().to_str().unwrap()
}

async fn body(resp: Response<Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn register_and_login(app: &App) -> String {
    let resp = app
        .post(
            "/register",
            "username=alice&email=alice%40example.com&password=hunter2hunter2&confirm_password=hunter2hunter2",
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/login");
    let anon_key = session_key(&resp);

    let resp = app
        .post(
            "/login",
            "username=alice&password=hunter2hunter2&next=%2Fdashboard",
            Some(&anon_key),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/dashboard");
    let key = session_key(&resp);
    assert_ne!(key, anon_key, "login must rotate the session key");
    key
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let resp = app.get("/health", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(session_cookie(&resp).is_none());
    assert_eq!(body(resp).await, "OK");
}

#[tokio::test]
async fn test_anonymous_is_sent_to_login() {
    let app = app();
    let resp = app.get("/dashboard", None).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/login?next=%2Fdashboard");
    assert!(session_cookie(&resp).is_none());
    assert!(app.store.is_empty("Sessions"));
}

#[tokio::test]
async fn test_unknown_cookie_is_expired() {
    let app = app();
    let resp = app.get("/", Some("doesnotexist1234")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cookie = session_cookie(&resp).unwrap();
    assert!(cookie.contains("Max-Age=0"));
    assert_eq!(resp.headers().get(VARY).unwrap(), "Cookie");
}

#[tokio::test]
async fn test_login_flow() {
    let app = app();
    let key = register_and_login(&app).await;

    let resp = app.get("/dashboard", Some(&key)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let html = body(resp).await;
    assert!(html.contains("Login successful!"));
    assert!(html.contains("Signed in as <strong>alice</strong>"));

    // flash messages are shown once
    let html = body(app.get("/dashboard", Some(&key)).await).await;
    assert!(!html.contains("Login successful!"));

    let html = body(app.get("/profile", Some(&key)).await).await;
    assert!(html.contains("alice@example.com"));
    assert!(html.contains("<td>AccessedDashboard</td>"));
    assert!(html.contains("<td>Login</td>"));
}

#[tokio::test]
async fn test_bad_credentials() {
    let app = app();
    register_and_login(&app).await;

    let resp = app
        .post("/login", "username=alice&password=wrongpassword", None)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body(resp).await.contains("Invalid credentials."));
}

#[tokio::test]
async fn test_duplicate_registration() {
    let app = app();
    register_and_login(&app).await;

    let resp = app
        .post(
            "/register",
            "username=alice&email=other%40example.com&password=password123&confirm_password=password123",
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body(resp).await.contains("Username already exists."));
}

#[tokio::test]
async fn test_prediction_and_rate_limit() {
    let app = app();
    let key = register_and_login(&app).await;

    let resp = app
        .post("/predict_stock", "company_symbol=22", Some(&key))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let html = body(resp).await;
    assert!(html.contains("INFY.NS: predicted close <strong>107.00</strong>"));

    let resp = app
        .post("/predict_stock", "company_symbol=22", Some(&key))
        .await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body(resp).await, r#"{"error":"Rate limit exceeded"}"#);

    let html = body(app.get("/dashboard", Some(&key)).await).await;
    assert!(html.contains("INFY.NS"));
}

#[tokio::test]
async fn test_invalid_symbol_message() {
    let app = app();
    let key = register_and_login(&app).await;

    let resp = app
        .post("/predict_stock", "company_symbol=abc", Some(&key))
        .await;
    assert!(body(resp)
        .await
        .contains("Invalid company_symbol. It should be an integer."));
}

#[tokio::test]
async fn test_logout_flushes_session() {
    let app = app();
    let key = register_and_login(&app).await;

    let resp = app.get("/logout", Some(&key)).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/login");
    let after = session_key(&resp);
    assert_ne!(after, key);

    let resp = app.get("/dashboard", Some(&key)).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);

    let html = body(app.get("/login", Some(&after)).await).await;
    assert!(html.contains("You have been logged out successfully."));
}

#[tokio::test]
async fn test_store_outage_keeps_session_cookie() {
    let app = app();
    let key = register_and_login(&app).await;

    app.store.set_available(false);
    let resp = app.get("/", Some(&key)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(session_cookie(&resp).is_none());

    app.store.set_available(true);
    let resp = app.get("/dashboard", Some(&key)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body(resp).await.contains("Signed in as <strong>alice</strong>"));
}
