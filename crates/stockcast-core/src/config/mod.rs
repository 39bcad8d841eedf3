use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Root configuration for stockcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[derive(Default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub aws: AwsConfig,
    pub tables: TablesConfig,
    pub prediction: PredictionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Session backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub table_name: String,
    pub cookie_name: String,
    /// Sliding lifetime in seconds, applied on every save.
    pub cookie_age: u64,
    pub cookie_secure: bool,
    pub save_every_request: bool,
    /// HMAC key for signed payloads. Empty means plain JSON payloads.
    pub secret_key: String,
    pub max_create_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            table_name: "Sessions".to_string(),
            cookie_name: "sessionid".to_string(),
            cookie_age: 1_209_600, // 2 weeks
            cookie_secure: false,
            save_every_request: false,
            secret_key: String::new(),
            max_create_attempts: 10,
        }
    }
}

/// Which record store backs the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Dynamodb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
        }
    }
}

/// DynamoDB connection parameters. Credentials come from the default AWS chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsConfig {
    pub region: String,
    /// Override endpoint, e.g. DynamoDB Local.
    pub endpoint_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TablesConfig {
    pub users: String,
    pub user_activities: String,
    pub predictions: String,
    pub news_cache: String,
    pub sentiment_cache: String,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            users: "Users".to_string(),
            user_activities: "UserActivities".to_string(),
            predictions: "Predictions".to_string(),
            news_cache: "NewsCache".to_string(),
            sentiment_cache: "SentimentCache".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PredictionConfig {
    pub model_dir: String,
    pub rate_limit_per_hour: u32,
    pub gnews_api_key: String,
    pub gnews_base_url: String,
    pub gnews_daily_limit: u64,
    pub news_cache_hours: i64,
    pub sentiment_cache_secs: i64,
    pub sentiment_monthly_char_limit: u64,
    pub market_base_url: String,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            model_dir: "models".to_string(),
            rate_limit_per_hour: 5,
            gnews_api_key: String::new(),
            gnews_base_url: "https://gnews.io/api/v4/search".to_string(),
            gnews_daily_limit: 100,
            news_cache_hours: 24,
            sentiment_cache_secs: 3600,
            sentiment_monthly_char_limit: 45_000,
            market_base_url: "https://query1.finance.yahoo.com/v8/finance/chart".to_string(),
        }
    }
}

/// Load configuration from environment variables.
///
/// `STOCKCAST_CONFIG` may hold a full JSON config; otherwise the file config is
/// loaded and individual variables are overlaid on top.
pub fn load_config_from_env() -> Config {
    if let Ok(json) = std::env::var("STOCKCAST_CONFIG") {
        match serde_json::from_str::<Config>(&json) {
            Ok(cfg) => return cfg,
            Err(e) => tracing::warn!("Failed to parse STOCKCAST_CONFIG: {}", e),
        }
    }

    let mut cfg = load_config(None);

    // Server
    if let Ok(v) = std::env::var("PORT") {
        match v.parse() {
            Ok(port) => cfg.server.port = port,
            Err(_) => tracing::warn!("Ignoring invalid PORT: {}", v),
        }
    }

    // Sessions
    if let Ok(v) = std::env::var("SESSION_COOKIE_AGE") {
        match v.parse() {
            Ok(age) => cfg.session.cookie_age = age,
            Err(_) => tracing::warn!("Ignoring invalid SESSION_COOKIE_AGE: {}", v),
        }
    }
    if let Ok(v) = std::env::var("DYNAMODB_SESSIONS_TABLE_NAME") {
        cfg.session.table_name = v;
    }
    if let Ok(v) = std::env::var("STOCKCAST_SECRET_KEY") {
        cfg.session.secret_key = v;
    }
    if let Ok(v) = std::env::var("SESSION_COOKIE_SECURE") {
        cfg.session.cookie_secure = matches!(v.as_str(), "1" | "true" | "TRUE");
    }

    // Storage
    if let Ok(v) = std::env::var("STOCKCAST_STORAGE") {
        match v.to_lowercase().as_str() {
            "memory" => cfg.storage.backend = StorageBackend::Memory,
            "dynamodb" => cfg.storage.backend = StorageBackend::Dynamodb,
            other => tracing::warn!("Unknown STOCKCAST_STORAGE: {}", other),
        }
    }

    // AWS
    if let Ok(v) = std::env::var("AWS_REGION") {
        cfg.aws.region = v;
    }
    if let Ok(v) = std::env::var("DYNAMODB_ENDPOINT") {
        cfg.aws.endpoint_url = Some(v);
    }

    // Prediction
    if let Ok(v) = std::env::var("GNEWS_API_KEY") {
        cfg.prediction.gnews_api_key = v;
    }
    if let Ok(v) = std::env::var("STOCKCAST_MODEL_DIR") {
        cfg.prediction.model_dir = v;
    }

    cfg
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stockcast")
        .join("config.json")
}

/// Load configuration from file or fall back to defaults.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config from {}: {}", path.display(), e);
                    tracing::warn!("Using default configuration.");
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config from {}: {}", path.display(), e);
                tracing::warn!("Using default configuration.");
            }
        }
    }

    Config::default()
}

/// Save configuration to file.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<(), ConfigError> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(())
}
