use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use stockcast_core::config::{self, Config, StorageBackend};
use stockcast_core::service::http::{self, AppState};
use stockcast_core::session::SessionBackend;
use stockcast_core::store::{app_tables, MemoryRecordStore, RecordStore};

#[derive(Parser)]
#[command(
    name = "stockcast",
    about = "stockcast - stock and forex price prediction",
    version = stockcast_core::VERSION,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Start the web server
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage backing tables
    Tables {
        #[command(subcommand)]
        command: TableCommands,
    },
    /// Inspect and maintain stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Show configuration status
    Status,
}

#[derive(Subcommand)]
enum TableCommands {
    /// Create every table the app uses
    Create,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Delete expired session records
    ClearExpired,
    /// Print a stored session
    Show {
        /// Session key
        key: String,
    },
    /// Delete a stored session
    Delete {
        /// Session key
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stockcast=info".parse()?)
                .add_directive("stockcast_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => cmd_init(force)?,
        Commands::Serve { host, port } => cmd_serve(host, port).await?,
        Commands::Tables { command } => match command {
            TableCommands::Create => cmd_tables_create().await?,
        },
        Commands::Sessions { command } => match command {
            SessionCommands::ClearExpired => cmd_sessions_clear().await?,
            SessionCommands::Show { key } => cmd_sessions_show(key).await?,
            SessionCommands::Delete { key } => cmd_sessions_delete(key).await?,
        },
        Commands::Status => cmd_status(),
    }

    Ok(())
}

async fn build_store(config: &Config) -> Result<Arc<dyn RecordStore>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory record store");
            Ok(Arc::new(MemoryRecordStore::with_tables(&app_tables(config))))
        }
        #[cfg(feature = "dynamodb-backend")]
        StorageBackend::Dynamodb => {
            let store = stockcast_core::store::dynamo::DynamoRecordStore::connect(&config.aws).await;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "dynamodb-backend"))]
        StorageBackend::Dynamodb => anyhow::bail!(
            "storage backend is dynamodb but this binary was built without the dynamodb-backend feature"
        ),
    }
}

/// Run blocking store work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

fn cmd_init(force: bool) -> Result<()> {
    let path = config::get_config_path();
    if path.exists() && !force {
        println!("Config already exists at {} (use --force to overwrite)", path.display());
        return Ok(());
    }
    config::save_config(&Config::default(), Some(path.as_path()))?;
    println!("✓ Wrote default config to {}", path.display());
    Ok(())
}

async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = config::load_config_from_env();
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if config.session.secret_key.is_empty() {
        tracing::warn!("session.secretKey is empty; session payloads are stored unsigned");
    }

    let store = build_store(&config).await?;
    let addr = config.server.addr();
    let state = Arc::new(AppState::new(config, store));
    http::serve(&addr, state).await
}

async fn cmd_tables_create() -> Result<()> {
    let config = config::load_config_from_env();
    let store = build_store(&config).await?;
    let tables = app_tables(&config);
    let created = blocking(move || {
        let mut names = Vec::new();
        for schema in &tables {
            store.ensure_table(schema)?;
            names.push(schema.name.clone());
        }
        Ok::<_, stockcast_core::error::StoreError>(names)
    })
    .await??;
    for name in created {
        println!("✓ {}", name);
    }
    Ok(())
}

async fn session_backend() -> Result<SessionBackend> {
    let config = config::load_config_from_env();
    let store = build_store(&config).await?;
    Ok(SessionBackend::from_config(store, &config.session))
}

async fn cmd_sessions_clear() -> Result<()> {
    let backend = session_backend().await?;
    let removed = blocking(move || backend.clear_expired()).await??;
    println!("Removed {} expired sessions", removed);
    Ok(())
}

async fn cmd_sessions_show(key: String) -> Result<()> {
    let backend = session_backend().await?;
    let record = blocking(move || backend.inspect(&key).map(|r| (key, r))).await??;
    match record {
        (key, None) => println!("No session {}", key),
        (_, Some(record)) => {
            let now = chrono::Utc::now();
            println!("Key:           {}", record.session_key);
            println!(
                "Expires:       {}{}",
                record
                    .expires_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string()),
                if record.is_expired(now) { " (expired)" } else { "" }
            );
            println!(
                "Last modified: {}",
                record.last_modified.as_deref().unwrap_or("unknown")
            );
            println!("{}", serde_json::to_string_pretty(&record.data)?);
        }
    }
    Ok(())
}

async fn cmd_sessions_delete(key: String) -> Result<()> {
    let backend = session_backend().await?;
    let shown = key.clone();
    blocking(move || backend.delete(&key)).await?;
    println!("✓ Deleted session {}", shown);
    Ok(())
}

fn cmd_status() {
    let config = config::load_config_from_env();
    let config_path = config::get_config_path();

    println!("stockcast {} ({})", stockcast_core::VERSION, stockcast_core::GIT_HASH);
    println!();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗ (defaults)" }
    );
    println!("Listen:    {}", config.server.addr());
    println!("Storage:   {:?}", config.storage.backend);
    if config.storage.backend == StorageBackend::Dynamodb {
        println!(
            "AWS:       {} ({})",
            config.aws.region,
            config.aws.endpoint_url.as_deref().unwrap_or("default endpoint")
        );
    }
    println!(
        "Sessions:  table {}, cookie {}, {}s, {}",
        config.session.table_name,
        config.session.cookie_name,
        config.session.cookie_age,
        if config.session.secret_key.is_empty() { "unsigned" } else { "signed" }
    );

    let model_dir = std::path::Path::new(&config.prediction.model_dir);
    println!(
        "Models:    {} {}",
        model_dir.display(),
        if model_dir.is_dir() { "✓" } else { "✗" }
    );
    println!(
        "News API:  {}",
        if config.prediction.gnews_api_key.is_empty() { "not configured" } else { "configured" }
    );
}
