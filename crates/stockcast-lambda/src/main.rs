use std::sync::Arc;

use lambda_http::{run, Error};
use tracing::info;

use stockcast_core::config;
use stockcast_core::service::http::{create_router, AppState};
use stockcast_core::store::dynamo::DynamoRecordStore;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stockcast_core=info".parse()?),
        )
        .with_ansi(false)
        .init();

    info!("stockcast Lambda starting...");

    let cfg = config::load_config_from_env();
    if cfg.session.secret_key.is_empty() {
        tracing::warn!("STOCKCAST_SECRET_KEY is not set; session payloads are stored unsigned");
    }

    // One client per cold start, reused by every invocation.
    let store = Arc::new(DynamoRecordStore::connect(&cfg.aws).await);
    info!(
        "Sessions table: {}, users table: {}",
        cfg.session.table_name, cfg.tables.users
    );

    let state = Arc::new(AppState::new(cfg, store));
    let router = create_router(state);

    run(router).await?;

    Ok(())
}
