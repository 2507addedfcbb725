use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tenancy_api::audit::TracingAuditSink;
use tenancy_api::cache::Cache;
use tenancy_api::clock::SystemClock;
use tenancy_api::config::{Config, StoreBackend};
use tenancy_api::error::{AppError, AppResult};
use tenancy_api::store::{InMemoryStore, PgStore, Store};
use tenancy_api::{build_router, db, AppState};

#[tokio::main]
async fn main() -> AppResult<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = Config::from_env();
    config.check().map_err(AppError::Internal)?;

    let store: Arc<dyn Store> = match config.store {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config).await?;
            db::migrate(&pool).await?;
            Arc::new(PgStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; data is lost on restart");
            Arc::new(InMemoryStore::new())
        }
    };

    let cache = if config.redis.enabled {
        match Cache::connect(&config).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!("redis unavailable, plan cache disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let port = config.port;
    let state = AppState::new(
        config,
        store,
        cache,
        Arc::new(SystemClock),
        Arc::new(TracingAuditSink),
    )?;
    state.engine.plans.seed_builtin().await?;
    if state.webhook.is_none() {
        tracing::warn!("BILLING_WEBHOOK_SECRET not set; billing webhooks will be refused");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| AppError::Internal(format!("bind failed: {e}")))?;
    tracing::info!(port, "tenancy api listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::Internal(format!("server error: {e}")))?;
    Ok(())
}
