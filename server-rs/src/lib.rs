use axum::{
    middleware as axum_mw,
    routing::{get, post, put},
    Router,
};
use http::{HeaderName, HeaderValue};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;

use audit::AuditSink;
use cache::Cache;
use clock::Clock;
use config::Config;
use error::{AppError, AppResult};
use middleware::auth::JwtVerifier;
use services::{Engine, WebhookVerifier};
use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub cache: Option<Cache>,
    pub engine: Engine,
    pub webhook: Option<WebhookVerifier>,
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<dyn AuditSink>,
    pub hint_header: HeaderName,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        cache: Option<Cache>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> AppResult<Self> {
        let hint_header = HeaderName::from_bytes(config.tenant.hint_header.as_bytes())
            .map_err(|_| {
                AppError::Internal(format!(
                    "invalid tenant hint header '{}'",
                    config.tenant.hint_header
                ))
            })?;
        let verifier = Arc::new(JwtVerifier::new(&config.jwt));
        let engine = Engine::new(
            &config,
            store.clone(),
            cache.clone(),
            clock.clone(),
            audit.clone(),
            verifier,
        );
        Ok(Self {
            webhook: WebhookVerifier::from_config(&config.billing),
            config: Arc::new(config),
            store,
            cache,
            engine,
            clock,
            audit,
            hint_header,
        })
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect::<Vec<_>>(),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    // --- Authenticated, no tenant context ---
    let tenant_routes = Router::new()
        .route("/", post(routes::tenants::onboard))
        .route("/mine", get(routes::tenants::mine))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::auth::authenticate,
        ));

    // --- Webhook routes (raw body, signature instead of auth) ---
    let webhook_routes = Router::new().route("/billing", post(routes::webhooks::billing_webhook));

    // --- Tenant-scoped routes ---
    let scoped_routes = Router::new()
        .route("/tenant", get(routes::tenants::get_tenant))
        .route("/tenant/settings", put(routes::tenants::update_settings))
        .route("/tenant/disable", post(routes::tenants::disable))
        .route("/enforce", post(routes::enforce::enforce))
        .route("/admin/subscription", get(routes::admin::subscription))
        .route("/admin/usage", get(routes::admin::usage))
        .route(
            "/admin/usage/history/:resource",
            get(routes::admin::usage_history),
        )
        .route(
            "/admin/members",
            get(routes::admin::list_members).post(routes::admin::add_member),
        )
        .route(
            "/admin/members/:user_id",
            put(routes::admin::change_role).delete(routes::admin::remove_member),
        )
        .route("/billing/plan", post(routes::billing::change_plan))
        .route("/billing/cancel", post(routes::billing::cancel))
        .route("/billing/reactivate", post(routes::billing::reactivate))
        .route("/billing/history", get(routes::billing::history))
        // layers run bottom-up: authenticate first, then resolve the tenant
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::tenant::resolve_tenant,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::auth::authenticate,
        ));

    // --- Compose full API ---
    let api = Router::new()
        .route("/plans", get(routes::plans::list_plans))
        .nest("/tenants", tenant_routes)
        .nest("/webhooks", webhook_routes)
        .merge(scoped_routes);

    Router::new()
        .route("/health", get(routes::health::health))
        .nest("/api/v1", api)
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}
