use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let store_ok = state.store.ping().await.is_ok();
    let redis_ok = match &state.cache {
        Some(cache) => Some(cache.ping().await),
        None => None,
    };

    let status = if store_ok && redis_ok.unwrap_or(true) {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "store": state.store.backend(),
        "storeOk": store_ok,
        "redis": redis_ok,
        "timestamp": state.clock.now(),
    }))
}
