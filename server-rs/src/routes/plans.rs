use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::AppState;

/// Public catalogue: newest offered version of every plan.
pub async fn list_plans(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let plans = state.engine.plans.list_active().await?;
    Ok(Json(json!({ "plans": plans })))
}
