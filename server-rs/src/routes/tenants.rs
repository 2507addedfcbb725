use axum::{extract::State, http::StatusCode, Extension, Json};
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::models::{OnboardTenantRequest, Principal, SettingsUpdate, TenantContext};
use crate::AppState;

pub async fn onboard(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<OnboardTenantRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let onboarded = state.engine.directory.onboard(principal, body).await?;
    Ok((StatusCode::CREATED, Json(json!(onboarded))))
}

pub async fn mine(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> AppResult<Json<Value>> {
    let tenants = state.engine.directory.memberships_for(principal).await?;
    Ok(Json(json!({ "tenants": tenants })))
}

pub async fn get_tenant(Extension(ctx): Extension<TenantContext>) -> Json<Value> {
    Json(json!({
        "tenant": ctx.tenant,
        "role": ctx.role,
    }))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<SettingsUpdate>,
) -> AppResult<Json<Value>> {
    let tenant = state.engine.directory.update_settings(&ctx, body).await?;
    Ok(Json(json!({ "tenant": tenant })))
}

pub async fn disable(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> AppResult<Json<Value>> {
    let tenant = state.engine.directory.disable(&ctx).await?;
    Ok(Json(json!({ "tenant": tenant })))
}
