use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::models::{ChangePlanRequest, Operation, OperationKind, ReactivateRequest, TenantContext};
use crate::AppState;

async fn authorize(state: &AppState, ctx: &TenantContext, kind: OperationKind) -> AppResult<()> {
    state
        .engine
        .enforcement
        .authorize(ctx, &Operation::new(kind, ctx.tenant.id))
        .await?;
    Ok(())
}

pub async fn change_plan(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<ChangePlanRequest>,
) -> AppResult<Json<Value>> {
    authorize(&state, &ctx, OperationKind::BillingManage).await?;
    let standing = state
        .engine
        .subscriptions
        .change_plan(ctx.tenant.id, body.plan_id, body.billing_cycle)
        .await?;
    Ok(Json(json!(standing)))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> AppResult<Json<Value>> {
    authorize(&state, &ctx, OperationKind::BillingManage).await?;
    let standing = state.engine.subscriptions.cancel(ctx.tenant.id).await?;
    Ok(Json(json!(standing)))
}

pub async fn reactivate(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<ReactivateRequest>,
) -> AppResult<Json<Value>> {
    authorize(&state, &ctx, OperationKind::BillingManage).await?;
    let standing = state
        .engine
        .subscriptions
        .reactivate(ctx.tenant.id, body.plan_id, body.billing_cycle)
        .await?;
    Ok(Json(json!(standing)))
}

pub async fn history(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> AppResult<Json<Value>> {
    authorize(&state, &ctx, OperationKind::BillingView).await?;
    let events = state.engine.subscriptions.history(ctx.tenant.id).await?;
    Ok(Json(json!({ "events": events })))
}
