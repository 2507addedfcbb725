use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::models::{
    AddMemberRequest, ChangeRoleRequest, Operation, OperationKind, ResourceKind, TenantContext,
    UserId,
};
use crate::AppState;

fn parse_user(raw: &str) -> AppResult<UserId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid user id '{raw}'")))
}

pub async fn subscription(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> AppResult<Json<Value>> {
    state
        .engine
        .enforcement
        .authorize(&ctx, &Operation::new(OperationKind::SubscriptionView, ctx.tenant.id))
        .await?;
    let standing = state.engine.subscriptions.standing(ctx.tenant.id).await?;
    Ok(Json(json!(standing)))
}

pub async fn usage(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> AppResult<Json<Value>> {
    state
        .engine
        .enforcement
        .authorize(&ctx, &Operation::new(OperationKind::UsageView, ctx.tenant.id))
        .await?;
    let standing = state.engine.subscriptions.standing(ctx.tenant.id).await?;
    let lines = state
        .engine
        .usage
        .snapshot(ctx.tenant.id, &standing.plan)
        .await?;
    Ok(Json(json!({
        "plan": standing.plan.key,
        "planVersion": standing.plan.version,
        "usage": lines,
    })))
}

pub async fn usage_history(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(resource): Path<String>,
) -> AppResult<Json<Value>> {
    let resource: ResourceKind = resource.parse().map_err(AppError::BadRequest)?;
    state
        .engine
        .enforcement
        .authorize(&ctx, &Operation::new(OperationKind::UsageView, ctx.tenant.id))
        .await?;
    let periods = state.engine.usage.history(ctx.tenant.id, resource).await?;
    Ok(Json(json!({
        "resource": resource,
        "metric": resource.metric(),
        "periods": periods,
    })))
}

pub async fn list_members(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> AppResult<Json<Value>> {
    let members = state.engine.directory.roster(&ctx).await?;
    Ok(Json(json!({ "members": members })))
}

pub async fn add_member(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<AddMemberRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let membership = state.engine.directory.add_member(&ctx, body).await?;
    Ok((StatusCode::CREATED, Json(json!({ "membership": membership }))))
}

pub async fn change_role(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(user_id): Path<String>,
    Json(body): Json<ChangeRoleRequest>,
) -> AppResult<Json<Value>> {
    let user_id = parse_user(&user_id)?;
    let membership = state
        .engine
        .directory
        .change_role(&ctx, user_id, body.role)
        .await?;
    Ok(Json(json!({ "membership": membership })))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(user_id): Path<String>,
) -> AppResult<StatusCode> {
    let user_id = parse_user(&user_id)?;
    state.engine.directory.remove_member(&ctx, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
