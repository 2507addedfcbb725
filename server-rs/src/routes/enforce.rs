use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::models::{EnforceRequest, Operation, TenantContext};
use crate::AppState;

/// Pre-flight check for collaborators: on success any metered usage has
/// already been committed against the plan.
pub async fn enforce(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<EnforceRequest>,
) -> AppResult<Json<Value>> {
    let operation = Operation::new(body.operation, body.resource_tenant.normalize())
        .with_quantity(body.quantity.unwrap_or(1));
    let grant = state.engine.enforcement.authorize(&ctx, &operation).await?;
    Ok(Json(json!({
        "allowed": true,
        "tenantId": ctx.tenant.id,
        "role": ctx.role,
        "grant": grant,
    })))
}
