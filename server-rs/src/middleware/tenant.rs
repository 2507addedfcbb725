use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::models::Principal;
use crate::AppState;

/// Middleware: resolves the tenant named by the hint header for the
/// authenticated principal. Sets `TenantContext` in extensions. Must run
/// after `authenticate`.
pub async fn resolve_tenant(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let principal = req
        .extensions()
        .get::<Principal>()
        .copied()
        .ok_or_else(|| AppError::Unauthenticated("No token provided".into()))?;
    let hint = req
        .headers()
        .get(&state.hint_header)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let context = state
        .engine
        .resolver
        .resolve_for(principal, hint.as_deref())
        .await?;
    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}
