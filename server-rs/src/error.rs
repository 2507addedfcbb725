use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::models::{Feature, LimitViolation, ResourceKind};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Tenant hint required")]
    TenantHintRequired,

    #[error("Tenant not found")]
    TenantNotFound,

    #[error("Not a member of this tenant")]
    NotAMember,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Cannot remove the last admin of a tenant")]
    CannotRemoveLastAdmin,

    #[error("Subscription inactive: {0}")]
    SubscriptionInactive(String),

    #[error("Plan change blocked by current usage")]
    PlanDowngradeBlocked(Vec<LimitViolation>),

    #[error("Limit exceeded for {resource}: {current}/{limit}")]
    LimitExceeded {
        resource: ResourceKind,
        current: i64,
        limit: i64,
    },

    #[error("Feature not included in plan: {0}")]
    FeatureNotIncluded(Feature),

    #[error("Duplicate webhook event: {0}")]
    DuplicateWebhookEvent(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthenticated(_) | AppError::Jwt(_) => "UNAUTHENTICATED",
            AppError::TenantHintRequired => "TENANT_HINT_REQUIRED",
            AppError::TenantNotFound => "TENANT_NOT_FOUND",
            AppError::NotAMember => "NOT_A_MEMBER",
            AppError::AccessDenied(_) => "ACCESS_DENIED",
            AppError::CannotRemoveLastAdmin => "CANNOT_REMOVE_LAST_ADMIN",
            AppError::SubscriptionInactive(_) => "SUBSCRIPTION_INACTIVE",
            AppError::PlanDowngradeBlocked(_) => "PLAN_DOWNGRADE_BLOCKED",
            AppError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            AppError::FeatureNotIncluded(_) => "FEATURE_NOT_INCLUDED",
            AppError::DuplicateWebhookEvent(_) => "DUPLICATE_WEBHOOK_EVENT",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Unavailable(_) => "UNAVAILABLE",
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => "INTERNAL",
        }
    }

    /// Persistence failures worth retrying: pool exhaustion, dropped
    /// connections, serialization failures and deadlocks.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            AppError::Redis(e) => e.is_timeout() || e.is_connection_dropped(),
            AppError::Unavailable(_) => true,
            _ => false,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated(_) | AppError::Jwt(_) => StatusCode::UNAUTHORIZED,
            AppError::TenantHintRequired | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::TenantNotFound | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotAMember
            | AppError::AccessDenied(_)
            | AppError::LimitExceeded { .. }
            | AppError::FeatureNotIncluded(_) => StatusCode::FORBIDDEN,
            AppError::CannotRemoveLastAdmin
            | AppError::PlanDowngradeBlocked(_)
            | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::SubscriptionInactive(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::DuplicateWebhookEvent(_) => StatusCode::OK,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                "Internal server error".to_string()
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {e}");
                "Internal server error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                "Internal server error".to_string()
            }
            AppError::Jwt(_) => "Invalid token".to_string(),
            other => other.to_string(),
        };

        let mut body = json!({ "error": message, "code": self.code() });
        match &self {
            AppError::LimitExceeded {
                resource,
                current,
                limit,
            } => {
                body["resource"] = json!(resource);
                body["current"] = json!(current);
                body["limit"] = json!(limit);
            }
            AppError::PlanDowngradeBlocked(violations) => {
                body["violations"] = json!(violations);
            }
            AppError::FeatureNotIncluded(feature) => {
                body["feature"] = Value::String(feature.as_str().to_string());
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
