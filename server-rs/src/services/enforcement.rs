use serde::Serialize;
use std::sync::Arc;

use super::access_guard::AccessGuard;
use super::context_resolver::{RequestCredentials, TenantContextResolver};
use super::subscription_machine::SubscriptionStateMachine;
use super::usage_meter::UsageMeter;
use crate::audit::{AuditEvent, AuditSink};
use crate::error::{AppError, AppResult};
use crate::models::{
    EffectiveStatus, LimitWarning, Operation, OperationKind, Reservation, TenantContext,
};

/// Permission to run one operation. When the operation is metered the usage
/// has already been committed and `reservation` describes it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    #[serde(skip)]
    pub context: TenantContext,
    pub operation: OperationKind,
    pub effective: EffectiveStatus,
    pub reservation: Option<Reservation>,
    pub warnings: Vec<LimitWarning>,
}

/// The single entry point collaborators call before touching tenant data:
/// resolve context, check access, check subscription, reserve usage. The
/// first failure wins and usage is only committed once every check passed.
#[derive(Clone)]
pub struct EnforcementFacade {
    resolver: TenantContextResolver,
    guard: AccessGuard,
    subscriptions: SubscriptionStateMachine,
    usage: UsageMeter,
    audit: Arc<dyn AuditSink>,
}

impl EnforcementFacade {
    pub fn new(
        resolver: TenantContextResolver,
        guard: AccessGuard,
        subscriptions: SubscriptionStateMachine,
        usage: UsageMeter,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            resolver,
            guard,
            subscriptions,
            usage,
            audit,
        }
    }

    pub async fn enforce(
        &self,
        credentials: RequestCredentials<'_>,
        operation: &Operation,
    ) -> AppResult<Grant> {
        let context = self.resolver.resolve(credentials).await?;
        self.authorize(&context, operation).await
    }

    fn deny(&self, context: &TenantContext, operation: &Operation, reason: String) {
        self.audit.record(AuditEvent::denied(
            Some(context.principal.user_id),
            Some(context.tenant.id),
            operation.kind.name(),
            reason,
        ));
    }

    /// Runs the checks that follow context resolution.
    pub async fn authorize(&self, context: &TenantContext, operation: &Operation) -> AppResult<Grant> {
        if operation.quantity <= 0 {
            return Err(AppError::BadRequest("quantity must be positive".into()));
        }
        let policy = operation.policy();
        let action = operation.kind.name();

        self.guard
            .check(context, operation.resource_tenant, policy.required_role, action)?;

        let standing = match self
            .subscriptions
            .ensure_permits(context.tenant.id, policy.class, operation.increases_usage())
            .await
        {
            Ok(standing) => standing,
            Err(e @ AppError::SubscriptionInactive(_)) => {
                self.deny(context, operation, e.to_string());
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let Some(feature) = policy.feature {
            if !standing.plan.has_feature(feature) {
                self.deny(
                    context,
                    operation,
                    format!("plan {} lacks feature {}", standing.plan.key, feature.as_str()),
                );
                return Err(AppError::FeatureNotIncluded(feature));
            }
        }

        let (reservation, warnings) = match operation.usage() {
            Some(usage) => {
                let metered = self
                    .usage
                    .reserve(context.tenant.id, &standing.plan, usage.resource, usage.delta)
                    .await?;
                (Some(metered.reservation), metered.warnings)
            }
            None => (None, Vec::new()),
        };

        tracing::debug!(
            tenant_id = %context.tenant.id,
            user_id = %context.principal.user_id,
            operation = action,
            "operation granted"
        );
        Ok(Grant {
            context: context.clone(),
            operation: operation.kind,
            effective: standing.effective,
            reservation,
            warnings,
        })
    }

    /// Reverses the reservation of a grant whose operation did not run.
    pub async fn abandon(&self, context: &TenantContext, reservation: &Reservation) -> AppResult<()> {
        if reservation.tenant_id != context.tenant.id {
            self.audit.record(AuditEvent::denied(
                Some(context.principal.user_id),
                Some(context.tenant.id),
                "usage.abandon",
                "reservation belongs to another tenant",
            ));
            return Err(AppError::AccessDenied(
                "reservation belongs to another tenant".into(),
            ));
        }
        self.usage.cancel_reservation(reservation).await
    }
}
