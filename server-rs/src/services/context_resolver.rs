use std::sync::Arc;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{AppError, AppResult};
use crate::models::{Principal, TenantContext, TenantId};
use crate::store::Store;

/// Turns a raw credential into an authenticated principal.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> AppResult<Principal>;
}

/// Raw per-request inputs: the bearer credential and the tenant hint header.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestCredentials<'a> {
    pub bearer: Option<&'a str>,
    pub tenant_hint: Option<&'a str>,
}

const RESOLVE: &str = "tenant.resolve";

/// Produces the (principal, tenant, role) triple a request runs under. Never
/// guesses a tenant: no hint means no context.
#[derive(Clone)]
pub struct TenantContextResolver {
    store: Arc<dyn Store>,
    verifier: Arc<dyn CredentialVerifier>,
    audit: Arc<dyn AuditSink>,
}

impl TenantContextResolver {
    pub fn new(
        store: Arc<dyn Store>,
        verifier: Arc<dyn CredentialVerifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            verifier,
            audit,
        }
    }

    pub fn authenticate(&self, credential: Option<&str>) -> AppResult<Principal> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::Unauthenticated("No token provided".into()))?;

        self.verifier.verify(credential).map_err(|e| {
            self.audit
                .record(AuditEvent::denied(None, None, RESOLVE, "invalid credential"));
            match e {
                AppError::Unauthenticated(_) => e,
                other => AppError::Unauthenticated(other.to_string()),
            }
        })
    }

    pub async fn resolve_for(
        &self,
        principal: Principal,
        tenant_hint: Option<&str>,
    ) -> AppResult<TenantContext> {
        let deny = |tenant: Option<TenantId>, reason: &str| {
            self.audit.record(AuditEvent::denied(
                Some(principal.user_id),
                tenant,
                RESOLVE,
                reason,
            ));
        };

        let Some(hint) = tenant_hint.map(str::trim).filter(|h| !h.is_empty()) else {
            deny(None, "missing tenant hint");
            return Err(AppError::TenantHintRequired);
        };

        let Ok(tenant_id) = hint.parse::<TenantId>() else {
            deny(None, "unparsable tenant hint");
            return Err(AppError::TenantNotFound);
        };

        let tenant = match self.store.get_tenant(tenant_id).await? {
            Some(tenant) if tenant.is_active() => tenant,
            Some(_) => {
                deny(Some(tenant_id), "tenant disabled");
                return Err(AppError::TenantNotFound);
            }
            None => {
                deny(Some(tenant_id), "tenant not found");
                return Err(AppError::TenantNotFound);
            }
        };

        let Some(membership) = self
            .store
            .get_membership(tenant.id, principal.user_id)
            .await?
        else {
            deny(Some(tenant.id), "not a member");
            return Err(AppError::NotAMember);
        };

        Ok(TenantContext {
            principal,
            tenant,
            role: membership.role,
        })
    }

    pub async fn resolve(&self, credentials: RequestCredentials<'_>) -> AppResult<TenantContext> {
        let principal = self.authenticate(credentials.bearer)?;
        self.resolve_for(principal, credentials.tenant_hint).await
    }
}
