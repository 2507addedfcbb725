use std::sync::Arc;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{AppError, AppResult};
use crate::models::{Role, TenantContext, TenantId};

/// A membership mutation, described by the roles involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Add { role: Role },
    ChangeRole { from: Role, to: Role },
    Remove { role: Role },
}

impl MembershipChange {
    fn action(self) -> &'static str {
        match self {
            MembershipChange::Add { .. } => "membership.add",
            MembershipChange::ChangeRole { .. } => "membership.change_role",
            MembershipChange::Remove { .. } => "membership.remove",
        }
    }

    /// True when the change takes an owner/admin seat away.
    fn drops_admin(self) -> bool {
        match self {
            MembershipChange::Add { .. } => false,
            MembershipChange::ChangeRole { from, to } => from.is_admin() && !to.is_admin(),
            MembershipChange::Remove { role } => role.is_admin(),
        }
    }
}

/// Pure allow/deny decisions. Every decision is reported to the audit sink.
#[derive(Clone)]
pub struct AccessGuard {
    audit: Arc<dyn AuditSink>,
}

impl AccessGuard {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self { audit }
    }

    fn deny(&self, ctx: &TenantContext, action: &str, reason: String) -> AppError {
        self.audit.record(AuditEvent::denied(
            Some(ctx.principal.user_id),
            Some(ctx.tenant.id),
            action,
            reason.clone(),
        ));
        AppError::AccessDenied(reason)
    }

    fn check_scope(
        &self,
        ctx: &TenantContext,
        resource_tenant: TenantId,
        required: Role,
        action: &str,
    ) -> AppResult<()> {
        if ctx.tenant.id != resource_tenant {
            return Err(self.deny(ctx, action, "resource belongs to another tenant".into()));
        }
        if !ctx.role.satisfies(required) {
            return Err(self.deny(
                ctx,
                action,
                format!("role {} does not meet required {}", ctx.role, required),
            ));
        }
        Ok(())
    }

    pub fn check(
        &self,
        ctx: &TenantContext,
        resource_tenant: TenantId,
        required: Role,
        action: &str,
    ) -> AppResult<()> {
        self.check_scope(ctx, resource_tenant, required, action)?;
        self.audit.record(AuditEvent::allowed(
            ctx.principal.user_id,
            ctx.tenant.id,
            action,
        ));
        Ok(())
    }

    /// Membership changes need admin rights, may not touch a member who
    /// outranks the actor or grant a role above the actor's own, and may not
    /// leave the tenant without an owner or admin.
    pub fn check_membership_change(
        &self,
        ctx: &TenantContext,
        resource_tenant: TenantId,
        change: MembershipChange,
        admin_count: usize,
    ) -> AppResult<()> {
        let action = change.action();
        self.check_scope(ctx, resource_tenant, Role::Admin, action)?;

        let (touched, granted) = match change {
            MembershipChange::Add { role } => (None, Some(role)),
            MembershipChange::ChangeRole { from, to } => (Some(from), Some(to)),
            MembershipChange::Remove { role } => (Some(role), None),
        };
        if let Some(existing) = touched {
            if existing.outranks(ctx.role) {
                return Err(self.deny(
                    ctx,
                    action,
                    format!("cannot modify a member with role {existing}"),
                ));
            }
        }
        if let Some(granted) = granted {
            if granted.outranks(ctx.role) {
                return Err(self.deny(
                    ctx,
                    action,
                    format!("cannot grant role {granted} above own role {}", ctx.role),
                ));
            }
        }

        if change.drops_admin() && admin_count <= 1 {
            self.audit.record(AuditEvent::denied(
                Some(ctx.principal.user_id),
                Some(ctx.tenant.id),
                action,
                "last admin",
            ));
            return Err(AppError::CannotRemoveLastAdmin);
        }

        self.audit.record(AuditEvent::allowed(
            ctx.principal.user_id,
            ctx.tenant.id,
            action,
        ));
        Ok(())
    }
}
