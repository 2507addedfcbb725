use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::access_guard::{AccessGuard, MembershipChange};
use super::enforcement::{EnforcementFacade, Grant};
use super::lifecycle;
use super::plan_catalog::PlanCatalog;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{
    slugify, AddMemberRequest, BillingCycle, Membership, OnboardTenantRequest, Operation,
    OperationKind, Principal, Role, SettingsUpdate, Subscription, Tenant, TenantContext, TenantId,
    TenantSettings, TenantStatus, UserId,
};
use crate::store::{MembershipWrite, Store};

const MAX_NAME_LEN: usize = 120;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Onboarded {
    pub tenant: Tenant,
    pub membership: Membership,
    pub subscription: Subscription,
}

/// One tenant the principal belongs to, for tenant pickers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberOf {
    pub tenant: Tenant,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TenantDirectory {
    store: Arc<dyn Store>,
    plans: PlanCatalog,
    guard: AccessGuard,
    facade: EnforcementFacade,
    clock: Arc<dyn Clock>,
    trial_days: i64,
    default_plan: String,
}

fn validate_settings(settings: &TenantSettings) -> AppResult<()> {
    if settings.currency.len() != 3 || !settings.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(AppError::BadRequest(
            "currency must be a three-letter ISO code".into(),
        ));
    }
    if settings.timezone.trim().is_empty() {
        return Err(AppError::BadRequest("timezone is required".into()));
    }
    if !(0..=10_000).contains(&settings.tax_rate_bps) {
        return Err(AppError::BadRequest(
            "taxRateBps must be between 0 and 10000".into(),
        ));
    }
    Ok(())
}

fn validate_name(name: &str) -> AppResult<String> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(AppError::BadRequest(format!(
            "name must be 1 to {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

impl TenantDirectory {
    pub fn new(
        store: Arc<dyn Store>,
        plans: PlanCatalog,
        guard: AccessGuard,
        facade: EnforcementFacade,
        clock: Arc<dyn Clock>,
        trial_days: i64,
        default_plan: impl Into<String>,
    ) -> Self {
        Self {
            store,
            plans,
            guard,
            facade,
            clock,
            trial_days,
            default_plan: default_plan.into(),
        }
    }

    /// Creates a tenant owned by `principal`, on a trial of the requested plan.
    pub async fn onboard(
        &self,
        principal: Principal,
        req: OnboardTenantRequest,
    ) -> AppResult<Onboarded> {
        let name = validate_name(&req.name)?;
        let slug = slugify(req.slug.as_deref().unwrap_or(&name));
        if slug.is_empty() {
            return Err(AppError::BadRequest(
                "slug must contain letters or digits".into(),
            ));
        }
        let settings = req.settings.unwrap_or_default();
        validate_settings(&settings)?;

        let plan_key = req.plan_key.as_deref().unwrap_or(&self.default_plan);
        let plan = match self.plans.latest(plan_key).await {
            Ok(plan) if plan.is_active => plan,
            Ok(_) | Err(AppError::NotFound(_)) => {
                return Err(AppError::BadRequest(format!("plan '{plan_key}' is not offered")))
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let tenant = Tenant {
            id: TenantId::new(),
            name,
            slug,
            status: TenantStatus::Active,
            settings,
            created_at: now,
            updated_at: now,
        };
        let membership = Membership {
            tenant_id: tenant.id,
            user_id: principal.user_id,
            role: Role::Owner,
            joined_at: now,
        };
        let subscription =
            lifecycle::start_subscription(tenant.id, &plan, BillingCycle::Monthly, now, self.trial_days);

        self.store
            .onboard_tenant(&tenant, &membership, &subscription)
            .await?;
        tracing::info!(
            tenant_id = %tenant.id,
            slug = %tenant.slug,
            plan = %plan.key,
            owner = %principal.user_id,
            "tenant onboarded"
        );
        Ok(Onboarded {
            tenant,
            membership,
            subscription,
        })
    }

    /// Tenants the principal belongs to. Never used to pick a tenant implicitly.
    pub async fn memberships_for(&self, principal: Principal) -> AppResult<Vec<MemberOf>> {
        let mut tenants: Vec<MemberOf> = self
            .store
            .memberships_for_user(principal.user_id)
            .await?
            .into_iter()
            .map(|(membership, tenant)| MemberOf {
                tenant,
                role: membership.role,
                joined_at: membership.joined_at,
            })
            .collect();
        tenants.sort_by(|a, b| a.tenant.name.cmp(&b.tenant.name));
        Ok(tenants)
    }

    async fn fresh_tenant(&self, ctx: &TenantContext) -> AppResult<Tenant> {
        self.store
            .get_tenant(ctx.tenant.id)
            .await?
            .ok_or(AppError::TenantNotFound)
    }

    pub async fn update_settings(
        &self,
        ctx: &TenantContext,
        update: SettingsUpdate,
    ) -> AppResult<Tenant> {
        self.facade
            .authorize(ctx, &Operation::new(OperationKind::SettingsUpdate, ctx.tenant.id))
            .await?;

        let mut tenant = self.fresh_tenant(ctx).await?;
        if let Some(name) = update.name {
            tenant.name = validate_name(&name)?;
        }
        if let Some(currency) = update.currency {
            tenant.settings.currency = currency.trim().to_ascii_uppercase();
        }
        if let Some(timezone) = update.timezone {
            tenant.settings.timezone = timezone.trim().to_string();
        }
        if let Some(tax) = update.tax_rate_bps {
            tenant.settings.tax_rate_bps = tax;
        }
        validate_settings(&tenant.settings)?;
        tenant.updated_at = self.clock.now();
        self.store.update_tenant(&tenant).await?;
        Ok(tenant)
    }

    /// Soft-disables the tenant. Its memberships stop resolving immediately.
    pub async fn disable(&self, ctx: &TenantContext) -> AppResult<Tenant> {
        self.facade
            .authorize(ctx, &Operation::new(OperationKind::TenantDisable, ctx.tenant.id))
            .await?;
        let mut tenant = self.fresh_tenant(ctx).await?;
        tenant.status = TenantStatus::Suspended;
        tenant.updated_at = self.clock.now();
        self.store.update_tenant(&tenant).await?;
        tracing::warn!(tenant_id = %tenant.id, by = %ctx.principal.user_id, "tenant disabled");
        Ok(tenant)
    }

    pub async fn roster(&self, ctx: &TenantContext) -> AppResult<Vec<Membership>> {
        self.facade
            .authorize(ctx, &Operation::new(OperationKind::MemberList, ctx.tenant.id))
            .await?;
        self.store.list_memberships(ctx.tenant.id).await
    }

    async fn admin_count(&self, tenant_id: TenantId) -> AppResult<usize> {
        Ok(self
            .store
            .list_memberships(tenant_id)
            .await?
            .iter()
            .filter(|m| m.role.is_admin())
            .count())
    }

    async fn member(&self, tenant_id: TenantId, user_id: UserId) -> AppResult<Membership> {
        self.store
            .get_membership(tenant_id, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("member {user_id}")))
    }

    /// Gives back the usage reserved for a membership write that failed.
    async fn rollback(&self, ctx: &TenantContext, grant: &Grant) {
        if let Some(reservation) = &grant.reservation {
            if let Err(e) = self.facade.abandon(ctx, reservation).await {
                tracing::error!(tenant_id = %ctx.tenant.id, "failed to reverse user reservation: {e}");
            }
        }
    }

    pub async fn add_member(
        &self,
        ctx: &TenantContext,
        req: AddMemberRequest,
    ) -> AppResult<Membership> {
        let tenant_id = ctx.tenant.id;
        let user_id = req.user.normalize();
        if self.store.get_membership(tenant_id, user_id).await?.is_some() {
            return Err(AppError::Conflict(format!("user {user_id} is already a member")));
        }
        self.guard.check_membership_change(
            ctx,
            tenant_id,
            MembershipChange::Add { role: req.role },
            self.admin_count(tenant_id).await?,
        )?;
        let grant = self
            .facade
            .authorize(ctx, &Operation::new(OperationKind::UserInvite, tenant_id))
            .await?;

        let membership = Membership {
            tenant_id,
            user_id,
            role: req.role,
            joined_at: self.clock.now(),
        };
        if let Err(e) = self.store.insert_membership(&membership).await {
            self.rollback(ctx, &grant).await;
            return Err(e);
        }
        tracing::info!(tenant_id = %tenant_id, user_id = %user_id, role = %req.role, "member added");
        Ok(membership)
    }

    pub async fn change_role(
        &self,
        ctx: &TenantContext,
        user_id: UserId,
        role: Role,
    ) -> AppResult<Membership> {
        let tenant_id = ctx.tenant.id;
        let mut target = self.member(tenant_id, user_id).await?;
        if target.role == role {
            return Ok(target);
        }
        self.guard.check_membership_change(
            ctx,
            tenant_id,
            MembershipChange::ChangeRole {
                from: target.role,
                to: role,
            },
            self.admin_count(tenant_id).await?,
        )?;
        self.facade
            .authorize(ctx, &Operation::new(OperationKind::UserChangeRole, tenant_id))
            .await?;

        match self
            .store
            .update_membership_role(tenant_id, user_id, role)
            .await?
        {
            MembershipWrite::Done => {
                tracing::info!(tenant_id = %tenant_id, user_id = %user_id, from = %target.role, to = %role, "member role changed");
                target.role = role;
                Ok(target)
            }
            MembershipWrite::NotFound => Err(AppError::NotFound(format!("member {user_id}"))),
            MembershipWrite::LastAdmin => Err(AppError::CannotRemoveLastAdmin),
        }
    }

    pub async fn remove_member(&self, ctx: &TenantContext, user_id: UserId) -> AppResult<()> {
        let tenant_id = ctx.tenant.id;
        let target = self.member(tenant_id, user_id).await?;
        self.guard.check_membership_change(
            ctx,
            tenant_id,
            MembershipChange::Remove { role: target.role },
            self.admin_count(tenant_id).await?,
        )?;
        let grant = self
            .facade
            .authorize(ctx, &Operation::new(OperationKind::UserRemove, tenant_id))
            .await?;

        let result = match self.store.remove_membership(tenant_id, user_id).await {
            Ok(MembershipWrite::Done) => Ok(()),
            Ok(MembershipWrite::NotFound) => Err(AppError::NotFound(format!("member {user_id}"))),
            Ok(MembershipWrite::LastAdmin) => Err(AppError::CannotRemoveLastAdmin),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                tracing::info!(tenant_id = %tenant_id, user_id = %user_id, "member removed");
                Ok(())
            }
            Err(e) => {
                self.rollback(ctx, &grant).await;
                Err(e)
            }
        }
    }
}
