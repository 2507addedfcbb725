//! In-process store backed by a single `tokio::sync::RwLock`.
//!
//! Every trait method takes the write lock for its whole body when it mutates,
//! so multi-row operations (onboarding, guarded membership changes, event +
//! subscription writes) are atomic exactly like their Postgres counterparts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    MembershipWrite, PlanStore, Store, SubscriptionStore, TenantStore, UsageStore,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    BillingEventRecord, CounterKey, CounterUpdate, Membership, Plan, ResourceKind, Role,
    SaveOutcome, Subscription, Tenant, TenantId, UsageCounter, UserId, STOCK_PERIOD,
};

#[derive(Default)]
struct State {
    tenants: HashMap<TenantId, Tenant>,
    slugs: HashSet<String>,
    memberships: HashMap<(TenantId, UserId), Membership>,
    plans: HashMap<Uuid, Plan>,
    /// Insertion order per tenant; the last entry is current.
    subscriptions: HashMap<TenantId, Vec<Subscription>>,
    events: HashMap<String, BillingEventRecord>,
    counters: HashMap<CounterKey, UsageCounter>,
}

impl State {
    fn admin_count(&self, tenant_id: TenantId) -> usize {
        self.memberships
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.role.is_admin())
            .count()
    }

    fn find_subscription_mut(&mut self, id: Uuid) -> Option<&mut Subscription> {
        self.subscriptions
            .values_mut()
            .flat_map(|subs| subs.iter_mut())
            .find(|s| s.id == id)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantStore for InMemoryStore {
    async fn onboard_tenant(
        &self,
        tenant: &Tenant,
        owner: &Membership,
        subscription: &Subscription,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state.slugs.contains(&tenant.slug) {
            return Err(AppError::Conflict(format!(
                "slug '{}' is already taken",
                tenant.slug
            )));
        }
        if !state.plans.contains_key(&subscription.plan_id) {
            return Err(AppError::NotFound("plan".into()));
        }
        state.slugs.insert(tenant.slug.clone());
        state.tenants.insert(tenant.id, tenant.clone());
        state
            .memberships
            .insert((owner.tenant_id, owner.user_id), owner.clone());
        state
            .subscriptions
            .entry(tenant.id)
            .or_default()
            .push(subscription.clone());
        let key = CounterKey::new(tenant.id, ResourceKind::Users, STOCK_PERIOD);
        state.counters.insert(
            key,
            UsageCounter {
                tenant_id: tenant.id,
                resource: ResourceKind::Users,
                period: STOCK_PERIOD.to_string(),
                count: 1,
                updated_at: tenant.created_at,
            },
        );
        Ok(())
    }

    async fn get_tenant(&self, id: TenantId) -> AppResult<Option<Tenant>> {
        Ok(self.state.read().await.tenants.get(&id).cloned())
    }

    async fn update_tenant(&self, tenant: &Tenant) -> AppResult<()> {
        let mut state = self.state.write().await;
        match state.tenants.get_mut(&tenant.id) {
            Some(existing) => {
                *existing = tenant.clone();
                Ok(())
            }
            None => Err(AppError::NotFound("tenant".into())),
        }
    }

    async fn get_membership(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> AppResult<Option<Membership>> {
        Ok(self
            .state
            .read()
            .await
            .memberships
            .get(&(tenant_id, user_id))
            .cloned())
    }

    async fn list_memberships(&self, tenant_id: TenantId) -> AppResult<Vec<Membership>> {
        let state = self.state.read().await;
        let mut members: Vec<Membership> = state
            .memberships
            .values()
            .filter(|m| m.tenant_id == tenant_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    async fn memberships_for_user(&self, user_id: UserId) -> AppResult<Vec<(Membership, Tenant)>> {
        let state = self.state.read().await;
        let mut out: Vec<(Membership, Tenant)> = state
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| {
                let tenant = state.tenants.get(&m.tenant_id)?;
                tenant.is_active().then(|| (m.clone(), tenant.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        Ok(out)
    }

    async fn insert_membership(&self, membership: &Membership) -> AppResult<()> {
        let mut state = self.state.write().await;
        if !state.tenants.contains_key(&membership.tenant_id) {
            return Err(AppError::TenantNotFound);
        }
        let key = (membership.tenant_id, membership.user_id);
        if state.memberships.contains_key(&key) {
            return Err(AppError::Conflict("user is already a member".into()));
        }
        state.memberships.insert(key, membership.clone());
        Ok(())
    }

    async fn update_membership_role(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        role: Role,
    ) -> AppResult<MembershipWrite> {
        let mut state = self.state.write().await;
        let admins = state.admin_count(tenant_id);
        let Some(member) = state.memberships.get_mut(&(tenant_id, user_id)) else {
            return Ok(MembershipWrite::NotFound);
        };
        if member.role.is_admin() && !role.is_admin() && admins <= 1 {
            return Ok(MembershipWrite::LastAdmin);
        }
        member.role = role;
        Ok(MembershipWrite::Done)
    }

    async fn remove_membership(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> AppResult<MembershipWrite> {
        let mut state = self.state.write().await;
        let admins = state.admin_count(tenant_id);
        let Some(member) = state.memberships.get(&(tenant_id, user_id)) else {
            return Ok(MembershipWrite::NotFound);
        };
        if member.role.is_admin() && admins <= 1 {
            return Ok(MembershipWrite::LastAdmin);
        }
        state.memberships.remove(&(tenant_id, user_id));
        Ok(MembershipWrite::Done)
    }
}

#[async_trait]
impl PlanStore for InMemoryStore {
    async fn get_plan(&self, id: Uuid) -> AppResult<Option<Plan>> {
        Ok(self.state.read().await.plans.get(&id).cloned())
    }

    async fn list_plans(&self) -> AppResult<Vec<Plan>> {
        let state = self.state.read().await;
        let mut plans: Vec<Plan> = state.plans.values().cloned().collect();
        plans.sort_by(|a, b| (&a.key, a.version).cmp(&(&b.key, b.version)));
        Ok(plans)
    }

    async fn insert_plan(&self, plan: &Plan) -> AppResult<()> {
        let mut state = self.state.write().await;
        let clash = state
            .plans
            .values()
            .any(|p| p.id == plan.id || (p.key == plan.key && p.version == plan.version));
        if clash {
            return Err(AppError::Conflict(format!(
                "plan {} v{} already exists",
                plan.key, plan.version
            )));
        }
        state.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn latest_plan(&self, key: &str) -> AppResult<Option<Plan>> {
        let state = self.state.read().await;
        Ok(state
            .plans
            .values()
            .filter(|p| p.key == key)
            .max_by_key(|p| p.version)
            .cloned())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn current_subscription(&self, tenant_id: TenantId) -> AppResult<Option<Subscription>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .get(&tenant_id)
            .and_then(|subs| subs.last())
            .cloned())
    }

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
        event: Option<&BillingEventRecord>,
    ) -> AppResult<SaveOutcome> {
        let mut state = self.state.write().await;
        if let Some(event) = event {
            if state.events.contains_key(&event.event_id) {
                return Ok(SaveOutcome::DuplicateEvent);
            }
        }
        let Some(stored) = state.find_subscription_mut(subscription.id) else {
            return Err(AppError::NotFound("subscription".into()));
        };
        if stored.version != expected_version {
            return Ok(SaveOutcome::Stale);
        }
        *stored = subscription.clone();
        if let Some(event) = event {
            state.events.insert(event.event_id.clone(), event.clone());
        }
        Ok(SaveOutcome::Saved)
    }

    async fn replace_subscription(
        &self,
        previous_id: Uuid,
        expected_version: i64,
        next: &Subscription,
    ) -> AppResult<SaveOutcome> {
        let mut state = self.state.write().await;
        let Some(previous) = state.find_subscription_mut(previous_id) else {
            return Err(AppError::NotFound("subscription".into()));
        };
        if previous.version != expected_version {
            return Ok(SaveOutcome::Stale);
        }
        previous.version += 1;
        previous.updated_at = next.created_at;
        state
            .subscriptions
            .entry(next.tenant_id)
            .or_default()
            .push(next.clone());
        Ok(SaveOutcome::Saved)
    }

    async fn record_billing_event(&self, event: &BillingEventRecord) -> AppResult<bool> {
        let mut state = self.state.write().await;
        if state.events.contains_key(&event.event_id) {
            return Ok(false);
        }
        state.events.insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn is_event_processed(&self, event_id: &str) -> AppResult<bool> {
        Ok(self.state.read().await.events.contains_key(event_id))
    }

    async fn billing_events(&self, tenant_id: TenantId) -> AppResult<Vec<BillingEventRecord>> {
        let state = self.state.read().await;
        let mut events: Vec<BillingEventRecord> = state
            .events
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(events)
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn try_increment(
        &self,
        key: &CounterKey,
        delta: i64,
        limit: Option<i64>,
        at: DateTime<Utc>,
    ) -> AppResult<CounterUpdate> {
        let mut state = self.state.write().await;
        let counter = state
            .counters
            .entry(key.clone())
            .or_insert_with(|| UsageCounter {
                tenant_id: key.tenant_id,
                resource: key.resource,
                period: key.period.clone(),
                count: 0,
                updated_at: at,
            });
        let previous = counter.count;
        let next = previous.saturating_add(delta);
        if limit.is_some_and(|limit| next > limit) {
            return Ok(CounterUpdate::Rejected { current: previous });
        }
        counter.count = next;
        counter.updated_at = at;
        Ok(CounterUpdate::Applied {
            previous,
            current: next,
        })
    }

    async fn decrement(
        &self,
        key: &CounterKey,
        amount: i64,
        at: DateTime<Utc>,
    ) -> AppResult<(i64, i64)> {
        let mut state = self.state.write().await;
        match state.counters.get_mut(key) {
            Some(counter) => {
                let previous = counter.count;
                counter.count = (previous - amount).max(0);
                counter.updated_at = at;
                Ok((previous, counter.count))
            }
            None => Ok((0, 0)),
        }
    }

    async fn get_count(&self, key: &CounterKey) -> AppResult<i64> {
        Ok(self
            .state
            .read()
            .await
            .counters
            .get(key)
            .map(|c| c.count)
            .unwrap_or(0))
    }

    async fn counters_for(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
    ) -> AppResult<Vec<UsageCounter>> {
        let state = self.state.read().await;
        let mut counters: Vec<UsageCounter> = state
            .counters
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.resource == resource)
            .cloned()
            .collect();
        counters.sort_by(|a, b| b.period.cmp(&a.period));
        Ok(counters)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
