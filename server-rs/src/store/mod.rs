use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppResult;
use crate::models::{
    BillingEventRecord, CounterKey, CounterUpdate, Membership, Plan, ResourceKind, Role,
    SaveOutcome, Subscription, Tenant, TenantId, UsageCounter, UserId,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Result of a membership write guarded by the last-admin rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipWrite {
    Done,
    NotFound,
    /// The change would leave the tenant without an owner or admin.
    LastAdmin,
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Creates the tenant, its owner membership, the `users` counter at 1 and the
    /// first subscription in one atomic step. Slug collisions are `Conflict`.
    async fn onboard_tenant(
        &self,
        tenant: &Tenant,
        owner: &Membership,
        subscription: &Subscription,
    ) -> AppResult<()>;
    async fn get_tenant(&self, id: TenantId) -> AppResult<Option<Tenant>>;
    async fn update_tenant(&self, tenant: &Tenant) -> AppResult<()>;

    async fn get_membership(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> AppResult<Option<Membership>>;
    async fn list_memberships(&self, tenant_id: TenantId) -> AppResult<Vec<Membership>>;
    /// Memberships of one user in tenants that are still active.
    async fn memberships_for_user(&self, user_id: UserId) -> AppResult<Vec<(Membership, Tenant)>>;
    async fn insert_membership(&self, membership: &Membership) -> AppResult<()>;
    async fn update_membership_role(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        role: Role,
    ) -> AppResult<MembershipWrite>;
    async fn remove_membership(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> AppResult<MembershipWrite>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn get_plan(&self, id: uuid::Uuid) -> AppResult<Option<Plan>>;
    async fn list_plans(&self) -> AppResult<Vec<Plan>>;
    async fn insert_plan(&self, plan: &Plan) -> AppResult<()>;
    /// Highest version published under `key`.
    async fn latest_plan(&self, key: &str) -> AppResult<Option<Plan>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Most recently created subscription of the tenant.
    async fn current_subscription(&self, tenant_id: TenantId) -> AppResult<Option<Subscription>>;
    /// Writes `subscription` if the stored version still equals `expected_version`.
    /// When `event` is given it is recorded in the same transaction; a repeated
    /// event id yields `DuplicateEvent` and nothing is written.
    async fn save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
        event: Option<&BillingEventRecord>,
    ) -> AppResult<SaveOutcome>;
    /// Retires `previous_id` (bumping its version) and inserts `next` atomically.
    async fn replace_subscription(
        &self,
        previous_id: uuid::Uuid,
        expected_version: i64,
        next: &Subscription,
    ) -> AppResult<SaveOutcome>;
    /// Records an event that changed no subscription. False if already recorded.
    async fn record_billing_event(&self, event: &BillingEventRecord) -> AppResult<bool>;
    async fn is_event_processed(&self, event_id: &str) -> AppResult<bool>;
    async fn billing_events(&self, tenant_id: TenantId) -> AppResult<Vec<BillingEventRecord>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Adds `delta` only if the result stays within `limit`, as one atomic step.
    /// `at` becomes the counter's `updated_at`.
    async fn try_increment(
        &self,
        key: &CounterKey,
        delta: i64,
        limit: Option<i64>,
        at: DateTime<Utc>,
    ) -> AppResult<CounterUpdate>;
    /// Subtracts `amount`, flooring at zero. Returns `(previous, current)`.
    async fn decrement(
        &self,
        key: &CounterKey,
        amount: i64,
        at: DateTime<Utc>,
    ) -> AppResult<(i64, i64)>;
    async fn get_count(&self, key: &CounterKey) -> AppResult<i64>;
    async fn counters_for(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
    ) -> AppResult<Vec<UsageCounter>>;
}

#[async_trait]
pub trait Store: TenantStore + PlanStore + SubscriptionStore + UsageStore {
    async fn ping(&self) -> AppResult<()>;
    fn backend(&self) -> &'static str;
}
