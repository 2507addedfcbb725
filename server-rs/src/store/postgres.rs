use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

use super::{
    MembershipWrite, PlanStore, Store, SubscriptionStore, TenantStore, UsageStore,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    BillingEventRecord, CounterKey, CounterUpdate, Feature, Membership, PaymentDue,
    PaymentRecord, Plan, PlanLimits, ResourceKind, Role, SaveOutcome, Subscription, Tenant,
    TenantId, TenantSettings, UsageCounter, UserId, STOCK_PERIOD,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_column<T>(value: &str, column: &str) -> AppResult<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e| AppError::Internal(format!("bad value in {column}: {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    slug: String,
    status: String,
    settings: Json<TenantSettings>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TenantRow {
    fn into_tenant(self) -> AppResult<Tenant> {
        Ok(Tenant {
            id: TenantId(self.id),
            name: self.name,
            slug: self.slug,
            status: parse_column(&self.status, "tenants.status")?,
            settings: self.settings.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct MembershipRow {
    tenant_id: Uuid,
    user_id: Uuid,
    role: String,
    joined_at: DateTime<Utc>,
}

impl MembershipRow {
    fn into_membership(self) -> AppResult<Membership> {
        Ok(Membership {
            tenant_id: TenantId(self.tenant_id),
            user_id: UserId(self.user_id),
            role: parse_column(&self.role, "memberships.role")?,
            joined_at: self.joined_at,
        })
    }
}

#[derive(FromRow)]
struct PlanRow {
    id: Uuid,
    plan_key: String,
    version: i32,
    name: String,
    monthly_price_cents: i64,
    yearly_price_cents: i64,
    currency: String,
    max_users: Option<i64>,
    max_products: Option<i64>,
    max_transactions: Option<i64>,
    max_storage_bytes: Option<i64>,
    features: Json<Vec<Feature>>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            key: row.plan_key,
            version: row.version,
            name: row.name,
            monthly_price_cents: row.monthly_price_cents,
            yearly_price_cents: row.yearly_price_cents,
            currency: row.currency,
            limits: PlanLimits {
                max_users: row.max_users,
                max_products: row.max_products,
                max_transactions_per_month: row.max_transactions,
                max_storage_bytes: row.max_storage_bytes,
            },
            features: row.features.0,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

const PLAN_COLUMNS: &str = "id, plan_key, version, name, monthly_price_cents, yearly_price_cents, \
     currency, max_users, max_products, max_transactions, max_storage_bytes, features, \
     is_active, created_at";

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    plan_id: Uuid,
    billing_cycle: String,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    trial_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    canceled_at: Option<DateTime<Utc>>,
    status_before_cancel: Option<String>,
    past_due_since: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    last_payment: Option<Json<PaymentRecord>>,
    next_payment_due: Option<Json<PaymentDue>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SubscriptionRow {
    fn into_subscription(self) -> AppResult<Subscription> {
        let status_before_cancel = match self.status_before_cancel.as_deref() {
            Some(s) => Some(parse_column(s, "subscriptions.status_before_cancel")?),
            None => None,
        };
        Ok(Subscription {
            id: self.id,
            tenant_id: TenantId(self.tenant_id),
            plan_id: self.plan_id,
            billing_cycle: parse_column(&self.billing_cycle, "subscriptions.billing_cycle")?,
            status: parse_column(&self.status, "subscriptions.status")?,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            trial_end: self.trial_end,
            cancel_at_period_end: self.cancel_at_period_end,
            canceled_at: self.canceled_at,
            status_before_cancel,
            past_due_since: self.past_due_since,
            ended_at: self.ended_at,
            last_payment: self.last_payment.map(|j| j.0),
            next_payment_due: self.next_payment_due.map(|j| j.0),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, plan_id, billing_cycle, status, \
     current_period_start, current_period_end, trial_end, cancel_at_period_end, canceled_at, \
     status_before_cancel, past_due_since, ended_at, last_payment, next_payment_due, version, \
     created_at, updated_at";

#[derive(FromRow)]
struct EventRow {
    event_id: String,
    tenant_id: Uuid,
    subscription_id: Option<Uuid>,
    event_type: String,
    outcome: String,
    amount_cents: Option<i64>,
    currency: Option<String>,
    occurred_at: DateTime<Utc>,
    processed_at: DateTime<Utc>,
}

impl EventRow {
    fn into_record(self) -> AppResult<BillingEventRecord> {
        Ok(BillingEventRecord {
            event_id: self.event_id,
            tenant_id: TenantId(self.tenant_id),
            subscription_id: self.subscription_id,
            event_type: self.event_type,
            outcome: parse_column(&self.outcome, "billing_events.outcome")?,
            amount_cents: self.amount_cents,
            currency: self.currency,
            occurred_at: self.occurred_at,
            processed_at: self.processed_at,
        })
    }
}

#[derive(FromRow)]
struct CounterRow {
    tenant_id: Uuid,
    resource: String,
    period: String,
    count: i64,
    updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Shared statements
// ---------------------------------------------------------------------------

async fn insert_subscription<'e, E>(executor: E, sub: &Subscription) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO subscriptions (id, tenant_id, plan_id, billing_cycle, status, \
         current_period_start, current_period_end, trial_end, cancel_at_period_end, canceled_at, \
         status_before_cancel, past_due_since, ended_at, last_payment, next_payment_due, version, \
         created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
    )
    .bind(sub.id)
    .bind(sub.tenant_id.0)
    .bind(sub.plan_id)
    .bind(sub.billing_cycle.as_str())
    .bind(sub.status.as_str())
    .bind(sub.current_period_start)
    .bind(sub.current_period_end)
    .bind(sub.trial_end)
    .bind(sub.cancel_at_period_end)
    .bind(sub.canceled_at)
    .bind(sub.status_before_cancel.map(|s| s.as_str()))
    .bind(sub.past_due_since)
    .bind(sub.ended_at)
    .bind(sub.last_payment.clone().map(Json))
    .bind(sub.next_payment_due.clone().map(Json))
    .bind(sub.version)
    .bind(sub.created_at)
    .bind(sub.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_event<'e, E>(executor: E, event: &BillingEventRecord) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        "INSERT INTO billing_events (event_id, tenant_id, subscription_id, event_type, outcome, \
         amount_cents, currency, occurred_at, processed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (event_id) DO NOTHING",
    )
    .bind(&event.event_id)
    .bind(event.tenant_id.0)
    .bind(event.subscription_id)
    .bind(&event.event_type)
    .bind(event.outcome.as_str())
    .bind(event.amount_cents)
    .bind(&event.currency)
    .bind(event.occurred_at)
    .bind(event.processed_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Tenants & memberships
// ---------------------------------------------------------------------------

#[async_trait]
impl TenantStore for PgStore {
    async fn onboard_tenant(
        &self,
        tenant: &Tenant,
        owner: &Membership,
        subscription: &Subscription,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query(
            "INSERT INTO tenants (id, name, slug, status, settings, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(tenant.id.0)
        .bind(&tenant.name)
        .bind(&tenant.slug)
        .bind(tenant.status.as_str())
        .bind(Json(&tenant.settings))
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&mut *tx)
        .await;
        if let Err(err) = insert {
            if is_unique_violation(&err) {
                return Err(AppError::Conflict(format!(
                    "slug '{}' is already taken",
                    tenant.slug
                )));
            }
            return Err(err.into());
        }

        sqlx::query(
            "INSERT INTO memberships (tenant_id, user_id, role, joined_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(owner.tenant_id.0)
        .bind(owner.user_id.0)
        .bind(owner.role.as_str())
        .bind(owner.joined_at)
        .execute(&mut *tx)
        .await?;

        insert_subscription(&mut *tx, subscription).await?;

        sqlx::query(
            "INSERT INTO usage_counters (tenant_id, resource, period, count, updated_at) \
             VALUES ($1, $2, $3, 1, $4)",
        )
        .bind(tenant.id.0)
        .bind(ResourceKind::Users.as_str())
        .bind(STOCK_PERIOD)
        .bind(tenant.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_tenant(&self, id: TenantId) -> AppResult<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as(
            "SELECT id, name, slug, status, settings, created_at, updated_at \
             FROM tenants WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TenantRow::into_tenant).transpose()
    }

    async fn update_tenant(&self, tenant: &Tenant) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE tenants SET name = $2, status = $3, settings = $4, updated_at = $5 \
             WHERE id = $1",
        )
        .bind(tenant.id.0)
        .bind(&tenant.name)
        .bind(tenant.status.as_str())
        .bind(Json(&tenant.settings))
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("tenant".into()));
        }
        Ok(())
    }

    async fn get_membership(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> AppResult<Option<Membership>> {
        let row: Option<MembershipRow> = sqlx::query_as(
            "SELECT tenant_id, user_id, role, joined_at FROM memberships \
             WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MembershipRow::into_membership).transpose()
    }

    async fn list_memberships(&self, tenant_id: TenantId) -> AppResult<Vec<Membership>> {
        let rows: Vec<MembershipRow> = sqlx::query_as(
            "SELECT tenant_id, user_id, role, joined_at FROM memberships \
             WHERE tenant_id = $1 ORDER BY joined_at",
        )
        .bind(tenant_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MembershipRow::into_membership).collect()
    }

    async fn memberships_for_user(&self, user_id: UserId) -> AppResult<Vec<(Membership, Tenant)>> {
        let memberships: Vec<MembershipRow> = sqlx::query_as(
            "SELECT m.tenant_id, m.user_id, m.role, m.joined_at FROM memberships m \
             JOIN tenants t ON t.id = m.tenant_id \
             WHERE m.user_id = $1 AND t.status = 'active' ORDER BY t.name",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(memberships.len());
        for row in memberships {
            let membership = row.into_membership()?;
            if let Some(tenant) = self.get_tenant(membership.tenant_id).await? {
                out.push((membership, tenant));
            }
        }
        Ok(out)
    }

    async fn insert_membership(&self, membership: &Membership) -> AppResult<()> {
        let result = sqlx::query(
            "INSERT INTO memberships (tenant_id, user_id, role, joined_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(membership.tenant_id.0)
        .bind(membership.user_id.0)
        .bind(membership.role.as_str())
        .bind(membership.joined_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(AppError::Conflict("user is already a member".into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_membership_role(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        role: Role,
    ) -> AppResult<MembershipWrite> {
        let mut tx = self.pool.begin().await?;
        // Serializes admin-affecting changes per tenant.
        sqlx::query("SELECT id FROM tenants WHERE id = $1 FOR UPDATE")
            .bind(tenant_id.0)
            .execute(&mut *tx)
            .await?;

        let current: Option<(String,)> = sqlx::query_as(
            "SELECT role FROM memberships WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant_id.0)
        .bind(user_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((current,)) = current else {
            return Ok(MembershipWrite::NotFound);
        };
        let current: Role = parse_column(&current, "memberships.role")?;

        if current.is_admin() && !role.is_admin() {
            let (admins,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM memberships \
                 WHERE tenant_id = $1 AND role IN ('owner', 'admin')",
            )
            .bind(tenant_id.0)
            .fetch_one(&mut *tx)
            .await?;
            if admins <= 1 {
                return Ok(MembershipWrite::LastAdmin);
            }
        }

        sqlx::query("UPDATE memberships SET role = $3 WHERE tenant_id = $1 AND user_id = $2")
            .bind(tenant_id.0)
            .bind(user_id.0)
            .bind(role.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(MembershipWrite::Done)
    }

    async fn remove_membership(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> AppResult<MembershipWrite> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT id FROM tenants WHERE id = $1 FOR UPDATE")
            .bind(tenant_id.0)
            .execute(&mut *tx)
            .await?;

        let current: Option<(String,)> = sqlx::query_as(
            "SELECT role FROM memberships WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant_id.0)
        .bind(user_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((current,)) = current else {
            return Ok(MembershipWrite::NotFound);
        };
        let current: Role = parse_column(&current, "memberships.role")?;

        if current.is_admin() {
            let (admins,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM memberships \
                 WHERE tenant_id = $1 AND role IN ('owner', 'admin')",
            )
            .bind(tenant_id.0)
            .fetch_one(&mut *tx)
            .await?;
            if admins <= 1 {
                return Ok(MembershipWrite::LastAdmin);
            }
        }

        sqlx::query("DELETE FROM memberships WHERE tenant_id = $1 AND user_id = $2")
            .bind(tenant_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(MembershipWrite::Done)
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[async_trait]
impl PlanStore for PgStore {
    async fn get_plan(&self, id: Uuid) -> AppResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Plan::from))
    }

    async fn list_plans(&self) -> AppResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans ORDER BY plan_key, version"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Plan::from).collect())
    }

    async fn insert_plan(&self, plan: &Plan) -> AppResult<()> {
        let result = sqlx::query(
            "INSERT INTO plans (id, plan_key, version, name, monthly_price_cents, \
             yearly_price_cents, currency, max_users, max_products, max_transactions, \
             max_storage_bytes, features, is_active, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(plan.id)
        .bind(&plan.key)
        .bind(plan.version)
        .bind(&plan.name)
        .bind(plan.monthly_price_cents)
        .bind(plan.yearly_price_cents)
        .bind(&plan.currency)
        .bind(plan.limits.max_users)
        .bind(plan.limits.max_products)
        .bind(plan.limits.max_transactions_per_month)
        .bind(plan.limits.max_storage_bytes)
        .bind(Json(&plan.features))
        .bind(plan.is_active)
        .bind(plan.created_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(AppError::Conflict(format!(
                "plan {} v{} already exists",
                plan.key, plan.version
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn latest_plan(&self, key: &str) -> AppResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE plan_key = $1 ORDER BY version DESC LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Plan::from))
    }
}

// ---------------------------------------------------------------------------
// Subscriptions & billing events
// ---------------------------------------------------------------------------

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn current_subscription(&self, tenant_id: TenantId) -> AppResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE tenant_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn save_subscription(
        &self,
        sub: &Subscription,
        expected_version: i64,
        event: Option<&BillingEventRecord>,
    ) -> AppResult<SaveOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(event) = event {
            if !insert_event(&mut *tx, event).await? {
                return Ok(SaveOutcome::DuplicateEvent);
            }
        }

        let result = sqlx::query(
            "UPDATE subscriptions SET plan_id = $3, billing_cycle = $4, status = $5, \
             current_period_start = $6, current_period_end = $7, trial_end = $8, \
             cancel_at_period_end = $9, canceled_at = $10, status_before_cancel = $11, \
             past_due_since = $12, ended_at = $13, last_payment = $14, next_payment_due = $15, \
             version = $16, updated_at = $17 \
             WHERE id = $1 AND version = $2",
        )
        .bind(sub.id)
        .bind(expected_version)
        .bind(sub.plan_id)
        .bind(sub.billing_cycle.as_str())
        .bind(sub.status.as_str())
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.canceled_at)
        .bind(sub.status_before_cancel.map(|s| s.as_str()))
        .bind(sub.past_due_since)
        .bind(sub.ended_at)
        .bind(sub.last_payment.clone().map(Json))
        .bind(sub.next_payment_due.clone().map(Json))
        .bind(sub.version)
        .bind(sub.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls back the event insert too.
            return Ok(SaveOutcome::Stale);
        }
        tx.commit().await?;
        Ok(SaveOutcome::Saved)
    }

    async fn replace_subscription(
        &self,
        previous_id: Uuid,
        expected_version: i64,
        next: &Subscription,
    ) -> AppResult<SaveOutcome> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE subscriptions SET version = version + 1, updated_at = $3 \
             WHERE id = $1 AND version = $2",
        )
        .bind(previous_id)
        .bind(expected_version)
        .bind(next.created_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(SaveOutcome::Stale);
        }
        insert_subscription(&mut *tx, next).await?;
        tx.commit().await?;
        Ok(SaveOutcome::Saved)
    }

    async fn record_billing_event(&self, event: &BillingEventRecord) -> AppResult<bool> {
        Ok(insert_event(&self.pool, event).await?)
    }

    async fn is_event_processed(&self, event_id: &str) -> AppResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM billing_events WHERE event_id = $1)")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn billing_events(&self, tenant_id: TenantId) -> AppResult<Vec<BillingEventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT event_id, tenant_id, subscription_id, event_type, outcome, amount_cents, \
             currency, occurred_at, processed_at FROM billing_events \
             WHERE tenant_id = $1 ORDER BY occurred_at DESC",
        )
        .bind(tenant_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_record).collect()
    }
}

// ---------------------------------------------------------------------------
// Usage counters
// ---------------------------------------------------------------------------

#[async_trait]
impl UsageStore for PgStore {
    async fn try_increment(
        &self,
        key: &CounterKey,
        delta: i64,
        limit: Option<i64>,
        at: DateTime<Utc>,
    ) -> AppResult<CounterUpdate> {
        // Conditional upsert: the limit check and the write are one statement.
        let applied: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO usage_counters (tenant_id, resource, period, count, updated_at) \
             SELECT $1, $2, $3, $4, $6 WHERE $5::BIGINT IS NULL OR $4 <= $5 \
             ON CONFLICT (tenant_id, resource, period) DO UPDATE \
             SET count = usage_counters.count + EXCLUDED.count, updated_at = EXCLUDED.updated_at \
             WHERE $5::BIGINT IS NULL OR usage_counters.count + EXCLUDED.count <= $5 \
             RETURNING count",
        )
        .bind(key.tenant_id.0)
        .bind(key.resource.as_str())
        .bind(&key.period)
        .bind(delta)
        .bind(limit)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match applied {
            Some((current,)) => Ok(CounterUpdate::Applied {
                previous: current - delta,
                current,
            }),
            None => Ok(CounterUpdate::Rejected {
                current: self.get_count(key).await?,
            }),
        }
    }

    async fn decrement(
        &self,
        key: &CounterKey,
        amount: i64,
        at: DateTime<Utc>,
    ) -> AppResult<(i64, i64)> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "UPDATE usage_counters AS u \
             SET count = GREATEST(u.count - $4, 0), updated_at = $5 \
             FROM (SELECT count FROM usage_counters \
                   WHERE tenant_id = $1 AND resource = $2 AND period = $3 FOR UPDATE) AS old \
             WHERE u.tenant_id = $1 AND u.resource = $2 AND u.period = $3 \
             RETURNING old.count, u.count",
        )
        .bind(key.tenant_id.0)
        .bind(key.resource.as_str())
        .bind(&key.period)
        .bind(amount)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.unwrap_or((0, 0)))
    }

    async fn get_count(&self, key: &CounterKey) -> AppResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT count FROM usage_counters \
             WHERE tenant_id = $1 AND resource = $2 AND period = $3",
        )
        .bind(key.tenant_id.0)
        .bind(key.resource.as_str())
        .bind(&key.period)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(count,)| count).unwrap_or(0))
    }

    async fn counters_for(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
    ) -> AppResult<Vec<UsageCounter>> {
        let rows: Vec<CounterRow> = sqlx::query_as(
            "SELECT tenant_id, resource, period, count, updated_at FROM usage_counters \
             WHERE tenant_id = $1 AND resource = $2 ORDER BY period DESC",
        )
        .bind(tenant_id.0)
        .bind(resource.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| -> AppResult<UsageCounter> {
                Ok(UsageCounter {
                    tenant_id: TenantId(row.tenant_id),
                    resource: parse_column(&row.resource, "usage_counters.resource")?,
                    period: row.period,
                    count: row.count,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
