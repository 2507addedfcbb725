//! `PgStore` against a live database.
//!
//!   DATABASE_URL="postgres://..." cargo test --test postgres_store -- --ignored
//!
//! Every test works on freshly onboarded tenants with random slugs, so the
//! suite can run repeatedly against the same database.

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use uuid::Uuid;

use tenancy_api::db;
use tenancy_api::models::{
    builtin_plans, BillingCycle, BillingEventRecord, CounterKey, CounterUpdate, EventOutcome,
    Membership, Plan, ResourceKind, Role, SaveOutcome, Subscription, SubscriptionStatus, Tenant,
    TenantId, TenantSettings, TenantStatus, UserId, STOCK_PERIOD,
};
use tenancy_api::services::lifecycle;
use tenancy_api::store::{
    MembershipWrite, PgStore, PlanStore, SubscriptionStore, TenantStore, UsageStore,
};

async fn store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await
        .unwrap();
    db::migrate(&pool).await.unwrap();
    PgStore::new(pool)
}

async fn plan(store: &PgStore) -> Plan {
    let mut plan = builtin_plans(Utc::now()).remove(0);
    plan.id = Uuid::new_v4();
    plan.key = format!("pgtest-{}", plan.id.simple());
    store.insert_plan(&plan).await.unwrap();
    plan
}

struct Onboarded {
    tenant: Tenant,
    owner: Membership,
    subscription: Subscription,
}

async fn onboard(store: &PgStore) -> Onboarded {
    let now = Utc::now();
    let plan = plan(store).await;
    let id = TenantId::new();
    let tenant = Tenant {
        id,
        name: "Pg Shop".into(),
        slug: format!("pg-shop-{}", id.0.simple()),
        status: TenantStatus::Active,
        settings: TenantSettings::default(),
        created_at: now,
        updated_at: now,
    };
    let owner = Membership {
        tenant_id: id,
        user_id: UserId::new(),
        role: Role::Owner,
        joined_at: now,
    };
    let subscription = lifecycle::start_subscription(id, &plan, BillingCycle::Monthly, now, 14);
    store
        .onboard_tenant(&tenant, &owner, &subscription)
        .await
        .unwrap();
    Onboarded {
        tenant,
        owner,
        subscription,
    }
}

fn event(id: &str, sub: &Subscription) -> BillingEventRecord {
    let now = Utc::now();
    BillingEventRecord {
        event_id: id.to_string(),
        tenant_id: sub.tenant_id,
        subscription_id: Some(sub.id),
        event_type: "payment.succeeded".into(),
        outcome: EventOutcome::Applied,
        amount_cents: Some(2900),
        currency: Some("usd".into()),
        occurred_at: now,
        processed_at: now,
    }
}

fn activated(sub: &Subscription) -> Subscription {
    let mut next = sub.clone();
    next.status = SubscriptionStatus::Active;
    next.trial_end = None;
    next.version += 1;
    next.updated_at = Utc::now();
    next
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn concurrent_increments_stop_at_limit() {
    let store = Arc::new(store().await);
    let shop = onboard(&store).await;
    let key = CounterKey::new(shop.tenant.id, ResourceKind::Products, STOCK_PERIOD);

    let tasks: Vec<_> = (0..24)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.try_increment(&key, 1, Some(5), Utc::now()).await })
        })
        .collect();

    let mut applied = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            CounterUpdate::Applied { current, .. } => {
                assert!(current <= 5);
                applied += 1;
            }
            CounterUpdate::Rejected { current } => {
                assert_eq!(current, 5);
                rejected += 1;
            }
        }
    }
    assert_eq!(applied, 5);
    assert_eq!(rejected, 19);
    assert_eq!(store.get_count(&key).await.unwrap(), 5);

    assert_eq!(store.decrement(&key, 9, Utc::now()).await.unwrap(), (5, 0));
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn repeated_event_id_writes_nothing() {
    let store = store().await;
    let shop = onboard(&store).await;
    let sub = shop.subscription;
    let event_id = format!("evt_{}", Uuid::new_v4().simple());

    assert!(store.record_billing_event(&event(&event_id, &sub)).await.unwrap());
    let outcome = store
        .save_subscription(&activated(&sub), sub.version, Some(&event(&event_id, &sub)))
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::DuplicateEvent);

    let stored = store
        .current_subscription(shop.tenant.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, sub.version);
    assert_eq!(stored.status, SubscriptionStatus::Trialing);
    assert_eq!(store.billing_events(shop.tenant.id).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn stale_version_rolls_back_event() {
    let store = store().await;
    let shop = onboard(&store).await;
    let sub = shop.subscription;
    let event_id = format!("evt_{}", Uuid::new_v4().simple());

    let outcome = store
        .save_subscription(&activated(&sub), sub.version + 7, Some(&event(&event_id, &sub)))
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::Stale);
    assert!(!store.is_event_processed(&event_id).await.unwrap());

    let outcome = store
        .save_subscription(&activated(&sub), sub.version, Some(&event(&event_id, &sub)))
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::Saved);
    assert!(store.is_event_processed(&event_id).await.unwrap());
    let stored = store
        .current_subscription(shop.tenant.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, sub.version + 1);
    assert_eq!(stored.status, SubscriptionStatus::Active);
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn last_admin_is_kept() {
    let store = store().await;
    let shop = onboard(&store).await;
    let tenant = shop.tenant.id;
    let owner = shop.owner.user_id;

    assert_eq!(
        store.remove_membership(tenant, owner).await.unwrap(),
        MembershipWrite::LastAdmin
    );
    assert_eq!(
        store
            .update_membership_role(tenant, owner, Role::Staff)
            .await
            .unwrap(),
        MembershipWrite::LastAdmin
    );
    assert_eq!(
        store
            .remove_membership(tenant, UserId::new())
            .await
            .unwrap(),
        MembershipWrite::NotFound
    );

    let admin = Membership {
        tenant_id: tenant,
        user_id: UserId::new(),
        role: Role::Admin,
        joined_at: Utc::now(),
    };
    store.insert_membership(&admin).await.unwrap();
    assert_eq!(
        store.remove_membership(tenant, owner).await.unwrap(),
        MembershipWrite::Done
    );
    assert_eq!(
        store
            .update_membership_role(tenant, admin.user_id, Role::Manager)
            .await
            .unwrap(),
        MembershipWrite::LastAdmin
    );
    let members = store.list_memberships(tenant).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].role, Role::Admin);
}
