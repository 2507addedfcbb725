mod common;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use common::{start_time, Harness, WEBHOOK_SECRET};
use tenancy_api::audit::{AuditEvent, MemoryAuditSink};
use tenancy_api::clock::ManualClock;
use tenancy_api::config::Config;
use tenancy_api::error::AppResult;
use tenancy_api::models::{
    BillingEventRecord, CounterKey, CounterUpdate, Membership, Plan, ResourceKind, Role,
    SaveOutcome, Subscription, SubscriptionStatus, Tenant, TenantId, UsageCounter, UserId,
};
use tenancy_api::services::WebhookVerifier;
use tenancy_api::store::{
    InMemoryStore, MembershipWrite, PlanStore, Store, SubscriptionStore, TenantStore, UsageStore,
};
use tenancy_api::{build_router, AppState};

fn payload(id: &str, kind: &str, tenant: TenantId, at: DateTime<Utc>) -> Vec<u8> {
    json!({
        "id": id,
        "type": kind,
        "created": at.timestamp(),
        "data": {
            "tenantId": tenant,
            "amountCents": 2900,
            "currency": "usd",
        },
    })
    .to_string()
    .into_bytes()
}

fn signed(body: Vec<u8>, signed_at: DateTime<Utc>) -> Request<Body> {
    let signature = WebhookVerifier::new(WEBHOOK_SECRET, 300)
        .sign(&body, signed_at)
        .unwrap();
    Request::builder()
        .method(Method::POST)
        .uri("/api/v1/webhooks/billing")
        .header("content-type", "application/json")
        .header("x-billing-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

async fn deliver(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn signed_payment_activates_once() {
    let h = Harness::new().await;
    let app = h.router();
    let shop = h.onboard("Webhook Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;
    let body = payload("evt_001", "payment.succeeded", tenant, h.now());

    let (status, res) = deliver(&app, signed(body.clone(), h.now())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(res["received"], true);
    assert_eq!(res["outcome"], "applied");
    let sub = h.engine().subscriptions.current(tenant).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);

    let (status, res) = deliver(&app, signed(body, h.now())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(res["duplicate"], true);
    let replayed = h.engine().subscriptions.current(tenant).await.unwrap();
    assert_eq!(replayed.version, sub.version);
}

#[tokio::test]
async fn bad_signatures_are_rejected() {
    let h = Harness::new().await;
    let app = h.router();
    let shop = h.onboard("Guarded Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;
    let body = payload("evt_002", "payment.succeeded", tenant, h.now());

    let mut forged = signed(body.clone(), h.now());
    forged.headers_mut().insert(
        "x-billing-signature",
        format!("t={},v1=deadbeef", h.now().timestamp()).parse().unwrap(),
    );
    let (status, _) = deliver(&app, forged).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // outside the replay window
    let stale = signed(body.clone(), h.now() - Duration::hours(1));
    let (status, _) = deliver(&app, stale).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut unsigned = signed(body, h.now());
    unsigned.headers_mut().remove("x-billing-signature");
    let (status, _) = deliver(&app, unsigned).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let rejected = h
        .audit
        .events()
        .iter()
        .filter(|e| matches!(e, AuditEvent::WebhookRejected { .. }))
        .count();
    assert_eq!(rejected, 3);
    let sub = h.engine().subscriptions.current(tenant).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Trialing);
}

#[tokio::test]
async fn unroutable_events_are_acknowledged() {
    let h = Harness::new().await;
    let app = h.router();
    let shop = h.onboard("Quiet Shop", "starter").await;

    let unknown_tenant = payload("evt_003", "payment.succeeded", TenantId::new(), h.now());
    let (status, res) = deliver(&app, signed(unknown_tenant, h.now())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(res["outcome"], "ignored");

    let unsupported = payload("evt_004", "invoice.created", shop.ctx.tenant.id, h.now());
    let (status, res) = deliver(&app, signed(unsupported, h.now())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(res["outcome"], "ignored");

    let history = h
        .engine()
        .subscriptions
        .history(shop.ctx.tenant.id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn malformed_payload_is_a_bad_request() {
    let h = Harness::new().await;
    let app = h.router();

    let (status, res) = deliver(&app, signed(b"{\"id\": 42}".to_vec(), h.now())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(res["error"].as_str().unwrap().starts_with("malformed event"));
}

#[tokio::test]
async fn webhooks_need_a_secret() {
    let store = Arc::new(InMemoryStore::new());
    let state = AppState::new(
        Config::default(),
        store,
        None,
        Arc::new(ManualClock::new(start_time())),
        Arc::new(MemoryAuditSink::new()),
    )
    .unwrap();
    let app = build_router(state);

    let body = payload("evt_005", "payment.succeeded", TenantId::new(), start_time());
    let (status, _) = deliver(&app, signed(body, start_time())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

/// Loses every optimistic subscription write, as if another writer always
/// got there first.
struct AlwaysStale(InMemoryStore);

#[async_trait]
impl TenantStore for AlwaysStale {
    async fn onboard_tenant(
        &self,
        tenant: &Tenant,
        owner: &Membership,
        subscription: &Subscription,
    ) -> AppResult<()> {
        self.0.onboard_tenant(tenant, owner, subscription).await
    }
    async fn get_tenant(&self, id: TenantId) -> AppResult<Option<Tenant>> {
        self.0.get_tenant(id).await
    }
    async fn update_tenant(&self, tenant: &Tenant) -> AppResult<()> {
        self.0.update_tenant(tenant).await
    }
    async fn get_membership(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> AppResult<Option<Membership>> {
        self.0.get_membership(tenant_id, user_id).await
    }
    async fn list_memberships(&self, tenant_id: TenantId) -> AppResult<Vec<Membership>> {
        self.0.list_memberships(tenant_id).await
    }
    async fn memberships_for_user(&self, user_id: UserId) -> AppResult<Vec<(Membership, Tenant)>> {
        self.0.memberships_for_user(user_id).await
    }
    async fn insert_membership(&self, membership: &Membership) -> AppResult<()> {
        self.0.insert_membership(membership).await
    }
    async fn update_membership_role(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        role: Role,
    ) -> AppResult<MembershipWrite> {
        self.0.update_membership_role(tenant_id, user_id, role).await
    }
    async fn remove_membership(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> AppResult<MembershipWrite> {
        self.0.remove_membership(tenant_id, user_id).await
    }
}

#[async_trait]
impl PlanStore for AlwaysStale {
    async fn get_plan(&self, id: uuid::Uuid) -> AppResult<Option<Plan>> {
        self.0.get_plan(id).await
    }
    async fn list_plans(&self) -> AppResult<Vec<Plan>> {
        self.0.list_plans().await
    }
    async fn insert_plan(&self, plan: &Plan) -> AppResult<()> {
        self.0.insert_plan(plan).await
    }
    async fn latest_plan(&self, key: &str) -> AppResult<Option<Plan>> {
        self.0.latest_plan(key).await
    }
}

#[async_trait]
impl SubscriptionStore for AlwaysStale {
    async fn current_subscription(&self, tenant_id: TenantId) -> AppResult<Option<Subscription>> {
        self.0.current_subscription(tenant_id).await
    }
    async fn save_subscription(
        &self,
        _subscription: &Subscription,
        _expected_version: i64,
        _event: Option<&BillingEventRecord>,
    ) -> AppResult<SaveOutcome> {
        Ok(SaveOutcome::Stale)
    }
    async fn replace_subscription(
        &self,
        previous_id: uuid::Uuid,
        expected_version: i64,
        next: &Subscription,
    ) -> AppResult<SaveOutcome> {
        self.0
            .replace_subscription(previous_id, expected_version, next)
            .await
    }
    async fn record_billing_event(&self, event: &BillingEventRecord) -> AppResult<bool> {
        self.0.record_billing_event(event).await
    }
    async fn is_event_processed(&self, event_id: &str) -> AppResult<bool> {
        self.0.is_event_processed(event_id).await
    }
    async fn billing_events(&self, tenant_id: TenantId) -> AppResult<Vec<BillingEventRecord>> {
        self.0.billing_events(tenant_id).await
    }
}

#[async_trait]
impl UsageStore for AlwaysStale {
    async fn try_increment(
        &self,
        key: &CounterKey,
        delta: i64,
        limit: Option<i64>,
        at: DateTime<Utc>,
    ) -> AppResult<CounterUpdate> {
        self.0.try_increment(key, delta, limit, at).await
    }
    async fn decrement(
        &self,
        key: &CounterKey,
        amount: i64,
        at: DateTime<Utc>,
    ) -> AppResult<(i64, i64)> {
        self.0.decrement(key, amount, at).await
    }
    async fn get_count(&self, key: &CounterKey) -> AppResult<i64> {
        self.0.get_count(key).await
    }
    async fn counters_for(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
    ) -> AppResult<Vec<UsageCounter>> {
        self.0.counters_for(tenant_id, resource).await
    }
}

#[async_trait]
impl Store for AlwaysStale {
    async fn ping(&self) -> AppResult<()> {
        self.0.ping().await
    }
    fn backend(&self) -> &'static str {
        "always-stale"
    }
}

#[tokio::test]
async fn contended_event_is_refused_for_redelivery() {
    // onboard through the normal store, then replay against one that never wins
    let h = Harness::new().await;
    let shop = h.onboard("Busy Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;

    let mut config = Config::default();
    config.billing.webhook_secret = WEBHOOK_SECRET.to_string();
    let state = AppState::new(
        config,
        Arc::new(AlwaysStale((*h.store).clone())),
        None,
        Arc::new(h.clock.clone()),
        Arc::new(MemoryAuditSink::new()),
    )
    .unwrap();
    let app = build_router(state);

    let body = payload("evt_busy", "payment.succeeded", tenant, h.now());
    let (status, _) = deliver(&app, signed(body, h.now())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // not recorded, so the redelivery is processed normally
    assert!(!h.store.is_event_processed("evt_busy").await.unwrap());
    assert!(h
        .engine()
        .subscriptions
        .history(tenant)
        .await
        .unwrap()
        .is_empty());

    let body = payload("evt_busy", "payment.succeeded", tenant, h.now());
    let (status, res) = deliver(&h.router(), signed(body, h.now())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(res["outcome"], "applied");
    let sub = h.engine().subscriptions.current(tenant).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
}
