#![allow(dead_code)]

use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

use tenancy_api::audit::MemoryAuditSink;
use tenancy_api::clock::{Clock, ManualClock};
use tenancy_api::config::Config;
use tenancy_api::middleware::auth::issue_token;
use tenancy_api::models::{
    AddMemberRequest, IdRef, OnboardTenantRequest, Plan, PlanLimits, PlanRevision, Principal,
    Role, TenantContext, UserId,
};
use tenancy_api::services::{Engine, Onboarded};
use tenancy_api::store::InMemoryStore;
use tenancy_api::{build_router, AppState};

pub const WEBHOOK_SECRET: &str = "whsec_test";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub clock: ManualClock,
    pub audit: MemoryAuditSink,
    pub state: AppState,
}

pub struct Shop {
    pub owner: UserId,
    pub ctx: TenantContext,
    pub onboarded: Onboarded,
}

impl Harness {
    pub async fn new() -> Self {
        let mut config = Config::default();
        config.billing.webhook_secret = WEBHOOK_SECRET.to_string();

        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(start_time());
        let audit = MemoryAuditSink::new();
        let state = AppState::new(
            config,
            store.clone(),
            None,
            Arc::new(clock.clone()),
            Arc::new(audit.clone()),
        )
        .unwrap();
        state.engine.plans.seed_builtin().await.unwrap();

        Self {
            store,
            clock,
            audit,
            state,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.state.engine
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Identity tokens are checked against wall-clock time, not the manual clock.
    pub fn token(&self, user: UserId) -> String {
        issue_token(&self.state.config.jwt, user, Utc::now(), 3600).unwrap()
    }

    /// Publishes a new version of `key` with different limits.
    pub async fn publish_limits(&self, key: &str, limits: PlanLimits) -> Plan {
        self.engine()
            .plans
            .publish_revision(
                key,
                PlanRevision {
                    limits: Some(limits),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    pub async fn onboard(&self, name: &str, plan_key: &str) -> Shop {
        let owner = UserId::new();
        let onboarded = self
            .engine()
            .directory
            .onboard(
                Principal { user_id: owner },
                OnboardTenantRequest {
                    name: name.to_string(),
                    slug: None,
                    settings: None,
                    plan_key: Some(plan_key.to_string()),
                },
            )
            .await
            .unwrap();
        let ctx = self.context(owner, &onboarded).await;
        Shop {
            owner,
            ctx,
            onboarded,
        }
    }

    pub async fn context(&self, user: UserId, onboarded: &Onboarded) -> TenantContext {
        self.engine()
            .resolver
            .resolve_for(Principal { user_id: user }, Some(&onboarded.tenant.id.to_string()))
            .await
            .unwrap()
    }

    pub async fn add_member(&self, shop: &Shop, role: Role) -> (UserId, TenantContext) {
        let user = UserId::new();
        self.engine()
            .directory
            .add_member(
                &shop.ctx,
                AddMemberRequest {
                    user: IdRef::Bare(user),
                    role,
                },
            )
            .await
            .unwrap();
        let ctx = self.context(user, &shop.onboarded).await;
        (user, ctx)
    }
}
