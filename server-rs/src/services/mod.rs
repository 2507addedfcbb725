pub mod access_guard;
pub mod context_resolver;
pub mod enforcement;
pub mod lifecycle;
pub mod plan_catalog;
pub mod subscription_machine;
pub mod tenant_directory;
pub mod usage_meter;
pub mod webhook_signature;

use std::sync::Arc;

use crate::audit::AuditSink;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::config::Config;
use crate::store::Store;

pub use access_guard::{AccessGuard, MembershipChange};
pub use context_resolver::{CredentialVerifier, RequestCredentials, TenantContextResolver};
pub use enforcement::{EnforcementFacade, Grant};
pub use plan_catalog::PlanCatalog;
pub use subscription_machine::{Standing, SubscriptionStateMachine};
pub use tenant_directory::{MemberOf, Onboarded, TenantDirectory};
pub use usage_meter::{Metered, UsageMeter};
pub use webhook_signature::WebhookVerifier;

/// Every engine component, wired to one store, clock and audit sink.
#[derive(Clone)]
pub struct Engine {
    pub plans: PlanCatalog,
    pub resolver: TenantContextResolver,
    pub guard: AccessGuard,
    pub subscriptions: SubscriptionStateMachine,
    pub usage: UsageMeter,
    pub enforcement: EnforcementFacade,
    pub directory: TenantDirectory,
}

impl Engine {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        cache: Option<Cache>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let plans = PlanCatalog::new(
            store.clone(),
            cache,
            config.redis.plan_cache_secs,
            clock.clone(),
        );
        let resolver = TenantContextResolver::new(store.clone(), verifier, audit.clone());
        let guard = AccessGuard::new(audit.clone());
        let usage = UsageMeter::new(store.clone(), audit.clone(), clock.clone(), &config.usage);
        let subscriptions = SubscriptionStateMachine::new(
            store.clone(),
            plans.clone(),
            usage.clone(),
            audit.clone(),
            clock.clone(),
            config.billing.grace_period_secs,
        );
        let enforcement = EnforcementFacade::new(
            resolver.clone(),
            guard.clone(),
            subscriptions.clone(),
            usage.clone(),
            audit,
        );
        let directory = TenantDirectory::new(
            store,
            plans.clone(),
            guard.clone(),
            enforcement.clone(),
            clock,
            config.billing.trial_days,
            config.billing.default_plan.clone(),
        );

        Self {
            plans,
            resolver,
            guard,
            subscriptions,
            usage,
            enforcement,
            directory,
        }
    }
}
