use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::lifecycle::{self, Changes};
use super::plan_catalog::PlanCatalog;
use super::usage_meter::UsageMeter;
use crate::audit::{AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{
    AccessClass, BillingCycle, BillingEvent, BillingEventKind, BillingEventRecord,
    EffectiveStatus, EventOutcome, Plan, SaveOutcome, Subscription, SubscriptionStatus, TenantId,
};
use crate::store::Store;

/// Optimistic writes retried this many times before giving up with `Conflict`.
const MAX_ATTEMPTS: usize = 3;

/// A tenant's subscription together with its plan terms and current access level.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub subscription: Subscription,
    pub plan: Plan,
    pub effective: EffectiveStatus,
}

#[derive(Clone)]
pub struct SubscriptionStateMachine {
    store: Arc<dyn Store>,
    plans: PlanCatalog,
    usage: UsageMeter,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl SubscriptionStateMachine {
    pub fn new(
        store: Arc<dyn Store>,
        plans: PlanCatalog,
        usage: UsageMeter,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        grace_period_secs: i64,
    ) -> Self {
        Self {
            store,
            plans,
            usage,
            audit,
            clock,
            grace: Duration::seconds(grace_period_secs),
        }
    }

    async fn load(&self, tenant_id: TenantId) -> AppResult<Subscription> {
        self.store
            .current_subscription(tenant_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("subscription for tenant {tenant_id}")))
    }

    /// Recomputes derived fields, bumps the version and writes `next` over `stored`.
    async fn commit(
        &self,
        stored: &Subscription,
        mut next: Subscription,
        changes: &Changes,
        event: Option<&BillingEventRecord>,
        now: DateTime<Utc>,
    ) -> AppResult<(SaveOutcome, Subscription)> {
        let plan = self.plans.get(next.plan_id).await?;
        next.next_payment_due = lifecycle::next_payment_due(&next, &plan);
        next.version = stored.version + 1;
        next.updated_at = now;

        let outcome = self
            .store
            .save_subscription(&next, stored.version, event)
            .await?;
        if outcome == SaveOutcome::Saved {
            self.report(next.tenant_id, changes, now);
        }
        Ok((outcome, next))
    }

    fn report(&self, tenant_id: TenantId, changes: &Changes, at: DateTime<Utc>) {
        for t in &changes.transitions {
            tracing::info!(
                tenant_id = %tenant_id,
                from = %t.from,
                to = %t.to,
                trigger = t.trigger,
                "subscription transition"
            );
            self.audit.record(AuditEvent::SubscriptionTransition {
                tenant_id,
                from: t.from,
                to: t.to,
                trigger: t.trigger.to_string(),
                at,
            });
        }
    }

    fn contended(tenant_id: TenantId) -> AppError {
        tracing::warn!(tenant_id = %tenant_id, "subscription write lost to concurrent updates");
        AppError::Conflict("subscription was modified concurrently, retry".into())
    }

    /// Contention while applying a processor event. Transient, so the webhook
    /// is refused and redelivered instead of acknowledged.
    fn event_contended(tenant_id: TenantId, event: &BillingEvent) -> AppError {
        tracing::warn!(
            tenant_id = %tenant_id,
            event_id = %event.id,
            "billing event lost to concurrent subscription updates"
        );
        AppError::Unavailable(format!(
            "subscription busy while applying event {}, retry later",
            event.id
        ))
    }

    /// The tenant's subscription with every time-based transition applied.
    pub async fn current(&self, tenant_id: TenantId) -> AppResult<Subscription> {
        for _ in 0..MAX_ATTEMPTS {
            let stored = self.load(tenant_id).await?;
            let now = self.clock.now();
            let mut next = stored.clone();
            let changes = lifecycle::refresh(&mut next, now, self.grace);
            if !changes.changed {
                return Ok(stored);
            }
            match self.commit(&stored, next, &changes, None, now).await? {
                (SaveOutcome::Saved, saved) => return Ok(saved),
                _ => continue,
            }
        }
        Err(Self::contended(tenant_id))
    }

    pub async fn standing(&self, tenant_id: TenantId) -> AppResult<Standing> {
        let subscription = self.current(tenant_id).await?;
        let plan = self.plans.get(subscription.plan_id).await?;
        let effective = lifecycle::effective_status(&subscription, self.clock.now());
        Ok(Standing {
            subscription,
            plan,
            effective,
        })
    }

    /// Fails `SubscriptionInactive` unless the current effective state allows
    /// an operation of `class`.
    pub async fn ensure_permits(
        &self,
        tenant_id: TenantId,
        class: AccessClass,
        increases_usage: bool,
    ) -> AppResult<Standing> {
        let standing = self.standing(tenant_id).await?;
        let state = standing.effective.state;
        if !state.permits(class, increases_usage) {
            let detail = if increases_usage {
                format!("subscription is {state}; operations that add usage are blocked")
            } else {
                format!("subscription is {state}")
            };
            return Err(AppError::SubscriptionInactive(detail));
        }
        Ok(standing)
    }

    async fn validate_limits(&self, tenant_id: TenantId, plan: &Plan) -> AppResult<()> {
        let usage = self.usage.stock_levels(tenant_id).await?;
        let violations = plan.stock_violations(&usage);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(AppError::PlanDowngradeBlocked(violations))
        }
    }

    async fn offered_plan(&self, plan_id: Uuid) -> AppResult<Plan> {
        let plan = self.plans.get(plan_id).await?;
        if !plan.is_active {
            return Err(AppError::BadRequest(format!(
                "plan {} v{} is no longer offered",
                plan.key, plan.version
            )));
        }
        Ok(plan)
    }

    /// Moves an active subscription to another plan. Rejected while a
    /// cancellation is pending and whenever current stock exceeds the new limits.
    pub async fn change_plan(
        &self,
        tenant_id: TenantId,
        plan_id: Uuid,
        cycle: Option<BillingCycle>,
    ) -> AppResult<Standing> {
        let plan = self.offered_plan(plan_id).await?;
        for _ in 0..MAX_ATTEMPTS {
            let stored = self.current(tenant_id).await?;
            if stored.status != SubscriptionStatus::Active {
                return Err(AppError::Conflict(format!(
                    "plan changes need an active subscription, current status is {}",
                    stored.status
                )));
            }
            self.validate_limits(tenant_id, &plan).await?;

            let now = self.clock.now();
            let mut next = stored.clone();
            next.plan_id = plan.id;
            if let Some(cycle) = cycle {
                next.billing_cycle = cycle;
            }
            let changes = Changes {
                changed: true,
                transitions: vec![lifecycle::Transition {
                    from: SubscriptionStatus::Active,
                    to: SubscriptionStatus::Active,
                    trigger: "plan_changed",
                }],
            };
            if let (SaveOutcome::Saved, _) = self.commit(&stored, next, &changes, None, now).await? {
                tracing::info!(tenant_id = %tenant_id, plan = %plan.key, version = plan.version, "plan changed");
                return self.standing(tenant_id).await;
            }
        }
        Err(Self::contended(tenant_id))
    }

    pub async fn cancel(&self, tenant_id: TenantId) -> AppResult<Standing> {
        for _ in 0..MAX_ATTEMPTS {
            let stored = self.current(tenant_id).await?;
            let now = self.clock.now();
            let mut next = stored.clone();
            let changes = lifecycle::cancel(&mut next, now)?;
            if let (SaveOutcome::Saved, _) = self.commit(&stored, next, &changes, None, now).await? {
                return self.standing(tenant_id).await;
            }
        }
        Err(Self::contended(tenant_id))
    }

    /// Starts a new active subscription for a cancelled tenant. Defaults to the
    /// newest version of the previous plan.
    pub async fn reactivate(
        &self,
        tenant_id: TenantId,
        plan_id: Option<Uuid>,
        cycle: Option<BillingCycle>,
    ) -> AppResult<Standing> {
        for _ in 0..MAX_ATTEMPTS {
            let stored = self.current(tenant_id).await?;
            if stored.status != SubscriptionStatus::Cancelled {
                return Err(AppError::Conflict(format!(
                    "only cancelled subscriptions can be reactivated, current status is {}",
                    stored.status
                )));
            }
            let plan = match plan_id {
                Some(id) => self.offered_plan(id).await?,
                None => {
                    let previous = self.plans.get(stored.plan_id).await?;
                    let latest = self.plans.latest(&previous.key).await?;
                    self.offered_plan(latest.id).await?
                }
            };
            self.validate_limits(tenant_id, &plan).await?;

            let now = self.clock.now();
            let next = lifecycle::reactivated(
                &stored,
                &plan,
                cycle.unwrap_or(stored.billing_cycle),
                now,
            );
            let outcome = self
                .store
                .replace_subscription(stored.id, stored.version, &next)
                .await?;
            if outcome == SaveOutcome::Saved {
                let changes = Changes {
                    changed: true,
                    transitions: vec![lifecycle::Transition {
                        from: SubscriptionStatus::Cancelled,
                        to: SubscriptionStatus::Active,
                        trigger: "reactivated",
                    }],
                };
                self.report(tenant_id, &changes, now);
                return self.standing(tenant_id).await;
            }
        }
        Err(Self::contended(tenant_id))
    }

    fn event_record(
        &self,
        event: &BillingEvent,
        subscription_id: Option<Uuid>,
        outcome: EventOutcome,
    ) -> BillingEventRecord {
        BillingEventRecord {
            event_id: event.id.clone(),
            tenant_id: event.data.tenant_id,
            subscription_id,
            event_type: event.kind.as_str().to_string(),
            outcome,
            amount_cents: event.data.amount_cents,
            currency: event.data.currency.clone(),
            occurred_at: event.created,
            processed_at: self.clock.now(),
        }
    }

    fn duplicate(&self, event: &BillingEvent) -> AppError {
        tracing::info!(event_id = %event.id, "duplicate billing event absorbed");
        self.audit.record(AuditEvent::DuplicateWebhook {
            event_id: event.id.clone(),
            tenant_id: event.data.tenant_id,
        });
        AppError::DuplicateWebhookEvent(event.id.clone())
    }

    async fn ignore(
        &self,
        event: &BillingEvent,
        subscription_id: Option<Uuid>,
        reason: &str,
    ) -> AppResult<EventOutcome> {
        let record = self.event_record(event, subscription_id, EventOutcome::Ignored);
        if !self.store.record_billing_event(&record).await? {
            return Err(self.duplicate(event));
        }
        tracing::info!(event_id = %event.id, event_type = event.kind.as_str(), reason, "billing event ignored");
        Ok(EventOutcome::Ignored)
    }

    /// Validates a plan change pushed by the processor. `None` means it is held
    /// back; the rest of the event still applies.
    async fn provider_plan_allowed(
        &self,
        stored: &Subscription,
        plan_id: Uuid,
        event: &BillingEvent,
    ) -> AppResult<Option<Plan>> {
        let blocked = |resources| {
            self.audit.record(AuditEvent::PlanChangeBlocked {
                tenant_id: stored.tenant_id,
                event_id: Some(event.id.clone()),
                resources,
            });
        };
        if stored.status != SubscriptionStatus::Active {
            blocked(Vec::new());
            return Ok(None);
        }
        let plan = match self.plans.get(plan_id).await {
            Ok(plan) => plan,
            Err(AppError::NotFound(_)) => {
                blocked(Vec::new());
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match self.validate_limits(stored.tenant_id, &plan).await {
            Ok(()) => Ok(Some(plan)),
            Err(AppError::PlanDowngradeBlocked(violations)) => {
                blocked(violations.iter().map(|v| v.resource).collect());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Applies one processor event exactly once. A repeated event id yields
    /// `DuplicateWebhookEvent` and changes nothing.
    pub async fn handle_event(&self, event: &BillingEvent) -> AppResult<EventOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            return Err(self.duplicate(event));
        }
        if event.kind == BillingEventKind::Unsupported {
            return self.ignore(event, None, "unsupported event type").await;
        }
        let tenant_id = event.data.tenant_id;
        if self.store.get_tenant(tenant_id).await?.is_none() {
            return self.ignore(event, None, "unknown tenant").await;
        }

        for _ in 0..MAX_ATTEMPTS {
            let Some(stored) = self.store.current_subscription(tenant_id).await? else {
                return self.ignore(event, None, "tenant has no subscription").await;
            };
            if event.data.subscription_id.is_some_and(|id| id != stored.id) {
                return self
                    .ignore(event, event.data.subscription_id, "superseded subscription")
                    .await;
            }

            let now = self.clock.now();
            let mut next = stored.clone();
            let mut changes = lifecycle::refresh(&mut next, now, self.grace);
            let before_event = next.clone();
            let (mut outcome, applied) = lifecycle::apply_event(&mut next, event);
            changes.merge(applied);

            if outcome == EventOutcome::Applied && event.kind == BillingEventKind::SubscriptionUpdated {
                if let Some(plan_id) = event.data.plan_id.filter(|id| *id != next.plan_id) {
                    match self.provider_plan_allowed(&before_event, plan_id, event).await? {
                        Some(plan) => {
                            next.plan_id = plan.id;
                            changes.changed = true;
                        }
                        None => outcome = EventOutcome::Blocked,
                    }
                }
            }

            if !changes.changed {
                let record = self.event_record(event, Some(stored.id), outcome);
                if !self.store.record_billing_event(&record).await? {
                    return Err(self.duplicate(event));
                }
                return Ok(outcome);
            }

            let record = self.event_record(event, Some(stored.id), outcome);
            match self.commit(&stored, next, &changes, Some(&record), now).await? {
                (SaveOutcome::Saved, _) => {
                    tracing::info!(
                        event_id = %event.id,
                        event_type = event.kind.as_str(),
                        outcome = outcome.as_str(),
                        "billing event processed"
                    );
                    return Ok(outcome);
                }
                (SaveOutcome::DuplicateEvent, _) => return Err(self.duplicate(event)),
                (SaveOutcome::Stale, _) => continue,
            }
        }
        Err(Self::event_contended(tenant_id, event))
    }

    /// Processed billing events, newest first. Readable in every state.
    pub async fn history(&self, tenant_id: TenantId) -> AppResult<Vec<BillingEventRecord>> {
        self.store.billing_events(tenant_id).await
    }
}
