//! Pure subscription lifecycle rules. Nothing here touches storage; callers
//! apply these to a copy of the stored record and commit the result.

use chrono::{DateTime, Duration, Months, Utc};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    BillingCycle, BillingEvent, BillingEventKind, EffectiveState, EffectiveStatus, EventOutcome,
    PaymentDue, PaymentRecord, Plan, Subscription, SubscriptionStatus, TenantId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
    pub trigger: &'static str,
}

/// What a lifecycle step did to the record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Changes {
    /// True when any persisted field moved, even without a status change.
    pub changed: bool,
    pub transitions: Vec<Transition>,
}

impl Changes {
    fn transition(&mut self, sub: &mut Subscription, to: SubscriptionStatus, trigger: &'static str) {
        self.changed = true;
        self.transitions.push(Transition {
            from: sub.status,
            to,
            trigger,
        });
        sub.status = to;
    }

    pub fn merge(&mut self, other: Changes) {
        self.changed |= other.changed;
        self.transitions.extend(other.transitions);
    }
}

/// End of a billing period that starts at `start`.
pub fn period_end(start: DateTime<Utc>, cycle: BillingCycle) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(cycle.months()))
        .unwrap_or_else(|| start + Duration::days(30 * i64::from(cycle.months())))
}

/// First subscription of a freshly onboarded tenant. A non-positive trial
/// length starts the tenant directly on a paid period.
pub fn start_subscription(
    tenant_id: TenantId,
    plan: &Plan,
    cycle: BillingCycle,
    now: DateTime<Utc>,
    trial_days: i64,
) -> Subscription {
    let (status, end, trial_end) = if trial_days > 0 {
        let end = now + Duration::days(trial_days);
        (SubscriptionStatus::Trialing, end, Some(end))
    } else {
        (SubscriptionStatus::Active, period_end(now, cycle), None)
    };
    let mut sub = Subscription {
        id: Uuid::new_v4(),
        tenant_id,
        plan_id: plan.id,
        billing_cycle: cycle,
        status,
        current_period_start: now,
        current_period_end: end,
        trial_end,
        cancel_at_period_end: false,
        canceled_at: None,
        status_before_cancel: None,
        past_due_since: None,
        ended_at: None,
        last_payment: None,
        next_payment_due: None,
        version: 1,
        created_at: now,
        updated_at: now,
    };
    sub.next_payment_due = next_payment_due(&sub, plan);
    sub
}

/// Fresh `active` record replacing a cancelled one.
pub fn reactivated(
    previous: &Subscription,
    plan: &Plan,
    cycle: BillingCycle,
    now: DateTime<Utc>,
) -> Subscription {
    let mut sub = Subscription {
        id: Uuid::new_v4(),
        tenant_id: previous.tenant_id,
        plan_id: plan.id,
        billing_cycle: cycle,
        status: SubscriptionStatus::Active,
        current_period_start: now,
        current_period_end: period_end(now, cycle),
        trial_end: None,
        cancel_at_period_end: false,
        canceled_at: None,
        status_before_cancel: None,
        past_due_since: None,
        ended_at: None,
        last_payment: None,
        next_payment_due: None,
        version: 1,
        created_at: now,
        updated_at: now,
    };
    sub.next_payment_due = next_payment_due(&sub, plan);
    sub
}

/// Moment a cancelled subscription stops granting access.
fn access_end(sub: &Subscription, grace: Duration) -> DateTime<Utc> {
    match (sub.status_before_cancel, sub.past_due_since) {
        (Some(SubscriptionStatus::PastDue), Some(since)) => {
            sub.current_period_end.min(since + grace)
        }
        _ => sub.current_period_end,
    }
}

/// Applies every time-based transition that is due at `now`: trial expiry,
/// past-due grace expiry and the end of a pending cancellation.
pub fn refresh(sub: &mut Subscription, now: DateTime<Utc>, grace: Duration) -> Changes {
    let mut changes = Changes::default();

    if sub.status == SubscriptionStatus::Trialing && !sub.has_successful_payment() {
        if let Some(trial_end) = sub.trial_end.filter(|end| now > *end) {
            sub.past_due_since = Some(trial_end);
            changes.transition(sub, SubscriptionStatus::PastDue, "trial_expired");
        }
    }

    if sub.status == SubscriptionStatus::PastDue {
        let since = sub.past_due_since.unwrap_or(sub.current_period_end);
        let deadline = since + grace;
        if now > deadline {
            sub.status_before_cancel = Some(SubscriptionStatus::PastDue);
            sub.canceled_at = Some(deadline);
            sub.ended_at = Some(deadline);
            sub.cancel_at_period_end = false;
            changes.transition(sub, SubscriptionStatus::Cancelled, "grace_period_elapsed");
        }
    }

    if sub.status == SubscriptionStatus::Cancelled
        && sub.cancel_at_period_end
        && sub.ended_at.is_none()
    {
        let end = access_end(sub, grace);
        if now >= end {
            sub.ended_at = Some(end);
            changes.changed = true;
        }
    }

    changes
}

/// Access level granted at `now`. A pending cancellation keeps the level the
/// subscription had when it was requested until the period ends.
pub fn effective_status(sub: &Subscription, now: DateTime<Utc>) -> EffectiveStatus {
    match sub.status {
        SubscriptionStatus::Cancelled
            if sub.cancel_at_period_end
                && sub.ended_at.is_none()
                && now < sub.current_period_end =>
        {
            let state = sub
                .status_before_cancel
                .map(EffectiveState::from)
                .unwrap_or(EffectiveState::Active);
            EffectiveStatus {
                state,
                cancel_pending: true,
                access_until: Some(sub.current_period_end),
            }
        }
        SubscriptionStatus::Trialing => EffectiveStatus {
            state: EffectiveState::Trialing,
            cancel_pending: false,
            access_until: sub.trial_end,
        },
        status => EffectiveStatus {
            state: status.into(),
            cancel_pending: false,
            access_until: None,
        },
    }
}

/// Requests cancellation. Access continues until the current period ends; a
/// period that already ended cancels immediately.
pub fn cancel(sub: &mut Subscription, now: DateTime<Utc>) -> AppResult<Changes> {
    if sub.status.is_terminal() {
        return Err(AppError::Conflict("subscription is already cancelled".into()));
    }
    let mut changes = Changes::default();
    sub.status_before_cancel = Some(sub.status);
    sub.canceled_at = Some(now);
    if now < sub.current_period_end {
        sub.cancel_at_period_end = true;
    } else {
        sub.cancel_at_period_end = false;
        sub.ended_at = Some(now);
    }
    changes.transition(sub, SubscriptionStatus::Cancelled, "cancellation_requested");
    Ok(changes)
}

/// Next amount the processor is expected to collect, if any.
pub fn next_payment_due(sub: &Subscription, plan: &Plan) -> Option<PaymentDue> {
    let amount_cents = plan.price_for(sub.billing_cycle);
    if amount_cents == 0 {
        return None;
    }
    let due_at = match sub.status {
        SubscriptionStatus::Cancelled => return None,
        SubscriptionStatus::PastDue => sub.past_due_since.unwrap_or(sub.current_period_end),
        SubscriptionStatus::Trialing => sub.trial_end.unwrap_or(sub.current_period_end),
        SubscriptionStatus::Active => sub.current_period_end,
    };
    Some(PaymentDue {
        amount_cents,
        currency: plan.currency.clone(),
        due_at,
    })
}

fn payment(event: &BillingEvent, succeeded: bool) -> PaymentRecord {
    PaymentRecord {
        event_id: event.id.clone(),
        amount_cents: event.data.amount_cents.unwrap_or(0),
        currency: event.data.currency.clone().unwrap_or_default(),
        succeeded,
        occurred_at: event.created,
    }
}

/// Applies a processor event to the record. Plan changes carried by
/// `subscription.updated` are left to the caller, which has to validate them
/// against usage first.
pub fn apply_event(sub: &mut Subscription, event: &BillingEvent) -> (EventOutcome, Changes) {
    let mut changes = Changes::default();
    if sub.status.is_terminal() || event.kind == BillingEventKind::Unsupported {
        return (EventOutcome::Ignored, changes);
    }

    match event.kind {
        BillingEventKind::PaymentSucceeded => {
            let start = event.data.period_start.unwrap_or(match sub.status {
                SubscriptionStatus::Active => sub.current_period_end,
                _ => event.created,
            });
            sub.current_period_start = start;
            sub.current_period_end = event
                .data
                .period_end
                .unwrap_or_else(|| period_end(start, sub.billing_cycle));
            sub.past_due_since = None;
            sub.last_payment = Some(payment(event, true));
            changes.changed = true;
            if sub.status != SubscriptionStatus::Active {
                changes.transition(sub, SubscriptionStatus::Active, "payment_succeeded");
            }
        }
        BillingEventKind::PaymentFailed => {
            sub.last_payment = Some(payment(event, false));
            changes.changed = true;
            if sub.status == SubscriptionStatus::Active {
                sub.past_due_since = Some(event.created);
                changes.transition(sub, SubscriptionStatus::PastDue, "payment_failed");
            }
        }
        BillingEventKind::SubscriptionUpdated => {
            if let Some(start) = event.data.period_start {
                sub.current_period_start = start;
                changes.changed = true;
            }
            if let Some(end) = event.data.period_end {
                sub.current_period_end = end;
                changes.changed = true;
            }
            if event.data.cancel_at_period_end == Some(true) {
                if let Ok(cancelled) = cancel(sub, event.created) {
                    changes.merge(cancelled);
                }
            }
        }
        BillingEventKind::Unsupported => {}
    }

    (EventOutcome::Applied, changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{builtin_plans, BillingEventData};
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, 12, 0, 0).unwrap()
    }

    fn starter() -> Plan {
        builtin_plans(at(1))
            .into_iter()
            .find(|p| p.key == "starter")
            .unwrap()
    }

    fn event(kind: BillingEventKind, created: DateTime<Utc>, tenant: TenantId) -> BillingEvent {
        BillingEvent {
            id: format!("evt_{}", Uuid::new_v4()),
            kind,
            created,
            data: BillingEventData {
                tenant_id: tenant,
                subscription_id: None,
                amount_cents: Some(2_900),
                currency: Some("usd".into()),
                period_start: None,
                period_end: None,
                plan_id: None,
                cancel_at_period_end: None,
            },
        }
    }

    #[test]
    fn trial_expiry_then_grace_cancels() {
        let mut sub = start_subscription(TenantId::new(), &starter(), BillingCycle::Monthly, at(1), 14);
        let grace = Duration::days(7);

        assert!(!refresh(&mut sub, at(15), grace).changed);
        assert_eq!(sub.status, SubscriptionStatus::Trialing);

        let changes = refresh(&mut sub, at(16), grace);
        assert_eq!(changes.transitions[0].trigger, "trial_expired");
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.past_due_since, Some(at(15)));

        assert!(!refresh(&mut sub, at(22), grace).changed);
        refresh(&mut sub, at(23), grace);
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert_eq!(sub.ended_at, Some(at(22)));
        assert_eq!(effective_status(&sub, at(23)).state, EffectiveState::Cancelled);
    }

    #[test]
    fn pending_cancellation_keeps_access_until_period_end() {
        let mut sub = start_subscription(TenantId::new(), &starter(), BillingCycle::Monthly, at(1), 0);
        sub.current_period_end = at(20);
        cancel(&mut sub, at(17)).unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        let status = effective_status(&sub, at(19));
        assert_eq!(status.state, EffectiveState::Active);
        assert!(status.cancel_pending);
        assert_eq!(status.access_until, Some(at(20)));

        assert!(refresh(&mut sub, at(21), Duration::days(7)).changed);
        assert_eq!(sub.ended_at, Some(at(20)));
        assert_eq!(effective_status(&sub, at(21)).state, EffectiveState::Cancelled);
        assert!(cancel(&mut sub, at(21)).is_err());
    }

    #[test]
    fn payments_recover_and_fail() {
        let tenant = TenantId::new();
        let mut sub = start_subscription(tenant, &starter(), BillingCycle::Monthly, at(1), 14);

        let (outcome, changes) = apply_event(&mut sub, &event(BillingEventKind::PaymentSucceeded, at(10), tenant));
        assert_eq!(outcome, EventOutcome::Applied);
        assert_eq!(changes.transitions[0].to, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_start, at(10));
        assert_eq!(sub.current_period_end, Utc.with_ymd_and_hms(2026, 11, 10, 12, 0, 0).unwrap());

        apply_event(&mut sub, &event(BillingEventKind::PaymentFailed, at(11), tenant));
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.past_due_since, Some(at(11)));

        apply_event(&mut sub, &event(BillingEventKind::PaymentSucceeded, at(12), tenant));
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.past_due_since.is_none());
    }

    #[test]
    fn cancelled_subscriptions_ignore_events() {
        let tenant = TenantId::new();
        let mut sub = start_subscription(tenant, &starter(), BillingCycle::Monthly, at(1), 14);
        cancel(&mut sub, at(2)).unwrap();
        let (outcome, changes) =
            apply_event(&mut sub, &event(BillingEventKind::PaymentSucceeded, at(3), tenant));
        assert_eq!(outcome, EventOutcome::Ignored);
        assert!(!changes.changed);
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
    }

    #[test]
    fn cancelled_past_due_stays_write_blocked() {
        let tenant = TenantId::new();
        let mut sub = start_subscription(tenant, &starter(), BillingCycle::Monthly, at(1), 0);
        apply_event(&mut sub, &event(BillingEventKind::PaymentFailed, at(2), tenant));
        cancel(&mut sub, at(3)).unwrap();
        let status = effective_status(&sub, at(4));
        assert_eq!(status.state, EffectiveState::PastDue);
        assert!(status.cancel_pending);

        // grace ends before the period does
        refresh(&mut sub, at(10), Duration::days(7));
        assert_eq!(sub.ended_at, Some(at(9)));
    }

    #[test]
    fn payment_due_follows_status() {
        let plan = starter();
        let mut sub = start_subscription(TenantId::new(), &plan, BillingCycle::Yearly, at(1), 14);
        let due = sub.next_payment_due.clone().unwrap();
        assert_eq!(due.amount_cents, plan.yearly_price_cents);
        assert_eq!(due.due_at, at(15));

        cancel(&mut sub, at(2)).unwrap();
        assert!(next_payment_due(&sub, &plan).is_none());
    }
}
