use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::plan::BillingCycle;
use super::tenant::TenantId;

/// Lifecycle state as persisted. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SubscriptionStatus::Cancelled
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(format!("unknown subscription status '{other}'")),
        }
    }
}

/// Class of access an operation needs from the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessClass {
    Read,
    Write,
    Export,
    Billing,
}

/// Access level actually granted right now, after lazy expiry and pending
/// cancellation have been taken into account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveState {
    Trialing,
    Active,
    PastDue,
    Cancelled,
}

impl EffectiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectiveState::Trialing => "trialing",
            EffectiveState::Active => "active",
            EffectiveState::PastDue => "past_due",
            EffectiveState::Cancelled => "cancelled",
        }
    }

    pub fn permits(self, class: AccessClass, increases_usage: bool) -> bool {
        match self {
            EffectiveState::Trialing | EffectiveState::Active => true,
            EffectiveState::PastDue => !(class == AccessClass::Write && increases_usage),
            EffectiveState::Cancelled => {
                matches!(class, AccessClass::Export | AccessClass::Billing)
            }
        }
    }
}

impl From<SubscriptionStatus> for EffectiveState {
    fn from(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::Trialing => EffectiveState::Trialing,
            SubscriptionStatus::Active => EffectiveState::Active,
            SubscriptionStatus::PastDue => EffectiveState::PastDue,
            SubscriptionStatus::Cancelled => EffectiveState::Cancelled,
        }
    }
}

impl fmt::Display for EffectiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveStatus {
    pub state: EffectiveState,
    pub cancel_pending: bool,
    pub access_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub event_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub succeeded: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDue {
    pub amount_cents: i64,
    pub currency: String,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub plan_id: Uuid,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Lifecycle state at the moment cancellation was requested; governs
    /// access until the period ends.
    pub status_before_cancel: Option<SubscriptionStatus>,
    pub past_due_since: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_payment: Option<PaymentRecord>,
    pub next_payment_due: Option<PaymentDue>,
    /// Optimistic concurrency token, bumped on every committed transition.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn has_successful_payment(&self) -> bool {
        self.last_payment.as_ref().is_some_and(|p| p.succeeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventKind {
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "subscription.updated")]
    SubscriptionUpdated,
    #[serde(other)]
    Unsupported,
}

impl BillingEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingEventKind::PaymentSucceeded => "payment.succeeded",
            BillingEventKind::PaymentFailed => "payment.failed",
            BillingEventKind::SubscriptionUpdated => "subscription.updated",
            BillingEventKind::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEventData {
    pub tenant_id: TenantId,
    pub subscription_id: Option<Uuid>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub period_end: Option<DateTime<Utc>>,
    pub plan_id: Option<Uuid>,
    pub cancel_at_period_end: Option<bool>,
}

/// Payment-processor webhook event. `id` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BillingEventKind,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    pub data: BillingEventData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    Applied,
    Ignored,
    Blocked,
}

impl EventOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Ignored => "ignored",
            EventOutcome::Blocked => "blocked",
        }
    }
}

impl FromStr for EventOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(EventOutcome::Applied),
            "ignored" => Ok(EventOutcome::Ignored),
            "blocked" => Ok(EventOutcome::Blocked),
            other => Err(format!("unknown event outcome '{other}'")),
        }
    }
}

/// Processed billing event, kept for idempotency and billing history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEventRecord {
    pub event_id: String,
    pub tenant_id: TenantId,
    pub subscription_id: Option<Uuid>,
    pub event_type: String,
    pub outcome: EventOutcome,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The stored version moved on since the subscription was read.
    Stale,
    /// The event id was already recorded; nothing was written.
    DuplicateEvent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanRequest {
    pub plan_id: Uuid,
    pub billing_cycle: Option<BillingCycle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactivateRequest {
    pub plan_id: Option<Uuid>,
    pub billing_cycle: Option<BillingCycle>,
}
