use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::models::{ResourceKind, SubscriptionStatus, TenantId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

/// Everything the engine reports to the observability collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    AccessDecision {
        user_id: Option<UserId>,
        tenant_id: Option<TenantId>,
        action: String,
        decision: Decision,
        reason: Option<String>,
    },
    LimitWarning {
        tenant_id: TenantId,
        resource: ResourceKind,
        threshold_pct: u8,
        current: i64,
        limit: i64,
    },
    LimitExceeded {
        tenant_id: TenantId,
        resource: ResourceKind,
        current: i64,
        limit: i64,
    },
    SubscriptionTransition {
        tenant_id: TenantId,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        trigger: String,
        at: DateTime<Utc>,
    },
    PlanChangeBlocked {
        tenant_id: TenantId,
        event_id: Option<String>,
        resources: Vec<ResourceKind>,
    },
    DuplicateWebhook {
        event_id: String,
        tenant_id: TenantId,
    },
    WebhookRejected {
        reason: String,
    },
}

impl AuditEvent {
    pub fn allowed(
        user_id: UserId,
        tenant_id: TenantId,
        action: impl Into<String>,
    ) -> Self {
        AuditEvent::AccessDecision {
            user_id: Some(user_id),
            tenant_id: Some(tenant_id),
            action: action.into(),
            decision: Decision::Allow,
            reason: None,
        }
    }

    pub fn denied(
        user_id: Option<UserId>,
        tenant_id: Option<TenantId>,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        AuditEvent::AccessDecision {
            user_id,
            tenant_id,
            action: action.into(),
            decision: Decision::Deny,
            reason: Some(reason.into()),
        }
    }

    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            AuditEvent::AccessDecision {
                decision: Decision::Deny,
                ..
            }
        )
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits audit events as structured log lines under the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match &event {
            AuditEvent::AccessDecision {
                decision: Decision::Deny,
                ..
            }
            | AuditEvent::LimitExceeded { .. }
            | AuditEvent::PlanChangeBlocked { .. }
            | AuditEvent::WebhookRejected { .. } => {
                tracing::warn!(target: "audit", event = %payload);
            }
            _ => tracing::info!(target: "audit", event = %payload),
        }
    }
}

/// Keeps every event in memory. Used by tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn denials(&self) -> Vec<AuditEvent> {
        self.events().into_iter().filter(AuditEvent::is_denial).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
