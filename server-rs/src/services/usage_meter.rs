use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::config::UsageConfig;
use crate::error::{AppError, AppResult};
use crate::models::{
    crossed_thresholds, CounterKey, CounterUpdate, LimitWarning, MetricKind, Plan, Reservation,
    ResourceKind, TenantId, UsageCounter, UsageLine,
};
use crate::store::Store;

/// A committed counter change plus any warning thresholds it crossed.
#[derive(Debug, Clone)]
pub struct Metered {
    pub reservation: Reservation,
    pub warnings: Vec<LimitWarning>,
}

#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    thresholds: Vec<u8>,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl UsageMeter {
    pub fn new(
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: &UsageConfig,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            thresholds: config.warning_thresholds.clone(),
            retry_attempts: config.retry_attempts.max(1),
            retry_backoff: config.retry_backoff,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    async fn increment(
        &self,
        key: &CounterKey,
        delta: i64,
        limit: Option<i64>,
    ) -> AppResult<CounterUpdate> {
        let at = self.clock.now();
        let mut attempt = 1;
        loop {
            match self.store.try_increment(key, delta, limit, at).await {
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    tracing::warn!(
                        tenant_id = %key.tenant_id,
                        resource = %key.resource,
                        attempt,
                        "transient counter failure, retrying: {e}"
                    );
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn decrement(&self, key: &CounterKey, amount: i64) -> AppResult<(i64, i64)> {
        let at = self.clock.now();
        let mut attempt = 1;
        loop {
            match self.store.decrement(key, amount, at).await {
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    tracing::warn!(
                        tenant_id = %key.tenant_id,
                        resource = %key.resource,
                        attempt,
                        "transient counter failure, retrying: {e}"
                    );
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Checks `delta` against the plan limit and commits it in one atomic step.
    /// Negative deltas release stock and never fail on limits.
    pub async fn reserve(
        &self,
        tenant_id: TenantId,
        plan: &Plan,
        resource: ResourceKind,
        delta: i64,
    ) -> AppResult<Metered> {
        let key = CounterKey::at(tenant_id, resource, self.clock.now());
        let limit = plan.limits.limit_for(resource);

        if delta < 0 {
            let mut reservation = self.release(tenant_id, resource, -delta).await?;
            reservation.limit = limit;
            return Ok(Metered {
                reservation,
                warnings: Vec::new(),
            });
        }
        if delta == 0 {
            return Err(AppError::BadRequest("usage delta must be non-zero".into()));
        }

        match self.increment(&key, delta, limit).await? {
            CounterUpdate::Applied { previous, current } => {
                let warnings = self.warnings(tenant_id, resource, previous, current, limit);
                Ok(Metered {
                    reservation: Reservation {
                        tenant_id,
                        resource,
                        period: key.period,
                        delta,
                        current,
                        limit,
                    },
                    warnings,
                })
            }
            CounterUpdate::Rejected { current } => {
                // Rejected only happens when a limit exists.
                let limit = limit.unwrap_or(current);
                self.audit.record(AuditEvent::LimitExceeded {
                    tenant_id,
                    resource,
                    current,
                    limit,
                });
                Err(AppError::LimitExceeded {
                    resource,
                    current,
                    limit,
                })
            }
        }
    }

    fn warnings(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
        previous: i64,
        current: i64,
        limit: Option<i64>,
    ) -> Vec<LimitWarning> {
        let Some(limit) = limit else {
            return Vec::new();
        };
        crossed_thresholds(previous, current, limit, &self.thresholds)
            .into_iter()
            .map(|threshold_pct| {
                self.audit.record(AuditEvent::LimitWarning {
                    tenant_id,
                    resource,
                    threshold_pct,
                    current,
                    limit,
                });
                LimitWarning {
                    resource,
                    threshold_pct,
                    current,
                    limit,
                }
            })
            .collect()
    }

    /// Gives stock back on deletion. Flow metrics never decrease. The returned
    /// reservation records what was actually removed, which is less than
    /// `amount` when the counter hits zero.
    pub async fn release(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
        amount: i64,
    ) -> AppResult<Reservation> {
        if resource.metric() == MetricKind::Flow {
            return Err(AppError::BadRequest(format!(
                "{resource} is a flow metric and cannot be released"
            )));
        }
        if amount <= 0 {
            return Err(AppError::BadRequest("release amount must be positive".into()));
        }
        let key = CounterKey::at(tenant_id, resource, self.clock.now());
        let (previous, current) = self.decrement(&key, amount).await?;
        Ok(Reservation {
            tenant_id,
            resource,
            period: key.period,
            delta: current - previous,
            current,
            limit: None,
        })
    }

    /// Reverses a reservation whose operation never ran, in the period it was taken.
    pub async fn cancel_reservation(&self, reservation: &Reservation) -> AppResult<()> {
        let key = CounterKey::new(
            reservation.tenant_id,
            reservation.resource,
            reservation.period.clone(),
        );
        if reservation.delta > 0 {
            self.decrement(&key, reservation.delta).await?;
        } else if reservation.delta < 0 {
            self.increment(&key, -reservation.delta, None).await?;
        }
        tracing::info!(
            tenant_id = %reservation.tenant_id,
            resource = %reservation.resource,
            delta = reservation.delta,
            "usage reservation reversed"
        );
        Ok(())
    }

    pub async fn current(&self, tenant_id: TenantId, resource: ResourceKind) -> AppResult<i64> {
        let key = CounterKey::at(tenant_id, resource, self.clock.now());
        self.store.get_count(&key).await
    }

    /// Current stock counters, as used when validating a plan change.
    pub async fn stock_levels(&self, tenant_id: TenantId) -> AppResult<Vec<(ResourceKind, i64)>> {
        let mut levels = Vec::new();
        for resource in ResourceKind::ALL {
            if resource.metric() == MetricKind::Stock {
                levels.push((resource, self.current(tenant_id, resource).await?));
            }
        }
        Ok(levels)
    }

    /// Usage against the plan for every resource in the current period.
    pub async fn snapshot(&self, tenant_id: TenantId, plan: &Plan) -> AppResult<Vec<UsageLine>> {
        let now = self.clock.now();
        let mut lines = Vec::with_capacity(ResourceKind::ALL.len());
        for resource in ResourceKind::ALL {
            let key = CounterKey::at(tenant_id, resource, now);
            let current = self.store.get_count(&key).await?;
            lines.push(UsageLine::new(
                resource,
                key.period,
                current,
                plan.limits.limit_for(resource),
            ));
        }
        Ok(lines)
    }

    /// Every recorded period of one resource, newest first.
    pub async fn history(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
    ) -> AppResult<Vec<UsageCounter>> {
        self.store.counters_for(tenant_id, resource).await
    }
}
