use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Users,
    Products,
    Transactions,
    Storage,
}

/// Stock metrics track a current count; flow metrics track activity within a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Stock,
    Flow,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Users,
        ResourceKind::Products,
        ResourceKind::Transactions,
        ResourceKind::Storage,
    ];

    pub fn metric(self) -> MetricKind {
        match self {
            ResourceKind::Transactions => MetricKind::Flow,
            _ => MetricKind::Stock,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Users => "users",
            ResourceKind::Products => "products",
            ResourceKind::Transactions => "transactions",
            ResourceKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(ResourceKind::Users),
            "products" => Ok(ResourceKind::Products),
            "transactions" => Ok(ResourceKind::Transactions),
            "storage" => Ok(ResourceKind::Storage),
            other => Err(format!("unknown resource '{other}'")),
        }
    }
}

pub const STOCK_PERIOD: &str = "current";

/// Accounting period key: `current` for stock metrics, `YYYY-MM` for flow metrics.
pub fn period_key(resource: ResourceKind, at: DateTime<Utc>) -> String {
    match resource.metric() {
        MetricKind::Stock => STOCK_PERIOD.to_string(),
        MetricKind::Flow => format!("{:04}-{:02}", at.year(), at.month()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub tenant_id: TenantId,
    pub resource: ResourceKind,
    pub period: String,
}

impl CounterKey {
    pub fn new(tenant_id: TenantId, resource: ResourceKind, period: impl Into<String>) -> Self {
        Self {
            tenant_id,
            resource,
            period: period.into(),
        }
    }

    pub fn at(tenant_id: TenantId, resource: ResourceKind, at: DateTime<Utc>) -> Self {
        Self::new(tenant_id, resource, period_key(resource, at))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounter {
    pub tenant_id: TenantId,
    pub resource: ResourceKind,
    pub period: String,
    pub count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Result of an atomic conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    Applied { previous: i64, current: i64 },
    Rejected { current: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitWarning {
    pub resource: ResourceKind,
    pub threshold_pct: u8,
    pub current: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitViolation {
    pub resource: ResourceKind,
    pub current: i64,
    pub limit: i64,
}

/// A committed usage change, returned to the caller so it can be reversed if
/// the business operation it was taken for never executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub tenant_id: TenantId,
    pub resource: ResourceKind,
    pub period: String,
    pub delta: i64,
    pub current: i64,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLine {
    pub resource: ResourceKind,
    pub metric: MetricKind,
    pub period: String,
    pub current: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub usage_pct: Option<f64>,
}

impl UsageLine {
    pub fn new(resource: ResourceKind, period: String, current: i64, limit: Option<i64>) -> Self {
        let remaining = limit.map(|l| (l - current).max(0));
        let usage_pct = limit.map(|l| {
            if l > 0 {
                current as f64 / l as f64 * 100.0
            } else {
                100.0
            }
        });
        Self {
            resource,
            metric: resource.metric(),
            period,
            current,
            limit,
            remaining,
            usage_pct,
        }
    }
}

/// Thresholds (in percent of `limit`) crossed when a counter moved from
/// `previous` to `current`. Each threshold is reported once, on the crossing.
pub fn crossed_thresholds(previous: i64, current: i64, limit: i64, thresholds: &[u8]) -> Vec<u8> {
    if limit <= 0 || current <= previous {
        return Vec::new();
    }
    thresholds
        .iter()
        .copied()
        .filter(|&t| {
            let mark = i128::from(limit) * i128::from(t);
            i128::from(previous) * 100 < mark && i128::from(current) * 100 >= mark
        })
        .collect()
}
