use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::usage::{LimitViolation, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn months(self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }
}

impl FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(format!("unknown billing cycle '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    Loyalty,
    MultiLocation,
    AdvancedAnalytics,
    CustomBranding,
    ApiAccess,
    DataExport,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Loyalty,
        Feature::MultiLocation,
        Feature::AdvancedAnalytics,
        Feature::CustomBranding,
        Feature::ApiAccess,
        Feature::DataExport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Loyalty => "loyalty",
            Feature::MultiLocation => "multiLocation",
            Feature::AdvancedAnalytics => "advancedAnalytics",
            Feature::CustomBranding => "customBranding",
            Feature::ApiAccess => "apiAccess",
            Feature::DataExport => "dataExport",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan ceilings. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub max_users: Option<i64>,
    pub max_products: Option<i64>,
    pub max_transactions_per_month: Option<i64>,
    pub max_storage_bytes: Option<i64>,
}

impl PlanLimits {
    pub fn unlimited() -> Self {
        Self {
            max_users: None,
            max_products: None,
            max_transactions_per_month: None,
            max_storage_bytes: None,
        }
    }

    pub fn limit_for(&self, resource: ResourceKind) -> Option<i64> {
        match resource {
            ResourceKind::Users => self.max_users,
            ResourceKind::Products => self.max_products,
            ResourceKind::Transactions => self.max_transactions_per_month,
            ResourceKind::Storage => self.max_storage_bytes,
        }
    }
}

/// Immutable plan version. Revising a plan produces a new record with a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: Uuid,
    pub key: String,
    pub version: i32,
    pub name: String,
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    pub currency: String,
    pub limits: PlanLimits,
    pub features: Vec<Feature>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn price_for(&self, cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => self.monthly_price_cents,
            BillingCycle::Yearly => self.yearly_price_cents,
        }
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Stock counters that already exceed this plan's limits. Flow metrics are
    /// not considered: they restart each period.
    pub fn stock_violations(&self, usage: &[(ResourceKind, i64)]) -> Vec<LimitViolation> {
        usage
            .iter()
            .filter(|(resource, _)| resource.metric() == super::usage::MetricKind::Stock)
            .filter_map(|&(resource, current)| {
                let limit = self.limits.limit_for(resource)?;
                (current > limit).then_some(LimitViolation {
                    resource,
                    current,
                    limit,
                })
            })
            .collect()
    }
}

/// Changes applied on top of the latest version when publishing a revision.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRevision {
    pub name: Option<String>,
    pub monthly_price_cents: Option<i64>,
    pub yearly_price_cents: Option<i64>,
    pub limits: Option<PlanLimits>,
    pub features: Option<Vec<Feature>>,
    pub is_active: Option<bool>,
}

impl PlanRevision {
    pub fn apply(self, base: &Plan, at: DateTime<Utc>) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            key: base.key.clone(),
            version: base.version + 1,
            name: self.name.unwrap_or_else(|| base.name.clone()),
            monthly_price_cents: self.monthly_price_cents.unwrap_or(base.monthly_price_cents),
            yearly_price_cents: self.yearly_price_cents.unwrap_or(base.yearly_price_cents),
            currency: base.currency.clone(),
            limits: self.limits.unwrap_or(base.limits),
            features: self.features.unwrap_or_else(|| base.features.clone()),
            is_active: self.is_active.unwrap_or(base.is_active),
            created_at: at,
        }
    }
}

const MB: i64 = 1024 * 1024;

/// Plans seeded into an empty catalogue.
pub fn builtin_plans(at: DateTime<Utc>) -> Vec<Plan> {
    let plan = |key: &str, name: &str, monthly: i64, limits: PlanLimits, features: &[Feature]| Plan {
        id: Uuid::new_v4(),
        key: key.to_string(),
        version: 1,
        name: name.to_string(),
        monthly_price_cents: monthly,
        yearly_price_cents: monthly * 10,
        currency: "USD".to_string(),
        limits,
        features: features.to_vec(),
        is_active: true,
        created_at: at,
    };

    vec![
        plan(
            "free",
            "Free",
            0,
            PlanLimits {
                max_users: Some(2),
                max_products: Some(25),
                max_transactions_per_month: Some(200),
                max_storage_bytes: Some(100 * MB),
            },
            &[],
        ),
        plan(
            "starter",
            "Starter",
            2_900,
            PlanLimits {
                max_users: Some(5),
                max_products: Some(500),
                max_transactions_per_month: Some(2_000),
                max_storage_bytes: Some(1024 * MB),
            },
            &[Feature::Loyalty, Feature::DataExport],
        ),
        plan(
            "pro",
            "Pro",
            9_900,
            PlanLimits {
                max_users: Some(25),
                max_products: Some(5_000),
                max_transactions_per_month: Some(20_000),
                max_storage_bytes: Some(10 * 1024 * MB),
            },
            &[
                Feature::Loyalty,
                Feature::MultiLocation,
                Feature::AdvancedAnalytics,
                Feature::DataExport,
                Feature::ApiAccess,
            ],
        ),
        plan(
            "enterprise",
            "Enterprise",
            29_900,
            PlanLimits::unlimited(),
            &Feature::ALL,
        ),
    ]
}
