use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::Cache;
use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{builtin_plans, Plan, PlanRevision};
use crate::store::Store;

/// Versioned plan definitions. Records are never mutated once written, so
/// cached copies never go stale.
#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn Store>,
    cache: Option<Cache>,
    cache_ttl_secs: u64,
    clock: Arc<dyn Clock>,
}

impl PlanCatalog {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Option<Cache>,
        cache_ttl_secs: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            cache_ttl_secs,
            clock,
        }
    }

    /// Inserts every built-in plan whose key has no version yet.
    pub async fn seed_builtin(&self) -> AppResult<usize> {
        let mut seeded = 0;
        for plan in builtin_plans(self.clock.now()) {
            if self.store.latest_plan(&plan.key).await?.is_some() {
                continue;
            }
            match self.store.insert_plan(&plan).await {
                Ok(()) => seeded += 1,
                // another instance seeded it first
                Err(AppError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if seeded > 0 {
            tracing::info!(seeded, "seeded built-in plans");
        }
        Ok(seeded)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Plan> {
        let key = format!("plan:{id}");
        if let Some(cache) = &self.cache {
            if let Some(plan) = cache.get_json::<Plan>(&key).await {
                return Ok(plan);
            }
        }
        let plan = self
            .store
            .get_plan(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("plan {id}")))?;
        if let Some(cache) = &self.cache {
            cache.put_json(&key, &plan, self.cache_ttl_secs).await;
        }
        Ok(plan)
    }

    /// Newest version of `key`, whether or not it is still offered.
    pub async fn latest(&self, key: &str) -> AppResult<Plan> {
        self.store
            .latest_plan(key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("plan '{key}'")))
    }

    /// Newest version of each plan key that is still offered.
    pub async fn list_active(&self) -> AppResult<Vec<Plan>> {
        let mut latest: BTreeMap<String, Plan> = BTreeMap::new();
        for plan in self.store.list_plans().await? {
            let newer = latest
                .get(&plan.key)
                .map_or(true, |current| plan.version > current.version);
            if newer {
                latest.insert(plan.key.clone(), plan);
            }
        }
        let mut plans: Vec<Plan> = latest.into_values().filter(|p| p.is_active).collect();
        plans.sort_by_key(|p| p.monthly_price_cents);
        Ok(plans)
    }

    /// Publishes a new version of `key`. Existing versions stay untouched, so
    /// subscriptions referencing them keep their terms.
    pub async fn publish_revision(&self, key: &str, revision: PlanRevision) -> AppResult<Plan> {
        let base = self.latest(key).await?;
        let plan = revision.apply(&base, self.clock.now());
        self.store.insert_plan(&plan).await?;
        tracing::info!(plan_key = %plan.key, version = plan.version, "published plan revision");
        Ok(plan)
    }
}
