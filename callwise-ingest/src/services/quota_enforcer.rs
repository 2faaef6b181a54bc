//! Quota/plan enforcement
//!
//! Counters are per tenant per `YYYY-MM` (UTC). `try_consume` is a single
//! conditional UPDATE, so with limit N the Nth unit is allowed and the
//! (N+1)th denied regardless of concurrency.

use callwise_common::time::billing_period;
use callwise_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db;
use crate::models::{AlertKind, Plan, QuotaDecision, Tenant, UsageCounterKind, UsageSnapshot};
use crate::services::alerting::AlertingService;
use crate::utils::retry_on_lock;

#[derive(Clone)]
pub struct QuotaEnforcer {
    pool: SqlitePool,
    alerting: AlertingService,
    lock_wait_ms: u64,
}

impl QuotaEnforcer {
    pub fn new(pool: SqlitePool, alerting: AlertingService, lock_wait_ms: u64) -> Self {
        Self {
            pool,
            alerting,
            lock_wait_ms,
        }
    }

    pub async fn plan_for(&self, tenant: &Tenant) -> Result<Plan> {
        db::plans::load_plan(&self.pool, &tenant.plan_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("tenant {} references unknown plan {}", tenant.id, tenant.plan_id)))
    }

    /// Consume `amount` units of `counter` if the plan allows it
    ///
    /// Denials are reported to alerting and returned as a decision, never as an error.
    pub async fn try_consume(
        &self,
        tenant: &Tenant,
        plan: &Plan,
        counter: UsageCounterKind,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let period = billing_period(now);
        let limit = plan.limits.limit_for(counter);

        let applied = retry_on_lock("quota consume", self.lock_wait_ms, || {
            db::usage::try_increment(&self.pool, tenant.id, &period, counter, amount, limit)
        })
        .await?;

        if applied {
            debug!(tenant_id = %tenant.id, counter = counter.column(), amount, "Quota consumed");
            return Ok(QuotaDecision::Allowed);
        }

        // Only reachable with a finite limit
        let limit = limit.unwrap_or(i64::MAX);
        let used = db::usage::load_counters(&self.pool, tenant.id, &period)
            .await?
            .get(counter);

        info!(
            tenant_id = %tenant.id,
            plan = %plan.id,
            counter = counter.column(),
            amount,
            used,
            limit,
            "Quota exceeded, work skipped"
        );
        self.alerting
            .report(
                Some(tenant.id),
                AlertKind::QuotaExceeded,
                format!(
                    "{} quota exhausted for period {} ({} of {} used, {} requested)",
                    counter.column(),
                    period,
                    used,
                    limit,
                    amount
                ),
            )
            .await;

        Ok(QuotaDecision::Denied { limit, used })
    }

    /// Return a reservation (never below zero)
    pub async fn release(
        &self,
        tenant_id: Uuid,
        counter: UsageCounterKind,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let period = billing_period(now);
        retry_on_lock("quota release", self.lock_wait_ms, || {
            db::usage::decrement(&self.pool, tenant_id, &period, counter, amount)
        })
        .await?;
        debug!(tenant_id = %tenant_id, counter = counter.column(), amount, "Quota released");
        Ok(())
    }

    /// Add to a tracked-only counter (storage bytes)
    pub async fn record(
        &self,
        tenant_id: Uuid,
        counter: UsageCounterKind,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let period = billing_period(now);
        retry_on_lock("usage record", self.lock_wait_ms, || {
            db::usage::try_increment(&self.pool, tenant_id, &period, counter, amount, None)
        })
        .await?;
        Ok(())
    }

    /// Usage and limits for the period containing `now`
    pub async fn usage(&self, tenant: &Tenant, now: DateTime<Utc>) -> Result<UsageSnapshot> {
        let plan = self.plan_for(tenant).await?;
        let period = billing_period(now);
        let counters = db::usage::load_counters(&self.pool, tenant.id, &period).await?;

        Ok(UsageSnapshot {
            tenant_id: tenant.id,
            plan_id: plan.id,
            period,
            calls_processed: counters.calls_processed,
            transcription_minutes: counters.transcription_minutes,
            storage_bytes: counters.storage_bytes,
            api_calls: counters.api_calls,
            limits: plan.limits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTenant, PbxProfile, PbxSystem, PlanLimits};
    use crate::services::TenantRegistry;
    use callwise_common::config::AlertConfig;
    use callwise_common::db::init_database;
    use callwise_common::events::EventBus;
    use tempfile::TempDir;

    async fn setup(limits: PlanLimits) -> (TempDir, QuotaEnforcer, Tenant, Plan) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("callwise.db")).await.unwrap();
        let plan = Plan {
            id: "tiny".to_string(),
            name: "Tiny".to_string(),
            limits,
        };
        db::plans::upsert_plan(&pool, &plan).await.unwrap();

        let tenant = TenantRegistry::new(pool.clone())
            .provision(NewTenant {
                routing_key: "acme".to_string(),
                display_name: "Acme".to_string(),
                webhook_username: "pbx".to_string(),
                webhook_secret: Some("s3cret".to_string()),
                pbx: PbxProfile {
                    system: PbxSystem::FreePbx,
                    base_url: "https://pbx.example.test".to_string(),
                    username: "admin".to_string(),
                    secret: "pw".to_string(),
                },
                plan_id: "tiny".to_string(),
            })
            .await
            .unwrap();

        let alerting = AlertingService::new(pool.clone(), AlertConfig::default(), EventBus::new(16));
        (dir, QuotaEnforcer::new(pool, alerting, 1000), tenant, plan)
    }

    #[tokio::test]
    async fn test_limit_allows_nth_and_denies_next() {
        let (_dir, quota, tenant, plan) = setup(PlanLimits {
            calls_processed: Some(2),
            ..PlanLimits::default()
        })
        .await;
        let now = Utc::now();
        let calls = UsageCounterKind::CallsProcessed;

        assert_eq!(quota.try_consume(&tenant, &plan, calls, 1, now).await.unwrap(), QuotaDecision::Allowed);
        assert_eq!(quota.try_consume(&tenant, &plan, calls, 1, now).await.unwrap(), QuotaDecision::Allowed);
        assert_eq!(
            quota.try_consume(&tenant, &plan, calls, 1, now).await.unwrap(),
            QuotaDecision::Denied { limit: 2, used: 2 }
        );
        assert_eq!(quota.usage(&tenant, now).await.unwrap().calls_processed, 2);
    }

    #[tokio::test]
    async fn test_amount_larger_than_remaining_is_denied_whole() {
        let (_dir, quota, tenant, plan) = setup(PlanLimits {
            transcription_minutes: Some(5),
            ..PlanLimits::default()
        })
        .await;
        let now = Utc::now();
        let minutes = UsageCounterKind::TranscriptionMinutes;

        quota.try_consume(&tenant, &plan, minutes, 3, now).await.unwrap();
        let decision = quota.try_consume(&tenant, &plan, minutes, 3, now).await.unwrap();

        assert_eq!(decision, QuotaDecision::Denied { limit: 5, used: 3 });
        assert_eq!(quota.usage(&tenant, now).await.unwrap().transcription_minutes, 3);
    }

    #[tokio::test]
    async fn test_release_never_goes_below_zero() {
        let (_dir, quota, tenant, plan) = setup(PlanLimits::default()).await;
        let now = Utc::now();
        let api = UsageCounterKind::ApiCalls;

        quota.try_consume(&tenant, &plan, api, 1, now).await.unwrap();
        quota.release(tenant.id, api, 4, now).await.unwrap();

        assert_eq!(quota.usage(&tenant, now).await.unwrap().api_calls, 0);
    }

    #[tokio::test]
    async fn test_tracked_counter_is_never_gated() {
        let (_dir, quota, tenant, _plan) = setup(PlanLimits {
            storage_bytes: Some(10),
            ..PlanLimits::default()
        })
        .await;
        let now = Utc::now();

        quota.record(tenant.id, UsageCounterKind::StorageBytes, 64, now).await.unwrap();

        assert_eq!(quota.usage(&tenant, now).await.unwrap().storage_bytes, 64);
    }
}
