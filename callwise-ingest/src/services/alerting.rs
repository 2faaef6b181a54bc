//! Operator alerting
//!
//! Counts failure signals per (tenant, kind) in a sliding window. Reaching
//! the configured threshold raises a persisted alert; while that alert is
//! open (unacknowledged), further signals of the same (tenant, kind) are
//! absorbed into it as extra occurrences.
//!
//! Alerting never fails its caller: database errors are logged and dropped.

use callwise_common::config::AlertConfig;
use callwise_common::events::{CallwiseEvent, EventBus};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use crate::db;
use crate::models::AlertKind;

type SignalKey = (Option<Uuid>, AlertKind);

#[derive(Clone)]
pub struct AlertingService {
    pool: SqlitePool,
    config: AlertConfig,
    event_bus: EventBus,
    windows: Arc<Mutex<HashMap<SignalKey, VecDeque<Instant>>>>,
}

impl AlertingService {
    pub fn new(pool: SqlitePool, config: AlertConfig, event_bus: EventBus) -> Self {
        Self {
            pool,
            config,
            event_bus,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn threshold(&self, kind: AlertKind) -> u32 {
        let value = match kind {
            AlertKind::RecordingFetchFailure => self.config.fetch_failure_threshold,
            AlertKind::StageFailure => self.config.stage_failure_threshold,
            AlertKind::QuotaExceeded => self.config.quota_threshold,
            AlertKind::MalformedPayload => self.config.malformed_payload_threshold,
        };
        value.max(1)
    }

    /// Record one signal; returns the alert id when an alert was raised or bumped
    pub async fn report(
        &self,
        tenant_id: Option<Uuid>,
        kind: AlertKind,
        message: impl Into<String>,
    ) -> Option<i64> {
        let message = message.into();
        match self.report_inner(tenant_id, kind, &message).await {
            Ok(id) => id,
            Err(e) => {
                error!(kind = %kind, error = %e, "Failed to record alert signal");
                None
            }
        }
    }

    async fn report_inner(
        &self,
        tenant_id: Option<Uuid>,
        kind: AlertKind,
        message: &str,
    ) -> callwise_common::Result<Option<i64>> {
        let now = Utc::now();

        // Held across the database calls so two signals cannot both raise
        let mut windows = self.windows.lock().await;

        if let Some(open_id) = db::alerts::find_open(&self.pool, tenant_id, kind).await? {
            db::alerts::bump_occurrence(&self.pool, open_id, message, now).await?;
            return Ok(Some(open_id));
        }

        let window = Duration::from_secs(self.config.window_secs);
        let threshold = self.threshold(kind) as usize;
        let signals = windows.entry((tenant_id, kind)).or_default();
        let instant = Instant::now();
        signals.push_back(instant);
        while let Some(front) = signals.front() {
            if instant.duration_since(*front) > window {
                signals.pop_front();
            } else {
                break;
            }
        }

        if signals.len() < threshold {
            return Ok(None);
        }

        let occurrences = signals.len() as i64;
        signals.clear();

        let alert_id =
            db::alerts::insert_alert(&self.pool, tenant_id, kind, message, occurrences, now).await?;

        warn!(
            alert_id,
            tenant_id = ?tenant_id,
            kind = %kind,
            occurrences,
            detail = message,
            "Operator alert raised"
        );

        self.event_bus.emit_lossy(CallwiseEvent::AlertRaised {
            alert_id,
            tenant_id,
            kind: kind.as_str().to_string(),
            message: message.to_string(),
            timestamp: now,
        });

        Ok(Some(alert_id))
    }

    pub async fn list(
        &self,
        include_acknowledged: bool,
    ) -> callwise_common::Result<Vec<crate::models::OperatorAlert>> {
        db::alerts::list_alerts(&self.pool, include_acknowledged).await
    }

    /// Acknowledge an alert; the next signal of that kind starts a new window
    pub async fn acknowledge(&self, alert_id: i64) -> callwise_common::Result<bool> {
        db::alerts::acknowledge(&self.pool, alert_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callwise_common::db::init_database;
    use tempfile::TempDir;

    async fn service(threshold: u32) -> (TempDir, AlertingService) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("callwise.db")).await.unwrap();
        let config = AlertConfig {
            stage_failure_threshold: threshold,
            ..AlertConfig::default()
        };
        (dir, AlertingService::new(pool, config, EventBus::new(16)))
    }

    #[tokio::test]
    async fn test_alert_raised_at_threshold() {
        let (_dir, alerting) = service(3).await;

        assert!(alerting.report(None, AlertKind::StageFailure, "first").await.is_none());
        assert!(alerting.report(None, AlertKind::StageFailure, "second").await.is_none());
        let raised = alerting.report(None, AlertKind::StageFailure, "third").await;

        assert!(raised.is_some());
        let alerts = alerting.list(false).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].occurrences, 3);
    }

    #[tokio::test]
    async fn test_open_alert_absorbs_repeats() {
        let (_dir, alerting) = service(1).await;

        let first = alerting.report(None, AlertKind::StageFailure, "boom").await;
        let second = alerting.report(None, AlertKind::StageFailure, "boom again").await;

        assert_eq!(first, second);
        let alerts = alerting.list(false).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].occurrences, 2);
    }

    #[tokio::test]
    async fn test_acknowledged_alert_lets_a_new_one_raise() {
        let (_dir, alerting) = service(1).await;

        let first = alerting.report(None, AlertKind::StageFailure, "boom").await.unwrap();
        assert!(alerting.acknowledge(first).await.unwrap());
        let second = alerting.report(None, AlertKind::StageFailure, "boom").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(alerting.list(false).await.unwrap().len(), 1);
        assert_eq!(alerting.list(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_kinds_are_counted_separately() {
        let (_dir, alerting) = service(2).await;

        alerting.report(None, AlertKind::StageFailure, "a").await;
        let other = alerting
            .report(None, AlertKind::QuotaExceeded, "quota")
            .await;

        // Quota threshold defaults to 1
        assert!(other.is_some());
        assert!(alerting.list(false).await.unwrap().iter().all(|a| a.kind == AlertKind::QuotaExceeded));
    }
}
