//! Webhook delivery ledger
//!
//! The provider delivers at least once. Each notification id is claimed
//! atomically before processing so concurrent or repeated deliveries are
//! acknowledged without being processed twice. Failed events and claims stuck
//! in `processing` longer than the stale window can be claimed again.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingResult {
    Processing,
    Success,
    Ignored,
    Rejected,
    Error,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Ignored => "ignored",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "success" => Self::Success,
            "ignored" => Self::Ignored,
            "rejected" => Self::Rejected,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for ProcessingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller holds exclusive processing rights
    Claimed,
    /// Already handled or in flight elsewhere
    Duplicate(ProcessingResult),
}

/// A row of the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub external_event_id: String,
    pub event_type: String,
    pub event_timestamp: Option<OffsetDateTime>,
    pub processing_result: ProcessingResult,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WebhookEventRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let result: String = row.try_get("processing_result")?;
        Ok(Self {
            id: row.try_get("id")?,
            external_event_id: row.try_get("external_event_id")?,
            event_type: row.try_get("event_type")?,
            event_timestamp: row.try_get("event_timestamp")?,
            processing_result: ProcessingResult::parse(&result),
            processing_started_at: row.try_get("processing_started_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
pub trait EventLedger: Send + Sync {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: Option<OffsetDateTime>,
        stale_after: Duration,
    ) -> BillingResult<ClaimOutcome>;

    async fn finish(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    /// Most recent failed events, for operator replay
    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>>;
}

/// Whether an existing entry may be claimed again
pub(crate) fn is_reclaimable(
    record: &WebhookEventRecord,
    now: OffsetDateTime,
    stale_after: Duration,
) -> bool {
    match record.processing_result {
        ProcessingResult::Error => true,
        ProcessingResult::Processing => record
            .processing_started_at
            .map_or(true, |started| now - started > stale_after),
        _ => false,
    }
}

/// Postgres-backed [`EventLedger`] over `webhook_events`
#[derive(Clone)]
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLedger for PgEventLedger {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: Option<OffsetDateTime>,
        stale_after: Duration,
    ) -> BillingResult<ClaimOutcome> {
        // Only one concurrent INSERT ... RETURNING gets a row back
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (external_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (external_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.processing_started_at < NOW() - make_interval(secs => $4))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM webhook_events WHERE external_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let result = existing
            .map(|(status,)| ProcessingResult::parse(&status))
            .unwrap_or(ProcessingResult::Processing);
        Ok(ClaimOutcome::Duplicate(result))
    }

    async fn finish(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2, error_message = $3
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let record: Option<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, external_event_id, event_type, event_timestamp, processing_result,
                   processing_started_at, error_message, created_at
            FROM webhook_events
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, external_event_id, event_type, event_timestamp, processing_result,
                   processing_started_at, error_message, created_at
            FROM webhook_events
            WHERE processing_result = 'error'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(result: ProcessingResult, started: Option<OffsetDateTime>) -> WebhookEventRecord {
        WebhookEventRecord {
            id: Uuid::new_v4(),
            external_event_id: "evt_1".to_string(),
            event_type: "customer.subscription.updated".to_string(),
            event_timestamp: None,
            processing_result: result,
            processing_started_at: started,
            error_message: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_reclaim_rules() {
        let now = OffsetDateTime::now_utc();
        let window = Duration::from_secs(1800);

        assert!(is_reclaimable(&entry(ProcessingResult::Error, Some(now)), now, window));
        assert!(!is_reclaimable(&entry(ProcessingResult::Success, None), now, window));
        assert!(!is_reclaimable(&entry(ProcessingResult::Ignored, None), now, window));
        assert!(!is_reclaimable(&entry(ProcessingResult::Rejected, None), now, window));
        assert!(!is_reclaimable(
            &entry(ProcessingResult::Processing, Some(now - time::Duration::minutes(5))),
            now,
            window
        ));
        assert!(is_reclaimable(
            &entry(ProcessingResult::Processing, Some(now - time::Duration::minutes(31))),
            now,
            window
        ));
    }

    #[test]
    fn test_result_parse() {
        assert_eq!(ProcessingResult::parse("success"), ProcessingResult::Success);
        assert_eq!(ProcessingResult::parse("garbage"), ProcessingResult::Error);
        assert_eq!(ProcessingResult::Rejected.to_string(), "rejected");
    }
}
