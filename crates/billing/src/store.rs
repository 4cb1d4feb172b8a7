//! Local subscription persistence

use async_trait::async_trait;
use sefer_shared::{SubscriptionRecord, UserId};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Persistence for canonical subscription records.
///
/// Writes are conditional on `updated_at` (last writer wins) and keyed on
/// `(user_id, external_subscription_id)`.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert or update by `(user_id, external_subscription_id)`.
    /// `id` and `created_at` of an existing row are preserved; a write older
    /// than the stored row is skipped and the stored row is returned.
    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord>;

    /// All records of a user, most recently updated first
    async fn find_by_user(&self, user_id: UserId) -> BillingResult<Vec<SubscriptionRecord>>;

    async fn find_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Cancel every non-terminal record of the user except `keep`.
    /// Returns the records that were canceled.
    async fn cancel_active_except(
        &self,
        user_id: UserId,
        keep: Option<&str>,
        at: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>>;

    /// Move an `active` or `trialing` record to `past_due`, leaving periods untouched.
    /// Skipped when the stored record was updated after `at`.
    /// Returns `None` when no record was in a state that allows the move.
    async fn mark_past_due(
        &self,
        external_subscription_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>>;
}

const RECORD_COLUMNS: &str = r#"
    id,
    user_id,
    external_subscription_id,
    status,
    plan_tier,
    billing_interval,
    external_price_id,
    current_period_start,
    current_period_end,
    cancel_at_period_end,
    created_at,
    updated_at
"#;

/// Postgres-backed [`SubscriptionStore`]
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_key(
        &self,
        user_id: UserId,
        external_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND external_subscription_id = $2",
            RECORD_COLUMNS
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(user_id)
            .bind(external_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord> {
        let query = format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, external_subscription_id, status, plan_tier,
                billing_interval, external_price_id, current_period_start,
                current_period_end, cancel_at_period_end, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (user_id, external_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                plan_tier = EXCLUDED.plan_tier,
                billing_interval = EXCLUDED.billing_interval,
                external_price_id = EXCLUDED.external_price_id,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                updated_at = EXCLUDED.updated_at
            WHERE subscriptions.updated_at <= EXCLUDED.updated_at
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );

        let written = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(record.id)
            .bind(record.user_id)
            .bind(&record.external_subscription_id)
            .bind(record.status)
            .bind(record.plan_tier)
            .bind(record.billing_interval)
            .bind(&record.external_price_id)
            .bind(record.current_period_start)
            .bind(record.current_period_end)
            .bind(record.cancel_at_period_end)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(written) = written {
            return Ok(written);
        }

        // Conflict row was newer than this write
        tracing::info!(
            user_id = %record.user_id,
            subscription_id = %record.external_subscription_id,
            "Skipped stale subscription write"
        );
        self.find_by_key(record.user_id, &record.external_subscription_id)
            .await?
            .ok_or_else(|| {
                crate::error::BillingError::Internal(format!(
                    "Subscription {} vanished during upsert",
                    record.external_subscription_id
                ))
            })
    }

    async fn find_by_user(&self, user_id: UserId) -> BillingResult<Vec<SubscriptionRecord>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY updated_at DESC",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn find_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {} FROM subscriptions WHERE external_subscription_id = $1",
            RECORD_COLUMNS
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(external_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn cancel_active_except(
        &self,
        user_id: UserId,
        keep: Option<&str>,
        at: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let query = format!(
            r#"
            UPDATE subscriptions
            SET status = 'canceled',
                updated_at = $2
            WHERE user_id = $1
              AND status IN ('active', 'trialing', 'past_due', 'incomplete')
              AND ($3::TEXT IS NULL OR external_subscription_id <> $3)
              AND updated_at <= $2
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );
        let canceled = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(user_id)
            .bind(at)
            .bind(keep)
            .fetch_all(&self.pool)
            .await?;
        Ok(canceled)
    }

    async fn mark_past_due(
        &self,
        external_subscription_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            r#"
            UPDATE subscriptions
            SET status = 'past_due',
                updated_at = $2
            WHERE external_subscription_id = $1
              AND status IN ('active', 'trialing')
              AND updated_at <= $2
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&query)
            .bind(external_subscription_id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }
}
