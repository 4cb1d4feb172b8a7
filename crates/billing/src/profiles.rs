//! Identity mapping between readers and billing-provider customers

use async_trait::async_trait;
use sefer_shared::{CustomerProfile, UserId};
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};

/// Read-only view of the profile store
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn customer_for_user(&self, user_id: UserId) -> BillingResult<Option<String>>;

    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<UserId>>;

    /// Every profile that has a billing customer attached
    async fn list_billable(&self) -> BillingResult<Vec<CustomerProfile>>;
}

/// Resolve the customer id or fail with `ProfileNotFound`
pub async fn require_customer(
    profiles: &dyn ProfileDirectory,
    user_id: UserId,
) -> BillingResult<String> {
    profiles
        .customer_for_user(user_id)
        .await?
        .ok_or_else(|| BillingError::ProfileNotFound(user_id.to_string()))
}

/// Resolve the user id or fail with `ProfileNotFound`
pub async fn require_user(
    profiles: &dyn ProfileDirectory,
    customer_id: &str,
) -> BillingResult<UserId> {
    profiles
        .user_for_customer(customer_id)
        .await?
        .ok_or_else(|| BillingError::ProfileNotFound(format!("customer {}", customer_id)))
}

/// Postgres-backed [`ProfileDirectory`] over the `profiles` table
#[derive(Clone)]
pub struct PgProfileDirectory {
    pool: PgPool,
}

impl PgProfileDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileDirectory for PgProfileDirectory {
    async fn customer_for_user(&self, user_id: UserId) -> BillingResult<Option<String>> {
        let result: Option<(Option<String>,)> =
            sqlx::query_as("SELECT external_customer_id FROM profiles WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.and_then(|(customer_id,)| customer_id))
    }

    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<UserId>> {
        let result: Option<(UserId,)> =
            sqlx::query_as("SELECT user_id FROM profiles WHERE external_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.map(|(user_id,)| user_id))
    }

    async fn list_billable(&self) -> BillingResult<Vec<CustomerProfile>> {
        let profiles: Vec<CustomerProfile> = sqlx::query_as(
            r#"
            SELECT user_id, external_customer_id
            FROM profiles
            WHERE external_customer_id IS NOT NULL
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(profiles)
    }
}
