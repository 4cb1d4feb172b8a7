//! Billing invariants
//!
//! Read-only consistency checks over the local subscription records. They are
//! run by the worker after each scheduled re-sync; users named in a violation
//! are candidates for a targeted reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sefer_shared::{SubscriptionRecord, SubscriptionStatus, UserId};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::catalog::PlanCatalog;
use crate::error::BillingResult;

pub const SINGLE_LIVE_SUBSCRIPTION: &str = "single_live_subscription";
pub const PRICE_MATCHES_PLAN: &str = "price_matches_plan";
pub const ACCESS_WITHIN_PERIOD: &str = "access_within_period";
pub const SUBSCRIBER_HAS_PROFILE: &str = "subscriber_has_profile";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<UserId>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

impl InvariantViolation {
    /// Whether a fresh reconciliation of the named users can fix it
    pub fn is_healable(&self) -> bool {
        self.invariant != SUBSCRIBER_HAS_PROFILE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Reader may be billed twice or get the wrong access
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Distinct users a re-sync could repair
    pub fn healable_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .violations
            .iter()
            .filter(|v| v.is_healable())
            .flat_map(|v| v.user_ids.iter().copied())
            .collect();
        users.sort_by_key(|u| u.0);
        users.dedup();
        users
    }
}

/// Users with more than one non-terminal record
pub fn find_duplicate_live(records: &[SubscriptionRecord]) -> Vec<InvariantViolation> {
    let mut live: HashMap<UserId, Vec<&str>> = HashMap::new();
    for record in records.iter().filter(|r| r.status.is_non_terminal()) {
        live.entry(record.user_id)
            .or_default()
            .push(record.external_subscription_id.as_str());
    }

    let mut violations: Vec<InvariantViolation> = live
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(user_id, ids)| InvariantViolation {
            invariant: SINGLE_LIVE_SUBSCRIPTION.to_string(),
            user_ids: vec![user_id],
            description: format!(
                "User has {} live subscriptions (expected at most 1)",
                ids.len()
            ),
            context: serde_json::json!({ "subscriptions": ids }),
            severity: ViolationSeverity::Critical,
        })
        .collect();
    violations.sort_by_key(|v| v.user_ids.first().map(|u| u.0));
    violations
}

/// A record whose price id is in the catalog but whose plan disagrees with it
pub fn price_mismatch(record: &SubscriptionRecord, catalog: &PlanCatalog) -> Option<InvariantViolation> {
    let price_id = record.external_price_id.as_deref()?;
    let plan = catalog.by_price_id(price_id)?;
    if plan.tier() == record.plan_tier && plan.interval() == record.billing_interval {
        return None;
    }
    Some(InvariantViolation {
        invariant: PRICE_MATCHES_PLAN.to_string(),
        user_ids: vec![record.user_id],
        description: format!(
            "Subscription {} is recorded as {}-{} but price {} is {}",
            record.external_subscription_id,
            record.billing_interval,
            record.plan_tier,
            price_id,
            plan.slug()
        ),
        context: serde_json::json!({
            "subscription_id": record.external_subscription_id,
            "price_id": price_id,
            "recorded_tier": record.plan_tier,
            "recorded_interval": record.billing_interval,
        }),
        severity: ViolationSeverity::High,
    })
}

/// An access-granting record whose period already ended: a renewal or
/// cancellation notification was missed.
pub fn stale_access(record: &SubscriptionRecord, now: OffsetDateTime) -> Option<InvariantViolation> {
    let end = record.current_period_end?;
    if !record.status.grants_access() || end > now {
        return None;
    }
    Some(InvariantViolation {
        invariant: ACCESS_WITHIN_PERIOD.to_string(),
        user_ids: vec![record.user_id],
        description: format!(
            "Subscription {} is {} but its period ended at {}",
            record.external_subscription_id, record.status, end
        ),
        context: serde_json::json!({
            "subscription_id": record.external_subscription_id,
            "status": record.status,
            "current_period_end": end.unix_timestamp(),
        }),
        severity: ViolationSeverity::Medium,
    })
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanRow {
    user_id: UserId,
    external_subscription_id: String,
}

/// Runs the invariant checks against Postgres
pub struct InvariantChecker {
    pool: PgPool,
    catalog: Arc<PlanCatalog>,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, catalog: Arc<PlanCatalog>) -> Self {
        Self { pool, catalog }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let summary = InvariantCheckSummary::from_violations(Self::available_checks().len(), violations);
        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Billing invariants hold");
        } else {
            for violation in &summary.violations {
                tracing::warn!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    user_ids = ?violation.user_ids,
                    "{}",
                    violation.description
                );
            }
        }
        Ok(summary)
    }

    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            SINGLE_LIVE_SUBSCRIPTION => self.check_single_live_subscription().await,
            PRICE_MATCHES_PLAN => self.check_price_matches_plan().await,
            ACCESS_WITHIN_PERIOD => self.check_access_within_period().await,
            SUBSCRIBER_HAS_PROFILE => self.check_subscriber_has_profile().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SINGLE_LIVE_SUBSCRIPTION,
            PRICE_MATCHES_PLAN,
            ACCESS_WITHIN_PERIOD,
            SUBSCRIBER_HAS_PROFILE,
        ]
    }

    async fn live_records(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let records: Vec<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, external_subscription_id, status, plan_tier, billing_interval,
                   external_price_id, current_period_start, current_period_end,
                   cancel_at_period_end, created_at, updated_at
            FROM subscriptions
            WHERE status = ANY($1)
            "#,
        )
        .bind(SubscriptionStatus::non_terminal_strs())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// At most one non-terminal record per user
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let duplicated: Vec<(UserId,)> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM subscriptions
            WHERE status = ANY($1)
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .bind(SubscriptionStatus::non_terminal_strs())
        .fetch_all(&self.pool)
        .await?;

        if duplicated.is_empty() {
            return Ok(vec![]);
        }
        Ok(find_duplicate_live(&self.live_records().await?))
    }

    /// Recorded tier and interval agree with the catalog entry of the price
    async fn check_price_matches_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .live_records()
            .await?
            .iter()
            .filter_map(|r| price_mismatch(r, &self.catalog))
            .collect())
    }

    async fn check_access_within_period(&self) -> BillingResult<Vec<InvariantViolation>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .live_records()
            .await?
            .iter()
            .filter_map(|r| stale_access(r, now))
            .collect())
    }

    /// Every subscriber still has a billing customer to reconcile against
    async fn check_subscriber_has_profile(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanRow> = sqlx::query_as(
            r#"
            SELECT s.user_id, s.external_subscription_id
            FROM subscriptions s
            LEFT JOIN profiles p ON p.user_id = s.user_id
            WHERE s.status = ANY($1)
              AND (p.user_id IS NULL OR p.external_customer_id IS NULL)
            "#,
        )
        .bind(SubscriptionStatus::non_terminal_strs())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: SUBSCRIBER_HAS_PROFILE.to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Live subscription {} belongs to a user without a billing customer",
                    row.external_subscription_id
                ),
                context: serde_json::json!({
                    "subscription_id": row.external_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}
