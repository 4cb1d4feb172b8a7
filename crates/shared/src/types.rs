//! Common types used across Sefer

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SeferError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Plan tier sold to readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Basic,
    Plus,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Basic
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Plus => write!(f, "plus"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = SeferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic" | "basico" | "básico" => Ok(Self::Basic),
            "plus" => Ok(Self::Plus),
            _ => Err(SeferError::Validation(format!("Invalid plan tier: {}", s))),
        }
    }
}

/// How often a plan bills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl Default for BillingInterval {
    fn default() -> Self {
        Self::Monthly
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Yearly => write!(f, "yearly"),
        }
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = SeferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "monthly" | "month" | "mensal" => Ok(Self::Monthly),
            "yearly" | "year" | "annual" | "anual" => Ok(Self::Yearly),
            _ => Err(SeferError::Validation(format!(
                "Invalid billing interval: {}",
                s
            ))),
        }
    }
}

/// Subscription status as mirrored from the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
}

impl SubscriptionStatus {
    /// Statuses that still count as the user's live subscription.
    /// At most one record per user may be in one of these.
    pub fn is_non_terminal(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Trialing | Self::PastDue | Self::Incomplete
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_non_terminal()
    }

    /// Statuses that may grant access while the period is current
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Unpaid => "unpaid",
        }
    }

    /// All statuses, in the order they are stored
    pub const ALL: [SubscriptionStatus; 7] = [
        Self::Active,
        Self::Trialing,
        Self::PastDue,
        Self::Canceled,
        Self::Incomplete,
        Self::IncompleteExpired,
        Self::Unpaid,
    ];

    /// Statuses counted as non-terminal, for SQL `= ANY($n)` filters
    pub fn non_terminal_strs() -> Vec<&'static str> {
        Self::ALL
            .iter()
            .filter(|s| s.is_non_terminal())
            .map(|s| s.as_str())
            .collect()
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = SeferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "unpaid" => Ok(Self::Unpaid),
            _ => Err(SeferError::Validation(format!(
                "Invalid subscription status: {}",
                s
            ))),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Canonical local subscription record.
///
/// One row per `(user_id, external_subscription_id)`. Rows are never deleted;
/// cancellation is a status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub external_subscription_id: String,
    pub status: SubscriptionStatus,
    pub plan_tier: PlanTier,
    pub billing_interval: BillingInterval,
    pub external_price_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Same record content, ignoring bookkeeping timestamps
    pub fn same_state_as(&self, other: &SubscriptionRecord) -> bool {
        self.id == other.id
            && self.user_id == other.user_id
            && self.external_subscription_id == other.external_subscription_id
            && self.status == other.status
            && self.plan_tier == other.plan_tier
            && self.billing_interval == other.billing_interval
            && self.external_price_id == other.external_price_id
            && self.current_period_start == other.current_period_start
            && self.current_period_end == other.current_period_end
            && self.cancel_at_period_end == other.cancel_at_period_end
            && self.created_at == other.created_at
    }
}

/// Mapping between a user and their billing-provider customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CustomerProfile {
    pub user_id: UserId,
    pub external_customer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_terminality() {
        assert!(SubscriptionStatus::Active.is_non_terminal());
        assert!(SubscriptionStatus::Trialing.is_non_terminal());
        assert!(SubscriptionStatus::PastDue.is_non_terminal());
        assert!(SubscriptionStatus::Incomplete.is_non_terminal());
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::IncompleteExpired.is_terminal());
        assert!(SubscriptionStatus::Unpaid.is_terminal());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in SubscriptionStatus::ALL {
            assert_eq!(SubscriptionStatus::from_str(status.as_str()).ok(), Some(status));
        }
        assert_eq!(
            SubscriptionStatus::from_str("cancelled").ok(),
            Some(SubscriptionStatus::Canceled)
        );
    }

    #[test]
    fn test_non_terminal_strs() {
        let strs = SubscriptionStatus::non_terminal_strs();
        assert_eq!(strs, vec!["active", "trialing", "past_due", "incomplete"]);
    }

    #[test]
    fn test_tier_and_interval_parsing() {
        assert_eq!(PlanTier::from_str("Plus").ok(), Some(PlanTier::Plus));
        assert_eq!(PlanTier::from_str("basico").ok(), Some(PlanTier::Basic));
        assert!(PlanTier::from_str("gold").is_err());
        assert_eq!(
            BillingInterval::from_str("anual").ok(),
            Some(BillingInterval::Yearly)
        );
    }

    #[test]
    fn test_status_serde_is_snake_case() {
        let json = serde_json::to_string(&SubscriptionStatus::IncompleteExpired).ok();
        assert_eq!(json.as_deref(), Some("\"incomplete_expired\""));
    }
}
