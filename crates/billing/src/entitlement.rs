//! Entitlement computation
//!
//! Derives what a reader may access from their latest canonical subscription
//! record. The computation itself is pure ([`entitlement_at`]) so it can be
//! evaluated against any clock; [`EntitlementService`] only loads the record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sefer_shared::{PlanTier, SubscriptionRecord, SubscriptionStatus, UserId};
use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::error::BillingResult;
use crate::store::SubscriptionStore;

/// Tier visible to content-serving layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitledTier {
    None,
    Basic,
    Plus,
}

impl From<PlanTier> for EntitledTier {
    fn from(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Basic => Self::Basic,
            PlanTier::Plus => Self::Plus,
        }
    }
}

impl std::fmt::Display for EntitledTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Basic => write!(f, "basic"),
            Self::Plus => write!(f, "plus"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub has_access: bool,
    pub tier: EntitledTier,
    pub status: Option<SubscriptionStatus>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl Entitlement {
    pub fn none() -> Self {
        Self {
            has_access: false,
            tier: EntitledTier::None,
            status: None,
            current_period_end: None,
            cancel_at_period_end: false,
        }
    }

    pub fn is_plus(&self) -> bool {
        self.tier == EntitledTier::Plus
    }
}

/// The record that speaks for the user: a non-terminal one if any exists,
/// otherwise the most recently updated.
pub fn canonical_record(records: &[SubscriptionRecord]) -> Option<&SubscriptionRecord> {
    records
        .iter()
        .filter(|r| r.status.is_non_terminal())
        .max_by_key(|r| r.updated_at)
        .or_else(|| records.iter().max_by_key(|r| r.updated_at))
}

/// Access requires `active`/`trialing` and a period end (if known) in the future.
/// A canceled record never reports a tier.
pub fn entitlement_at(record: Option<&SubscriptionRecord>, now: OffsetDateTime) -> Entitlement {
    let Some(record) = record else {
        return Entitlement::none();
    };

    let period_current = record.current_period_end.map_or(true, |end| end > now);
    let has_access = record.status.grants_access() && period_current;

    let tier = if has_access && record.status != SubscriptionStatus::Canceled {
        EntitledTier::from(record.plan_tier)
    } else {
        EntitledTier::None
    };

    Entitlement {
        has_access,
        tier,
        status: Some(record.status),
        current_period_end: record.current_period_end,
        cancel_at_period_end: record.cancel_at_period_end,
    }
}

/// Loads canonical records and computes entitlements
#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn SubscriptionStore>,
    config: EngineConfig,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn SubscriptionStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub async fn get_entitlement(&self, user_id: UserId) -> BillingResult<Entitlement> {
        let records = self
            .config
            .bounded("find_by_user", self.store.find_by_user(user_id))
            .await?;
        let entitlement = entitlement_at(canonical_record(&records), OffsetDateTime::now_utc());

        tracing::debug!(
            user_id = %user_id,
            has_access = entitlement.has_access,
            tier = %entitlement.tier,
            "Computed entitlement"
        );

        Ok(entitlement)
    }
}
