//! Plan catalog
//!
//! Static registry of the four plans readers can buy. The catalog is built once
//! from configuration and shared read-only.

use serde::{Deserialize, Serialize};
use sefer_shared::{BillingInterval, PlanTier};

use crate::client::PriceIds;
use crate::error::{BillingError, BillingResult};

/// Identifies a plan independently of its provider price id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanKey {
    pub tier: PlanTier,
    pub interval: BillingInterval,
}

impl PlanKey {
    pub const MONTHLY_BASIC: PlanKey = PlanKey::new(PlanTier::Basic, BillingInterval::Monthly);
    pub const MONTHLY_PLUS: PlanKey = PlanKey::new(PlanTier::Plus, BillingInterval::Monthly);
    pub const YEARLY_BASIC: PlanKey = PlanKey::new(PlanTier::Basic, BillingInterval::Yearly);
    pub const YEARLY_PLUS: PlanKey = PlanKey::new(PlanTier::Plus, BillingInterval::Yearly);

    pub const fn new(tier: PlanTier, interval: BillingInterval) -> Self {
        Self { tier, interval }
    }

    /// Position in the upgrade order:
    /// monthly-basic < monthly-plus < yearly-basic < yearly-plus
    pub fn rank(&self) -> u8 {
        let interval = match self.interval {
            BillingInterval::Monthly => 0,
            BillingInterval::Yearly => 2,
        };
        let tier = match self.tier {
            PlanTier::Basic => 0,
            PlanTier::Plus => 1,
        };
        interval + tier
    }

    /// A strict improvement under the upgrade order
    pub fn is_upgrade_to(&self, target: &PlanKey) -> bool {
        target.rank() > self.rank()
    }

    pub fn slug(&self) -> String {
        format!("{}-{}", self.interval, self.tier)
    }
}

impl std::fmt::Display for PlanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.interval, self.tier)
    }
}

impl std::str::FromStr for PlanKey {
    type Err = BillingError;

    /// Accepts `monthly-plus` style slugs, including the legacy checkout
    /// spellings (`mensal-basico`, `anual-plus`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let (interval, tier) = normalized
            .split_once(['-', '_'])
            .ok_or_else(|| BillingError::InvalidPayload(format!("Invalid plan slug: {}", s)))?;
        let interval: BillingInterval = interval.parse()?;
        let tier: PlanTier = tier.parse()?;
        Ok(Self::new(tier, interval))
    }
}

/// An offerable plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub key: PlanKey,
    pub external_price_id: String,
    pub list_price_cents: i64,
}

impl Plan {
    pub fn tier(&self) -> PlanTier {
        self.key.tier
    }

    pub fn interval(&self) -> BillingInterval {
        self.key.interval
    }

    pub fn slug(&self) -> String {
        self.key.slug()
    }
}

/// List prices in cents
pub const MONTHLY_BASIC_CENTS: i64 = 9_990;
pub const MONTHLY_PLUS_CENTS: i64 = 14_990;
pub const YEARLY_BASIC_CENTS: i64 = 95_880;
pub const YEARLY_PLUS_CENTS: i64 = 107_880;

/// Immutable plan registry
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    /// Build a catalog; every plan key must appear exactly once
    pub fn new(plans: Vec<Plan>) -> BillingResult<Self> {
        for key in [
            PlanKey::MONTHLY_BASIC,
            PlanKey::MONTHLY_PLUS,
            PlanKey::YEARLY_BASIC,
            PlanKey::YEARLY_PLUS,
        ] {
            let count = plans.iter().filter(|p| p.key == key).count();
            if count != 1 {
                return Err(BillingError::Config(format!(
                    "Plan {} must be configured exactly once, found {}",
                    key, count
                )));
            }
        }

        let mut plans = plans;
        plans.sort_by_key(|p| p.key.rank());
        Ok(Self { plans })
    }

    /// Catalog with the standard list prices and the configured price ids
    pub fn from_price_ids(price_ids: &PriceIds) -> BillingResult<Self> {
        Self::new(vec![
            Plan {
                key: PlanKey::MONTHLY_BASIC,
                external_price_id: price_ids.monthly_basic.clone(),
                list_price_cents: MONTHLY_BASIC_CENTS,
            },
            Plan {
                key: PlanKey::MONTHLY_PLUS,
                external_price_id: price_ids.monthly_plus.clone(),
                list_price_cents: MONTHLY_PLUS_CENTS,
            },
            Plan {
                key: PlanKey::YEARLY_BASIC,
                external_price_id: price_ids.yearly_basic.clone(),
                list_price_cents: YEARLY_BASIC_CENTS,
            },
            Plan {
                key: PlanKey::YEARLY_PLUS,
                external_price_id: price_ids.yearly_plus.clone(),
                list_price_cents: YEARLY_PLUS_CENTS,
            },
        ])
    }

    /// Plans in upgrade order
    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn get(&self, key: PlanKey) -> Option<&Plan> {
        self.plans.iter().find(|p| p.key == key)
    }

    pub fn require(&self, key: PlanKey) -> BillingResult<&Plan> {
        self.get(key)
            .ok_or_else(|| BillingError::Config(format!("Plan {} is not configured", key)))
    }

    /// Exact price-id lookup
    pub fn by_price_id(&self, price_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.external_price_id == price_id)
    }

    /// Plans strictly above `current` in the upgrade order
    pub fn upgrades_from(&self, current: PlanKey) -> Vec<&Plan> {
        self.plans
            .iter()
            .filter(|p| current.is_upgrade_to(&p.key))
            .collect()
    }

    /// Yearly savings when moving from a monthly plan to a yearly one.
    /// Zero for any other transition.
    pub fn yearly_savings_cents(&self, from: PlanKey, to: PlanKey) -> i64 {
        if from.interval != BillingInterval::Monthly || to.interval != BillingInterval::Yearly {
            return 0;
        }
        match (self.get(from), self.get(to)) {
            (Some(current), Some(target)) => {
                (current.list_price_cents * 12 - target.list_price_cents).max(0)
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_catalog() -> PlanCatalog {
    PlanCatalog::from_price_ids(&PriceIds {
        monthly_basic: "price_mensal_basico".to_string(),
        monthly_plus: "price_mensal_plus".to_string(),
        yearly_basic: "price_anual_basico".to_string(),
        yearly_plus: "price_anual_plus".to_string(),
    })
    .unwrap()
}
