//! Plan classifier
//!
//! Derives `(tier, interval)` from a provider line item. Each dimension is
//! resolved by an ordered list of rules; the first rule that produces an
//! answer wins and is reported back as the classification's signal.
//!
//! Interval rules: structured recurring field, price-id pattern, catalog
//! lookup, then a `monthly` default.
//!
//! Tier rules: metadata annotation, `plus` substring on price id / nickname /
//! product name, catalog lookup, then a `basic` default.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sefer_shared::{BillingInterval, PlanTier};

use crate::catalog::{PlanCatalog, PlanKey};
use crate::gateway::LineItem;

/// Patterns tested against the lower-cased price id. Yearly goes first so that
/// ids such as `price_annual_monthly_equiv` are not mistaken for monthly.
const YEARLY_PATTERNS: &[&str] = &["yearly", "year", "annual", "anual"];
const MONTHLY_PATTERNS: &[&str] = &["monthly", "month", "mensal"];

/// Which rule decided the billing interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalSignal {
    RecurringField,
    PriceIdPattern,
    CatalogLookup,
    Default,
}

/// Which rule decided the tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierSignal {
    Metadata,
    PlusSubstring,
    CatalogLookup,
    Default,
}

impl std::fmt::Display for IntervalSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RecurringField => "recurring_field",
            Self::PriceIdPattern => "price_id_pattern",
            Self::CatalogLookup => "catalog_lookup",
            Self::Default => "default",
        };
        write!(f, "{}", s)
    }
}

impl std::fmt::Display for TierSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Metadata => "metadata",
            Self::PlusSubstring => "plus_substring",
            Self::CatalogLookup => "catalog_lookup",
            Self::Default => "default",
        };
        write!(f, "{}", s)
    }
}

/// Classifier verdict with provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: PlanTier,
    pub interval: BillingInterval,
    pub tier_signal: TierSignal,
    pub interval_signal: IntervalSignal,
}

impl Classification {
    pub fn plan_key(&self) -> PlanKey {
        PlanKey::new(self.tier, self.interval)
    }

    /// True when either dimension fell through to its default
    pub fn is_ambiguous(&self) -> bool {
        self.tier_signal == TierSignal::Default || self.interval_signal == IntervalSignal::Default
    }
}

#[derive(Debug, Clone)]
pub struct PlanClassifier {
    catalog: Arc<PlanCatalog>,
}

impl PlanClassifier {
    pub fn new(catalog: Arc<PlanCatalog>) -> Self {
        Self { catalog }
    }

    pub fn classify(&self, item: &LineItem) -> Classification {
        let (interval, interval_signal) = self.classify_interval(item);
        let (tier, tier_signal) = self.classify_tier(item);

        let classification = Classification {
            tier,
            interval,
            tier_signal,
            interval_signal,
        };

        if classification.is_ambiguous() {
            tracing::warn!(
                price_id = ?item.price_id,
                recurring_interval = ?item.recurring_interval,
                price_nickname = ?item.price_nickname,
                product_name = ?item.product_name,
                metadata = ?item.metadata,
                tier = %tier,
                interval = %interval,
                tier_signal = %tier_signal,
                interval_signal = %interval_signal,
                "Plan classification fell back to a default"
            );
        } else {
            tracing::debug!(
                price_id = ?item.price_id,
                tier = %tier,
                interval = %interval,
                tier_signal = %tier_signal,
                interval_signal = %interval_signal,
                "Classified plan"
            );
        }

        classification
    }

    fn classify_interval(&self, item: &LineItem) -> (BillingInterval, IntervalSignal) {
        if let Some(interval) = item
            .recurring_interval
            .as_deref()
            .and_then(interval_from_recurring)
        {
            return (interval, IntervalSignal::RecurringField);
        }

        if let Some(price_id) = item.price_id.as_deref() {
            let lowered = price_id.to_lowercase();
            if YEARLY_PATTERNS.iter().any(|p| lowered.contains(p)) {
                return (BillingInterval::Yearly, IntervalSignal::PriceIdPattern);
            }
            if MONTHLY_PATTERNS.iter().any(|p| lowered.contains(p)) {
                return (BillingInterval::Monthly, IntervalSignal::PriceIdPattern);
            }
            if let Some(plan) = self.catalog.by_price_id(price_id) {
                return (plan.interval(), IntervalSignal::CatalogLookup);
            }
        }

        (BillingInterval::Monthly, IntervalSignal::Default)
    }

    fn classify_tier(&self, item: &LineItem) -> (PlanTier, TierSignal) {
        if let Some(tier) = tier_from_metadata(item) {
            return (tier, TierSignal::Metadata);
        }

        let mentions_plus = [
            item.price_id.as_deref(),
            item.price_nickname.as_deref(),
            item.product_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|text| text.to_lowercase().contains("plus"));
        if mentions_plus {
            return (PlanTier::Plus, TierSignal::PlusSubstring);
        }

        if let Some(plan) = item
            .price_id
            .as_deref()
            .and_then(|id| self.catalog.by_price_id(id))
        {
            return (plan.tier(), TierSignal::CatalogLookup);
        }

        (PlanTier::Basic, TierSignal::Default)
    }
}

fn interval_from_recurring(raw: &str) -> Option<BillingInterval> {
    match raw.trim().to_lowercase().as_str() {
        "month" => Some(BillingInterval::Monthly),
        "year" => Some(BillingInterval::Yearly),
        _ => None,
    }
}

/// `tier=plus|basic`, or a checkout `plan` slug such as `mensal-plus`
fn tier_from_metadata(item: &LineItem) -> Option<PlanTier> {
    if let Some(tier) = item.metadata.get("tier").and_then(|t| t.parse().ok()) {
        return Some(tier);
    }
    item.metadata
        .get("plan")
        .and_then(|slug| slug.parse::<PlanKey>().ok())
        .map(|key| key.tier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_catalog;
    use std::collections::HashMap;

    fn classifier() -> PlanClassifier {
        PlanClassifier::new(Arc::new(test_catalog()))
    }

    fn item(price_id: &str) -> LineItem {
        LineItem {
            price_id: Some(price_id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_recurring_field_beats_price_pattern() {
        let line = LineItem {
            recurring_interval: Some("year".to_string()),
            ..item("price_monthly_plus")
        };
        let c = classifier().classify(&line);
        assert_eq!(c.interval, BillingInterval::Yearly);
        assert_eq!(c.interval_signal, IntervalSignal::RecurringField);
    }

    #[test]
    fn test_unknown_recurring_value_falls_through() {
        let line = LineItem {
            recurring_interval: Some("week".to_string()),
            ..item("price_anual_x")
        };
        let c = classifier().classify(&line);
        assert_eq!(c.interval, BillingInterval::Yearly);
        assert_eq!(c.interval_signal, IntervalSignal::PriceIdPattern);
    }

    #[test]
    fn test_yearly_pattern_checked_before_monthly() {
        let c = classifier().classify(&item("price_ANNUAL_from_monthly"));
        assert_eq!(c.interval, BillingInterval::Yearly);
    }

    #[test]
    fn test_catalog_lookup_for_opaque_price_ids() {
        let mut catalog_plans = test_catalog().plans().to_vec();
        catalog_plans[3].external_price_id = "price_1QxZ9".to_string();
        let catalog = PlanCatalog::new(catalog_plans).unwrap();
        let c = PlanClassifier::new(Arc::new(catalog)).classify(&item("price_1QxZ9"));
        assert_eq!(c.interval, BillingInterval::Yearly);
        assert_eq!(c.interval_signal, IntervalSignal::CatalogLookup);
        assert_eq!(c.tier, PlanTier::Plus);
        assert_eq!(c.tier_signal, TierSignal::CatalogLookup);
        assert!(!c.is_ambiguous());
    }

    #[test]
    fn test_defaults_are_flagged_ambiguous() {
        let c = classifier().classify(&item("price_1Opaque"));
        assert_eq!(c.interval, BillingInterval::Monthly);
        assert_eq!(c.tier, PlanTier::Basic);
        assert_eq!(c.interval_signal, IntervalSignal::Default);
        assert_eq!(c.tier_signal, TierSignal::Default);
        assert!(c.is_ambiguous());
    }

    #[test]
    fn test_metadata_beats_substring() {
        let mut metadata = HashMap::new();
        metadata.insert("tier".to_string(), "basic".to_string());
        let line = LineItem {
            metadata,
            ..item("price_mensal_plus")
        };
        let c = classifier().classify(&line);
        assert_eq!(c.tier, PlanTier::Basic);
        assert_eq!(c.tier_signal, TierSignal::Metadata);
    }

    #[test]
    fn test_plan_slug_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("plan".to_string(), "anual-plus".to_string());
        let line = LineItem {
            metadata,
            ..item("price_1Opaque")
        };
        let c = classifier().classify(&line);
        assert_eq!(c.tier, PlanTier::Plus);
        assert_eq!(c.tier_signal, TierSignal::Metadata);
    }

    #[test]
    fn test_plus_in_nickname_or_product_name() {
        let by_nickname = LineItem {
            price_nickname: Some("Leitor PLUS".to_string()),
            ..item("price_1Opaque")
        };
        assert_eq!(classifier().classify(&by_nickname).tier, PlanTier::Plus);

        let by_product = LineItem {
            product_name: Some("Biblioteca Plus".to_string()),
            ..item("price_1Opaque")
        };
        let c = classifier().classify(&by_product);
        assert_eq!(c.tier, PlanTier::Plus);
        assert_eq!(c.tier_signal, TierSignal::PlusSubstring);
    }

    #[test]
    fn test_missing_price_defaults_both() {
        let c = classifier().classify(&LineItem::default());
        assert!(c.is_ambiguous());
        assert_eq!(c.plan_key(), PlanKey::MONTHLY_BASIC);
    }
}
