//! Reconciliation engine
//!
//! Converges the local subscription records of one user onto the state held
//! by the billing provider. Every entry point re-fetches the full set of the
//! customer's subscriptions, so notifications only act as triggers and their
//! delivery order does not matter.
//!
//! ## Algorithm
//!
//! 1. List every external subscription of the customer (all statuses).
//! 2. None: cancel the user's non-terminal local records, report `NoSubscription`.
//! 3. Pick the authoritative subscription: `active` first, then other
//!    non-terminal statuses, then terminal ones; newest `created` breaks ties.
//! 4. Classify its plan.
//! 5. Upsert it keyed on `(user_id, external_subscription_id)`, then cancel
//!    any other non-terminal local record of the user.
//!
//! A gateway failure aborts before any local write.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sefer_shared::{SubscriptionRecord, SubscriptionStatus, UserId};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::classifier::{Classification, PlanClassifier};
use crate::config::EngineConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{record_event, ActorType, AuditLog, BillingEventBuilder, BillingEventType};
use crate::gateway::{BillingGateway, ExternalSubscription, LineItem, StatusFilter};
use crate::profiles::{require_customer, ProfileDirectory};
use crate::store::SubscriptionStore;

/// Result of a reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Canonical(SubscriptionRecord),
    NoSubscription,
}

impl ReconcileOutcome {
    pub fn record(&self) -> Option<&SubscriptionRecord> {
        match self {
            Self::Canonical(record) => Some(record),
            Self::NoSubscription => None,
        }
    }
}

/// Who asked for the pass, for the audit trail
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub actor: ActorType,
    pub external_event_id: Option<String>,
}

impl Default for ReconcileContext {
    fn default() -> Self {
        Self {
            actor: ActorType::System,
            external_event_id: None,
        }
    }
}

impl ReconcileContext {
    pub fn for_event(event_id: impl Into<String>) -> Self {
        Self {
            actor: ActorType::BillingProvider,
            external_event_id: Some(event_id.into()),
        }
    }

    pub fn for_actor(actor: ActorType) -> Self {
        Self {
            actor,
            external_event_id: None,
        }
    }

    fn event(&self, user_id: UserId, event_type: BillingEventType) -> BillingEventBuilder {
        let builder = BillingEventBuilder::new(user_id, event_type).actor_type(self.actor);
        match &self.external_event_id {
            Some(event_id) => builder.external_event(event_id.clone()),
            None => builder,
        }
    }
}

/// Per-user result of a bulk re-sync
#[derive(Debug, Clone)]
pub enum ResyncResult {
    Synced {
        user_id: UserId,
        external_subscription_id: String,
        status: SubscriptionStatus,
    },
    NoSubscription {
        user_id: UserId,
    },
    Error {
        user_id: UserId,
        customer_id: String,
        error: String,
        retryable: bool,
    },
}

fn authority_rank(status: SubscriptionStatus) -> u8 {
    match status {
        SubscriptionStatus::Active => 2,
        s if s.is_non_terminal() => 1,
        _ => 0,
    }
}

/// The subscription that speaks for the customer.
/// Ties on status rank go to the newest, then to the greatest id.
pub fn select_authoritative(subscriptions: &[ExternalSubscription]) -> Option<&ExternalSubscription> {
    subscriptions.iter().max_by(|a, b| {
        authority_rank(a.status)
            .cmp(&authority_rank(b.status))
            .then(a.created.cmp(&b.created))
            .then(a.id.cmp(&b.id))
    })
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    gateway: Arc<dyn BillingGateway>,
    store: Arc<dyn SubscriptionStore>,
    profiles: Arc<dyn ProfileDirectory>,
    audit: Arc<dyn AuditLog>,
    catalog: Arc<PlanCatalog>,
    classifier: PlanClassifier,
    config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(
        gateway: Arc<dyn BillingGateway>,
        store: Arc<dyn SubscriptionStore>,
        profiles: Arc<dyn ProfileDirectory>,
        audit: Arc<dyn AuditLog>,
        catalog: Arc<PlanCatalog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            classifier: PlanClassifier::new(catalog.clone()),
            gateway,
            store,
            profiles,
            audit,
            catalog,
            config,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn BillingGateway> {
        &self.gateway
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileDirectory> {
        &self.profiles
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn catalog(&self) -> &Arc<PlanCatalog> {
        &self.catalog
    }

    pub fn classifier(&self) -> &PlanClassifier {
        &self.classifier
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Converge the user's local state onto the provider's
    pub async fn reconcile(
        &self,
        user_id: UserId,
        customer_id: &str,
    ) -> BillingResult<ReconcileOutcome> {
        self.reconcile_with(user_id, customer_id, &ReconcileContext::default())
            .await
    }

    pub async fn reconcile_with(
        &self,
        user_id: UserId,
        customer_id: &str,
        ctx: &ReconcileContext,
    ) -> BillingResult<ReconcileOutcome> {
        self.converge(user_id, customer_id, None, ctx).await
    }

    /// Reconcile a user by id, resolving the customer through the profile store
    pub async fn reconcile_user(&self, user_id: UserId) -> BillingResult<ReconcileOutcome> {
        let customer_id = self
            .config
            .bounded(
                "customer_for_user",
                require_customer(self.profiles.as_ref(), user_id),
            )
            .await?;
        self.reconcile(user_id, &customer_id).await
    }

    /// Same as [`reconcile_with`](Self::reconcile_with), but the named
    /// subscription counts as canceled whatever the listing says. Used for
    /// deletion notifications, which are terminal at the provider.
    pub async fn reconcile_with_cancellation(
        &self,
        user_id: UserId,
        customer_id: &str,
        deleted_subscription_id: &str,
        ctx: &ReconcileContext,
    ) -> BillingResult<ReconcileOutcome> {
        self.converge(user_id, customer_id, Some(deleted_subscription_id), ctx)
            .await
    }

    /// Reconcile every profile with a billing customer.
    /// One user's failure does not stop the batch.
    pub async fn resync_all(&self) -> BillingResult<Vec<ResyncResult>> {
        let profiles = self
            .config
            .bounded("list_billable", self.profiles.list_billable())
            .await?;

        tracing::info!(count = profiles.len(), "Starting bulk subscription re-sync");

        let ctx = ReconcileContext::default();
        let mut results = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let result = match self
                .reconcile_with(profile.user_id, &profile.external_customer_id, &ctx)
                .await
            {
                Ok(ReconcileOutcome::Canonical(record)) => ResyncResult::Synced {
                    user_id: profile.user_id,
                    external_subscription_id: record.external_subscription_id,
                    status: record.status,
                },
                Ok(ReconcileOutcome::NoSubscription) => ResyncResult::NoSubscription {
                    user_id: profile.user_id,
                },
                Err(e) => {
                    tracing::error!(
                        user_id = %profile.user_id,
                        customer_id = %profile.external_customer_id,
                        error = %e,
                        "Re-sync failed for user"
                    );
                    ResyncResult::Error {
                        user_id: profile.user_id,
                        customer_id: profile.external_customer_id,
                        retryable: e.is_retryable(),
                        error: e.to_string(),
                    }
                }
            };
            results.push(result);
        }

        Ok(results)
    }

    /// List the customer's subscriptions under the call timeout
    pub async fn fetch_external(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ExternalSubscription>> {
        self.config
            .bounded(
                "list_by_customer",
                self.gateway.list_by_customer(customer_id, StatusFilter::All),
            )
            .await
    }

    /// Classify a subscription's plan; a subscription without items classifies on defaults
    pub fn classify(&self, subscription: &ExternalSubscription) -> Classification {
        match &subscription.line_item {
            Some(item) => self.classifier.classify(item),
            None => self.classifier.classify(&LineItem::default()),
        }
    }

    async fn converge(
        &self,
        user_id: UserId,
        customer_id: &str,
        forced_cancel: Option<&str>,
        ctx: &ReconcileContext,
    ) -> BillingResult<ReconcileOutcome> {
        let mut external = self.fetch_external(customer_id).await?;

        if let Some(deleted_id) = forced_cancel {
            for subscription in external.iter_mut().filter(|s| s.id == deleted_id) {
                subscription.status = SubscriptionStatus::Canceled;
            }
        }

        let now = OffsetDateTime::now_utc();

        let Some(authoritative) = select_authoritative(&external) else {
            return self.cancel_all_local(user_id, customer_id, now, ctx).await;
        };

        let live: Vec<&ExternalSubscription> = external
            .iter()
            .filter(|s| s.status.is_non_terminal())
            .collect();
        if live.len() > 1 {
            let live_ids: Vec<&str> = live.iter().map(|s| s.id.as_str()).collect();
            tracing::warn!(
                user_id = %user_id,
                customer_id = %customer_id,
                live_subscriptions = ?live_ids,
                kept = %authoritative.id,
                "Duplicate live subscriptions detected"
            );
            record_event(
                self.audit.as_ref(),
                ctx.event(user_id, BillingEventType::DuplicateSubscriptionDetected)
                    .external_customer(customer_id)
                    .external_subscription(authoritative.id.clone())
                    .data(serde_json::json!({
                        "live_subscriptions": live_ids,
                        "kept": authoritative.id,
                    })),
            )
            .await;
        }

        let classification = self.classify(authoritative);
        if classification.is_ambiguous() {
            let item = authoritative.line_item.clone().unwrap_or_default();
            record_event(
                self.audit.as_ref(),
                ctx.event(user_id, BillingEventType::ClassificationAmbiguous)
                    .external_subscription(authoritative.id.clone())
                    .data(serde_json::json!({
                        "price_id": item.price_id,
                        "recurring_interval": item.recurring_interval,
                        "price_nickname": item.price_nickname,
                        "product_name": item.product_name,
                        "metadata": item.metadata,
                        "tier": classification.tier,
                        "interval": classification.interval,
                        "tier_signal": classification.tier_signal,
                        "interval_signal": classification.interval_signal,
                    })),
            )
            .await;
        }

        let existing = self
            .config
            .bounded(
                "find_by_external_id",
                self.store.find_by_external_id(&authoritative.id),
            )
            .await?;

        if let Some(previous) = &existing {
            if previous.user_id != user_id {
                tracing::error!(
                    user_id = %user_id,
                    owner = %previous.user_id,
                    subscription_id = %authoritative.id,
                    "Subscription is already recorded for another user"
                );
                return Err(BillingError::Internal(format!(
                    "Subscription {} belongs to another user",
                    authoritative.id
                )));
            }
            self.note_period_correction(previous, authoritative, ctx).await;
        }

        let record = SubscriptionRecord {
            id: existing.as_ref().map(|r| r.id).unwrap_or_else(Uuid::new_v4),
            user_id,
            external_subscription_id: authoritative.id.clone(),
            status: authoritative.status,
            plan_tier: classification.tier,
            billing_interval: classification.interval,
            external_price_id: authoritative
                .line_item
                .as_ref()
                .and_then(|item| item.price_id.clone()),
            current_period_start: authoritative.current_period_start,
            current_period_end: authoritative.current_period_end,
            cancel_at_period_end: authoritative.cancel_at_period_end,
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };

        let written = self
            .config
            .bounded("upsert_subscription", self.store.upsert_subscription(&record))
            .await?;

        let superseded = self
            .config
            .bounded(
                "cancel_active_except",
                self.store
                    .cancel_active_except(user_id, Some(&authoritative.id), now),
            )
            .await?;
        for old in &superseded {
            tracing::info!(
                user_id = %user_id,
                superseded = %old.external_subscription_id,
                kept = %authoritative.id,
                "Canceled superseded local subscription"
            );
            record_event(
                self.audit.as_ref(),
                ctx.event(user_id, BillingEventType::SubscriptionSuperseded)
                    .external_subscription(old.external_subscription_id.clone())
                    .data(serde_json::json!({
                        "kept": authoritative.id,
                    })),
            )
            .await;
        }

        let changed = existing
            .as_ref()
            .map_or(true, |previous| !previous.same_state_as(&written));
        if changed {
            record_event(
                self.audit.as_ref(),
                ctx.event(user_id, BillingEventType::SubscriptionSynced)
                    .external_customer(customer_id)
                    .external_subscription(written.external_subscription_id.clone())
                    .data(serde_json::json!({
                        "status": written.status,
                        "plan_tier": written.plan_tier,
                        "billing_interval": written.billing_interval,
                        "tier_signal": classification.tier_signal,
                        "interval_signal": classification.interval_signal,
                        "previous_status": existing.as_ref().map(|r| r.status),
                    })),
            )
            .await;
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %written.external_subscription_id,
            status = %written.status,
            tier = %written.plan_tier,
            interval = %written.billing_interval,
            superseded = superseded.len(),
            changed = changed,
            "Reconciled subscription"
        );

        Ok(ReconcileOutcome::Canonical(written))
    }

    async fn cancel_all_local(
        &self,
        user_id: UserId,
        customer_id: &str,
        now: OffsetDateTime,
        ctx: &ReconcileContext,
    ) -> BillingResult<ReconcileOutcome> {
        let canceled = self
            .config
            .bounded(
                "cancel_active_except",
                self.store.cancel_active_except(user_id, None, now),
            )
            .await?;

        for record in &canceled {
            record_event(
                self.audit.as_ref(),
                ctx.event(user_id, BillingEventType::SubscriptionCanceled)
                    .external_customer(customer_id)
                    .external_subscription(record.external_subscription_id.clone())
                    .data(serde_json::json!({
                        "reason": "no_external_subscription",
                    })),
            )
            .await;
        }

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer_id,
            canceled = canceled.len(),
            "No external subscription; local records canceled"
        );

        Ok(ReconcileOutcome::NoSubscription)
    }

    /// A shrinking period end is a provider correction: accepted, but logged
    async fn note_period_correction(
        &self,
        previous: &SubscriptionRecord,
        current: &ExternalSubscription,
        ctx: &ReconcileContext,
    ) {
        if let (Some(old_end), Some(new_end)) =
            (previous.current_period_end, current.current_period_end)
        {
            if new_end < old_end {
                tracing::warn!(
                    user_id = %previous.user_id,
                    subscription_id = %current.id,
                    old_period_end = %old_end,
                    new_period_end = %new_end,
                    "Billing provider moved period end backwards"
                );
                record_event(
                    self.audit.as_ref(),
                    ctx.event(previous.user_id, BillingEventType::PeriodEndCorrected)
                        .external_subscription(current.id.clone())
                        .data(serde_json::json!({
                            "old_period_end": old_end.unix_timestamp(),
                            "new_period_end": new_end.unix_timestamp(),
                        })),
                )
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_catalog;
    use crate::memory::{
        external_subscription, InMemoryAuditLog, InMemoryGateway, InMemoryProfiles,
        InMemorySubscriptionStore,
    };
    use sefer_shared::{BillingInterval, PlanTier};
    use std::time::Duration;

    struct Harness {
        engine: ReconciliationEngine,
        gateway: Arc<InMemoryGateway>,
        store: Arc<InMemorySubscriptionStore>,
        audit: Arc<InMemoryAuditLog>,
        user_id: UserId,
    }

    fn harness() -> Harness {
        let gateway = Arc::new(InMemoryGateway::new());
        let store = Arc::new(InMemorySubscriptionStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let user_id = UserId::new();
        let profiles = Arc::new(InMemoryProfiles::new().with_profile(user_id, "cus_1"));

        let engine = ReconciliationEngine::new(
            gateway.clone(),
            store.clone(),
            profiles,
            audit.clone(),
            Arc::new(test_catalog()),
            EngineConfig::default(),
        );
        Harness {
            engine,
            gateway,
            store,
            audit,
            user_id,
        }
    }

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    #[test]
    fn test_select_prefers_active_then_newest() {
        let old_active = external_subscription("sub_a", "cus_1", SubscriptionStatus::Active, "price_mensal_basico", at(0));
        let new_incomplete = external_subscription("sub_b", "cus_1", SubscriptionStatus::Incomplete, "price_mensal_plus", at(100));
        let newest_canceled = external_subscription("sub_c", "cus_1", SubscriptionStatus::Canceled, "price_anual_plus", at(200));
        let subs = vec![old_active, new_incomplete, newest_canceled];
        assert_eq!(select_authoritative(&subs).map(|s| s.id.as_str()), Some("sub_a"));

        let subs = vec![
            external_subscription("sub_a", "cus_1", SubscriptionStatus::Active, "price_mensal_basico", at(0)),
            external_subscription("sub_b", "cus_1", SubscriptionStatus::Active, "price_mensal_plus", at(100)),
        ];
        assert_eq!(select_authoritative(&subs).map(|s| s.id.as_str()), Some("sub_b"));
        assert!(select_authoritative(&[]).is_none());
    }

    #[test]
    fn test_select_terminal_only_picks_newest() {
        let subs = vec![
            external_subscription("sub_a", "cus_1", SubscriptionStatus::Canceled, "price_mensal_basico", at(50)),
            external_subscription("sub_b", "cus_1", SubscriptionStatus::IncompleteExpired, "price_mensal_plus", at(10)),
        ];
        assert_eq!(select_authoritative(&subs).map(|s| s.id.as_str()), Some("sub_a"));
    }

    #[tokio::test]
    async fn test_reconcile_creates_record() {
        let h = harness();
        h.gateway
            .insert(external_subscription("sub_1", "cus_1", SubscriptionStatus::Active, "price_anual_plus", at(0)))
            .await;

        let outcome = h.engine.reconcile(h.user_id, "cus_1").await.unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record.external_subscription_id, "sub_1");
        assert_eq!(record.plan_tier, PlanTier::Plus);
        assert_eq!(record.billing_interval, BillingInterval::Yearly);
        assert_eq!(record.external_price_id.as_deref(), Some("price_anual_plus"));
        assert_eq!(h.audit.count(BillingEventType::SubscriptionSynced).await, 1);
    }

    #[tokio::test]
    async fn test_reconcile_user_requires_profile() {
        let h = harness();
        let result = h.engine.reconcile_user(UserId::new()).await;
        assert!(matches!(result, Err(BillingError::ProfileNotFound(_))));
    }

    #[tokio::test]
    async fn test_gateway_outage_leaves_store_untouched() {
        let h = harness();
        h.gateway
            .insert(external_subscription("sub_1", "cus_1", SubscriptionStatus::Active, "price_mensal_plus", at(0)))
            .await;
        h.gateway.set_unavailable(true).await;

        let result = h.engine.reconcile(h.user_id, "cus_1").await;
        assert!(matches!(result, Err(BillingError::GatewayUnavailable(_))));
        assert_eq!(h.store.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_gateway_timeout_is_unavailable() {
        let h = harness();
        let engine = ReconciliationEngine::new(
            h.gateway.clone(),
            h.store.clone(),
            h.engine.profiles().clone(),
            h.audit.clone(),
            Arc::new(test_catalog()),
            EngineConfig::default().with_call_timeout(Duration::from_millis(20)),
        );
        h.gateway.set_delay(Some(Duration::from_millis(500))).await;

        let result = engine.reconcile(h.user_id, "cus_1").await;
        assert!(matches!(result, Err(BillingError::GatewayUnavailable(_))));
        assert_eq!(h.store.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_ambiguous_classification_is_audited() {
        let h = harness();
        h.gateway
            .insert(external_subscription("sub_1", "cus_1", SubscriptionStatus::Active, "price_1Opaque", at(0)))
            .await;

        let outcome = h.engine.reconcile(h.user_id, "cus_1").await.unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record.plan_tier, PlanTier::Basic);
        assert_eq!(record.billing_interval, BillingInterval::Monthly);
        assert_eq!(h.audit.count(BillingEventType::ClassificationAmbiguous).await, 1);
    }

    #[tokio::test]
    async fn test_period_end_decrease_is_accepted() {
        let h = harness();
        let mut sub = external_subscription("sub_1", "cus_1", SubscriptionStatus::Active, "price_mensal_plus", at(0));
        sub.current_period_end = Some(at(60 * 86_400));
        h.gateway.insert(sub.clone()).await;
        h.engine.reconcile(h.user_id, "cus_1").await.unwrap();

        sub.current_period_end = Some(at(30 * 86_400));
        h.gateway.insert(sub).await;
        let outcome = h.engine.reconcile(h.user_id, "cus_1").await.unwrap();

        assert_eq!(outcome.record().unwrap().current_period_end, Some(at(30 * 86_400)));
        assert_eq!(h.audit.count(BillingEventType::PeriodEndCorrected).await, 1);
    }

    #[tokio::test]
    async fn test_forced_cancellation_overrides_listing() {
        let h = harness();
        h.gateway
            .insert(external_subscription("sub_1", "cus_1", SubscriptionStatus::Active, "price_mensal_plus", at(0)))
            .await;
        h.engine.reconcile(h.user_id, "cus_1").await.unwrap();

        let outcome = h
            .engine
            .reconcile_with_cancellation(h.user_id, "cus_1", "sub_1", &ReconcileContext::for_event("evt_1"))
            .await
            .unwrap();
        assert_eq!(outcome.record().unwrap().status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_resync_all_reports_each_user() {
        let h = harness();
        h.gateway
            .insert(external_subscription("sub_1", "cus_1", SubscriptionStatus::Active, "price_mensal_plus", at(0)))
            .await;

        let results = h.engine.resync_all().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            &results[0],
            ResyncResult::Synced { external_subscription_id, .. } if external_subscription_id == "sub_1"
        ));
    }
}
