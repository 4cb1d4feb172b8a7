//! Plan changes initiated by the reader
//!
//! Upgrades and renewals mutate the billing provider and then hand over to the
//! reconciliation engine; this module never writes the local store itself.
//! A failed reconciliation after a successful provider mutation is reported
//! (`reconciled: false`) rather than rolled back, since the next notification
//! or scheduled re-sync converges the local state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sefer_shared::{SubscriptionRecord, SubscriptionStatus, UserId};

use crate::catalog::{PlanCatalog, PlanKey};
use crate::error::{BillingError, BillingResult};
use crate::events::{record_event, ActorType, BillingEventBuilder, BillingEventType};
use crate::gateway::{ExternalSubscription, ProrationPolicy, ProrationQuote};
use crate::profiles::require_customer;
use crate::reconcile::{select_authoritative, ReconcileContext, ReconciliationEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// No live subscription: a new one is created
    Renewal,
    /// The live subscription's price is swapped for a higher plan
    Upgrade,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Renewal => write!(f, "renewal"),
            Self::Upgrade => write!(f, "upgrade"),
        }
    }
}

/// Result of [`SubscriptionOrchestrator::change_plan`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanChange {
    pub kind: ChangeKind,
    pub external_subscription_id: String,
    pub from: Option<PlanKey>,
    pub to: PlanKey,
    pub proration: Option<ProrationQuote>,
    /// False when the provider accepted the change but the local pass failed
    pub reconciled: bool,
    pub record: Option<SubscriptionRecord>,
}

/// A plan the reader may move to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOption {
    pub plan: PlanKey,
    pub slug: String,
    pub external_price_id: String,
    pub list_price_cents: i64,
    pub yearly_savings_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeOptions {
    pub current: Option<PlanKey>,
    pub status: Option<SubscriptionStatus>,
    pub external_subscription_id: Option<String>,
    /// True when any plan would start a new subscription
    pub renewal: bool,
    pub options: Vec<PlanOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePreview {
    pub kind: ChangeKind,
    pub from: Option<PlanKey>,
    pub to: PlanKey,
    pub list_price_cents: i64,
    /// Immediate charge for an upgrade; none for a renewal
    pub proration: Option<ProrationQuote>,
    pub yearly_savings_cents: i64,
}

/// Outcome of a cancel or reactivate request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationChange {
    pub external_subscription_id: String,
    pub cancel_at_period_end: bool,
    /// False when the subscription was already in the requested state
    pub mutated: bool,
    pub reconciled: bool,
    pub record: Option<SubscriptionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCleanup {
    pub kept: Option<String>,
    pub canceled: Vec<String>,
    pub reconciled: bool,
}

/// The subscription currently speaking for the customer, if it is still live
fn live_authoritative(external: &[ExternalSubscription]) -> Option<&ExternalSubscription> {
    select_authoritative(external).filter(|s| s.status.is_non_terminal())
}

/// Validate a transition against the upgrade order
pub fn check_transition(from: Option<PlanKey>, to: PlanKey) -> BillingResult<ChangeKind> {
    match from {
        None => Ok(ChangeKind::Renewal),
        Some(current) if current.is_upgrade_to(&to) => Ok(ChangeKind::Upgrade),
        Some(current) => Err(BillingError::InvalidTransition {
            from: current.slug(),
            to: to.slug(),
        }),
    }
}

fn change_metadata(user_id: UserId, target: PlanKey) -> HashMap<String, String> {
    HashMap::from([
        ("user_id".to_string(), user_id.to_string()),
        ("plan".to_string(), target.slug()),
        ("tier".to_string(), target.tier.to_string()),
    ])
}

fn plan_options(catalog: &PlanCatalog, current: Option<PlanKey>) -> Vec<PlanOption> {
    let targets = match current {
        Some(key) => catalog.upgrades_from(key),
        None => catalog.plans().iter().collect(),
    };
    targets
        .into_iter()
        .map(|plan| PlanOption {
            plan: plan.key,
            slug: plan.slug(),
            external_price_id: plan.external_price_id.clone(),
            list_price_cents: plan.list_price_cents,
            yearly_savings_cents: current
                .map(|key| catalog.yearly_savings_cents(key, plan.key))
                .unwrap_or(0),
        })
        .collect()
}

/// Executes reader-initiated subscription changes
#[derive(Clone)]
pub struct SubscriptionOrchestrator {
    engine: ReconciliationEngine,
}

impl SubscriptionOrchestrator {
    pub fn new(engine: ReconciliationEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    /// Move the user to `target`: a renewal when nothing is live, otherwise a
    /// strict upgrade of the live subscription.
    pub async fn change_plan(&self, user_id: UserId, target: PlanKey) -> BillingResult<PlanChange> {
        let (customer_id, external) = self.load(user_id).await?;
        let target_plan = self.engine.catalog().require(target)?;
        let current = live_authoritative(&external);
        let from = current.map(|s| self.engine.classify(s).plan_key());

        let kind = check_transition(from, target).map_err(|e| {
            tracing::warn!(
                user_id = %user_id,
                from = ?from.map(|k| k.slug()),
                to = %target,
                "Rejected plan change"
            );
            e
        })?;

        let keep = current.map(|s| s.id.as_str());
        self.cancel_others(user_id, &external, keep).await?;

        let config = self.engine.config();
        let gateway = self.engine.gateway();
        let metadata = change_metadata(user_id, target);

        let (subscription, proration) = match current {
            Some(current) => {
                let quote = config
                    .bounded(
                        "compute_proration",
                        gateway.compute_proration(&current.id, &target_plan.external_price_id),
                    )
                    .await?;
                let updated = config
                    .bounded(
                        "update_subscription",
                        gateway.update_subscription(
                            &current.id,
                            &target_plan.external_price_id,
                            ProrationPolicy::CreateProrations,
                            metadata,
                        ),
                    )
                    .await?;
                (updated, Some(quote))
            }
            None => {
                let created = config
                    .bounded(
                        "create_subscription",
                        gateway.create_subscription(
                            &customer_id,
                            &target_plan.external_price_id,
                            metadata,
                        ),
                    )
                    .await?;
                (created, None)
            }
        };

        tracing::info!(
            user_id = %user_id,
            kind = %kind,
            subscription_id = %subscription.id,
            from = ?from.map(|k| k.slug()),
            to = %target,
            proration_cents = ?proration.as_ref().map(|q| q.amount_due_cents),
            "Plan change accepted by billing provider"
        );

        let event_type = match kind {
            ChangeKind::Renewal => BillingEventType::SubscriptionRenewed,
            ChangeKind::Upgrade => BillingEventType::PlanChanged,
        };
        record_event(
            self.engine.audit().as_ref(),
            BillingEventBuilder::new(user_id, event_type)
                .actor_type(ActorType::User)
                .external_customer(customer_id.clone())
                .external_subscription(subscription.id.clone())
                .data(serde_json::json!({
                    "from": from.map(|k| k.slug()),
                    "to": target.slug(),
                    "proration_cents": proration.as_ref().map(|q| q.amount_due_cents),
                })),
        )
        .await;

        let (reconciled, record) = self.settle(user_id, &customer_id).await;

        Ok(PlanChange {
            kind,
            external_subscription_id: subscription.id,
            from,
            to: target,
            proration,
            reconciled,
            record,
        })
    }

    /// Current plan and the plans the user may move to
    pub async fn upgrade_options(&self, user_id: UserId) -> BillingResult<UpgradeOptions> {
        let (_, external) = self.load(user_id).await?;
        let current = live_authoritative(&external);
        let current_key = current.map(|s| self.engine.classify(s).plan_key());

        Ok(UpgradeOptions {
            current: current_key,
            status: current.map(|s| s.status),
            external_subscription_id: current.map(|s| s.id.clone()),
            renewal: current.is_none(),
            options: plan_options(self.engine.catalog(), current_key),
        })
    }

    /// Validate a change and price it without mutating anything
    pub async fn preview_change(
        &self,
        user_id: UserId,
        target: PlanKey,
    ) -> BillingResult<ChangePreview> {
        let (_, external) = self.load(user_id).await?;
        let target_plan = self.engine.catalog().require(target)?;
        let current = live_authoritative(&external);
        let from = current.map(|s| self.engine.classify(s).plan_key());
        let kind = check_transition(from, target)?;

        let proration = match current {
            Some(current) => Some(
                self.engine
                    .config()
                    .bounded(
                        "compute_proration",
                        self.engine
                            .gateway()
                            .compute_proration(&current.id, &target_plan.external_price_id),
                    )
                    .await?,
            ),
            None => None,
        };

        Ok(ChangePreview {
            kind,
            from,
            to: target,
            list_price_cents: target_plan.list_price_cents,
            proration,
            yearly_savings_cents: from
                .map(|key| self.engine.catalog().yearly_savings_cents(key, target))
                .unwrap_or(0),
        })
    }

    /// Schedule the live subscription to end with its current period
    pub async fn cancel_subscription(&self, user_id: UserId) -> BillingResult<CancellationChange> {
        self.set_period_end_cancellation(user_id, true).await
    }

    /// Undo a pending period-end cancellation
    pub async fn reactivate_subscription(
        &self,
        user_id: UserId,
    ) -> BillingResult<CancellationChange> {
        self.set_period_end_cancellation(user_id, false).await
    }

    /// Cancel every live subscription except the authoritative one
    pub async fn cleanup_duplicates(&self, user_id: UserId) -> BillingResult<DuplicateCleanup> {
        let (customer_id, external) = self.load(user_id).await?;
        let kept = live_authoritative(&external).map(|s| s.id.clone());
        let canceled = self.cancel_others(user_id, &external, kept.as_deref()).await?;

        if canceled.is_empty() {
            return Ok(DuplicateCleanup {
                kept,
                canceled,
                reconciled: true,
            });
        }

        tracing::info!(
            user_id = %user_id,
            kept = ?kept,
            canceled = ?canceled,
            "Cleaned up duplicate subscriptions"
        );
        let (reconciled, _) = self.settle(user_id, &customer_id).await;

        Ok(DuplicateCleanup {
            kept,
            canceled,
            reconciled,
        })
    }

    async fn load(&self, user_id: UserId) -> BillingResult<(String, Vec<ExternalSubscription>)> {
        let customer_id = self
            .engine
            .config()
            .bounded(
                "customer_for_user",
                require_customer(self.engine.profiles().as_ref(), user_id),
            )
            .await?;
        let external = self.engine.fetch_external(&customer_id).await?;
        Ok((customer_id, external))
    }

    /// Schedule period-end cancellation for every live subscription other than `keep`.
    /// Returns the ids that were changed.
    async fn cancel_others(
        &self,
        user_id: UserId,
        external: &[ExternalSubscription],
        keep: Option<&str>,
    ) -> BillingResult<Vec<String>> {
        let mut canceled = Vec::new();
        for subscription in external.iter().filter(|s| {
            s.status.is_non_terminal() && !s.cancel_at_period_end && keep != Some(s.id.as_str())
        }) {
            self.engine
                .config()
                .bounded(
                    "cancel_at_period_end",
                    self.engine.gateway().cancel_at_period_end(&subscription.id),
                )
                .await?;

            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription.id,
                kept = ?keep,
                "Scheduled cancellation of extra live subscription"
            );
            record_event(
                self.engine.audit().as_ref(),
                BillingEventBuilder::new(user_id, BillingEventType::CancellationScheduled)
                    .actor_type(ActorType::System)
                    .external_subscription(subscription.id.clone())
                    .data(serde_json::json!({
                        "reason": "duplicate_live_subscription",
                        "kept": keep,
                    })),
            )
            .await;
            canceled.push(subscription.id.clone());
        }
        Ok(canceled)
    }

    async fn set_period_end_cancellation(
        &self,
        user_id: UserId,
        cancel: bool,
    ) -> BillingResult<CancellationChange> {
        let (customer_id, external) = self.load(user_id).await?;
        let current = live_authoritative(&external).ok_or_else(|| {
            BillingError::NotFound(format!("No live subscription for user {}", user_id))
        })?;

        let mutated = current.cancel_at_period_end != cancel;
        if mutated {
            let gateway = self.engine.gateway();
            let call = if cancel {
                gateway.cancel_at_period_end(&current.id)
            } else {
                gateway.reactivate(&current.id)
            };
            let operation = if cancel { "cancel_at_period_end" } else { "reactivate" };
            self.engine.config().bounded(operation, call).await?;

            let event_type = if cancel {
                BillingEventType::CancellationScheduled
            } else {
                BillingEventType::SubscriptionReactivated
            };
            record_event(
                self.engine.audit().as_ref(),
                BillingEventBuilder::new(user_id, event_type)
                    .actor_type(ActorType::User)
                    .external_subscription(current.id.clone())
                    .data(serde_json::json!({
                        "current_period_end": current.current_period_end.map(|t| t.unix_timestamp()),
                    })),
            )
            .await;
        } else {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %current.id,
                cancel_at_period_end = cancel,
                "Subscription already in requested state"
            );
        }

        let (reconciled, record) = self.settle(user_id, &customer_id).await;

        Ok(CancellationChange {
            external_subscription_id: current.id.clone(),
            cancel_at_period_end: cancel,
            mutated,
            reconciled,
            record,
        })
    }

    /// Reconcile after a provider mutation; failures are reported, not raised
    async fn settle(&self, user_id: UserId, customer_id: &str) -> (bool, Option<SubscriptionRecord>) {
        match self
            .engine
            .reconcile_with(user_id, customer_id, &ReconcileContext::for_actor(ActorType::User))
            .await
        {
            Ok(outcome) => (true, outcome.record().cloned()),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    customer_id = %customer_id,
                    error = %e,
                    "Provider change applied but reconciliation failed; left for re-sync"
                );
                (false, None)
            }
        }
    }
}
