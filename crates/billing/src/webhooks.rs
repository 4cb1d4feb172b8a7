//! Billing provider notifications
//!
//! Notifications are triggers only: subscription and invoice events cause a
//! full reconciliation of the customer, which re-reads the provider's state.
//! The single exception is `invoice.payment_failed`, applied locally as a
//! fast `past_due` transition without calling the provider. A failure created
//! before the local record was last written is ignored.
//!
//! Signature verification happens in the transport in front of this module.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{record_event, ActorType, BillingEventBuilder, BillingEventType};
use crate::ledger::{ClaimOutcome, EventLedger, ProcessingResult};
use crate::profiles::require_user;
use crate::reconcile::{ReconcileContext, ReconcileOutcome, ReconciliationEngine};

/// Provider notification envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds
    #[serde(default)]
    pub created: Option<i64>,
    pub data: NotificationData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationData {
    pub object: serde_json::Value,
}

impl Notification {
    pub fn created_at(&self) -> Option<OffsetDateTime> {
        self.created
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
    }

    fn customer_id(&self) -> Option<String> {
        id_field(self.data.object.get("customer"))
    }

    /// Subscription id: the object itself for subscription events, the
    /// referenced subscription for invoices.
    fn subscription_id(&self, kind: EventKind) -> Option<String> {
        let object = &self.data.object;
        match kind {
            EventKind::SubscriptionChanged | EventKind::SubscriptionDeleted => {
                id_field(object.get("id"))
            }
            _ => id_field(object.get("subscription")).or_else(|| {
                id_field(
                    object
                        .pointer("/parent/subscription_details/subscription"),
                )
            }),
        }
    }
}

/// A reference that is either a bare id or an expanded object carrying one
fn id_field(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Object(map) => map
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionChanged,
    SubscriptionDeleted,
    PaymentSucceeded,
    PaymentFailed,
    Unknown,
}

impl EventKind {
    /// Map a provider event type; the `customer.` prefix is optional
    pub fn from_event_type(event_type: &str) -> Self {
        let name = event_type.strip_prefix("customer.").unwrap_or(event_type);
        match name {
            "subscription.created" | "subscription.updated" => Self::SubscriptionChanged,
            "subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" | "invoice.paid" => Self::PaymentSucceeded,
            "invoice.payment_failed" => Self::PaymentFailed,
            _ => Self::Unknown,
        }
    }
}

/// Answer for the transport: `Ack` maps to 2xx, `Reject` to 4xx.
/// Infrastructure faults are returned as `Err` so the provider redelivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    Ack,
    Reject(String),
}

enum Handled {
    Applied,
    Ignored,
}

/// Entry point for provider notifications
#[derive(Clone)]
pub struct EventIngress {
    engine: ReconciliationEngine,
    ledger: Arc<dyn EventLedger>,
}

impl EventIngress {
    pub fn new(engine: ReconciliationEngine, ledger: Arc<dyn EventLedger>) -> Self {
        Self { engine, ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn EventLedger> {
        &self.ledger
    }

    /// Parse a raw (already verified) body and handle it
    pub async fn handle_payload(&self, payload: &[u8]) -> BillingResult<IngressOutcome> {
        let notification: Notification = match serde_json::from_slice(payload) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected unparseable billing notification");
                return Ok(IngressOutcome::Reject(format!("invalid payload: {}", e)));
            }
        };
        self.handle(notification).await
    }

    /// Handle one delivery. Repeated deliveries of an event that already
    /// finished are acknowledged without reprocessing.
    pub async fn handle(&self, notification: Notification) -> BillingResult<IngressOutcome> {
        let config = self.engine.config();
        let claim = config
            .bounded(
                "claim_event",
                self.ledger.claim(
                    &notification.id,
                    &notification.event_type,
                    notification.created_at(),
                    config.stale_claim_after,
                ),
            )
            .await?;

        if let ClaimOutcome::Duplicate(previous) = claim {
            tracing::info!(
                event_id = %notification.id,
                event_type = %notification.event_type,
                previous_result = %previous,
                "Duplicate billing notification acknowledged"
            );
            return Ok(IngressOutcome::Ack);
        }

        self.process_claimed(&notification, ActorType::BillingProvider).await
    }

    /// Re-process an event regardless of its ledger state (operator action)
    pub async fn replay(&self, notification: Notification) -> BillingResult<IngressOutcome> {
        let existing = self
            .engine
            .config()
            .bounded("get_event", self.ledger.get(&notification.id))
            .await?;

        tracing::info!(
            event_id = %notification.id,
            event_type = %notification.event_type,
            previous_result = ?existing.as_ref().map(|e| e.processing_result),
            "Replaying billing notification"
        );

        if existing.is_none() {
            let config = self.engine.config();
            config
                .bounded(
                    "claim_event",
                    self.ledger.claim(
                        &notification.id,
                        &notification.event_type,
                        notification.created_at(),
                        config.stale_claim_after,
                    ),
                )
                .await?;
        }

        self.process_claimed(&notification, ActorType::Operator).await
    }

    async fn process_claimed(
        &self,
        notification: &Notification,
        actor: ActorType,
    ) -> BillingResult<IngressOutcome> {
        match self.dispatch(notification, actor).await {
            Ok(Handled::Applied) => {
                self.finish(notification, ProcessingResult::Success, None).await;
                Ok(IngressOutcome::Ack)
            }
            Ok(Handled::Ignored) => {
                self.finish(notification, ProcessingResult::Ignored, None).await;
                Ok(IngressOutcome::Ack)
            }
            Err(e @ (BillingError::InvalidPayload(_)
            | BillingError::ProfileNotFound(_)
            | BillingError::NotFound(_)
            | BillingError::InvalidRequest(_))) => {
                let reason = e.to_string();
                tracing::warn!(
                    event_id = %notification.id,
                    event_type = %notification.event_type,
                    reason = %reason,
                    "Rejected billing notification"
                );
                self.finish(notification, ProcessingResult::Rejected, Some(&reason))
                    .await;
                Ok(IngressOutcome::Reject(reason))
            }
            Err(e) => {
                tracing::error!(
                    event_id = %notification.id,
                    event_type = %notification.event_type,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Failed to process billing notification"
                );
                self.finish(notification, ProcessingResult::Error, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, notification: &Notification, actor: ActorType) -> BillingResult<Handled> {
        let kind = EventKind::from_event_type(&notification.event_type);
        let ctx = ReconcileContext {
            actor,
            ..ReconcileContext::for_event(notification.id.clone())
        };

        match kind {
            EventKind::SubscriptionChanged | EventKind::PaymentSucceeded => {
                let customer_id = require_field(notification.customer_id(), notification, "customer")?;
                let user_id = self.resolve_user(&customer_id).await?;
                let outcome = self
                    .engine
                    .reconcile_with(user_id, &customer_id, &ctx)
                    .await?;
                log_outcome(notification, &outcome);
                Ok(Handled::Applied)
            }
            EventKind::SubscriptionDeleted => {
                let customer_id = require_field(notification.customer_id(), notification, "customer")?;
                let subscription_id =
                    require_field(notification.subscription_id(kind), notification, "subscription")?;
                let user_id = self.resolve_user(&customer_id).await?;
                let outcome = self
                    .engine
                    .reconcile_with_cancellation(user_id, &customer_id, &subscription_id, &ctx)
                    .await?;
                log_outcome(notification, &outcome);
                Ok(Handled::Applied)
            }
            EventKind::PaymentFailed => {
                let subscription_id =
                    require_field(notification.subscription_id(kind), notification, "subscription")?;
                self.apply_payment_failure(notification, &subscription_id, actor).await
            }
            EventKind::Unknown => {
                tracing::info!(
                    event_id = %notification.id,
                    event_type = %notification.event_type,
                    "Ignoring unhandled billing notification type"
                );
                Ok(Handled::Ignored)
            }
        }
    }

    async fn resolve_user(&self, customer_id: &str) -> BillingResult<sefer_shared::UserId> {
        self.engine
            .config()
            .bounded(
                "user_for_customer",
                require_user(self.engine.profiles().as_ref(), customer_id),
            )
            .await
    }

    /// Local-only transition to `past_due`; periods stay as they are.
    /// A failure older than the stored record is ignored.
    async fn apply_payment_failure(
        &self,
        notification: &Notification,
        subscription_id: &str,
        actor: ActorType,
    ) -> BillingResult<Handled> {
        // Provider clock ahead of ours must not block later reconciles
        let now = OffsetDateTime::now_utc();
        let at = notification.created_at().map_or(now, |created| created.min(now));
        let updated = self
            .engine
            .config()
            .bounded(
                "mark_past_due",
                self.engine.store().mark_past_due(subscription_id, at),
            )
            .await?;

        let Some(record) = updated else {
            let current = self
                .engine
                .config()
                .bounded(
                    "find_by_external_id",
                    self.engine.store().find_by_external_id(subscription_id),
                )
                .await?;
            if let Some(current) = current.filter(|r| r.status.grants_access()) {
                tracing::info!(
                    event_id = %notification.id,
                    subscription_id = %subscription_id,
                    event_at = %at,
                    record_updated_at = %current.updated_at,
                    "Ignoring payment failure older than the local record"
                );
                return Ok(Handled::Ignored);
            }
            tracing::info!(
                event_id = %notification.id,
                subscription_id = %subscription_id,
                "Payment failure for subscription without an active local record"
            );
            return Ok(Handled::Applied);
        };

        tracing::warn!(
            event_id = %notification.id,
            user_id = %record.user_id,
            subscription_id = %subscription_id,
            "Subscription moved to past_due after failed payment"
        );
        record_event(
            self.engine.audit().as_ref(),
            BillingEventBuilder::new(record.user_id, BillingEventType::PaymentFailed)
                .actor_type(actor)
                .external_event(notification.id.clone())
                .external_subscription(subscription_id)
                .data(serde_json::json!({
                    "amount_due": notification.data.object.get("amount_due"),
                    "attempt_count": notification.data.object.get("attempt_count"),
                })),
        )
        .await;
        Ok(Handled::Applied)
    }

    async fn finish(
        &self,
        notification: &Notification,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) {
        // A stuck claim is reclaimed after the stale window, so this only logs
        if let Err(e) = self
            .ledger
            .finish(&notification.id, result, error_message)
            .await
        {
            tracing::error!(
                event_id = %notification.id,
                result = %result,
                error = %e,
                "Failed to record notification result"
            );
        }
    }
}

fn require_field(
    value: Option<String>,
    notification: &Notification,
    field: &str,
) -> BillingResult<String> {
    value.ok_or_else(|| {
        BillingError::InvalidPayload(format!(
            "{} event {} has no {} id",
            notification.event_type, notification.id, field
        ))
    })
}

fn log_outcome(notification: &Notification, outcome: &ReconcileOutcome) {
    tracing::info!(
        event_id = %notification.id,
        event_type = %notification.event_type,
        subscription_id = ?outcome.record().map(|r| r.external_subscription_id.as_str()),
        status = ?outcome.record().map(|r| r.status),
        "Billing notification reconciled"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(event_type: &str, object: serde_json::Value) -> Notification {
        Notification {
            id: "evt_1".to_string(),
            event_type: event_type.to_string(),
            created: Some(1_700_000_000),
            data: NotificationData { object },
        }
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(
            EventKind::from_event_type("customer.subscription.updated"),
            EventKind::SubscriptionChanged
        );
        assert_eq!(
            EventKind::from_event_type("subscription.created"),
            EventKind::SubscriptionChanged
        );
        assert_eq!(
            EventKind::from_event_type("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(EventKind::from_event_type("invoice.paid"), EventKind::PaymentSucceeded);
        assert_eq!(
            EventKind::from_event_type("invoice.payment_failed"),
            EventKind::PaymentFailed
        );
        assert_eq!(EventKind::from_event_type("charge.refunded"), EventKind::Unknown);
    }

    #[test]
    fn test_ids_from_subscription_object() {
        let n = notification(
            "customer.subscription.deleted",
            json!({ "id": "sub_1", "customer": "cus_1" }),
        );
        assert_eq!(n.customer_id().as_deref(), Some("cus_1"));
        assert_eq!(
            n.subscription_id(EventKind::SubscriptionDeleted).as_deref(),
            Some("sub_1")
        );
    }

    #[test]
    fn test_ids_from_invoice_object() {
        let n = notification(
            "invoice.payment_failed",
            json!({ "id": "in_1", "customer": { "id": "cus_1" }, "subscription": "sub_1" }),
        );
        assert_eq!(n.customer_id().as_deref(), Some("cus_1"));
        assert_eq!(n.subscription_id(EventKind::PaymentFailed).as_deref(), Some("sub_1"));

        let nested = notification(
            "invoice.payment_failed",
            json!({
                "id": "in_2",
                "customer": "cus_1",
                "parent": { "subscription_details": { "subscription": "sub_2" } }
            }),
        );
        assert_eq!(
            nested.subscription_id(EventKind::PaymentFailed).as_deref(),
            Some("sub_2")
        );
    }

    #[test]
    fn test_missing_ids() {
        let n = notification("invoice.paid", json!({ "id": "in_1", "customer": "" }));
        assert_eq!(n.customer_id(), None);
        assert_eq!(n.subscription_id(EventKind::PaymentSucceeded), None);
    }

    #[test]
    fn test_envelope_parses() {
        let raw = br#"{"id":"evt_9","type":"invoice.paid","created":1700000000,"data":{"object":{"customer":"cus_1"}}}"#;
        let n: Notification = serde_json::from_slice(raw).unwrap();
        assert_eq!(n.event_type, "invoice.paid");
        assert_eq!(n.created_at().map(|t| t.unix_timestamp()), Some(1_700_000_000));
    }
}
