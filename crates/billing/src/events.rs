//! Billing Events Module
//!
//! Append-only audit trail of everything the reconciliation engine decides.
//! Events answer "why does this reader have this plan?" after the fact:
//! - Subscription lifecycle as mirrored from the provider
//! - Duplicate subscriptions found and superseded
//! - Classifier fallbacks to default tier/interval
//! - Plan changes, cancellations and reactivations requested by readers
//!
//! Writing an event never fails the operation that produced it; callers use
//! [`record_event`] which downgrades failures to a warning.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sefer_shared::UserId;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Reconciliation outcomes
    SubscriptionSynced,
    SubscriptionSuperseded,
    SubscriptionCanceled,
    PaymentFailed,

    // Non-fatal anomalies
    DuplicateSubscriptionDetected,
    ClassificationAmbiguous,
    PeriodEndCorrected,

    // Reader-initiated changes
    PlanChanged,
    SubscriptionRenewed,
    CancellationScheduled,
    SubscriptionReactivated,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::SubscriptionSynced => "SUBSCRIPTION_SYNCED",
            BillingEventType::SubscriptionSuperseded => "SUBSCRIPTION_SUPERSEDED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::DuplicateSubscriptionDetected => "DUPLICATE_SUBSCRIPTION_DETECTED",
            BillingEventType::ClassificationAmbiguous => "CLASSIFICATION_AMBIGUOUS",
            BillingEventType::PeriodEndCorrected => "PERIOD_END_CORRECTED",
            BillingEventType::PlanChanged => "PLAN_CHANGED",
            BillingEventType::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            BillingEventType::CancellationScheduled => "CANCELLATION_SCHEDULED",
            BillingEventType::SubscriptionReactivated => "SUBSCRIPTION_REACTIVATED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// Reader through the app
    User,
    /// Scheduled or internal automation
    System,
    /// Billing provider notification
    BillingProvider,
    /// Manual operator action
    Operator,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::BillingProvider => write!(f, "billing_provider"),
            ActorType::Operator => write!(f, "operator"),
        }
    }
}

/// Builder for creating billing events
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    pub(crate) user_id: Option<UserId>,
    pub(crate) event_type: BillingEventType,
    pub(crate) event_data: serde_json::Value,
    pub(crate) external_event_id: Option<String>,
    pub(crate) external_subscription_id: Option<String>,
    pub(crate) external_customer_id: Option<String>,
    pub(crate) actor_type: ActorType,
}

impl BillingEventBuilder {
    /// Create a new event builder
    pub fn new(user_id: UserId, event_type: BillingEventType) -> Self {
        Self {
            user_id: Some(user_id),
            event_type,
            event_data: serde_json::json!({}),
            external_event_id: None,
            external_subscription_id: None,
            external_customer_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the provider event ID
    pub fn external_event(mut self, event_id: impl Into<String>) -> Self {
        self.external_event_id = Some(event_id.into());
        self
    }

    /// Set the provider subscription ID
    pub fn external_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.external_subscription_id = Some(subscription_id.into());
        self
    }

    /// Set the provider customer ID
    pub fn external_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.external_customer_id = Some(customer_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn event_type(&self) -> BillingEventType {
        self.event_type
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn external_subscription_id(&self) -> Option<&str> {
        self.external_subscription_id.as_deref()
    }

    pub fn event_data(&self) -> &serde_json::Value {
        &self.event_data
    }
}

/// Sink for billing events
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid>;
}

/// Write an event, downgrading failures to a warning
pub async fn record_event(audit: &dyn AuditLog, builder: BillingEventBuilder) {
    let event_type = builder.event_type;
    if let Err(e) = audit.log_event(builder).await {
        tracing::warn!(
            error = %e,
            event_type = %event_type,
            "Failed to log billing event"
        );
    }
}

/// Postgres-backed [`AuditLog`] writing to `billing_events`
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for BillingEventLogger {
    async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                user_id,
                event_type,
                event_data,
                external_event_id,
                external_subscription_id,
                external_customer_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(builder.user_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.external_event_id)
        .bind(&builder.external_subscription_id)
        .bind(&builder.external_customer_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }
}
