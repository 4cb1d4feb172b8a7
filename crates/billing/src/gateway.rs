//! Billing gateway adapter
//!
//! [`BillingGateway`] is the only way the engine talks to the billing
//! authority. Every operation is idempotent or safe to retry. The Stripe
//! implementation converts provider objects into [`ExternalSubscription`] at
//! this boundary so nothing downstream sees raw Unix timestamps or
//! provider-specific enums.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sefer_shared::SubscriptionStatus;
use stripe::generated::billing::subscription::{
    SubscriptionPaymentBehavior, SubscriptionProrationBehavior, SubscriptionStatusFilter,
};
use stripe::{
    CreateSubscription, CreateSubscriptionItems, CustomerId, Expandable, ListSubscriptions,
    Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus, UpdateSubscription,
    UpdateSubscriptionItems,
};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Expansion needed for the classifier to see product names
const RETRIEVE_EXPAND: &[&str] = &["items.data.price.product"];
const LIST_EXPAND: &[&str] = &["data.items.data.price.product"];

/// The priced line of a subscription, as seen by the plan classifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Provider id of the subscription item (needed to swap its price)
    pub item_id: Option<String>,
    pub price_id: Option<String>,
    /// Structured recurring interval (`month`, `year`, ...) when the provider sent one
    pub recurring_interval: Option<String>,
    pub price_nickname: Option<String>,
    pub product_name: Option<String>,
    /// Annotations set at checkout (`tier`, `plan`)
    pub metadata: HashMap<String, String>,
}

/// A subscription as reported by the billing authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub line_item: Option<LineItem>,
}

/// Which subscriptions a customer listing should include
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Every status, including canceled and expired
    All,
    /// Only subscriptions the provider reports as active
    Active,
}

impl StatusFilter {
    pub fn matches(&self, status: SubscriptionStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Active => status == SubscriptionStatus::Active,
        }
    }
}

/// How a price change bills the unused part of the current period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationPolicy {
    CreateProrations,
    None,
}

/// Amount the provider would charge immediately for a price change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProrationQuote {
    pub amount_due_cents: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_period_end: Option<OffsetDateTime>,
}

/// Query and command surface of the billing authority
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Fails with `NotFound` if the id is unknown to the provider
    async fn fetch_by_external_id(&self, id: &str) -> BillingResult<ExternalSubscription>;

    async fn list_by_customer(
        &self,
        customer_id: &str,
        filter: StatusFilter,
    ) -> BillingResult<Vec<ExternalSubscription>>;

    /// New subscriptions stay `incomplete` until the first payment succeeds
    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ExternalSubscription>;

    /// Swap the price of the subscription's primary item
    async fn update_subscription(
        &self,
        id: &str,
        new_price_id: &str,
        policy: ProrationPolicy,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ExternalSubscription>;

    async fn cancel_at_period_end(&self, id: &str) -> BillingResult<ExternalSubscription>;

    /// Clear a pending period-end cancellation
    async fn reactivate(&self, id: &str) -> BillingResult<ExternalSubscription>;

    async fn compute_proration(
        &self,
        current_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProrationQuote>;
}

// =============================================================================
// Stripe implementation
// =============================================================================

/// [`BillingGateway`] backed by the Stripe API
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
    list_limit: u64,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient, list_limit: u64) -> Self {
        Self { stripe, list_limit }
    }

    async fn retrieve(&self, id: &str) -> BillingResult<Subscription> {
        let sub_id = parse_subscription_id(id)?;
        Ok(Subscription::retrieve(self.stripe.inner(), &sub_id, RETRIEVE_EXPAND).await?)
    }

    async fn set_cancel_at_period_end(
        &self,
        id: &str,
        cancel: bool,
    ) -> BillingResult<ExternalSubscription> {
        let sub_id = parse_subscription_id(id)?;
        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            expand: RETRIEVE_EXPAND,
            ..Default::default()
        };
        let subscription = Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            cancel_at_period_end = cancel,
            "Updated subscription cancellation flag"
        );

        to_external(subscription)
    }
}

#[async_trait]
impl BillingGateway for StripeGateway {
    async fn fetch_by_external_id(&self, id: &str) -> BillingResult<ExternalSubscription> {
        to_external(self.retrieve(id).await?)
    }

    async fn list_by_customer(
        &self,
        customer_id: &str,
        filter: StatusFilter,
    ) -> BillingResult<Vec<ExternalSubscription>> {
        let customer = parse_customer_id(customer_id)?;
        let status = match filter {
            StatusFilter::All => SubscriptionStatusFilter::All,
            StatusFilter::Active => SubscriptionStatusFilter::Active,
        };

        let params = ListSubscriptions {
            customer: Some(customer),
            status: Some(status),
            limit: Some(self.list_limit),
            expand: LIST_EXPAND,
            ..Default::default()
        };

        let page = Subscription::list(self.stripe.inner(), &params).await?;
        if page.has_more {
            tracing::warn!(
                customer_id = %customer_id,
                limit = self.list_limit,
                "Customer has more subscriptions than one page; only the first page is considered"
            );
        }

        page.data.into_iter().map(to_external).collect()
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ExternalSubscription> {
        let customer = parse_customer_id(customer_id)?;

        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        params.expand = RETRIEVE_EXPAND;

        let subscription = Subscription::create(self.stripe.inner(), params).await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription.id,
            price_id = %price_id,
            "Created subscription"
        );

        to_external(subscription)
    }

    async fn update_subscription(
        &self,
        id: &str,
        new_price_id: &str,
        policy: ProrationPolicy,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ExternalSubscription> {
        let current = self.retrieve(id).await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(new_price_id.to_string()),
                ..Default::default()
            }]),
            metadata: Some(metadata),
            proration_behavior: Some(match policy {
                ProrationPolicy::CreateProrations => SubscriptionProrationBehavior::CreateProrations,
                ProrationPolicy::None => SubscriptionProrationBehavior::None,
            }),
            expand: RETRIEVE_EXPAND,
            ..Default::default()
        };

        let subscription = Subscription::update(self.stripe.inner(), &current.id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            new_price_id = %new_price_id,
            policy = ?policy,
            "Updated subscription price"
        );

        to_external(subscription)
    }

    async fn cancel_at_period_end(&self, id: &str) -> BillingResult<ExternalSubscription> {
        self.set_cancel_at_period_end(id, true).await
    }

    async fn reactivate(&self, id: &str) -> BillingResult<ExternalSubscription> {
        self.set_cancel_at_period_end(id, false).await
    }

    async fn compute_proration(
        &self,
        current_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProrationQuote> {
        let current = self.retrieve(current_id).await?;
        let customer_id = expandable_customer_id(&current.customer);
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        // async-stripe 0.39 predates POST /invoices/create_preview, so call it directly
        let form_params = [
            ("customer", customer_id.as_str()),
            ("subscription", current_id),
            ("subscription_details[items][0][id]", item_id.as_str()),
            ("subscription_details[items][0][price]", new_price_id),
            (
                "subscription_details[proration_behavior]",
                "create_prorations",
            ),
        ];

        let url = format!(
            "{}/v1/invoices/create_preview",
            self.stripe.config().api_base.trim_end_matches('/')
        );
        let response = self
            .stripe
            .http()
            .post(url)
            .bearer_auth(&self.stripe.config().secret_key)
            .form(&form_params)
            .send()
            .await
            .map_err(|e| {
                BillingError::GatewayUnavailable(format!("Failed to call Stripe API: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                error_body = %error_body,
                "Stripe invoices/create_preview API failed"
            );
            let message = format!("Stripe API error ({}): {}", status, error_body);
            return Err(match status.as_u16() {
                429 | 500..=599 => BillingError::GatewayUnavailable(message),
                404 => BillingError::NotFound(message),
                _ => BillingError::InvalidRequest(message),
            });
        }

        let preview: serde_json::Value = response.json().await.map_err(|e| {
            BillingError::GatewayUnavailable(format!("Failed to parse Stripe response: {}", e))
        })?;

        let quote = proration_quote_from_preview(&preview)?;

        tracing::info!(
            subscription_id = %current_id,
            new_price_id = %new_price_id,
            amount_due_cents = quote.amount_due_cents,
            "Previewed proration"
        );

        Ok(quote)
    }
}

// =============================================================================
// Conversion helpers
// =============================================================================

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::InvalidRequest(format!("Invalid subscription ID {}: {}", id, e)))
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse::<CustomerId>()
        .map_err(|e| BillingError::InvalidRequest(format!("Invalid customer ID {}: {}", id, e)))
}

fn expandable_customer_id(customer: &Expandable<stripe::Customer>) -> String {
    match customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(c) => c.id.to_string(),
    }
}

/// Unix seconds to an absolute time; zero and negative mean "not established"
pub(crate) fn epoch_to_time(ts: i64) -> Option<OffsetDateTime> {
    if ts <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

pub(crate) fn map_stripe_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        // Paused keeps the subscription alive without granting access
        StripeSubStatus::Paused => SubscriptionStatus::PastDue,
    }
}

fn to_external(subscription: Subscription) -> BillingResult<ExternalSubscription> {
    let created = epoch_to_time(subscription.created).ok_or_else(|| {
        BillingError::InvalidPayload(format!(
            "Subscription {} has invalid created timestamp {}",
            subscription.id, subscription.created
        ))
    })?;

    let line_item = subscription.items.data.first().map(|item| {
        let price = item.price.as_ref();
        LineItem {
            item_id: Some(item.id.to_string()),
            price_id: price.map(|p| p.id.to_string()),
            recurring_interval: price
                .and_then(|p| p.recurring.as_ref())
                .map(|r| r.interval.as_str().to_string()),
            price_nickname: price.and_then(|p| p.nickname.clone()),
            product_name: price
                .and_then(|p| p.product.as_ref())
                .and_then(|prod| match prod {
                    Expandable::Object(p) => p.name.clone(),
                    _ => None,
                }),
            metadata: subscription.metadata.clone(),
        }
    });

    Ok(ExternalSubscription {
        id: subscription.id.to_string(),
        customer_id: expandable_customer_id(&subscription.customer),
        status: map_stripe_status(subscription.status),
        created,
        current_period_start: epoch_to_time(subscription.current_period_start),
        current_period_end: epoch_to_time(subscription.current_period_end),
        cancel_at_period_end: subscription.cancel_at_period_end,
        line_item,
    })
}

/// Pull the immediate charge and the next period end out of a preview invoice
pub(crate) fn proration_quote_from_preview(
    preview: &serde_json::Value,
) -> BillingResult<ProrationQuote> {
    let amount_due_cents = preview["amount_due"].as_i64().ok_or_else(|| {
        BillingError::InvalidPayload("Preview invoice is missing amount_due".to_string())
    })?;

    let line_period_end = preview["lines"]["data"]
        .as_array()
        .and_then(|lines| {
            lines
                .iter()
                .filter_map(|line| line["period"]["end"].as_i64())
                .max()
        });
    let next_period_end = line_period_end
        .or_else(|| preview["period_end"].as_i64())
        .and_then(epoch_to_time);

    Ok(ProrationQuote {
        amount_due_cents,
        next_period_end,
    })
}
