//! In-process implementations of the billing collaborators.
//!
//! Used by the test suites and for running the engine without Stripe or
//! Postgres. The gateway can simulate outages and slow responses and counts
//! the mutations it receives.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sefer_shared::{CustomerProfile, SubscriptionRecord, SubscriptionStatus, UserId};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{AuditLog, BillingEventBuilder, BillingEventType};
use crate::gateway::{
    BillingGateway, ExternalSubscription, LineItem, ProrationPolicy, ProrationQuote, StatusFilter,
};
use crate::ledger::{
    is_reclaimable, ClaimOutcome, EventLedger, ProcessingResult, WebhookEventRecord,
};
use crate::profiles::ProfileDirectory;
use crate::store::SubscriptionStore;

/// Build a subscription with one priced item and a 30-day period from `created`
pub fn external_subscription(
    id: &str,
    customer_id: &str,
    status: SubscriptionStatus,
    price_id: &str,
    created: OffsetDateTime,
) -> ExternalSubscription {
    ExternalSubscription {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        status,
        created,
        current_period_start: Some(created),
        current_period_end: Some(created + time::Duration::days(30)),
        cancel_at_period_end: false,
        line_item: Some(LineItem {
            item_id: Some(format!("si_{}", id)),
            price_id: Some(price_id.to_string()),
            ..Default::default()
        }),
    }
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Default)]
struct GatewayState {
    subscriptions: Vec<ExternalSubscription>,
    unavailable: bool,
    delay: Option<Duration>,
    mutations: usize,
    proration_amount_cents: i64,
    next_id: u64,
}

impl GatewayState {
    fn find_mut(&mut self, id: &str) -> BillingResult<&mut ExternalSubscription> {
        self.subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))
    }
}

/// Scriptable stand-in for the billing provider
#[derive(Default)]
pub struct InMemoryGateway {
    state: RwLock<GatewayState>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription by id
    pub async fn insert(&self, subscription: ExternalSubscription) {
        let mut state = self.state.write().await;
        match state.subscriptions.iter_mut().find(|s| s.id == subscription.id) {
            Some(existing) => *existing = subscription,
            None => state.subscriptions.push(subscription),
        }
    }

    /// Drop a subscription, as if the provider no longer lists it
    pub async fn remove(&self, id: &str) {
        self.state.write().await.subscriptions.retain(|s| s.id != id);
    }

    pub async fn set_status(&self, id: &str, status: SubscriptionStatus) {
        let mut state = self.state.write().await;
        if let Ok(subscription) = state.find_mut(id) {
            subscription.status = status;
        }
    }

    /// Make every call fail with `GatewayUnavailable`
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Delay every call, to exercise timeouts
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().await.delay = delay;
    }

    pub async fn set_proration_amount(&self, cents: i64) {
        self.state.write().await.proration_amount_cents = cents;
    }

    pub async fn subscription(&self, id: &str) -> Option<ExternalSubscription> {
        self.state
            .read()
            .await
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn subscriptions(&self) -> Vec<ExternalSubscription> {
        self.state.read().await.subscriptions.clone()
    }

    /// Number of create/update/cancel/reactivate calls that reached the provider
    pub async fn mutation_count(&self) -> usize {
        self.state.read().await.mutations
    }

    async fn enter(&self) -> BillingResult<()> {
        let (unavailable, delay) = {
            let state = self.state.read().await;
            (state.unavailable, state.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unavailable {
            return Err(BillingError::GatewayUnavailable(
                "in-memory gateway offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingGateway for InMemoryGateway {
    async fn fetch_by_external_id(&self, id: &str) -> BillingResult<ExternalSubscription> {
        self.enter().await?;
        self.subscription(id)
            .await
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))
    }

    async fn list_by_customer(
        &self,
        customer_id: &str,
        filter: StatusFilter,
    ) -> BillingResult<Vec<ExternalSubscription>> {
        self.enter().await?;
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.customer_id == customer_id && filter.matches(s.status))
            .cloned()
            .collect())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ExternalSubscription> {
        self.enter().await?;
        let mut state = self.state.write().await;
        state.next_id += 1;
        state.mutations += 1;

        let id = format!("sub_mem_{}", state.next_id);
        let subscription = ExternalSubscription {
            id: id.clone(),
            customer_id: customer_id.to_string(),
            status: SubscriptionStatus::Incomplete,
            created: OffsetDateTime::now_utc(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            line_item: Some(LineItem {
                item_id: Some(format!("si_{}", id)),
                price_id: Some(price_id.to_string()),
                metadata,
                ..Default::default()
            }),
        };
        state.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(
        &self,
        id: &str,
        new_price_id: &str,
        _policy: ProrationPolicy,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ExternalSubscription> {
        self.enter().await?;
        let mut state = self.state.write().await;
        let subscription = state.find_mut(id)?;
        let item = subscription.line_item.get_or_insert_with(LineItem::default);
        item.price_id = Some(new_price_id.to_string());
        item.recurring_interval = None;
        item.price_nickname = None;
        item.product_name = None;
        item.metadata.extend(metadata);
        let updated = subscription.clone();
        state.mutations += 1;
        Ok(updated)
    }

    async fn cancel_at_period_end(&self, id: &str) -> BillingResult<ExternalSubscription> {
        self.enter().await?;
        let mut state = self.state.write().await;
        let subscription = state.find_mut(id)?;
        subscription.cancel_at_period_end = true;
        let updated = subscription.clone();
        state.mutations += 1;
        Ok(updated)
    }

    async fn reactivate(&self, id: &str) -> BillingResult<ExternalSubscription> {
        self.enter().await?;
        let mut state = self.state.write().await;
        let subscription = state.find_mut(id)?;
        subscription.cancel_at_period_end = false;
        let updated = subscription.clone();
        state.mutations += 1;
        Ok(updated)
    }

    async fn compute_proration(
        &self,
        current_id: &str,
        _new_price_id: &str,
    ) -> BillingResult<ProrationQuote> {
        self.enter().await?;
        let mut state = self.state.write().await;
        let amount_due_cents = state.proration_amount_cents;
        let subscription = state.find_mut(current_id)?;
        Ok(ProrationQuote {
            amount_due_cents,
            next_period_end: subscription.current_period_end,
        })
    }
}

// =============================================================================
// Subscription store
// =============================================================================

#[derive(Default)]
struct StoreState {
    records: Vec<SubscriptionRecord>,
    writes: usize,
}

/// Vec-backed [`SubscriptionStore`] with the same last-writer-wins rules as Postgres
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    state: RwLock<StoreState>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing write accounting
    pub async fn seed(&self, record: SubscriptionRecord) {
        self.state.write().await.records.push(record);
    }

    pub async fn records(&self) -> Vec<SubscriptionRecord> {
        self.state.read().await.records.clone()
    }

    /// Number of rows changed through the store trait
    pub async fn write_count(&self) -> usize {
        self.state.read().await.writes
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord> {
        let mut state = self.state.write().await;
        let existing = state.records.iter_mut().find(|r| {
            r.user_id == record.user_id
                && r.external_subscription_id == record.external_subscription_id
        });

        let written = match existing {
            Some(current) if current.updated_at > record.updated_at => return Ok(current.clone()),
            Some(current) => {
                let id = current.id;
                let created_at = current.created_at;
                *current = SubscriptionRecord {
                    id,
                    created_at,
                    ..record.clone()
                };
                current.clone()
            }
            None => {
                state.records.push(record.clone());
                record.clone()
            }
        };
        state.writes += 1;
        Ok(written)
    }

    async fn find_by_user(&self, user_id: UserId) -> BillingResult<Vec<SubscriptionRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<SubscriptionRecord> = state
            .records
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn find_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .iter()
            .find(|r| r.external_subscription_id == external_subscription_id)
            .cloned())
    }

    async fn cancel_active_except(
        &self,
        user_id: UserId,
        keep: Option<&str>,
        at: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let mut state = self.state.write().await;
        let mut canceled = Vec::new();
        for record in state.records.iter_mut().filter(|r| {
            r.user_id == user_id
                && r.status.is_non_terminal()
                && keep != Some(r.external_subscription_id.as_str())
                && r.updated_at <= at
        }) {
            record.status = SubscriptionStatus::Canceled;
            record.updated_at = at;
            canceled.push(record.clone());
        }
        state.writes += canceled.len();
        Ok(canceled)
    }

    async fn mark_past_due(
        &self,
        external_subscription_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut state = self.state.write().await;
        let updated = state
            .records
            .iter_mut()
            .find(|r| {
                r.external_subscription_id == external_subscription_id
                    && r.status.grants_access()
                    && r.updated_at <= at
            })
            .map(|record| {
                record.status = SubscriptionStatus::PastDue;
                record.updated_at = at;
                record.clone()
            });
        if updated.is_some() {
            state.writes += 1;
        }
        Ok(updated)
    }
}

// =============================================================================
// Profiles
// =============================================================================

#[derive(Default)]
pub struct InMemoryProfiles {
    customers: RwLock<HashMap<UserId, String>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, user_id: UserId, customer_id: &str) -> Self {
        self.customers
            .get_mut()
            .insert(user_id, customer_id.to_string());
        self
    }

    pub async fn insert(&self, user_id: UserId, customer_id: &str) {
        self.customers
            .write()
            .await
            .insert(user_id, customer_id.to_string());
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryProfiles {
    async fn customer_for_user(&self, user_id: UserId) -> BillingResult<Option<String>> {
        Ok(self.customers.read().await.get(&user_id).cloned())
    }

    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<UserId>> {
        Ok(self
            .customers
            .read()
            .await
            .iter()
            .find(|(_, c)| c.as_str() == customer_id)
            .map(|(user_id, _)| *user_id))
    }

    async fn list_billable(&self) -> BillingResult<Vec<CustomerProfile>> {
        let mut profiles: Vec<CustomerProfile> = self
            .customers
            .read()
            .await
            .iter()
            .map(|(user_id, customer_id)| CustomerProfile {
                user_id: *user_id,
                external_customer_id: customer_id.clone(),
            })
            .collect();
        profiles.sort_by(|a, b| a.external_customer_id.cmp(&b.external_customer_id));
        Ok(profiles)
    }
}

// =============================================================================
// Audit log
// =============================================================================

/// Keeps every logged event for inspection; can be told to fail
#[derive(Default)]
pub struct InMemoryAuditLog {
    events: RwLock<Vec<BillingEventBuilder>>,
    failing: RwLock<bool>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.write().await = failing;
    }

    pub async fn events(&self) -> Vec<BillingEventBuilder> {
        self.events.read().await.clone()
    }

    pub async fn count(&self, event_type: BillingEventType) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        if *self.failing.read().await {
            return Err(BillingError::Database("audit log offline".to_string()));
        }
        self.events.write().await.push(builder);
        Ok(Uuid::new_v4())
    }
}

// =============================================================================
// Event ledger
// =============================================================================

#[derive(Default)]
pub struct InMemoryEventLedger {
    entries: RwLock<HashMap<String, WebhookEventRecord>>,
}

impl InMemoryEventLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLedger for InMemoryEventLedger {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: Option<OffsetDateTime>,
        stale_after: Duration,
    ) -> BillingResult<ClaimOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.write().await;
        match entries.get_mut(event_id) {
            Some(existing) if is_reclaimable(existing, now, stale_after) => {
                existing.processing_result = ProcessingResult::Processing;
                existing.processing_started_at = Some(now);
                existing.error_message = None;
                Ok(ClaimOutcome::Claimed)
            }
            Some(existing) => Ok(ClaimOutcome::Duplicate(existing.processing_result)),
            None => {
                entries.insert(
                    event_id.to_string(),
                    WebhookEventRecord {
                        id: Uuid::new_v4(),
                        external_event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        event_timestamp,
                        processing_result: ProcessingResult::Processing,
                        processing_started_at: Some(now),
                        error_message: None,
                        created_at: now,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn finish(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(event_id) {
            entry.processing_result = result;
            entry.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn get(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self.entries.read().await.get(event_id).cloned())
    }

    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let entries = self.entries.read().await;
        let mut failed: Vec<WebhookEventRecord> = entries
            .values()
            .filter(|e| e.processing_result == ProcessingResult::Error)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        failed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(failed)
    }
}
