// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
#![allow(clippy::too_many_arguments)] // Engine wiring takes every collaborator
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sefer Billing Module
//!
//! Keeps each reader's local subscription record consistent with Stripe.
//!
//! ## Features
//!
//! - **Reconciliation**: Converge local records onto the provider's state for a customer
//! - **Plan Changes**: Renewals and strict upgrades with proration, cancel and reactivate
//! - **Notifications**: Idempotent handling of subscription and invoice webhooks
//! - **Entitlements**: Access and tier derived from the canonical record
//! - **Invariants**: Read-only consistency checks for the scheduled worker

pub mod catalog;
pub mod classifier;
pub mod client;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod memory;
pub mod orchestrator;
pub mod profiles;
pub mod reconcile;
pub mod store;
pub mod webhooks;


use std::sync::Arc;

use sqlx::PgPool;

// Catalog
pub use catalog::{Plan, PlanCatalog, PlanKey};

// Classifier
pub use classifier::{Classification, IntervalSignal, PlanClassifier, TierSignal};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Config
pub use config::EngineConfig;

// Entitlement
pub use entitlement::{EntitledTier, Entitlement, EntitlementService};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, AuditLog, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// Gateway
pub use gateway::{
    BillingGateway, ExternalSubscription, LineItem, ProrationPolicy, ProrationQuote, StatusFilter,
    StripeGateway,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{ClaimOutcome, EventLedger, PgEventLedger, ProcessingResult, WebhookEventRecord};

// Orchestrator
pub use orchestrator::{
    CancellationChange, ChangeKind, ChangePreview, DuplicateCleanup, PlanChange, PlanOption,
    SubscriptionOrchestrator, UpgradeOptions,
};

// Profiles
pub use profiles::{PgProfileDirectory, ProfileDirectory};

// Reconciliation
pub use reconcile::{ReconcileContext, ReconcileOutcome, ReconciliationEngine, ResyncResult};

// Store
pub use store::{PgSubscriptionStore, SubscriptionStore};

// Webhooks
pub use webhooks::{EventIngress, IngressOutcome, Notification};

/// Main billing service that wires the engine to its entry points
#[derive(Clone)]
pub struct BillingService {
    pub engine: ReconciliationEngine,
    pub orchestrator: SubscriptionOrchestrator,
    pub ingress: EventIngress,
    pub entitlements: EntitlementService,
}

impl BillingService {
    /// Create a billing service backed by Stripe and Postgres from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = EngineConfig::from_env()?;
        Self::new(stripe, config, pool)
    }

    /// Create a billing service with explicit config
    pub fn new(stripe: StripeClient, config: EngineConfig, pool: PgPool) -> BillingResult<Self> {
        let catalog = Arc::new(PlanCatalog::from_price_ids(&stripe.config().price_ids)?);
        let engine = ReconciliationEngine::new(
            Arc::new(StripeGateway::new(stripe, config.list_limit)),
            Arc::new(PgSubscriptionStore::new(pool.clone())),
            Arc::new(PgProfileDirectory::new(pool.clone())),
            Arc::new(BillingEventLogger::new(pool.clone())),
            catalog,
            config,
        );
        Ok(Self::from_parts(engine, Arc::new(PgEventLedger::new(pool))))
    }

    /// Assemble from an engine and a ledger (any backing)
    pub fn from_parts(engine: ReconciliationEngine, ledger: Arc<dyn EventLedger>) -> Self {
        Self {
            orchestrator: SubscriptionOrchestrator::new(engine.clone()),
            ingress: EventIngress::new(engine.clone(), ledger),
            entitlements: EntitlementService::new(
                engine.store().clone(),
                engine.config().clone(),
            ),
            engine,
        }
    }
}
