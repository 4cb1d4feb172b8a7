use std::sync::Arc;

use sefer_billing::memory::{
    InMemoryAuditLog, InMemoryEventLedger, InMemoryGateway, InMemoryProfiles,
    InMemorySubscriptionStore,
};
use sefer_billing::webhooks::NotificationData;
use sefer_billing::{
    BillingService, EngineConfig, Notification, PlanCatalog, PriceIds, ReconciliationEngine,
};
use sefer_shared::UserId;

pub const MONTHLY_BASIC_PRICE: &str = "price_test_mensal_basico";
pub const MONTHLY_PLUS_PRICE: &str = "price_test_mensal_plus";
pub const YEARLY_BASIC_PRICE: &str = "price_test_anual_basico";
pub const YEARLY_PLUS_PRICE: &str = "price_test_anual_plus";

pub struct TestBilling {
    pub billing: BillingService,
    pub gateway: Arc<InMemoryGateway>,
    pub store: Arc<InMemorySubscriptionStore>,
    pub profiles: Arc<InMemoryProfiles>,
    pub audit: Arc<InMemoryAuditLog>,
}

pub fn catalog() -> PlanCatalog {
    PlanCatalog::from_price_ids(&PriceIds {
        monthly_basic: MONTHLY_BASIC_PRICE.to_string(),
        monthly_plus: MONTHLY_PLUS_PRICE.to_string(),
        yearly_basic: YEARLY_BASIC_PRICE.to_string(),
        yearly_plus: YEARLY_PLUS_PRICE.to_string(),
    })
    .expect("test catalog is complete")
}

/// Billing service over in-memory collaborators with one profile per `(user, customer)`
pub fn setup(profiles: &[(UserId, &str)]) -> TestBilling {
    let gateway = Arc::new(InMemoryGateway::new());
    let store = Arc::new(InMemorySubscriptionStore::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let directory = profiles
        .iter()
        .fold(InMemoryProfiles::new(), |dir, (user_id, customer_id)| {
            dir.with_profile(*user_id, customer_id)
        });
    let directory = Arc::new(directory);

    let engine = ReconciliationEngine::new(
        gateway.clone(),
        store.clone(),
        directory.clone(),
        audit.clone(),
        Arc::new(catalog()),
        EngineConfig::default(),
    );

    TestBilling {
        billing: BillingService::from_parts(engine, Arc::new(InMemoryEventLedger::new())),
        gateway,
        store,
        profiles: directory,
        audit,
    }
}

pub fn notification(id: &str, event_type: &str, object: serde_json::Value) -> Notification {
    Notification {
        id: id.to_string(),
        event_type: event_type.to_string(),
        created: Some(time::OffsetDateTime::now_utc().unix_timestamp()),
        data: NotificationData { object },
    }
}
