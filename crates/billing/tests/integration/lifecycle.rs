//! Reader lifecycle against the in-memory provider

use sefer_billing::memory::external_subscription;
use sefer_billing::{
    BillingError, BillingEventType, ChangeKind, EntitledTier, IngressOutcome, PlanKey,
    ResyncResult, SubscriptionStore,
};
use sefer_shared::{BillingInterval, PlanTier, SubscriptionStatus, UserId};
use serde_json::json;
use time::{Duration, OffsetDateTime};

use crate::common::{notification, setup, MONTHLY_BASIC_PRICE, MONTHLY_PLUS_PRICE};

// ============================================================================
// Renewal -> activation -> upgrade -> payment failure -> cancellation
// ============================================================================

#[tokio::test]
async fn test_full_reader_lifecycle() {
    let user_id = UserId::new();
    let t = setup(&[(user_id, "cus_reader")]);

    // New reader subscribes to monthly basic
    let renewal = t
        .billing
        .orchestrator
        .change_plan(user_id, PlanKey::MONTHLY_BASIC)
        .await
        .unwrap();
    assert_eq!(renewal.kind, ChangeKind::Renewal);
    let sub_id = renewal.external_subscription_id.clone();

    let entitlement = t.billing.entitlements.get_entitlement(user_id).await.unwrap();
    assert!(!entitlement.has_access, "Incomplete until first payment");

    // First invoice paid: provider activates the subscription
    let now = OffsetDateTime::now_utc();
    let mut active = t.gateway.subscription(&sub_id).await.unwrap();
    active.status = SubscriptionStatus::Active;
    active.current_period_start = Some(now);
    active.current_period_end = Some(now + Duration::days(30));
    t.gateway.insert(active).await;

    let outcome = t
        .billing
        .ingress
        .handle(notification(
            "evt_paid",
            "invoice.payment_succeeded",
            json!({ "id": "in_1", "customer": "cus_reader", "subscription": sub_id }),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, IngressOutcome::Ack);

    let entitlement = t.billing.entitlements.get_entitlement(user_id).await.unwrap();
    assert!(entitlement.has_access);
    assert_eq!(entitlement.tier, EntitledTier::Basic);

    // Upgrade to yearly plus on the same subscription
    let upgrade = t
        .billing
        .orchestrator
        .change_plan(user_id, PlanKey::YEARLY_PLUS)
        .await
        .unwrap();
    assert_eq!(upgrade.kind, ChangeKind::Upgrade);
    assert_eq!(upgrade.external_subscription_id, sub_id);
    assert!(upgrade.reconciled);
    let record = upgrade.record.unwrap();
    assert_eq!(record.plan_tier, PlanTier::Plus);
    assert_eq!(record.billing_interval, BillingInterval::Yearly);

    // Renewal charge fails
    let mut failed = notification(
        "evt_failed",
        "invoice.payment_failed",
        json!({ "id": "in_2", "customer": "cus_reader", "subscription": sub_id }),
    );
    failed.created = Some(now.unix_timestamp() + 60);
    t.billing.ingress.handle(failed).await.unwrap();
    let entitlement = t.billing.entitlements.get_entitlement(user_id).await.unwrap();
    assert!(!entitlement.has_access);
    assert_eq!(entitlement.status, Some(SubscriptionStatus::PastDue));

    // Provider gives up and deletes the subscription
    t.gateway.set_status(&sub_id, SubscriptionStatus::Canceled).await;
    t.billing
        .ingress
        .handle(notification(
            "evt_deleted",
            "customer.subscription.deleted",
            json!({ "id": sub_id, "customer": "cus_reader" }),
        ))
        .await
        .unwrap();

    let entitlement = t.billing.entitlements.get_entitlement(user_id).await.unwrap();
    assert_eq!(entitlement.tier, EntitledTier::None);
    assert_eq!(entitlement.status, Some(SubscriptionStatus::Canceled));
    assert_eq!(t.audit.count(BillingEventType::PaymentFailed).await, 1);
    assert_eq!(t.audit.count(BillingEventType::PlanChanged).await, 1);
}

#[tokio::test]
async fn test_late_payment_failure_after_recovery() {
    let user_id = UserId::new();
    let t = setup(&[(user_id, "cus_reader")]);
    let now = OffsetDateTime::now_utc();
    t.gateway
        .insert(external_subscription("sub_1", "cus_reader", SubscriptionStatus::Active, MONTHLY_PLUS_PRICE, now))
        .await;
    t.billing.engine.reconcile(user_id, "cus_reader").await.unwrap();

    // Failure stamped ahead of our clock is applied as of now
    let mut failed = notification(
        "evt_failed",
        "invoice.payment_failed",
        json!({ "id": "in_1", "customer": "cus_reader", "subscription": "sub_1" }),
    );
    failed.created = Some(now.unix_timestamp() + 60);
    t.billing.ingress.handle(failed).await.unwrap();
    assert!(!t.billing.entitlements.get_entitlement(user_id).await.unwrap().has_access);

    // Retry charge succeeds
    t.billing
        .ingress
        .handle(notification(
            "evt_paid",
            "invoice.paid",
            json!({ "id": "in_1", "customer": "cus_reader", "subscription": "sub_1" }),
        ))
        .await
        .unwrap();
    assert!(t.billing.entitlements.get_entitlement(user_id).await.unwrap().has_access);

    // An earlier failure delivered after the recovery
    let mut late = notification(
        "evt_failed_earlier",
        "invoice.payment_failed",
        json!({ "id": "in_1", "customer": "cus_reader", "subscription": "sub_1" }),
    );
    late.created = Some(now.unix_timestamp());
    assert_eq!(t.billing.ingress.handle(late).await.unwrap(), IngressOutcome::Ack);

    let entitlement = t.billing.entitlements.get_entitlement(user_id).await.unwrap();
    assert!(entitlement.has_access);
    assert_eq!(entitlement.status, Some(SubscriptionStatus::Active));
    assert_eq!(t.audit.count(BillingEventType::PaymentFailed).await, 1);
}

#[tokio::test]
async fn test_downgrade_is_never_executed() {
    let user_id = UserId::new();
    let t = setup(&[(user_id, "cus_reader")]);
    t.gateway
        .insert(external_subscription(
            "sub_1",
            "cus_reader",
            SubscriptionStatus::Active,
            MONTHLY_PLUS_PRICE,
            OffsetDateTime::now_utc(),
        ))
        .await;

    let result = t
        .billing
        .orchestrator
        .preview_change(user_id, PlanKey::MONTHLY_BASIC)
        .await;
    assert!(matches!(result, Err(BillingError::InvalidTransition { .. })));

    let options = t.billing.orchestrator.upgrade_options(user_id).await.unwrap();
    assert!(options.options.iter().all(|o| o.plan != PlanKey::MONTHLY_BASIC));
    assert_eq!(t.gateway.mutation_count().await, 0);
}

// ============================================================================
// Concurrency and bulk re-sync
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconciles_converge() {
    let user_id = UserId::new();
    let t = setup(&[(user_id, "cus_reader")]);
    let now = OffsetDateTime::now_utc();
    t.gateway
        .insert(external_subscription("sub_old", "cus_reader", SubscriptionStatus::Active, MONTHLY_BASIC_PRICE, now - Duration::days(10)))
        .await;
    t.gateway
        .insert(external_subscription("sub_new", "cus_reader", SubscriptionStatus::Active, MONTHLY_PLUS_PRICE, now))
        .await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = t.billing.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.reconcile(user_id, "cus_reader").await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.record().unwrap().external_subscription_id, "sub_new");
    }

    let records = t.store.find_by_user(user_id).await.unwrap();
    assert_eq!(records.len(), 2);
    let live: Vec<_> = records.iter().filter(|r| r.status.is_non_terminal()).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].external_subscription_id, "sub_new");
}

#[tokio::test]
async fn test_resync_all_isolates_failures() {
    let healthy = UserId::new();
    let empty = UserId::new();
    let t = setup(&[(healthy, "cus_a"), (empty, "cus_b")]);
    t.gateway
        .insert(external_subscription("sub_a", "cus_a", SubscriptionStatus::Trialing, MONTHLY_PLUS_PRICE, OffsetDateTime::now_utc()))
        .await;

    let results = t.billing.engine.resync_all().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().any(|r| matches!(
        r,
        ResyncResult::Synced { user_id, status: SubscriptionStatus::Trialing, .. } if *user_id == healthy
    )));
    assert!(results
        .iter()
        .any(|r| matches!(r, ResyncResult::NoSubscription { user_id } if *user_id == empty)));

    // A profile added later is picked up by the next pass
    let late = UserId::new();
    t.profiles.insert(late, "cus_c").await;
    t.gateway.set_unavailable(true).await;
    let results = t.billing.engine.resync_all().await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|r| matches!(r, ResyncResult::Error { retryable: true, .. })));
}
