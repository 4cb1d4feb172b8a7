//! Postgres-backed store and ledger
//!
//! These require a migrated database at `DATABASE_URL` and are ignored by default.

use std::time::Duration;

use sefer_billing::{
    ClaimOutcome, EventLedger, PgEventLedger, PgSubscriptionStore, ProcessingResult,
    SubscriptionStore,
};
use sefer_shared::{
    create_pool, run_migrations, BillingInterval, PlanTier, PoolSettings, SubscriptionRecord,
    SubscriptionStatus, UserId,
};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let pool = create_pool(&url, &PoolSettings::default()).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

async fn profile(pool: &PgPool) -> UserId {
    let user_id = UserId::new();
    sqlx::query("INSERT INTO profiles (user_id, external_customer_id) VALUES ($1, $2)")
        .bind(user_id)
        .bind(format!("cus_{}", user_id.0.simple()))
        .execute(pool)
        .await
        .unwrap();
    user_id
}

fn record(user_id: UserId, updated_at: OffsetDateTime) -> SubscriptionRecord {
    SubscriptionRecord {
        id: Uuid::new_v4(),
        user_id,
        external_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
        status: SubscriptionStatus::Active,
        plan_tier: PlanTier::Basic,
        billing_interval: BillingInterval::Monthly,
        external_price_id: Some("price_test_mensal_basico".to_string()),
        current_period_start: Some(updated_at),
        current_period_end: Some(updated_at + time::Duration::days(30)),
        cancel_at_period_end: false,
        created_at: updated_at,
        updated_at,
    }
}

#[tokio::test]
#[ignore] // Requires database
async fn test_pg_store_skips_older_writes() {
    let pool = pool().await;
    let user_id = profile(&pool).await;
    let store = PgSubscriptionStore::new(pool);
    let now = OffsetDateTime::now_utc();

    let newer = record(user_id, now);
    store.upsert_subscription(&newer).await.unwrap();

    let mut older = newer.clone();
    older.status = SubscriptionStatus::Canceled;
    older.updated_at = now - time::Duration::minutes(5);
    let kept = store.upsert_subscription(&older).await.unwrap();

    assert_eq!(kept.status, SubscriptionStatus::Active);
    let stored = store
        .find_by_external_id(&newer.external_subscription_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Active);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_pg_store_cancels_all_but_kept() {
    let pool = pool().await;
    let user_id = profile(&pool).await;
    let store = PgSubscriptionStore::new(pool);
    let now = OffsetDateTime::now_utc();

    let keep = record(user_id, now - time::Duration::minutes(1));
    let stale = record(user_id, now - time::Duration::minutes(2));
    store.upsert_subscription(&keep).await.unwrap();
    store.upsert_subscription(&stale).await.unwrap();

    let canceled = store
        .cancel_active_except(user_id, Some(&keep.external_subscription_id), now)
        .await
        .unwrap();
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].external_subscription_id, stale.external_subscription_id);
    assert_eq!(canceled[0].status, SubscriptionStatus::Canceled);

    let past_due = store
        .mark_past_due(&keep.external_subscription_id, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(past_due.status, SubscriptionStatus::PastDue);
    assert_eq!(past_due.current_period_end, keep.current_period_end);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_pg_ledger_claims_once() {
    let ledger = PgEventLedger::new(pool().await);
    let event_id = format!("evt_{}", Uuid::new_v4().simple());
    let stale = Duration::from_secs(300);

    let first = ledger
        .claim(&event_id, "invoice.paid", None, stale)
        .await
        .unwrap();
    assert_eq!(first, ClaimOutcome::Claimed);

    let second = ledger
        .claim(&event_id, "invoice.paid", None, stale)
        .await
        .unwrap();
    assert_eq!(second, ClaimOutcome::Duplicate(ProcessingResult::Processing));

    ledger
        .finish(&event_id, ProcessingResult::Error, Some("gateway unavailable"))
        .await
        .unwrap();
    let failed = ledger.list_failed(50).await.unwrap();
    assert!(failed.iter().any(|r| r.external_event_id == event_id));

    // Failed events can be claimed again
    let retry = ledger
        .claim(&event_id, "invoice.paid", None, stale)
        .await
        .unwrap();
    assert_eq!(retry, ClaimOutcome::Claimed);

    ledger
        .finish(&event_id, ProcessingResult::Success, None)
        .await
        .unwrap();
    let record = ledger.get(&event_id).await.unwrap().unwrap();
    assert_eq!(record.processing_result, ProcessingResult::Success);
    assert!(record.error_message.is_none());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_pg_mark_past_due_skips_newer_record() {
    let pool = pool().await;
    let user_id = profile(&pool).await;
    let store = PgSubscriptionStore::new(pool);
    let now = OffsetDateTime::now_utc();

    let active = record(user_id, now);
    store.upsert_subscription(&active).await.unwrap();

    let stale = store
        .mark_past_due(&active.external_subscription_id, now - time::Duration::minutes(1))
        .await
        .unwrap();
    assert!(stale.is_none());
    let stored = store
        .find_by_external_id(&active.external_subscription_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Active);

    let fresh = store
        .mark_past_due(&active.external_subscription_id, now + time::Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.status, SubscriptionStatus::PastDue);
}
