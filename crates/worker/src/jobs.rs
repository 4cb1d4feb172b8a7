//! Scheduled billing jobs
//!
//! Re-sync converges every billable reader onto Stripe. The invariant pass
//! reports inconsistencies and re-reconciles the users it can heal.

use sefer_billing::{
    BillingError, BillingService, InvariantCheckSummary, InvariantChecker, ReconcileOutcome,
    ResyncResult,
};
use sefer_shared::UserId;
use tokio_retry::RetryIf;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

/// Re-sync all billable users, retrying transient failures with backoff
pub async fn resync_all(billing: &BillingService, config: &WorkerConfig) -> Vec<ResyncResult> {
    let first_pass = RetryIf::spawn(
        config.backoff(),
        || billing.engine.resync_all(),
        BillingError::is_retryable,
    )
    .await;

    let results = match first_pass {
        Ok(results) => results,
        Err(e) => {
            error!(error = %e, "Re-sync aborted: could not list billable users");
            return Vec::new();
        }
    };

    let mut settled = Vec::with_capacity(results.len());
    for result in results {
        match result {
            ResyncResult::Error {
                user_id,
                customer_id,
                retryable: true,
                ..
            } => settled.push(retry_user(billing, config, user_id, customer_id).await),
            other => settled.push(other),
        }
    }

    log_resync_results(&settled);
    settled
}

async fn retry_user(
    billing: &BillingService,
    config: &WorkerConfig,
    user_id: UserId,
    customer_id: String,
) -> ResyncResult {
    warn!(user_id = %user_id, "Retrying re-sync after transient failure");

    let outcome = RetryIf::spawn(
        config.backoff(),
        || billing.engine.reconcile(user_id, &customer_id),
        BillingError::is_retryable,
    )
    .await;

    match outcome {
        Ok(ReconcileOutcome::Canonical(record)) => ResyncResult::Synced {
            user_id,
            external_subscription_id: record.external_subscription_id,
            status: record.status,
        },
        Ok(ReconcileOutcome::NoSubscription) => ResyncResult::NoSubscription { user_id },
        Err(e) => ResyncResult::Error {
            user_id,
            customer_id,
            retryable: e.is_retryable(),
            error: e.to_string(),
        },
    }
}

/// Log results of a re-sync pass
fn log_resync_results(results: &[ResyncResult]) {
    let synced = results
        .iter()
        .filter(|r| matches!(r, ResyncResult::Synced { .. }))
        .count();
    let no_subscription = results
        .iter()
        .filter(|r| matches!(r, ResyncResult::NoSubscription { .. }))
        .count();
    let errors = results
        .iter()
        .filter(|r| matches!(r, ResyncResult::Error { .. }))
        .count();

    info!(
        synced = synced,
        no_subscription = no_subscription,
        errors = errors,
        "Re-sync cycle complete"
    );

    for result in results {
        if let ResyncResult::Error {
            user_id,
            customer_id,
            error,
            retryable,
        } = result
        {
            error!(
                user_id = %user_id,
                customer_id = %customer_id,
                error = %error,
                retryable = retryable,
                "Failed to re-sync subscription"
            );
        }
    }
}

/// Run every invariant check, then reconcile the users behind healable violations
pub async fn check_and_heal(
    billing: &BillingService,
    checker: &InvariantChecker,
    config: &WorkerConfig,
) -> Option<InvariantCheckSummary> {
    let summary = match checker.run_all_checks().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Invariant check failed to run");
            return None;
        }
    };

    let mut healed = 0usize;
    for user_id in summary.healable_users() {
        let outcome = RetryIf::spawn(
            config.backoff(),
            || billing.engine.reconcile_user(user_id),
            BillingError::is_retryable,
        )
        .await;

        match outcome {
            Ok(_) => healed += 1,
            Err(e) => error!(user_id = %user_id, error = %e, "Failed to heal invariant violation"),
        }
    }

    if !summary.healthy {
        info!(
            violations = summary.violations.len(),
            healed = healed,
            "Invariant heal pass complete"
        );
    }
    Some(summary)
}
