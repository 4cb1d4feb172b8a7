// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sefer Background Worker
//!
//! Handles scheduled jobs including:
//! - Full subscription re-sync against Stripe (every 6 hours by default)
//! - Invariant checks with healing of repairable users (daily at 03:30 UTC by default)
//! - Heartbeat (every 5 minutes)

mod config;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sefer_billing::{BillingService, InvariantChecker};
use sefer_shared::{create_pool, run_migrations, PoolSettings};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::WorkerConfig;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(config.log_json);

    info!("Starting Sefer Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url, &PoolSettings::from_env()).await?;
    run_migrations(&pool).await?;
    info!("Database pool created");

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Nothing to reconcile against without Stripe credentials
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };
    let checker = Arc::new(InvariantChecker::new(
        pool.clone(),
        billing.engine.catalog().clone(),
    ));
    let config = Arc::new(config);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Full re-sync
    let resync_billing = billing.clone();
    let resync_config = config.clone();
    scheduler
        .add(Job::new_async(config.resync_schedule.as_str(), move |_uuid, _l| {
            let billing = resync_billing.clone();
            let config = resync_config.clone();
            Box::pin(async move {
                info!("Running scheduled subscription re-sync");
                jobs::resync_all(&billing, &config).await;
            })
        })?)
        .await?;
    info!(schedule = %config.resync_schedule, "Scheduled: Subscription re-sync");

    // Job 2: Invariant check and heal
    let heal_billing = billing.clone();
    let heal_config = config.clone();
    scheduler
        .add(Job::new_async(config.invariant_schedule.as_str(), move |_uuid, _l| {
            let billing = heal_billing.clone();
            let checker = checker.clone();
            let config = heal_config.clone();
            Box::pin(async move {
                info!("Running scheduled invariant checks");
                jobs::check_and_heal(&billing, &checker, &config).await;
            })
        })?)
        .await?;
    info!(schedule = %config.invariant_schedule, "Scheduled: Invariant check and heal");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Worker scheduler started");

    // Converge once at startup instead of waiting for the first tick
    jobs::resync_all(&billing, &config).await;

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
