//! StageRight Background Worker
//!
//! Handles scheduled reconciliation jobs:
//! - Credit synchronizer pass over all users (hourly)
//! - Expiry sweep for lapsed cancellations (hourly)
//! - Webhook audit table cleanup (daily at 4:10 UTC)
//!
//! The engine has no other scheduler; lazy expiry on read plus this sweep
//! is what moves canceled users off their paid plan.

use std::sync::Arc;
use std::time::Duration;

use stageright_billing::BillingService;
use stageright_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// How long processed webhook audit rows are kept
const WEBHOOK_RETENTION_DAYS: i32 = 90;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting StageRight Worker");

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without Stripe config there is nothing to reconcile against;
            // idle rather than crash-loop so deploys without billing work.
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: credit synchronizer pass, hourly at :25
    let sync_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 25 * * * *", move |_uuid, _l| {
            let billing = sync_billing.clone();
            Box::pin(async move {
                info!("Running scheduled credit sync pass");
                match billing.sync.sync_all().await {
                    Ok(report) => info!(
                        checked = report.checked,
                        repaired = report.repaired,
                        seeded = report.seeded,
                        failures = report.failures,
                        "Credit sync pass finished"
                    ),
                    Err(e) => error!(error = %e, "Credit sync pass failed"),
                }
            })
        })?)
        .await?;

    // Job 2: expire lapsed cancellations, hourly at :40
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 40 * * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                info!("Running expiry sweep for lapsed cancellations");
                match billing.engine.sweep_expired().await {
                    Ok(expired) => {
                        if expired > 0 {
                            info!(expired = expired, "Expired lapsed subscriptions to free tier");
                        }
                    }
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;

    // Job 3: webhook audit cleanup, daily at 04:10 UTC
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 10 4 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                match billing
                    .webhooks
                    .cleanup_old_events(WEBHOOK_RETENTION_DAYS)
                    .await
                {
                    Ok(deleted) => {
                        if deleted > 0 {
                            info!(
                                deleted = deleted,
                                retention_days = WEBHOOK_RETENTION_DAYS,
                                "Cleaned up old webhook events"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Webhook cleanup failed"),
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Scheduler started");

    // Keep the worker alive
    loop {
        tokio::time::sleep(Duration::from_secs(300)).await;
        info!("Worker heartbeat");
    }
}
