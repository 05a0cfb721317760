// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Hookrelay Background Worker
//!
//! Handles scheduled jobs:
//! - Stale gateway event sweep (every 5 minutes)
//! - Invariant checks (hourly)

mod sweep;

use std::sync::Arc;

use anyhow::Context;
use hookrelay_reconcile::{
    HttpPaymentGateway, InvariantChecker, ReconcileServices, Stores, DEFAULT_GATEWAY_BASE_URL,
};
use hookrelay_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::sweep::{sweep_stale_events, DEFAULT_BATCH_SIZE};

fn batch_size() -> anyhow::Result<i64> {
    match std::env::var("SWEEP_BATCH_SIZE") {
        Ok(raw) => {
            let size: i64 = raw
                .trim()
                .parse()
                .with_context(|| format!("SWEEP_BATCH_SIZE is not a number: {}", raw))?;
            anyhow::ensure!(size > 0, "SWEEP_BATCH_SIZE must be positive");
            Ok(size)
        }
        Err(_) => Ok(DEFAULT_BATCH_SIZE),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Hookrelay Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let gateway_base_url = std::env::var("GATEWAY_BASE_URL")
        .unwrap_or_else(|_| DEFAULT_GATEWAY_BASE_URL.to_string());
    let gateway_access_token = std::env::var("GATEWAY_ACCESS_TOKEN").unwrap_or_default();
    if gateway_access_token.is_empty() {
        warn!("GATEWAY_ACCESS_TOKEN not set - sweeps will fail at the gateway");
    }
    let batch_size = batch_size()?;

    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let gateway = Arc::new(HttpPaymentGateway::new(
        &gateway_base_url,
        &gateway_access_token,
    )?);
    let services = ReconcileServices::new(Stores::postgres(pool.clone()), gateway)?;
    let checker = Arc::new(InvariantChecker::new(pool));

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Reconcile gateway events left pending (every 5 minutes)
    let sweep_services = services.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let services = sweep_services.clone();
            Box::pin(async move {
                if let Err(e) =
                    sweep_stale_events(&services.recorder, &services.reconciler, batch_size).await
                {
                    error!(error = %e, "Stale event sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale event sweep (every 5 minutes)");

    // Job 2: Consistency checks (hourly)
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Invariant checks passed");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                binding_ids = ?violation.binding_ids,
                                description = %violation.description,
                                "Invariant violation"
                            );
                        }
                        warn!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Invariant checks found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Hookrelay Worker started with 2 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");

    scheduler.shutdown().await?;

    Ok(())
}
