// Worker clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Patronage Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription renewals with dunning (hourly by default)
//! - Ledger invariant sweep (daily at 03:30 UTC by default)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use patronage_billing::{BillingService, RealtimeNotifier};
use patronage_shared::{connect_redis, create_pool, DbConfig, RedisPresence, DEFAULT_PRESENCE_TTL};
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

use crate::jobs::{RecurringJob, WorkerConfig, HEARTBEAT_CRON};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Patronage Worker");

    let config = WorkerConfig::from_env()?;
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let redis_url =
        std::env::var("REDIS_URL").map_err(|_| anyhow::anyhow!("REDIS_URL must be set"))?;

    let pool = create_pool(
        &database_url,
        DbConfig {
            max_connections: 5,
            ..DbConfig::default()
        },
    )
    .await?;

    let redis = connect_redis(&redis_url).await?;
    let presence = Arc::new(RedisPresence::new(redis.clone(), DEFAULT_PRESENCE_TTL));
    let notifier = Arc::new(RealtimeNotifier::new(redis, presence));

    let billing = Arc::new(BillingService::from_env(pool, notifier)?);

    let scheduler = JobScheduler::new().await?;

    let renewal_billing = billing.clone();
    RecurringJob::new("subscription_renewals", config.renewal_cron.clone(), config.renewal_jitter)
        .schedule(&scheduler, move || {
            let billing = renewal_billing.clone();
            async move {
                jobs::run_renewals(&billing).await;
            }
        })
        .await?;

    let invariant_billing = billing.clone();
    RecurringJob::new("ledger_invariants", config.invariant_cron.clone(), Duration::ZERO)
        .schedule(&scheduler, move || {
            let billing = invariant_billing.clone();
            async move {
                jobs::run_invariant_checks(&billing).await;
            }
        })
        .await?;

    RecurringJob::new("heartbeat", HEARTBEAT_CRON, Duration::ZERO)
        .schedule(&scheduler, || async {
            info!("Worker heartbeat - all systems operational");
        })
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Patronage Worker started with 3 scheduled jobs");

    // Renewals are idempotent per period and attempt, so catching up right away after a
    // restart is safe
    jobs::run_renewals(&billing).await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let mut scheduler = scheduler;
    scheduler.shutdown().await?;

    Ok(())
}
