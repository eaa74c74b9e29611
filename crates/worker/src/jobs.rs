//! Recurring jobs
//!
//! Each job is a cron expression plus a random start delay. Nothing here remembers
//! state between runs: the renewal query picks up whatever is due and idempotency
//! keys make a repeated charge harmless, so a restart or a missed tick only delays
//! work.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use patronage_billing::{BillingService, InvariantCheckSummary, RenewalRunSummary};
use rand::Rng;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub const DEFAULT_RENEWAL_CRON: &str = "0 0 * * * *";
pub const DEFAULT_RENEWAL_JITTER_SECS: u64 = 120;
pub const DEFAULT_INVARIANT_CRON: &str = "0 30 3 * * *";
pub const HEARTBEAT_CRON: &str = "0 */5 * * * *";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub renewal_cron: String,
    pub renewal_jitter: Duration,
    pub invariant_cron: String,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let renewal_jitter = match lookup("RENEWAL_JITTER_SECS") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                anyhow::anyhow!("RENEWAL_JITTER_SECS is not a number of seconds: {}", raw)
            })?,
            None => DEFAULT_RENEWAL_JITTER_SECS,
        };

        Ok(Self {
            renewal_cron: non_empty(lookup("RENEWAL_CRON"))
                .unwrap_or_else(|| DEFAULT_RENEWAL_CRON.to_string()),
            renewal_jitter: Duration::from_secs(renewal_jitter),
            invariant_cron: non_empty(lookup("INVARIANT_CRON"))
                .unwrap_or_else(|| DEFAULT_INVARIANT_CRON.to_string()),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// A named cron job with a random start delay of up to `jitter`
#[derive(Debug, Clone)]
pub struct RecurringJob {
    pub name: &'static str,
    pub cron: String,
    pub jitter: Duration,
}

impl RecurringJob {
    pub fn new(name: &'static str, cron: impl Into<String>, jitter: Duration) -> Self {
        Self {
            name,
            cron: cron.into(),
            jitter,
        }
    }

    /// Register `task` on `scheduler`. A tick that fires while the previous run is
    /// still going is skipped.
    pub async fn schedule<F, Fut>(self, scheduler: &JobScheduler, task: F) -> anyhow::Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(task);
        let running = Arc::new(Mutex::new(()));
        let name = self.name;
        let jitter = self.jitter;

        let job = Job::new_async(self.cron.as_str(), move |_uuid, _l| {
            let task = task.clone();
            let running = running.clone();
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!(job = name, "Previous run still in progress, skipping tick");
                    return;
                };
                let delay = jitter_delay(jitter);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                (*task)().await;
            })
        })?;
        scheduler.add(job).await?;

        info!(job = self.name, cron = %self.cron, jitter_secs = self.jitter.as_secs(), "Scheduled job");
        Ok(())
    }
}

/// Uniform delay in `[0, max]`, whole seconds
pub fn jitter_delay(max: Duration) -> Duration {
    let max_secs = max.as_secs();
    if max_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rand::rng().random_range(0..=max_secs))
}

pub async fn run_renewals(billing: &BillingService) -> Option<RenewalRunSummary> {
    info!("Running scheduled subscription renewals");
    match billing.renewals.run_once().await {
        Ok(summary) => {
            log_renewal_summary(&summary);
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Renewal run failed");
            None
        }
    }
}

pub async fn run_invariant_checks(billing: &BillingService) -> Option<InvariantCheckSummary> {
    info!("Running ledger invariant checks");
    match billing.invariants.run_all_checks().await {
        Ok(summary) => {
            log_invariant_summary(&summary);
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Invariant check run failed");
            None
        }
    }
}

/// Log results of a renewal run
fn log_renewal_summary(summary: &RenewalRunSummary) {
    info!(
        selected = summary.selected,
        renewed = summary.renewed,
        canceled = summary.canceled,
        declined = summary.declined,
        pending = summary.pending,
        skipped = summary.skipped,
        errors = summary.errors.len(),
        "Renewal cycle complete"
    );

    for (subscription_id, err) in &summary.errors {
        error!(subscription_id = %subscription_id, error = %err, "Failed to renew subscription");
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Ledger invariants hold"
        );
        return;
    }

    for violation in &summary.violations {
        error!(
            alert = true,
            invariant = %violation.invariant,
            severity = %violation.severity,
            subjects = ?violation.subjects,
            description = %violation.description,
            "InconsistentLedger"
        );
    }
    error!(
        alert = true,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Ledger invariant checks failed"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use patronage_billing::testing::TestHarness;
    use patronage_billing::SubscriptionStatus;
    use uuid::Uuid;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<WorkerConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.renewal_cron, DEFAULT_RENEWAL_CRON);
        assert_eq!(config.renewal_jitter, Duration::from_secs(120));
        assert_eq!(config.invariant_cron, DEFAULT_INVARIANT_CRON);
    }

    #[test]
    fn test_config_overrides() {
        let config = config_from(&[
            ("RENEWAL_CRON", "0 */10 * * * *"),
            ("RENEWAL_JITTER_SECS", "0"),
            ("INVARIANT_CRON", " "),
        ])
        .unwrap();
        assert_eq!(config.renewal_cron, "0 */10 * * * *");
        assert_eq!(config.renewal_jitter, Duration::ZERO);
        assert_eq!(config.invariant_cron, DEFAULT_INVARIANT_CRON);
    }

    #[test]
    fn test_config_rejects_bad_jitter() {
        assert!(config_from(&[("RENEWAL_JITTER_SECS", "two minutes")]).is_err());
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
        let max = Duration::from_secs(5);
        for _ in 0..200 {
            assert!(jitter_delay(max) <= max);
        }
    }

    #[tokio::test]
    async fn test_schedule_accepts_default_crons() {
        let scheduler = JobScheduler::new().await.unwrap();
        for cron in [DEFAULT_RENEWAL_CRON, DEFAULT_INVARIANT_CRON, HEARTBEAT_CRON] {
            RecurringJob::new("heartbeat", cron, Duration::ZERO)
                .schedule(&scheduler, || async {})
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_schedule_rejects_invalid_cron() {
        let scheduler = JobScheduler::new().await.unwrap();
        let result = RecurringJob::new("broken", "every hour", Duration::ZERO)
            .schedule(&scheduler, || async {})
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_renewal_job_renews_due_subscriptions() {
        let h = TestHarness::new();
        let billing = BillingService::from_context(h.ctx.clone(), h.signing());
        let creator = h.creator_with_price(1200);
        let sub = h
            .subscriptions()
            .subscribe(Uuid::new_v4(), creator, "cnon_ok")
            .await
            .unwrap();

        let summary = run_renewals(&billing).await.unwrap();
        assert_eq!(summary.selected, 0);

        h.clock.advance(time::Duration::days(32));
        let summary = run_renewals(&billing).await.unwrap();
        assert_eq!(summary.selected, 1);
        assert_eq!(summary.renewed, 1);

        let renewed = h.subscriptions().get(sub.id).await.unwrap();
        assert_eq!(renewed.status, SubscriptionStatus::Active);
        assert!(renewed.current_period_end > sub.current_period_end);

        // A second tick in the same period charges nothing
        let charges = h.gateway.charge_count();
        let summary = run_renewals(&billing).await.unwrap();
        assert_eq!(summary.renewed, 0);
        assert_eq!(h.gateway.charge_count(), charges);

        let invariants = run_invariant_checks(&billing).await.unwrap();
        assert!(invariants.healthy);
    }
}
