//! Renewal scheduler
//!
//! Selects due subscriptions (ACTIVE or PAST_DUE with `current_period_end <= now`, and
//! not waiting out a declined charge) and drives each through
//! [`SubscriptionService::renew`]. Items are independent: one failure is recorded and
//! the rest of the batch continues.
//!
//! A pass walks every due row in `(current_period_end, id)` order, one page at a time,
//! so rows that stay due after their attempt cannot hide the ones behind them.
//!
//! Running two schedulers at once is safe. Renewals of the same subscription serialize
//! on its lock, and a racing charge carries the same idempotency key.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::DueCursor;
use crate::subscriptions::{RenewalOutcome, SubscriptionService};
use crate::BillingContext;

/// Result of renewing one subscription
#[derive(Debug, Clone)]
pub enum RenewalResult {
    Renewed { subscription_id: Uuid },
    Canceled { subscription_id: Uuid },
    Declined {
        subscription_id: Uuid,
        code: Option<String>,
    },
    Pending { subscription_id: Uuid },
    Skipped { subscription_id: Uuid },
    Error { subscription_id: Uuid, error: String },
}

impl RenewalResult {
    fn from_outcome(subscription_id: Uuid, outcome: BillingResult<RenewalOutcome>) -> Self {
        match outcome {
            Ok(RenewalOutcome::Renewed(_)) => RenewalResult::Renewed { subscription_id },
            Ok(RenewalOutcome::Canceled(_)) => RenewalResult::Canceled { subscription_id },
            Ok(RenewalOutcome::Declined { code, .. }) => RenewalResult::Declined {
                subscription_id,
                code,
            },
            Ok(RenewalOutcome::Pending(_)) => RenewalResult::Pending { subscription_id },
            Ok(RenewalOutcome::NotDue(_)) => RenewalResult::Skipped { subscription_id },
            Err(e) => RenewalResult::Error {
                subscription_id,
                error: e.to_string(),
            },
        }
    }
}

/// Counts for one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalRunSummary {
    pub selected: usize,
    pub renewed: usize,
    pub canceled: usize,
    pub declined: usize,
    pub pending: usize,
    pub skipped: usize,
    pub errors: Vec<(Uuid, String)>,
}

impl RenewalRunSummary {
    fn from_results(results: &[RenewalResult]) -> Self {
        let mut summary = Self {
            selected: results.len(),
            ..Self::default()
        };
        for result in results {
            match result {
                RenewalResult::Renewed { .. } => summary.renewed += 1,
                RenewalResult::Canceled { .. } => summary.canceled += 1,
                RenewalResult::Declined { .. } => summary.declined += 1,
                RenewalResult::Pending { .. } => summary.pending += 1,
                RenewalResult::Skipped { .. } => summary.skipped += 1,
                RenewalResult::Error {
                    subscription_id,
                    error,
                } => summary.errors.push((*subscription_id, error.clone())),
            }
        }
        summary
    }
}

#[derive(Clone)]
pub struct RenewalScheduler {
    ctx: Arc<BillingContext>,
    subscriptions: SubscriptionService,
}

impl RenewalScheduler {
    pub fn new(ctx: Arc<BillingContext>) -> Self {
        let subscriptions = SubscriptionService::new(ctx.clone());
        Self { ctx, subscriptions }
    }

    /// Renew every due subscription, page by page
    pub async fn run_once(&self) -> BillingResult<RenewalRunSummary> {
        let now = self.ctx.clock.now();
        let batch_size = self.ctx.config.renewal_batch_size.max(1);
        let mut after: Option<DueCursor> = None;
        let mut results: Vec<RenewalResult> = Vec::new();

        loop {
            let due = self
                .ctx
                .store
                .list_due_subscriptions(now, after, batch_size)
                .await?;
            let Some(last) = due.last() else {
                break;
            };
            after = Some(DueCursor::of(last));
            let full_page = due.len() as i64 >= batch_size;

            tracing::info!(count = due.len(), "Renewing due subscriptions");
            let page: Vec<RenewalResult> = stream::iter(due.into_iter().map(|sub| sub.id))
                .map(|id| async move {
                    let outcome = self.subscriptions.renew(id).await;
                    RenewalResult::from_outcome(id, outcome)
                })
                .buffer_unordered(self.ctx.config.renewal_concurrency.max(1))
                .collect()
                .await;
            results.extend(page);

            if !full_page {
                break;
            }
        }

        if results.is_empty() {
            tracing::debug!("No subscriptions due for renewal");
            return Ok(RenewalRunSummary::default());
        }

        for result in &results {
            match result {
                RenewalResult::Declined {
                    subscription_id,
                    code,
                } => {
                    tracing::info!(subscription_id = %subscription_id, decline_code = ?code, "Renewal declined");
                }
                RenewalResult::Error {
                    subscription_id,
                    error,
                } => {
                    tracing::error!(subscription_id = %subscription_id, error = %error, "Renewal failed");
                }
                _ => {}
            }
        }

        let summary = RenewalRunSummary::from_results(&results);
        tracing::info!(
            selected = summary.selected,
            renewed = summary.renewed,
            canceled = summary.canceled,
            declined = summary.declined,
            pending = summary.pending,
            skipped = summary.skipped,
            errors = summary.errors.len(),
            "Renewal cycle complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ChargeReceipt, GatewayError, PaymentStatus};
    use crate::clock::Clock;
    use crate::config::BillingConfig;
    use crate::subscriptions::SubscriptionStatus;
    use crate::testing::TestHarness;
    use time::Duration;

    #[tokio::test]
    async fn test_run_once_renews_only_due_subscriptions() {
        let h = TestHarness::new();
        let creator = h.creator_with_price(1000);
        let early = h
            .subscriptions()
            .subscribe(uuid::Uuid::new_v4(), creator, "cnon_ok")
            .await
            .unwrap();
        h.clock.advance(Duration::days(15));
        let late = h
            .subscriptions()
            .subscribe(uuid::Uuid::new_v4(), creator, "cnon_ok")
            .await
            .unwrap();

        h.clock.advance(Duration::days(20));
        let summary = h.renewals().run_once().await.unwrap();

        assert_eq!(summary.selected, 1);
        assert_eq!(summary.renewed, 1);
        let early = h.subscriptions().get(early.id).await.unwrap();
        let late_now = h.subscriptions().get(late.id).await.unwrap();
        assert!(early.current_period_end > h.clock.now());
        assert_eq!(late_now.version, late.version);
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_the_batch() {
        let h = TestHarness::new();
        let creator = h.creator_with_price(1000);
        let a = h.subscriptions().subscribe(uuid::Uuid::new_v4(), creator, "cnon_ok").await.unwrap();
        let b = h.subscriptions().subscribe(uuid::Uuid::new_v4(), creator, "cnon_ok").await.unwrap();

        h.clock.advance(Duration::days(32));
        h.gateway.push_charge(Err(GatewayError::Declined {
            code: Some("INSUFFICIENT_FUNDS".into()),
        }));
        let summary = h.renewals().run_once().await.unwrap();

        assert_eq!(summary.selected, 2);
        assert_eq!(summary.renewed + summary.declined, 2);
        assert_eq!(summary.declined, 1);
        let statuses = [
            h.subscriptions().get(a.id).await.unwrap().status,
            h.subscriptions().get(b.id).await.unwrap().status,
        ];
        assert!(statuses.contains(&SubscriptionStatus::PastDue));
        assert!(statuses.contains(&SubscriptionStatus::Active));
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_concurrent_runs_charge_once() {
        let h = TestHarness::new();
        let creator = h.creator_with_price(1000);
        let sub = h.subscriptions().subscribe(uuid::Uuid::new_v4(), creator, "cnon_ok").await.unwrap();
        h.clock.advance(Duration::days(32));

        let (a, b) = (h.renewals(), h.renewals());
        let (first, second) = tokio::join!(a.run_once(), b.run_once());
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.renewed + second.renewed, 1);
        assert_eq!(h.gateway.charge_count(), 2);
        assert_eq!(h.store.transaction_count().await, 4);
        let renewed = h.subscriptions().get(sub.id).await.unwrap();
        assert_eq!(renewed.status, SubscriptionStatus::Active);
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_stuck_renewal_does_not_starve_later_ones() {
        let h = TestHarness::with_config(BillingConfig {
            renewal_batch_size: 1,
            ..BillingConfig::default()
        });
        let creator = h.creator_with_price(1000);
        let stuck = h.subscriptions().subscribe(uuid::Uuid::new_v4(), creator, "cnon_ok").await.unwrap();
        h.clock.advance(Duration::days(1));
        let later = h.subscriptions().subscribe(uuid::Uuid::new_v4(), creator, "cnon_ok").await.unwrap();

        h.clock.set(stuck.current_period_end);
        h.gateway.push_charge(Ok(ChargeReceipt {
            external_payment_id: "pay_stuck".into(),
            status: PaymentStatus::Approved,
        }));
        let first = h.renewals().run_once().await.unwrap();
        assert_eq!(first.pending, 1);

        // The stuck row sorts first and still qualifies on every pass
        h.clock.set(later.current_period_end);
        let second = h.renewals().run_once().await.unwrap();

        assert_eq!(second.selected, 2);
        assert_eq!(second.pending, 1);
        assert_eq!(second.renewed, 1);
        let renewed = h.subscriptions().get(later.id).await.unwrap();
        assert_eq!(renewed.status, SubscriptionStatus::Active);
        assert!(renewed.current_period_end > h.clock.now());
        let waiting = h.subscriptions().get(stuck.id).await.unwrap();
        assert_eq!(waiting.status, SubscriptionStatus::PastDue);
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_paging_visits_every_due_row_once() {
        let h = TestHarness::with_config(BillingConfig {
            renewal_batch_size: 2,
            ..BillingConfig::default()
        });
        let creator = h.creator_with_price(1000);
        for _ in 0..5 {
            h.subscriptions().subscribe(uuid::Uuid::new_v4(), creator, "cnon_ok").await.unwrap();
        }

        h.clock.advance(Duration::days(32));
        let summary = h.renewals().run_once().await.unwrap();

        assert_eq!(summary.selected, 5);
        assert_eq!(summary.renewed, 5);
        assert_eq!(h.gateway.charge_count(), 10);
        h.assert_invariants().await;
    }
}
