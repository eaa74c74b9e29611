//! Ledger invariants
//!
//! Runnable consistency checks over the wallet ledger and subscriptions. They only
//! read, so they can run after any mutation, webhook replay or on a schedule.
//!
//! ## Checks
//!
//! 1. `ledger_zero_sum`: for each charge reference, Σ(amount + fee) over its legs is 0
//! 2. `pair_cardinality`: each charge reference has exactly two legs, both completed
//!    or neither
//! 3. `single_live_subscription`: at most one PENDING/ACTIVE/PAST_DUE subscription per
//!    (subscriber, creator)
//! 4. `period_ordering`: `current_period_end > current_period_start`

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::BillingResult;
use crate::store::BillingStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Charge reference or subscription ids affected
    pub subjects: Vec<String>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money was created or destroyed
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Service for running ledger invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        for violation in &violations {
            tracing::error!(
                alert = true,
                invariant = %violation.invariant,
                severity = %violation.severity,
                subjects = ?violation.subjects,
                description = %violation.description,
                "InconsistentLedger"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: self.clock.now(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: every charge reference nets to zero
    async fn check_ledger_zero_sum(&self) -> BillingResult<Vec<InvariantViolation>> {
        let summaries = self.store.charge_ref_summaries().await?;
        Ok(summaries
            .into_iter()
            .filter(|s| s.net_sum != 0)
            .map(|s| InvariantViolation {
                invariant: "ledger_zero_sum".to_string(),
                description: format!(
                    "Charge {} nets to {} instead of 0",
                    s.external_ref, s.net_sum
                ),
                context: serde_json::json!({ "net_sum": s.net_sum, "rows": s.rows }),
                subjects: vec![s.external_ref],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: two legs per charge, settled together
    async fn check_pair_cardinality(&self) -> BillingResult<Vec<InvariantViolation>> {
        let summaries = self.store.charge_ref_summaries().await?;
        Ok(summaries
            .into_iter()
            .filter(|s| s.rows != 2 || !(s.completed_rows == 0 || s.completed_rows == 2))
            .map(|s| InvariantViolation {
                invariant: "pair_cardinality".to_string(),
                description: format!(
                    "Charge {} has {} legs ({} completed), expected 2 settled together",
                    s.external_ref, s.rows, s.completed_rows
                ),
                context: serde_json::json!({
                    "rows": s.rows,
                    "completed_rows": s.completed_rows,
                }),
                subjects: vec![s.external_ref],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: one live subscription per pair
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let duplicates = self.store.live_subscription_duplicates().await?;
        Ok(duplicates
            .into_iter()
            .map(|d| InvariantViolation {
                invariant: "single_live_subscription".to_string(),
                subjects: vec![d.subscriber_id.to_string(), d.creator_id.to_string()],
                description: format!(
                    "Subscriber has {} live subscriptions to one creator (expected at most 1)",
                    d.live_count
                ),
                context: serde_json::json!({ "live_count": d.live_count }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: periods move forward
    async fn check_period_ordering(&self) -> BillingResult<Vec<InvariantViolation>> {
        let ids: Vec<Uuid> = self.store.invalid_periods().await?;
        Ok(ids
            .into_iter()
            .map(|id| InvariantViolation {
                invariant: "period_ordering".to_string(),
                subjects: vec![id.to_string()],
                description: "Subscription period ends before it starts".to_string(),
                context: serde_json::Value::Null,
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "ledger_zero_sum" => self.check_ledger_zero_sum().await,
            "pair_cardinality" => self.check_pair_cardinality().await,
            "single_live_subscription" => self.check_single_live_subscription().await,
            "period_ordering" => self.check_period_ordering().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "ledger_zero_sum",
            "pair_cardinality",
            "single_live_subscription",
            "period_ordering",
        ]
    }
}
