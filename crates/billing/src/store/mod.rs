//! Persistence seam for the billing engine
//!
//! [`BillingStore`] serves plain reads and opens units of work. Every mutation goes
//! through a [`StoreTx`]: rows are locked with `lock_*`, changed, and the whole unit
//! commits at once. Dropping a `StoreTx` without committing rolls it back.
//!
//! Do not call `BillingStore` reads while holding a `StoreTx` in the same task; use the
//! transaction's own reads instead.

mod memory;
mod postgres;

pub use memory::{LockedRows, MemoryStore};
pub use postgres::PgStore;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::ledger::{TransactionStatus, TransactionType, WalletTransaction};
use crate::purchases::Purchase;
use crate::subscriptions::{Subscription, SubscriptionStatus};

/// Outcome of trying to take ownership of a webhook event id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// This caller owns processing of the event
    Claimed,
    /// The event finished successfully before
    AlreadyProcessed,
    /// Another worker is processing it right now
    InProgress,
}

/// Re-claim events stuck in `processing` after this many minutes
pub const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Per-reference aggregate over charge legs, used by the invariant checker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefSummary {
    pub external_ref: String,
    pub rows: i64,
    pub completed_rows: i64,
    /// Σ(amount + fee) over every leg of the reference
    pub net_sum: i64,
}

/// Position in the due-subscription order `(current_period_end, id)`. A page read
/// after a cursor starts strictly past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DueCursor {
    pub period_end: OffsetDateTime,
    pub id: Uuid,
}

impl DueCursor {
    pub fn of(sub: &Subscription) -> Self {
        Self {
            period_end: sub.current_period_end,
            id: sub.id,
        }
    }
}

/// A subscriber/creator pair with more than one live subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveDuplicate {
    pub subscriber_id: Uuid,
    pub creator_id: Uuid,
    pub live_count: i64,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>>;

    async fn get_customer_id(&self, account_id: Uuid) -> BillingResult<Option<String>>;

    /// Persist the processor customer id unless one is already set. Returns the id that is
    /// stored after the call (first writer wins).
    async fn save_customer_id(&self, account_id: Uuid, customer_id: &str) -> BillingResult<String>;

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Newest first
    async fn list_subscriptions(
        &self,
        subscriber_id: Uuid,
        status: Option<SubscriptionStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<Subscription>>;

    async fn pair_subscriptions(
        &self,
        subscriber_id: Uuid,
        creator_id: Uuid,
    ) -> BillingResult<Vec<Subscription>>;

    /// ACTIVE or PAST_DUE subscriptions whose period ended at or before `now` and whose
    /// retry time, if any, has come. Ordered by `(current_period_end, id)` and starting
    /// after `after`.
    async fn list_due_subscriptions(
        &self,
        now: OffsetDateTime,
        after: Option<DueCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    async fn get_purchase(&self, id: Uuid) -> BillingResult<Option<Purchase>>;

    /// Sum of COMPLETED amounts for an account, optionally restricted by type and time
    async fn sum_completed(
        &self,
        account_id: Uuid,
        types: Option<&[TransactionType]>,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<i64>;

    /// Newest first
    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WalletTransaction>>;

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<EventClaim>;

    /// Record the processing result; `error = None` marks success
    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()>;

    async fn charge_ref_summaries(&self) -> BillingResult<Vec<RefSummary>>;

    async fn live_subscription_duplicates(&self) -> BillingResult<Vec<LiveDuplicate>>;

    /// Ids of subscriptions whose period end is not after its start
    async fn invalid_periods(&self) -> BillingResult<Vec<Uuid>>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn lock_subscription(&mut self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// The PENDING, ACTIVE or PAST_DUE subscription of a pair, if any
    async fn lock_live_subscription(
        &mut self,
        subscriber_id: Uuid,
        creator_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    /// Subscription owning a charge: `external_payment_ref == payment_ref` or
    /// `pending_charge_key == charge_key`
    async fn lock_subscription_by_charge(
        &mut self,
        payment_ref: &str,
        charge_key: Option<&str>,
    ) -> BillingResult<Option<Subscription>>;

    async fn insert_subscription(&mut self, sub: &Subscription) -> BillingResult<()>;

    /// Write `sub` if the stored row still has `expected_version`
    async fn update_subscription(
        &mut self,
        sub: &Subscription,
        expected_version: i64,
    ) -> BillingResult<()>;

    async fn lock_purchase(&mut self, id: Uuid) -> BillingResult<Option<Purchase>>;

    /// The PENDING or COMPLETED purchase of a post by a buyer, if any
    async fn lock_live_purchase(
        &mut self,
        buyer_id: Uuid,
        post_id: Uuid,
    ) -> BillingResult<Option<Purchase>>;

    async fn count_purchases(&mut self, buyer_id: Uuid, post_id: Uuid) -> BillingResult<i64>;

    async fn lock_purchase_by_charge(
        &mut self,
        payment_ref: &str,
        charge_key: Option<&str>,
    ) -> BillingResult<Option<Purchase>>;

    /// Purchase whose in-flight or finished refund is `refund_ref`, or whose payment is
    /// `payment_ref`
    async fn lock_purchase_by_refund(
        &mut self,
        refund_ref: &str,
        payment_ref: Option<&str>,
    ) -> BillingResult<Option<Purchase>>;

    async fn insert_purchase(&mut self, purchase: &Purchase) -> BillingResult<()>;

    async fn update_purchase(
        &mut self,
        purchase: &Purchase,
        expected_version: i64,
    ) -> BillingResult<()>;

    async fn lock_transactions_by_ref(
        &mut self,
        external_ref: &str,
    ) -> BillingResult<Vec<WalletTransaction>>;

    async fn insert_transaction(&mut self, row: &WalletTransaction) -> BillingResult<()>;

    /// Move rows of `external_ref` currently in `from` to `to`; returns rows changed
    async fn set_transaction_status(
        &mut self,
        external_ref: &str,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> BillingResult<u64>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}
