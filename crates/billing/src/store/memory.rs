//! In-memory [`BillingStore`]
//!
//! A unit of work holds an owned lock over the whole state and edits a private copy,
//! which replaces the shared state on commit. Units of work are therefore fully
//! serialized, the strongest isolation Postgres row locks give us. The unique and
//! version checks mirror the constraints in `migrations/`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    BillingStore, DueCursor, EventClaim, LiveDuplicate, RefSummary, StoreTx,
    WEBHOOK_PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{TransactionStatus, TransactionType, WalletTransaction};
use crate::purchases::Purchase;
use crate::subscriptions::{Subscription, SubscriptionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Processing,
    Success,
    Error,
}

#[derive(Debug, Clone)]
struct EventRecord {
    state: EventState,
    started_at: OffsetDateTime,
    error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct State {
    customers: HashMap<Uuid, String>,
    /// Insertion order
    subscriptions: Vec<Subscription>,
    purchases: Vec<Purchase>,
    transactions: Vec<WalletTransaction>,
    webhook_events: HashMap<String, EventRecord>,
}

/// Kind of row a unit of work locked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockedRows {
    /// Subscription or purchase rows
    Owner,
    /// Wallet transaction rows
    Ledger,
}

type LockJournal = Arc<std::sync::Mutex<Vec<Vec<LockedRows>>>>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    /// Lock calls per unit of work, in begin order
    locks: LockJournal,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of wallet transaction rows
    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    /// Recorded state of a webhook event: `processing`, `success` or `error`
    pub async fn webhook_event_state(&self, event_id: &str) -> Option<&'static str> {
        self.state
            .lock()
            .await
            .webhook_events
            .get(event_id)
            .map(|record| match record.state {
                EventState::Processing => "processing",
                EventState::Success => "success",
                EventState::Error => "error",
            })
    }

    /// Lock calls of every unit of work begun so far
    pub fn lock_journal(&self) -> Vec<Vec<LockedRows>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Units of work that locked an owner row after already holding ledger rows. On
    /// Postgres those can deadlock against the charge paths, which lock the owner first.
    pub fn lock_order_inversions(&self) -> usize {
        self.lock_journal()
            .iter()
            .filter(|calls| {
                calls
                    .iter()
                    .skip_while(|kind| **kind != LockedRows::Ledger)
                    .any(|kind| *kind == LockedRows::Owner)
            })
            .count()
    }

    pub async fn webhook_event_error(&self, event_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .webhook_events
            .get(event_id)
            .and_then(|record| record.error.clone())
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        let unit = {
            let mut journal = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            journal.push(Vec::new());
            journal.len() - 1
        };
        Ok(Box::new(MemoryTx {
            guard,
            working,
            locks: self.locks.clone(),
            unit,
        }))
    }

    async fn get_customer_id(&self, account_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.state.lock().await.customers.get(&account_id).cloned())
    }

    async fn save_customer_id(&self, account_id: Uuid, customer_id: &str) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        Ok(state
            .customers
            .entry(account_id)
            .or_insert_with(|| customer_id.to_string())
            .clone())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn list_subscriptions(
        &self,
        subscriber_id: Uuid,
        status: Option<SubscriptionStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut subs: Vec<Subscription> = state
            .subscriptions
            .iter()
            .rev()
            .filter(|s| s.subscriber_id == subscriber_id)
            .filter(|s| status.map_or(true, |status| s.status == status))
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(subs, limit, offset))
    }

    async fn pair_subscriptions(
        &self,
        subscriber_id: Uuid,
        creator_id: Uuid,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.subscriber_id == subscriber_id && s.creator_id == creator_id)
            .cloned()
            .collect())
    }

    async fn list_due_subscriptions(
        &self,
        now: OffsetDateTime,
        after: Option<DueCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut due: Vec<Subscription> = state
            .subscriptions
            .iter()
            .filter(|s| s.is_due(now))
            .filter(|s| after.map_or(true, |after| DueCursor::of(s) > after))
            .cloned()
            .collect();
        due.sort_by_key(DueCursor::of);
        Ok(page(due, limit, 0))
    }

    async fn get_purchase(&self, id: Uuid) -> BillingResult<Option<Purchase>> {
        let state = self.state.lock().await;
        Ok(state.purchases.iter().find(|p| p.id == id).cloned())
    }

    async fn sum_completed(
        &self,
        account_id: Uuid,
        types: Option<&[TransactionType]>,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id && t.status == TransactionStatus::Completed)
            .filter(|t| types.map_or(true, |types| types.contains(&t.transaction_type)))
            .filter(|t| since.map_or(true, |since| t.created_at >= since))
            .map(|t| t.amount_minor)
            .sum())
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WalletTransaction>> {
        let state = self.state.lock().await;
        let mut rows: Vec<WalletTransaction> = state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(rows, limit, offset))
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        _event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let mut state = self.state.lock().await;
        let stale_before = now - Duration::minutes(WEBHOOK_PROCESSING_TIMEOUT_MINUTES);

        let claim = match state.webhook_events.get(event_id) {
            None => EventClaim::Claimed,
            Some(record) => match record.state {
                EventState::Success => EventClaim::AlreadyProcessed,
                EventState::Error => EventClaim::Claimed,
                EventState::Processing if record.started_at < stale_before => EventClaim::Claimed,
                EventState::Processing => EventClaim::InProgress,
            },
        };
        if claim == EventClaim::Claimed {
            state.webhook_events.insert(
                event_id.to_string(),
                EventRecord {
                    state: EventState::Processing,
                    started_at: now,
                    error: None,
                },
            );
        }
        Ok(claim)
    }

    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.webhook_events.get_mut(event_id) {
            record.state = if error.is_some() {
                EventState::Error
            } else {
                EventState::Success
            };
            record.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn charge_ref_summaries(&self) -> BillingResult<Vec<RefSummary>> {
        let state = self.state.lock().await;
        let mut by_ref: BTreeMap<&str, RefSummary> = BTreeMap::new();
        for t in state
            .transactions
            .iter()
            .filter(|t| t.transaction_type.is_charge_leg())
        {
            let entry = by_ref
                .entry(t.external_payment_ref.as_str())
                .or_insert_with(|| RefSummary {
                    external_ref: t.external_payment_ref.clone(),
                    rows: 0,
                    completed_rows: 0,
                    net_sum: 0,
                });
            entry.rows += 1;
            if t.status == TransactionStatus::Completed {
                entry.completed_rows += 1;
            }
            entry.net_sum += t.amount_minor + t.fee_minor;
        }
        Ok(by_ref.into_values().collect())
    }

    async fn live_subscription_duplicates(&self) -> BillingResult<Vec<LiveDuplicate>> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<(Uuid, Uuid), i64> = BTreeMap::new();
        for s in state.subscriptions.iter().filter(|s| s.status.is_live()) {
            *counts.entry((s.subscriber_id, s.creator_id)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|((subscriber_id, creator_id), live_count)| LiveDuplicate {
                subscriber_id,
                creator_id,
                live_count,
            })
            .collect())
    }

    async fn invalid_periods(&self) -> BillingResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.current_period_end <= s.current_period_start)
            .map(|s| s.id)
            .collect())
    }
}

fn page<T>(rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    rows.into_iter().skip(offset).take(limit).collect()
}

struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
    locks: LockJournal,
    unit: usize,
}

impl MemoryTx {
    fn record(&self, kind: LockedRows) {
        let mut journal = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(calls) = journal.get_mut(self.unit) {
            calls.push(kind);
        }
    }
}

fn unique_violation(constraint: &str) -> BillingError {
    BillingError::Database(format!(
        "duplicate key value violates unique constraint \"{}\"",
        constraint
    ))
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_subscription(&mut self, id: Uuid) -> BillingResult<Option<Subscription>> {
        self.record(LockedRows::Owner);
        Ok(self.working.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn lock_live_subscription(
        &mut self,
        subscriber_id: Uuid,
        creator_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        self.record(LockedRows::Owner);
        Ok(self
            .working
            .subscriptions
            .iter()
            .find(|s| {
                s.subscriber_id == subscriber_id && s.creator_id == creator_id && s.status.is_live()
            })
            .cloned())
    }

    async fn lock_subscription_by_charge(
        &mut self,
        payment_ref: &str,
        charge_key: Option<&str>,
    ) -> BillingResult<Option<Subscription>> {
        self.record(LockedRows::Owner);
        let subs = &self.working.subscriptions;
        let by_key = charge_key.and_then(|key| {
            subs.iter()
                .find(|s| s.pending_charge_key.as_deref() == Some(key))
        });
        Ok(by_key
            .or_else(|| {
                subs.iter()
                    .find(|s| s.external_payment_ref.as_deref() == Some(payment_ref))
            })
            .cloned())
    }

    async fn insert_subscription(&mut self, sub: &Subscription) -> BillingResult<()> {
        if self.working.subscriptions.iter().any(|s| s.id == sub.id) {
            return Err(unique_violation("subscriptions_pkey"));
        }
        if sub.status.is_live()
            && self.working.subscriptions.iter().any(|s| {
                s.subscriber_id == sub.subscriber_id
                    && s.creator_id == sub.creator_id
                    && s.status.is_live()
            })
        {
            return Err(unique_violation("subscriptions_one_live_per_pair"));
        }
        self.working.subscriptions.push(sub.clone());
        Ok(())
    }

    async fn update_subscription(
        &mut self,
        sub: &Subscription,
        expected_version: i64,
    ) -> BillingResult<()> {
        let row = self
            .working
            .subscriptions
            .iter_mut()
            .find(|s| s.id == sub.id && s.version == expected_version)
            .ok_or(BillingError::ConcurrentModification)?;
        *row = sub.clone();
        Ok(())
    }

    async fn lock_purchase(&mut self, id: Uuid) -> BillingResult<Option<Purchase>> {
        self.record(LockedRows::Owner);
        Ok(self.working.purchases.iter().find(|p| p.id == id).cloned())
    }

    async fn lock_live_purchase(
        &mut self,
        buyer_id: Uuid,
        post_id: Uuid,
    ) -> BillingResult<Option<Purchase>> {
        self.record(LockedRows::Owner);
        Ok(self
            .working
            .purchases
            .iter()
            .find(|p| p.buyer_id == buyer_id && p.post_id == post_id && p.status.is_live())
            .cloned())
    }

    async fn count_purchases(&mut self, buyer_id: Uuid, post_id: Uuid) -> BillingResult<i64> {
        let count = self
            .working
            .purchases
            .iter()
            .filter(|p| p.buyer_id == buyer_id && p.post_id == post_id)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn lock_purchase_by_charge(
        &mut self,
        payment_ref: &str,
        charge_key: Option<&str>,
    ) -> BillingResult<Option<Purchase>> {
        self.record(LockedRows::Owner);
        let purchases = &self.working.purchases;
        let by_key = charge_key.and_then(|key| {
            purchases
                .iter()
                .find(|p| p.pending_charge_key.as_deref() == Some(key))
        });
        Ok(by_key
            .or_else(|| {
                purchases
                    .iter()
                    .find(|p| p.external_payment_ref.as_deref() == Some(payment_ref))
            })
            .cloned())
    }

    async fn lock_purchase_by_refund(
        &mut self,
        refund_ref: &str,
        payment_ref: Option<&str>,
    ) -> BillingResult<Option<Purchase>> {
        self.record(LockedRows::Owner);
        let purchases = &self.working.purchases;
        let by_refund = purchases
            .iter()
            .find(|p| p.refund_ref.as_deref() == Some(refund_ref));
        Ok(by_refund
            .or_else(|| {
                payment_ref.and_then(|payment_ref| {
                    purchases
                        .iter()
                        .find(|p| p.external_payment_ref.as_deref() == Some(payment_ref))
                })
            })
            .cloned())
    }

    async fn insert_purchase(&mut self, purchase: &Purchase) -> BillingResult<()> {
        if self.working.purchases.iter().any(|p| p.id == purchase.id) {
            return Err(unique_violation("purchases_pkey"));
        }
        if purchase.status.is_live()
            && self.working.purchases.iter().any(|p| {
                p.buyer_id == purchase.buyer_id && p.post_id == purchase.post_id && p.status.is_live()
            })
        {
            return Err(unique_violation("purchases_one_live_per_post"));
        }
        self.working.purchases.push(purchase.clone());
        Ok(())
    }

    async fn update_purchase(
        &mut self,
        purchase: &Purchase,
        expected_version: i64,
    ) -> BillingResult<()> {
        let row = self
            .working
            .purchases
            .iter_mut()
            .find(|p| p.id == purchase.id && p.version == expected_version)
            .ok_or(BillingError::ConcurrentModification)?;
        *row = purchase.clone();
        Ok(())
    }

    async fn lock_transactions_by_ref(
        &mut self,
        external_ref: &str,
    ) -> BillingResult<Vec<WalletTransaction>> {
        self.record(LockedRows::Ledger);
        Ok(self
            .working
            .transactions
            .iter()
            .filter(|t| t.external_payment_ref == external_ref)
            .cloned()
            .collect())
    }

    async fn insert_transaction(&mut self, row: &WalletTransaction) -> BillingResult<()> {
        if self.working.transactions.iter().any(|t| {
            t.external_payment_ref == row.external_payment_ref
                && t.transaction_type == row.transaction_type
        }) {
            return Err(unique_violation("wallet_transactions_ref_type_key"));
        }
        self.working.transactions.push(row.clone());
        Ok(())
    }

    async fn set_transaction_status(
        &mut self,
        external_ref: &str,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> BillingResult<u64> {
        let mut changed = 0;
        for t in self
            .working
            .transactions
            .iter_mut()
            .filter(|t| t.external_payment_ref == external_ref && t.status == from)
        {
            t.status = to;
            changed += 1;
        }
        Ok(changed)
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;

    fn sub(subscriber: Uuid, creator: Uuid) -> Subscription {
        Subscription::new(subscriber, creator, Money::usd(1000), None, OffsetDateTime::now_utc()).unwrap()
    }

    #[tokio::test]
    async fn test_dropped_tx_rolls_back() {
        let store = MemoryStore::new();
        let s = sub(Uuid::new_v4(), Uuid::new_v4());

        let mut tx = store.begin().await.unwrap();
        tx.insert_subscription(&s).await.unwrap();
        drop(tx);
        assert!(store.get_subscription(s.id).await.unwrap().is_none());

        let mut tx = store.begin().await.unwrap();
        tx.insert_subscription(&s).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.get_subscription(s.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_one_live_subscription_per_pair() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let mut tx = store.begin().await.unwrap();
        tx.insert_subscription(&sub(a, b)).await.unwrap();
        let err = tx.insert_subscription(&sub(a, b)).await.unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryStore::new();
        let s = sub(Uuid::new_v4(), Uuid::new_v4());
        let mut tx = store.begin().await.unwrap();
        tx.insert_subscription(&s).await.unwrap();

        let mut changed = s.clone();
        changed.version = 2;
        tx.update_subscription(&changed, 1).await.unwrap();
        let err = tx.update_subscription(&changed, 1).await.unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification));
    }

    #[tokio::test]
    async fn test_webhook_claims() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();

        assert_eq!(store.claim_webhook_event("evt_1", "payment.updated", now).await.unwrap(), EventClaim::Claimed);
        assert_eq!(store.claim_webhook_event("evt_1", "payment.updated", now).await.unwrap(), EventClaim::InProgress);

        let later = now + Duration::minutes(WEBHOOK_PROCESSING_TIMEOUT_MINUTES + 1);
        assert_eq!(store.claim_webhook_event("evt_1", "payment.updated", later).await.unwrap(), EventClaim::Claimed);

        store.finish_webhook_event("evt_1", Some("boom")).await.unwrap();
        assert_eq!(store.claim_webhook_event("evt_1", "payment.updated", later).await.unwrap(), EventClaim::Claimed);

        store.finish_webhook_event("evt_1", None).await.unwrap();
        assert_eq!(store.webhook_event_state("evt_1").await, Some("success"));
        assert_eq!(store.claim_webhook_event("evt_1", "payment.updated", later).await.unwrap(), EventClaim::AlreadyProcessed);
    }
}
