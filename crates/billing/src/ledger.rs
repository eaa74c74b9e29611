//! Wallet ledger
//!
//! Append-only log of wallet transactions. The ledger is the only writer of
//! transaction rows; other services hand it a [`StoreTx`] so ledger rows commit
//! atomically with the subscription or purchase change they belong to.
//!
//! Every completed charge is a [`LedgerPair`]: a payer debit of `-price` and a payee
//! credit of `+creator_net` carrying the withheld platform fee, so that for each
//! charge reference `Σ(amount + fee) == 0`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::money::{Currency, FeeSplit, Money};
use crate::store::{BillingStore, StoreTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    SubscriptionPayment,
    SubscriptionEarning,
    ContentPurchasePayment,
    ContentPurchaseEarning,
    Refund,
    Withdrawal,
    Deposit,
}

impl TransactionType {
    pub const EARNINGS: [TransactionType; 2] = [
        TransactionType::SubscriptionEarning,
        TransactionType::ContentPurchaseEarning,
    ];

    /// Rows that count towards what an account has spent (refunds net out)
    pub const SPEND: [TransactionType; 3] = [
        TransactionType::SubscriptionPayment,
        TransactionType::ContentPurchasePayment,
        TransactionType::Refund,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::SubscriptionPayment => "subscription_payment",
            TransactionType::SubscriptionEarning => "subscription_earning",
            TransactionType::ContentPurchasePayment => "content_purchase_payment",
            TransactionType::ContentPurchaseEarning => "content_purchase_earning",
            TransactionType::Refund => "refund",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Deposit => "deposit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscription_payment" => Some(TransactionType::SubscriptionPayment),
            "subscription_earning" => Some(TransactionType::SubscriptionEarning),
            "content_purchase_payment" => Some(TransactionType::ContentPurchasePayment),
            "content_purchase_earning" => Some(TransactionType::ContentPurchaseEarning),
            "refund" => Some(TransactionType::Refund),
            "withdrawal" => Some(TransactionType::Withdrawal),
            "deposit" => Some(TransactionType::Deposit),
            _ => None,
        }
    }

    /// Part of a two-row charge pair
    pub fn is_charge_leg(&self) -> bool {
        matches!(
            self,
            TransactionType::SubscriptionPayment
                | TransactionType::SubscriptionEarning
                | TransactionType::ContentPurchasePayment
                | TransactionType::ContentPurchaseEarning
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// Immutable ledger entry. Only `status` may change after insert, and only away from
/// `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletTransaction {
    pub id: Uuid,
    /// Links the debit and credit of one charge
    pub pair_id: Option<Uuid>,
    pub account_id: Uuid,
    /// Signed: negative = debit/spend, positive = credit/earning
    pub amount_minor: i64,
    /// Platform fee withheld from this entry (credit leg only)
    pub fee_minor: i64,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub external_payment_ref: String,
    /// For refunds: the payment being reversed
    pub original_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Which pair of transaction types a charge produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeKind {
    Subscription,
    ContentPurchase,
}

impl ChargeKind {
    pub fn debit_type(&self) -> TransactionType {
        match self {
            ChargeKind::Subscription => TransactionType::SubscriptionPayment,
            ChargeKind::ContentPurchase => TransactionType::ContentPurchasePayment,
        }
    }

    pub fn credit_type(&self) -> TransactionType {
        match self {
            ChargeKind::Subscription => TransactionType::SubscriptionEarning,
            ChargeKind::ContentPurchase => TransactionType::ContentPurchaseEarning,
        }
    }
}

/// Debit + credit for one charge, built and validated before anything is written
#[derive(Debug, Clone)]
pub struct LedgerPair {
    pub pair_id: Uuid,
    pub debit: WalletTransaction,
    pub credit: WalletTransaction,
}

impl LedgerPair {
    pub fn new(
        payer_id: Uuid,
        payee_id: Uuid,
        split: &FeeSplit,
        kind: ChargeKind,
        external_ref: &str,
        status: TransactionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<Self> {
        if payer_id == payee_id {
            return Err(BillingError::InvalidAmount(
                "payer and payee must differ".to_string(),
            ));
        }
        if split.processor_amount.minor_units <= 0 {
            return Err(BillingError::InvalidAmount(
                "ledger pairs require a positive charge".to_string(),
            ));
        }
        if split.platform_fee.minor_units + split.creator_net.minor_units
            != split.processor_amount.minor_units
        {
            return Err(BillingError::InconsistentLedger(format!(
                "fee split does not add up for {}",
                external_ref
            )));
        }
        if external_ref.is_empty() {
            return Err(BillingError::InvalidAmount(
                "ledger pairs require an external payment reference".to_string(),
            ));
        }

        let pair_id = Uuid::new_v4();
        let currency = split.processor_amount.currency;
        let debit = WalletTransaction {
            id: Uuid::new_v4(),
            pair_id: Some(pair_id),
            account_id: payer_id,
            amount_minor: -split.processor_amount.minor_units,
            fee_minor: 0,
            currency,
            transaction_type: kind.debit_type(),
            status,
            external_payment_ref: external_ref.to_string(),
            original_ref: None,
            created_at: now,
        };
        let credit = WalletTransaction {
            id: Uuid::new_v4(),
            pair_id: Some(pair_id),
            account_id: payee_id,
            amount_minor: split.creator_net.minor_units,
            fee_minor: split.platform_fee.minor_units,
            currency,
            transaction_type: kind.credit_type(),
            status,
            external_payment_ref: external_ref.to_string(),
            original_ref: None,
            created_at: now,
        };

        Ok(Self {
            pair_id,
            debit,
            credit,
        })
    }
}

/// Result of moving transactions out of `Pending`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Pending rows were moved to the target status
    Updated(u64),
    /// Every row was already terminal; nothing changed
    AlreadyTerminal,
    /// No rows carry this reference
    NotFound,
}

/// Wallet figures for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSummary {
    pub balance: i64,
    pub total_earnings: i64,
    pub total_spent: i64,
    pub currency: Currency,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn BillingStore>,
    currency: Currency,
}

impl Ledger {
    pub fn new(store: Arc<dyn BillingStore>, currency: Currency) -> Self {
        Self { store, currency }
    }

    /// Write both legs of a charge inside `tx`.
    ///
    /// Idempotent per external reference: if the pair already exists its id is returned
    /// and nothing new is written. Existing PENDING legs move to the status of `pair`
    /// when that status is terminal; a terminal pair never changes. A half-written pair,
    /// or a terminal pair with a different outcome, is an
    /// [`BillingError::InconsistentLedger`].
    pub async fn record_pair(&self, tx: &mut dyn StoreTx, pair: LedgerPair) -> BillingResult<Uuid> {
        let existing: Vec<WalletTransaction> = tx
            .lock_transactions_by_ref(&pair.debit.external_payment_ref)
            .await?
            .into_iter()
            .filter(|t| t.transaction_type.is_charge_leg())
            .collect();

        match existing.len() {
            0 => {}
            2 => {
                let debit = existing
                    .iter()
                    .find(|t| t.transaction_type == pair.debit.transaction_type);
                let credit = existing
                    .iter()
                    .find(|t| t.transaction_type == pair.credit.transaction_type);
                if let (Some(d), Some(c)) = (debit, credit) {
                    if d.amount_minor == pair.debit.amount_minor
                        && c.amount_minor == pair.credit.amount_minor
                        && d.status == c.status
                    {
                        let pair_id = d.pair_id.unwrap_or(pair.pair_id);
                        let wanted = pair.debit.status;
                        if d.status == wanted || (d.status.is_terminal() && !wanted.is_terminal()) {
                            tracing::debug!(
                                external_ref = %pair.debit.external_payment_ref,
                                status = d.status.as_str(),
                                "Ledger pair already recorded"
                            );
                            return Ok(pair_id);
                        }
                        if !d.status.is_terminal() {
                            // Pending legs settle in place
                            tx.set_transaction_status(
                                &pair.debit.external_payment_ref,
                                TransactionStatus::Pending,
                                wanted,
                            )
                            .await?;
                            tracing::info!(
                                pair_id = %pair_id,
                                external_ref = %pair.debit.external_payment_ref,
                                status = wanted.as_str(),
                                "Settled pending ledger pair"
                            );
                            return Ok(pair_id);
                        }
                        return Err(self.inconsistent(format!(
                            "charge {} is already {} and cannot become {}",
                            pair.debit.external_payment_ref,
                            d.status.as_str(),
                            wanted.as_str()
                        )));
                    }
                }
                return Err(self.inconsistent(format!(
                    "existing rows for {} do not match the charge being recorded",
                    pair.debit.external_payment_ref
                )));
            }
            n => {
                return Err(self.inconsistent(format!(
                    "{} charge rows found for {}, expected 0 or 2",
                    n, pair.debit.external_payment_ref
                )));
            }
        }

        tx.insert_transaction(&pair.debit).await?;
        tx.insert_transaction(&pair.credit).await?;

        tracing::info!(
            pair_id = %pair.pair_id,
            external_ref = %pair.debit.external_payment_ref,
            payer_id = %pair.debit.account_id,
            payee_id = %pair.credit.account_id,
            amount = pair.debit.amount_minor,
            fee = pair.credit.fee_minor,
            status = pair.debit.status.as_str(),
            "Recorded ledger pair"
        );

        Ok(pair.pair_id)
    }

    /// Record the single reversing entry of a refund, idempotent per refund reference
    pub async fn record_refund(
        &self,
        tx: &mut dyn StoreTx,
        payer_id: Uuid,
        amount: Money,
        refund_ref: &str,
        original_ref: &str,
        status: TransactionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<WalletTransaction> {
        if amount.minor_units <= 0 {
            return Err(BillingError::InvalidAmount(
                "refund amount must be positive".to_string(),
            ));
        }

        let existing = tx.lock_transactions_by_ref(refund_ref).await?;
        if let Some(row) = existing
            .into_iter()
            .find(|t| t.transaction_type == TransactionType::Refund)
        {
            return Ok(row);
        }

        let row = WalletTransaction {
            id: Uuid::new_v4(),
            pair_id: None,
            account_id: payer_id,
            amount_minor: amount.minor_units,
            fee_minor: 0,
            currency: amount.currency,
            transaction_type: TransactionType::Refund,
            status,
            external_payment_ref: refund_ref.to_string(),
            original_ref: Some(original_ref.to_string()),
            created_at: now,
        };
        tx.insert_transaction(&row).await?;

        tracing::info!(
            refund_ref = %refund_ref,
            original_ref = %original_ref,
            account_id = %payer_id,
            amount = amount.minor_units,
            status = status.as_str(),
            "Recorded refund transaction"
        );

        Ok(row)
    }

    /// Move every pending row for `external_ref` to `status`. Terminal rows never change.
    pub async fn mark_status(
        &self,
        tx: &mut dyn StoreTx,
        external_ref: &str,
        status: TransactionStatus,
    ) -> BillingResult<MarkOutcome> {
        let rows = tx.lock_transactions_by_ref(external_ref).await?;
        if rows.is_empty() {
            return Ok(MarkOutcome::NotFound);
        }
        if rows.iter().all(|t| t.status.is_terminal()) {
            return Ok(MarkOutcome::AlreadyTerminal);
        }
        let updated = tx
            .set_transaction_status(external_ref, TransactionStatus::Pending, status)
            .await?;
        Ok(MarkOutcome::Updated(updated))
    }

    /// Sum of completed transactions. Pending and failed rows never count.
    pub async fn get_balance(&self, account_id: Uuid) -> BillingResult<i64> {
        self.store.sum_completed(account_id, None, None).await
    }

    pub async fn get_earnings(
        &self,
        account_id: Uuid,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<i64> {
        self.store
            .sum_completed(account_id, Some(&TransactionType::EARNINGS), since)
            .await
    }

    /// Net spend: payments made minus refunds received, as a positive number
    pub async fn get_spend(
        &self,
        account_id: Uuid,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<i64> {
        let net = self
            .store
            .sum_completed(account_id, Some(&TransactionType::SPEND), since)
            .await?;
        Ok(-net)
    }

    pub async fn summary(&self, account_id: Uuid) -> BillingResult<WalletSummary> {
        Ok(WalletSummary {
            balance: self.get_balance(account_id).await?,
            total_earnings: self.get_earnings(account_id, None).await?,
            total_spent: self.get_spend(account_id, None).await?,
            currency: self.currency,
        })
    }

    pub async fn history(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WalletTransaction>> {
        self.store.list_transactions(account_id, limit, offset).await
    }

    fn inconsistent(&self, message: String) -> BillingError {
        tracing::error!(alert = true, message = %message, "InconsistentLedger");
        BillingError::InconsistentLedger(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::{split, FeePercent};
    use crate::testing::MemoryStore;

    fn now() -> OffsetDateTime {
        time::macros::datetime!(2026-05-01 12:00 UTC)
    }

    fn pair(payer: Uuid, payee: Uuid, price: i64, r: &str, status: TransactionStatus) -> LedgerPair {
        let s = split(Money::usd(price), FeePercent::new(20).unwrap()).unwrap();
        LedgerPair::new(payer, payee, &s, ChargeKind::Subscription, r, status, now()).unwrap()
    }

    #[test]
    fn test_pair_shape() {
        let (payer, payee) = (Uuid::new_v4(), Uuid::new_v4());
        let p = pair(payer, payee, 1000, "pay_1", TransactionStatus::Completed);
        assert_eq!(p.debit.amount_minor, -1000);
        assert_eq!(p.credit.amount_minor, 800);
        assert_eq!(p.credit.fee_minor, 200);
        assert_eq!(
            p.debit.amount_minor + p.debit.fee_minor + p.credit.amount_minor + p.credit.fee_minor,
            0
        );
        assert_eq!(p.debit.pair_id, p.credit.pair_id);
        assert_eq!(p.debit.external_payment_ref, p.credit.external_payment_ref);
    }

    #[test]
    fn test_pair_rejects_self_and_zero() {
        let a = Uuid::new_v4();
        let s = split(Money::usd(1000), FeePercent::new(20).unwrap()).unwrap();
        assert!(LedgerPair::new(a, a, &s, ChargeKind::Subscription, "p", TransactionStatus::Completed, now()).is_err());

        let zero = split(Money::usd(0), FeePercent::new(20).unwrap()).unwrap();
        assert!(LedgerPair::new(a, Uuid::new_v4(), &zero, ChargeKind::Subscription, "p", TransactionStatus::Completed, now()).is_err());
    }

    #[tokio::test]
    async fn test_record_pair_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), Currency::Usd);
        let (payer, payee) = (Uuid::new_v4(), Uuid::new_v4());

        let mut tx = store.begin().await.unwrap();
        let first = ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 1000, "pay_1", TransactionStatus::Completed))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let second = ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 1000, "pay_1", TransactionStatus::Completed))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.transaction_count().await, 2);
        assert_eq!(ledger.get_balance(payer).await.unwrap(), -1000);
        assert_eq!(ledger.get_balance(payee).await.unwrap(), 800);
    }

    #[tokio::test]
    async fn test_record_pair_settles_pending_legs() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), Currency::Usd);
        let (payer, payee) = (Uuid::new_v4(), Uuid::new_v4());

        let mut tx = store.begin().await.unwrap();
        let pending = ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 1000, "pay_1", TransactionStatus::Pending))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(ledger.get_balance(payee).await.unwrap(), 0);

        let mut tx = store.begin().await.unwrap();
        let settled = ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 1000, "pay_1", TransactionStatus::Completed))
            .await
            .unwrap();
        // A late pending report does not move it back
        let stale = ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 1000, "pay_1", TransactionStatus::Pending))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(pending, settled);
        assert_eq!(settled, stale);
        assert_eq!(store.transaction_count().await, 2);
        assert_eq!(ledger.get_balance(payer).await.unwrap(), -1000);
        assert_eq!(ledger.get_balance(payee).await.unwrap(), 800);

        let mut tx = store.begin().await.unwrap();
        let flipped = ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 1000, "pay_1", TransactionStatus::Failed))
            .await;
        assert!(matches!(flipped, Err(BillingError::InconsistentLedger(_))));
    }

    #[tokio::test]
    async fn test_balance_ignores_pending_and_failed() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), Currency::Usd);
        let (payer, payee) = (Uuid::new_v4(), Uuid::new_v4());

        let mut tx = store.begin().await.unwrap();
        ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 1000, "pay_ok", TransactionStatus::Completed))
            .await
            .unwrap();
        ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 500, "pay_pending", TransactionStatus::Pending))
            .await
            .unwrap();
        ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 300, "pay_failed", TransactionStatus::Failed))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let payer_summary = ledger.summary(payer).await.unwrap();
        assert_eq!(payer_summary.balance, -1000);
        assert_eq!(payer_summary.total_spent, 1000);
        assert_eq!(payer_summary.total_earnings, 0);

        let payee_summary = ledger.summary(payee).await.unwrap();
        assert_eq!(payee_summary.balance, 800);
        assert_eq!(payee_summary.total_earnings, 800);
    }

    #[tokio::test]
    async fn test_mark_status_is_terminal_sticky() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), Currency::Usd);
        let (payer, payee) = (Uuid::new_v4(), Uuid::new_v4());

        let mut tx = store.begin().await.unwrap();
        ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 1000, "pay_1", TransactionStatus::Pending))
            .await
            .unwrap();
        let failed = ledger
            .mark_status(tx.as_mut(), "pay_1", TransactionStatus::Failed)
            .await
            .unwrap();
        let resurrect = ledger
            .mark_status(tx.as_mut(), "pay_1", TransactionStatus::Completed)
            .await
            .unwrap();
        let missing = ledger
            .mark_status(tx.as_mut(), "pay_unknown", TransactionStatus::Completed)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(failed, MarkOutcome::Updated(2));
        assert_eq!(resurrect, MarkOutcome::AlreadyTerminal);
        assert_eq!(missing, MarkOutcome::NotFound);
        assert_eq!(ledger.get_balance(payer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refund_nets_out_spend() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), Currency::Usd);
        let (payer, payee) = (Uuid::new_v4(), Uuid::new_v4());

        let mut tx = store.begin().await.unwrap();
        ledger
            .record_pair(tx.as_mut(), pair(payer, payee, 500, "pay_1", TransactionStatus::Completed))
            .await
            .unwrap();
        let refund = ledger
            .record_refund(tx.as_mut(), payer, Money::usd(500), "rf_1", "pay_1", TransactionStatus::Completed, now())
            .await
            .unwrap();
        let again = ledger
            .record_refund(tx.as_mut(), payer, Money::usd(500), "rf_1", "pay_1", TransactionStatus::Completed, now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(refund.id, again.id);
        assert_eq!(refund.amount_minor, 500);
        assert_eq!(refund.original_ref.as_deref(), Some("pay_1"));
        let summary = ledger.summary(payer).await.unwrap();
        assert_eq!(summary.balance, 0);
        assert_eq!(summary.total_spent, 0);
    }
}
