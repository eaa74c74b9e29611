//! One-time content purchases

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{ChargeOutcome, ChargeRequest, IdempotencyKey};
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{ChargeKind, LedgerPair, TransactionStatus};
use crate::money::{split, Money};
use crate::notify::NotificationKind;
use crate::BillingContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Failed => "failed",
            PurchaseStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PurchaseStatus::Pending),
            "completed" => Some(PurchaseStatus::Completed),
            "failed" => Some(PurchaseStatus::Failed),
            "refunded" => Some(PurchaseStatus::Refunded),
            _ => None,
        }
    }

    /// Blocks another purchase of the same post by the same buyer
    pub fn is_live(&self) -> bool {
        matches!(self, PurchaseStatus::Pending | PurchaseStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub creator_id: Uuid,
    pub post_id: Uuid,
    pub status: PurchaseStatus,
    pub price: Money,
    pub external_payment_ref: Option<String>,
    #[serde(skip_serializing)]
    pub pending_charge_key: Option<String>,
    /// Card the charge was submitted with
    #[serde(skip_serializing)]
    pub payment_method_ref: Option<String>,
    /// Set while a refund is in flight and once it completed
    pub refund_ref: Option<String>,
    #[serde(skip_serializing)]
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub refunded_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseUpdate {
    Complete { payment_ref: Option<String> },
    AwaitCharge { payment_ref: Option<String> },
    Fail,
    RefundRequested { refund_ref: String },
    RefundFailed,
    Refunded { refund_ref: String },
}

impl PurchaseUpdate {
    fn action(&self) -> &'static str {
        match self {
            PurchaseUpdate::Complete { .. } => "complete",
            PurchaseUpdate::AwaitCharge { .. } => "await a charge",
            PurchaseUpdate::Fail => "fail",
            PurchaseUpdate::RefundRequested { .. } => "start a refund",
            PurchaseUpdate::RefundFailed => "fail a refund",
            PurchaseUpdate::Refunded { .. } => "be refunded",
        }
    }
}

impl Purchase {
    pub fn new(
        buyer_id: Uuid,
        creator_id: Uuid,
        post_id: Uuid,
        price: Money,
        pending_charge_key: Option<String>,
        payment_method_ref: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            buyer_id,
            creator_id,
            post_id,
            status: PurchaseStatus::Pending,
            price,
            external_payment_ref: None,
            pending_charge_key,
            payment_method_ref,
            refund_ref: None,
            version: 1,
            created_at: now,
            updated_at: now,
            refunded_at: None,
        }
    }

    /// Charge submitted but no processor payment id ever came back
    pub fn first_charge_unresolved(&self) -> bool {
        self.status == PurchaseStatus::Pending
            && self.pending_charge_key.is_some()
            && self.external_payment_ref.is_none()
    }

    pub fn apply(mut self, update: PurchaseUpdate, now: OffsetDateTime) -> BillingResult<Self> {
        use PurchaseStatus::*;

        match (&update, self.status) {
            (PurchaseUpdate::Complete { payment_ref }, Pending) => {
                self.status = Completed;
                self.external_payment_ref = payment_ref.clone().or(self.external_payment_ref.take());
                self.pending_charge_key = None;
            }
            (PurchaseUpdate::AwaitCharge { payment_ref }, Pending) => {
                if payment_ref.is_some() {
                    self.external_payment_ref = payment_ref.clone();
                }
            }
            (PurchaseUpdate::Fail, Pending) => {
                self.status = Failed;
                self.pending_charge_key = None;
            }
            (PurchaseUpdate::RefundRequested { refund_ref }, Completed) if self.refund_ref.is_none() => {
                self.refund_ref = Some(refund_ref.clone());
            }
            (PurchaseUpdate::RefundFailed, Completed) => {
                self.refund_ref = None;
            }
            (PurchaseUpdate::Refunded { refund_ref }, Completed) => {
                self.status = Refunded;
                self.refund_ref = Some(refund_ref.clone());
                self.refunded_at = Some(now);
            }
            (_, status) => {
                return Err(BillingError::InvalidPurchaseState {
                    status: status.as_str(),
                    action: update.action(),
                })
            }
        }

        self.version += 1;
        self.updated_at = now;
        Ok(self)
    }
}

#[derive(Clone)]
pub struct PurchaseService {
    ctx: Arc<BillingContext>,
    customers: CustomerService,
}

impl PurchaseService {
    pub fn new(ctx: Arc<BillingContext>) -> Self {
        let customers = CustomerService::new(ctx.clone());
        Self { ctx, customers }
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Purchase> {
        self.ctx
            .store
            .get_purchase(id)
            .await?
            .ok_or(BillingError::PurchaseNotFound)
    }

    /// Buy a post. Returns a COMPLETED purchase, or a PENDING one whose charge the
    /// webhook processor will settle.
    pub async fn purchase(
        &self,
        buyer_id: Uuid,
        post_id: Uuid,
        payment_source_token: &str,
    ) -> BillingResult<Purchase> {
        let post = self
            .ctx
            .catalog
            .post_price(post_id)
            .await?
            .ok_or(BillingError::PostNotFound)?;
        if post.creator_id == buyer_id {
            return Err(BillingError::SelfPurchase);
        }
        if post.price.minor_units < 0 {
            return Err(BillingError::InvalidAmount(format!(
                "post {} has a negative price",
                post_id
            )));
        }

        let _guard = self
            .ctx
            .locks
            .lock(format!("purchase:{}:{}", buyer_id, post_id))
            .await;

        if post.price.is_zero() {
            let now = self.ctx.clock.now();
            let purchase =
                Purchase::new(buyer_id, post.creator_id, post_id, post.price, None, None, now)
                    .apply(PurchaseUpdate::Complete { payment_ref: None }, now)?;
            let mut tx = self.ctx.store.begin().await?;
            if tx.lock_live_purchase(buyer_id, post_id).await?.is_some() {
                return Err(BillingError::AlreadyPurchased);
            }
            tx.insert_purchase(&purchase).await?;
            tx.commit().await?;
            return Ok(purchase);
        }

        let live = {
            let mut tx = self.ctx.store.begin().await?;
            tx.lock_live_purchase(buyer_id, post_id).await?
        };
        if let Some(live) = live {
            if live.first_charge_unresolved() {
                return self.resubmit_charge(live).await;
            }
            return Err(BillingError::AlreadyPurchased);
        }

        let customer_id = self.customers.ensure_customer(buyer_id).await?;
        let card = self
            .customers
            .save_payment_method(&customer_id, payment_source_token)
            .await?;

        let now = self.ctx.clock.now();
        let mut tx = self.ctx.store.begin().await?;
        if tx.lock_live_purchase(buyer_id, post_id).await?.is_some() {
            return Err(BillingError::AlreadyPurchased);
        }
        let attempt = tx.count_purchases(buyer_id, post_id).await?;
        let key = IdempotencyKey::derive("purchase", &[&buyer_id, &post_id, &attempt, &card]);
        let purchase = Purchase::new(
            buyer_id,
            post.creator_id,
            post_id,
            post.price,
            Some(key.to_string()),
            Some(card.clone()),
            now,
        );
        tx.insert_purchase(&purchase).await?;
        tx.commit().await?;

        let request = ChargeRequest {
            customer_id,
            payment_method_ref: card,
            amount: post.price,
            idempotency_key: key.clone(),
            note: format!("Post {}", post_id),
        };
        let outcome = match self.ctx.gateway.charge(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let failed = self
                    .settle(purchase.id, &key, ChargeOutcome::Declined { code: None })
                    .await;
                if let Err(settle_err) = failed {
                    tracing::error!(purchase_id = %purchase.id, error = %settle_err, "Failed to mark purchase as failed");
                }
                return Err(e);
            }
        };

        match self.settle(purchase.id, &key, outcome).await? {
            Settled::Done(purchase) => Ok(purchase),
            Settled::Declined(code) => Err(BillingError::GatewayDeclined { code }),
        }
    }

    /// Submit the stored key and card again for a purchase whose charge outcome
    /// was lost. The processor answers with the original charge if it exists.
    async fn resubmit_charge(&self, purchase: Purchase) -> BillingResult<Purchase> {
        let (Some(key), Some(card)) = (
            purchase.pending_charge_key.clone(),
            purchase.payment_method_ref.clone(),
        ) else {
            return Err(BillingError::AlreadyPurchased);
        };
        let key = IdempotencyKey::from_stored(key);
        tracing::info!(purchase_id = %purchase.id, "Resubmitting purchase charge whose outcome never arrived");

        let customer_id = self.customers.ensure_customer(purchase.buyer_id).await?;
        let request = ChargeRequest {
            customer_id,
            payment_method_ref: card,
            amount: purchase.price,
            idempotency_key: key.clone(),
            note: format!("Post {}", purchase.post_id),
        };
        let outcome = self.ctx.gateway.charge(&request).await?;

        match self.settle(purchase.id, &key, outcome).await? {
            Settled::Done(purchase) => Ok(purchase),
            Settled::Declined(code) => Err(BillingError::GatewayDeclined { code }),
        }
    }

    async fn settle(
        &self,
        purchase_id: Uuid,
        key: &IdempotencyKey,
        outcome: ChargeOutcome,
    ) -> BillingResult<Settled> {
        let now = self.ctx.clock.now();
        let mut tx = self.ctx.store.begin().await?;
        let purchase = tx
            .lock_purchase(purchase_id)
            .await?
            .ok_or(BillingError::PurchaseNotFound)?;
        if purchase.pending_charge_key.as_deref() != Some(key.as_str()) {
            return Ok(Settled::Done(purchase));
        }
        let expected = purchase.version;

        match outcome {
            ChargeOutcome::Completed { payment_id } => {
                let pair = LedgerPair::new(
                    purchase.buyer_id,
                    purchase.creator_id,
                    &split(purchase.price, self.ctx.config.fee_percent)?,
                    ChargeKind::ContentPurchase,
                    &payment_id,
                    TransactionStatus::Completed,
                    now,
                )?;
                self.ctx.ledger.record_pair(tx.as_mut(), pair).await?;
                let updated = purchase.apply(
                    PurchaseUpdate::Complete {
                        payment_ref: Some(payment_id.clone()),
                    },
                    now,
                )?;
                tx.update_purchase(&updated, expected).await?;
                tx.commit().await?;

                tracing::info!(
                    purchase_id = %updated.id,
                    post_id = %updated.post_id,
                    payment_id = %payment_id,
                    "Content purchase completed"
                );
                notify_purchased(&self.ctx, &updated).await;
                Ok(Settled::Done(updated))
            }
            ChargeOutcome::Pending { payment_id } => {
                if let Some(payment_id) = &payment_id {
                    let pair = LedgerPair::new(
                        purchase.buyer_id,
                        purchase.creator_id,
                        &split(purchase.price, self.ctx.config.fee_percent)?,
                        ChargeKind::ContentPurchase,
                        payment_id,
                        TransactionStatus::Pending,
                        now,
                    )?;
                    self.ctx.ledger.record_pair(tx.as_mut(), pair).await?;
                }
                let updated = purchase.apply(
                    PurchaseUpdate::AwaitCharge {
                        payment_ref: payment_id,
                    },
                    now,
                )?;
                tx.update_purchase(&updated, expected).await?;
                tx.commit().await?;
                tracing::warn!(purchase_id = %updated.id, "Purchase charge not settled, awaiting webhook");
                Ok(Settled::Done(updated))
            }
            ChargeOutcome::Declined { code } => {
                if let Some(payment_ref) = &purchase.external_payment_ref {
                    self.ctx
                        .ledger
                        .mark_status(tx.as_mut(), payment_ref, TransactionStatus::Failed)
                        .await?;
                }
                let updated = purchase.apply(PurchaseUpdate::Fail, now)?;
                tx.update_purchase(&updated, expected).await?;
                tx.commit().await?;
                tracing::info!(purchase_id = %updated.id, decline_code = ?code, "Purchase charge declined");
                Ok(Settled::Declined(code))
            }
        }
    }
}

enum Settled {
    Done(Purchase),
    Declined(Option<String>),
}

pub(crate) async fn notify_purchased(ctx: &BillingContext, purchase: &Purchase) {
    ctx.notify(
        purchase.creator_id,
        NotificationKind::ContentPurchased,
        serde_json::json!({
            "purchaseId": purchase.id,
            "postId": purchase.post_id,
            "buyerId": purchase.buyer_id,
        }),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::GatewayError;
    use crate::testing::TestHarness;

    #[tokio::test]
    async fn test_purchase_writes_pair() {
        let h = TestHarness::new();
        let creator = Uuid::new_v4();
        let post = h.post_with_price(creator, 500);
        let buyer = Uuid::new_v4();

        let purchase = h.purchases().purchase(buyer, post, "cnon_ok").await.unwrap();

        assert_eq!(purchase.status, PurchaseStatus::Completed);
        assert_eq!(h.ledger().get_balance(buyer).await.unwrap(), -500);
        assert_eq!(h.ledger().get_balance(creator).await.unwrap(), 400);
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_purchase_guards() {
        let h = TestHarness::new();
        let creator = Uuid::new_v4();
        let post = h.post_with_price(creator, 500);
        let buyer = Uuid::new_v4();

        let err = h.purchases().purchase(creator, post, "cnon_ok").await.unwrap_err();
        assert!(matches!(err, BillingError::SelfPurchase));

        let err = h
            .purchases()
            .purchase(buyer, Uuid::new_v4(), "cnon_ok")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PostNotFound));

        h.purchases().purchase(buyer, post, "cnon_ok").await.unwrap();
        let err = h.purchases().purchase(buyer, post, "cnon_ok").await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadyPurchased));
        assert_eq!(h.gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn test_declined_purchase_can_be_retried() {
        let h = TestHarness::new();
        let creator = Uuid::new_v4();
        let post = h.post_with_price(creator, 500);
        let buyer = Uuid::new_v4();
        h.gateway.push_charge(Err(GatewayError::Declined { code: None }));

        let err = h.purchases().purchase(buyer, post, "cnon_ok").await.unwrap_err();
        assert!(matches!(err, BillingError::GatewayDeclined { .. }));
        assert_eq!(h.store.transaction_count().await, 0);

        let retry = h.purchases().purchase(buyer, post, "cnon_ok").await.unwrap();
        assert_eq!(retry.status, PurchaseStatus::Completed);
        assert_eq!(h.gateway.charge_keys().len(), 2);
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_lost_charge_is_resubmitted_on_repurchase() {
        let h = TestHarness::new();
        let creator = Uuid::new_v4();
        let post = h.post_with_price(creator, 500);
        let buyer = Uuid::new_v4();
        for _ in 0..3 {
            h.gateway
                .push_charge(Err(GatewayError::Transient("timeout".into())));
        }

        let pending = h.purchases().purchase(buyer, post, "cnon_ok").await.unwrap();
        assert_eq!(pending.status, PurchaseStatus::Pending);
        assert!(pending.external_payment_ref.is_none());
        assert_eq!(h.store.transaction_count().await, 0);

        let completed = h.purchases().purchase(buyer, post, "cnon_other").await.unwrap();
        assert_eq!(completed.id, pending.id);
        assert_eq!(completed.status, PurchaseStatus::Completed);
        assert_eq!(completed.payment_method_ref, pending.payment_method_ref);
        let keys = h.gateway.charge_keys();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| k == &keys[0]));
        assert_eq!(h.ledger().get_balance(creator).await.unwrap(), 400);

        // Settled now, so a third attempt is a conflict
        let err = h.purchases().purchase(buyer, post, "cnon_ok").await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadyPurchased));
        h.assert_invariants().await;
    }

    #[test]
    fn test_refunded_is_terminal() {
        let now = OffsetDateTime::now_utc();
        let p = Purchase::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Money::usd(500), None, None, now)
            .apply(PurchaseUpdate::Complete { payment_ref: Some("pay_1".into()) }, now)
            .unwrap()
            .apply(PurchaseUpdate::Refunded { refund_ref: "rf_1".into() }, now)
            .unwrap();
        assert_eq!(p.status, PurchaseStatus::Refunded);
        assert!(p.clone().apply(PurchaseUpdate::Complete { payment_ref: None }, now).is_err());
        assert!(p.apply(PurchaseUpdate::Refunded { refund_ref: "rf_2".into() }, now).is_err());
    }
}
