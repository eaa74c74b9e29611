//! Refund service for admin-initiated refunds
//!
//! Refunds return the full price of a content purchase to the buyer's card. The ledger
//! gets a single reversing REFUND row for the buyer; creator earnings are not clawed
//! back.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::client::{IdempotencyKey, RefundRequest, RefundStatus};
use crate::error::{BillingError, BillingResult};
use crate::ledger::TransactionStatus;
use crate::notify::NotificationKind;
use crate::purchases::{Purchase, PurchaseStatus, PurchaseUpdate};
use crate::BillingContext;

/// Result of a refund request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    pub purchase: Purchase,
    /// Processor refund id
    pub external_refund_id: String,
    pub amount_minor: i64,
    /// False while the processor has not settled the refund
    pub completed: bool,
}

#[derive(Clone)]
pub struct RefundService {
    ctx: Arc<BillingContext>,
}

impl RefundService {
    pub fn new(ctx: Arc<BillingContext>) -> Self {
        Self { ctx }
    }

    /// Refund a COMPLETED purchase in full.
    ///
    /// Safe to call again: the processor collapses repeats through the idempotency key
    /// and the ledger row is recorded once per refund id.
    pub async fn refund_purchase(&self, purchase_id: Uuid, reason: &str) -> BillingResult<RefundResult> {
        let _guard = self
            .ctx
            .locks
            .lock(format!("refund:{}", purchase_id))
            .await;

        let purchase = self
            .ctx
            .store
            .get_purchase(purchase_id)
            .await?
            .ok_or(BillingError::PurchaseNotFound)?;

        if purchase.status == PurchaseStatus::Refunded {
            return Ok(RefundResult {
                external_refund_id: purchase.refund_ref.clone().unwrap_or_default(),
                amount_minor: purchase.price.minor_units,
                completed: true,
                purchase,
            });
        }
        if purchase.status != PurchaseStatus::Completed {
            return Err(BillingError::InvalidPurchaseState {
                status: purchase.status.as_str(),
                action: "be refunded",
            });
        }
        let payment_ref = match (&purchase.external_payment_ref, purchase.price.is_zero()) {
            (Some(payment_ref), false) => payment_ref.clone(),
            _ => {
                return Err(BillingError::InvalidAmount(
                    "purchase has no charge to refund".to_string(),
                ))
            }
        };

        let key = IdempotencyKey::derive("refund", &[&purchase.id]);
        let receipt = self
            .ctx
            .gateway
            .refund(&RefundRequest {
                external_payment_id: payment_ref.clone(),
                amount: purchase.price,
                idempotency_key: key,
                reason: reason.to_string(),
            })
            .await?;

        if receipt.status.is_failure() {
            tracing::warn!(
                purchase_id = %purchase_id,
                refund_id = %receipt.external_refund_id,
                status = ?receipt.status,
                "Refund rejected by processor"
            );
            return Err(BillingError::GatewayDeclined { code: None });
        }

        let completed = receipt.status == RefundStatus::Completed;
        let row_status = if completed {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Pending
        };

        let now = self.ctx.clock.now();
        let mut tx = self.ctx.store.begin().await?;
        let locked = tx
            .lock_purchase(purchase_id)
            .await?
            .ok_or(BillingError::PurchaseNotFound)?;

        self.ctx
            .ledger
            .record_refund(
                tx.as_mut(),
                locked.buyer_id,
                locked.price,
                &receipt.external_refund_id,
                &payment_ref,
                row_status,
                now,
            )
            .await?;

        let expected = locked.version;
        let updated = match (locked.status, &locked.refund_ref) {
            // A webhook settled it while we were waiting on the processor
            (PurchaseStatus::Refunded, _) => locked,
            (_, Some(existing)) if existing == &receipt.external_refund_id && !completed => locked,
            _ => {
                let update = if completed {
                    PurchaseUpdate::Refunded {
                        refund_ref: receipt.external_refund_id.clone(),
                    }
                } else {
                    PurchaseUpdate::RefundRequested {
                        refund_ref: receipt.external_refund_id.clone(),
                    }
                };
                let updated = locked.apply(update, now)?;
                tx.update_purchase(&updated, expected).await?;
                updated
            }
        };
        tx.commit().await?;

        tracing::info!(
            purchase_id = %purchase_id,
            refund_id = %receipt.external_refund_id,
            amount = updated.price.minor_units,
            completed,
            reason = %reason,
            "Refund issued"
        );
        if completed {
            notify_refunded(&self.ctx, &updated).await;
        }

        Ok(RefundResult {
            external_refund_id: receipt.external_refund_id,
            amount_minor: updated.price.minor_units,
            completed: updated.status == PurchaseStatus::Refunded,
            purchase: updated,
        })
    }
}

pub(crate) async fn notify_refunded(ctx: &BillingContext, purchase: &Purchase) {
    ctx.notify(
        purchase.buyer_id,
        NotificationKind::RefundIssued,
        serde_json::json!({
            "purchaseId": purchase.id,
            "amount": purchase.price.minor_units,
        }),
    )
    .await;
}
