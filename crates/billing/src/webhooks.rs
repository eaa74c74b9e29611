//! Payment processor webhook handling
//!
//! Reconciles asynchronous payment and refund updates with local state. Delivery is
//! at-least-once and unordered, so every event is applied under two guards:
//!
//! - the event id is claimed in the webhook event log, so a redelivered event is skipped;
//! - ledger rows only ever leave `PENDING`, so a late `COMPLETED` after a `FAILED` (or
//!   the reverse) is a no-op.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::client::{GatewayConfig, PaymentStatus, RefundStatus};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{ChargeKind, LedgerPair, MarkOutcome, TransactionStatus, TransactionType};
use crate::money::split;
use crate::notify::NotificationKind;
use crate::purchases::{notify_purchased, Purchase, PurchaseStatus, PurchaseUpdate};
use crate::refund::notify_refunded;
use crate::store::{EventClaim, StoreTx};
use crate::subscriptions::{Subscription, SubscriptionStatus, SubscriptionUpdate};
use crate::BillingContext;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the base64 HMAC-SHA256 signature
pub const SIGNATURE_HEADER: &str = "x-payments-hmacsha256-signature";

/// Secret material needed to authenticate webhook deliveries
#[derive(Debug, Clone)]
pub struct WebhookSigning {
    signature_key: String,
    notification_url: String,
}

impl WebhookSigning {
    pub fn new(signature_key: impl Into<String>, notification_url: impl Into<String>) -> Self {
        Self {
            signature_key: signature_key.into(),
            notification_url: notification_url.into(),
        }
    }

    pub fn from_gateway_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.webhook_signature_key.clone(),
            config.webhook_notification_url.clone(),
        )
    }

    /// Signature the processor sends for `body`
    pub fn sign(&self, body: &[u8]) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.signature_key.as_bytes())
            .map_err(|e| BillingError::Config(format!("invalid webhook signature key: {}", e)))?;
        mac.update(self.notification_url.as_bytes());
        mac.update(body);
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time comparison against the expected signature
    pub fn verify(&self, body: &[u8], signature: &str) -> BillingResult<()> {
        let expected = self.sign(body)?;
        if bool::from(expected.as_bytes().ct_eq(signature.trim().as_bytes())) {
            Ok(())
        } else {
            Err(BillingError::WebhookSignatureInvalid)
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: EnvelopeObject,
}

#[derive(Debug, Deserialize)]
struct EnvelopeObject {
    payment: Option<PaymentObject>,
    refund: Option<RefundObject>,
}

#[derive(Debug, Deserialize)]
struct PaymentObject {
    id: String,
    status: String,
    reference_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundObject {
    id: String,
    payment_id: String,
    status: String,
}

/// A verified, parsed webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Payment {
        event_id: String,
        payment_id: String,
        /// Idempotency key the charge was submitted with
        reference_id: Option<String>,
        status: String,
    },
    Refund {
        event_id: String,
        refund_id: String,
        payment_id: String,
        status: String,
    },
    /// Event types the engine does not consume
    Other { event_id: String, event_type: String },
}

impl WebhookEvent {
    pub fn event_id(&self) -> &str {
        match self {
            WebhookEvent::Payment { event_id, .. }
            | WebhookEvent::Refund { event_id, .. }
            | WebhookEvent::Other { event_id, .. } => event_id,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            WebhookEvent::Payment { .. } => "payment.updated",
            WebhookEvent::Refund { .. } => "refund.updated",
            WebhookEvent::Other { event_type, .. } => event_type,
        }
    }

    /// Parse an event body. Schema violations are `WebhookPayloadInvalid`.
    pub fn parse(body: &[u8]) -> BillingResult<Self> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;
        if envelope.event_id.is_empty() {
            return Err(BillingError::WebhookPayloadInvalid(
                "event_id is empty".to_string(),
            ));
        }

        let event = match envelope.event_type.as_str() {
            "payment.created" | "payment.updated" => {
                let payment = envelope.data.object.payment.ok_or_else(|| {
                    BillingError::WebhookPayloadInvalid("missing data.object.payment".to_string())
                })?;
                WebhookEvent::Payment {
                    event_id: envelope.event_id,
                    payment_id: payment.id,
                    reference_id: payment.reference_id.filter(|r| !r.is_empty()),
                    status: payment.status,
                }
            }
            "refund.created" | "refund.updated" => {
                let refund = envelope.data.object.refund.ok_or_else(|| {
                    BillingError::WebhookPayloadInvalid("missing data.object.refund".to_string())
                })?;
                WebhookEvent::Refund {
                    event_id: envelope.event_id,
                    refund_id: refund.id,
                    payment_id: refund.payment_id,
                    status: refund.status,
                }
            }
            _ => WebhookEvent::Other {
                event_id: envelope.event_id,
                event_type: envelope.event_type,
            },
        };
        Ok(event)
    }
}

/// What processing an event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Local state changed
    Applied,
    /// Event id seen before, or the target state was already terminal
    Duplicate,
    /// Non-terminal status, unknown owner or unconsumed event type
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Clone)]
pub struct WebhookProcessor {
    ctx: Arc<BillingContext>,
    signing: WebhookSigning,
}

impl WebhookProcessor {
    pub fn new(ctx: Arc<BillingContext>, signing: WebhookSigning) -> Self {
        Self { ctx, signing }
    }

    /// Verify, parse and apply one raw delivery
    pub async fn receive(&self, body: &[u8], signature: Option<&str>) -> BillingResult<WebhookOutcome> {
        let signature = signature.ok_or(BillingError::WebhookSignatureInvalid)?;
        if let Err(e) = self.signing.verify(body, signature) {
            tracing::warn!(body_len = body.len(), "Rejected webhook with invalid signature");
            return Err(e);
        }
        let event = WebhookEvent::parse(body)?;
        self.handle(event).await
    }

    /// Apply a verified event exactly once per event id
    pub async fn handle(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        let event_id = event.event_id().to_string();
        let now = self.ctx.clock.now();

        match self
            .ctx
            .store
            .claim_webhook_event(&event_id, event.event_type(), now)
            .await?
        {
            EventClaim::Claimed => {}
            claim => {
                let duplicate = BillingError::DuplicateWebhookEvent(event_id.clone());
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event.event_type(),
                    claim = ?claim,
                    "{}",
                    duplicate
                );
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        tracing::info!(event_id = %event_id, event_type = %event.event_type(), "Processing webhook event");
        let result = match &event {
            WebhookEvent::Payment {
                payment_id,
                reference_id,
                status,
                ..
            } => {
                self.handle_payment_event(payment_id, reference_id.as_deref(), status)
                    .await
            }
            WebhookEvent::Refund {
                refund_id,
                payment_id,
                status,
                ..
            } => self.handle_refund_event(refund_id, payment_id, status).await,
            WebhookEvent::Other { event_type, .. } => {
                tracing::debug!(event_id = %event_id, event_type = %event_type, "Ignoring webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        };

        let error_message = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self
            .ctx
            .store
            .finish_webhook_event(&event_id, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result; event stays claimed until the timeout"
            );
        }

        match &result {
            Ok(outcome) => tracing::info!(event_id = %event_id, outcome = outcome.as_str(), "Webhook event processed"),
            Err(e) => tracing::error!(event_id = %event_id, error = %e, "Webhook event processing failed"),
        }
        result
    }

    /// Apply a processor payment status to the charge it belongs to
    pub async fn handle_payment_event(
        &self,
        payment_id: &str,
        reference_id: Option<&str>,
        status: &str,
    ) -> BillingResult<WebhookOutcome> {
        let status = match PaymentStatus::parse(status) {
            Some(status) if status.is_terminal() => status,
            _ => {
                tracing::debug!(payment_id = %payment_id, status = %status, "Ignoring non-terminal payment status");
                return Ok(WebhookOutcome::Ignored);
            }
        };
        let success = status.is_success();

        // Owner rows are locked before ledger rows, the order the charge paths use
        let mut tx = self.ctx.store.begin().await?;
        let sub = tx
            .lock_subscription_by_charge(payment_id, reference_id)
            .await?
            .filter(|sub| {
                awaits_charge(&sub.pending_charge_key, &sub.external_payment_ref, payment_id, reference_id)
            });
        let purchase = match sub {
            Some(_) => None,
            None => tx
                .lock_purchase_by_charge(payment_id, reference_id)
                .await?
                .filter(|purchase| {
                    purchase.status == PurchaseStatus::Pending
                        && awaits_charge(
                            &purchase.pending_charge_key,
                            &purchase.external_payment_ref,
                            payment_id,
                            reference_id,
                        )
                }),
        };

        let rows: Vec<_> = tx
            .lock_transactions_by_ref(payment_id)
            .await?
            .into_iter()
            .filter(|t| t.transaction_type.is_charge_leg())
            .collect();
        if !rows.is_empty() && rows.iter().all(|t| t.status.is_terminal()) {
            tracing::debug!(payment_id = %payment_id, "Payment already settled; terminal state is sticky");
            return Ok(WebhookOutcome::Duplicate);
        }
        let has_rows = !rows.is_empty();

        if let Some(sub) = sub {
            return self
                .settle_subscription(tx, sub, payment_id, has_rows, success)
                .await;
        }
        if let Some(purchase) = purchase {
            return self
                .settle_purchase(tx, purchase, payment_id, has_rows, success)
                .await;
        }

        if has_rows {
            let target = terminal_status(success);
            let marked = self.ctx.ledger.mark_status(tx.as_mut(), payment_id, target).await?;
            tx.commit().await?;
            tracing::warn!(
                payment_id = %payment_id,
                status = target.as_str(),
                outcome = ?marked,
                "Settled ledger rows of a payment with no waiting owner"
            );
            return Ok(WebhookOutcome::Applied);
        }

        tracing::warn!(
            payment_id = %payment_id,
            reference_id = ?reference_id,
            "Payment event matches no local charge"
        );
        Ok(WebhookOutcome::Ignored)
    }

    async fn settle_subscription(
        &self,
        mut tx: Box<dyn StoreTx>,
        sub: Subscription,
        payment_id: &str,
        has_rows: bool,
        success: bool,
    ) -> BillingResult<WebhookOutcome> {
        let now = self.ctx.clock.now();
        let first_charge = sub.status == SubscriptionStatus::Pending;
        let expected = sub.version;

        if success {
            if has_rows {
                self.ctx
                    .ledger
                    .mark_status(tx.as_mut(), payment_id, TransactionStatus::Completed)
                    .await?;
            } else {
                let pair = LedgerPair::new(
                    sub.subscriber_id,
                    sub.creator_id,
                    &split(sub.price, self.ctx.config.fee_percent)?,
                    ChargeKind::Subscription,
                    payment_id,
                    TransactionStatus::Completed,
                    now,
                )?;
                self.ctx.ledger.record_pair(tx.as_mut(), pair).await?;
            }
            let update = if first_charge {
                SubscriptionUpdate::Activate {
                    payment_ref: Some(payment_id.to_string()),
                }
            } else {
                SubscriptionUpdate::Renew {
                    payment_ref: Some(payment_id.to_string()),
                }
            };
            let updated = sub.apply(update, now)?;
            tx.update_subscription(&updated, expected).await?;
            tx.commit().await?;

            tracing::info!(
                subscription_id = %updated.id,
                payment_id = %payment_id,
                first_charge,
                period_end = %updated.current_period_end,
                "Webhook settled subscription charge"
            );
            let (recipient, kind) = if first_charge {
                (updated.subscriber_id, NotificationKind::SubscriptionActivated)
            } else {
                (updated.subscriber_id, NotificationKind::SubscriptionRenewed)
            };
            self.ctx
                .notify(
                    recipient,
                    kind,
                    serde_json::json!({
                        "subscriptionId": updated.id,
                        "periodEnd": updated.current_period_end.unix_timestamp(),
                    }),
                )
                .await;
            if first_charge {
                self.ctx
                    .notify(
                        updated.creator_id,
                        NotificationKind::NewSubscriber,
                        serde_json::json!({ "subscriptionId": updated.id, "subscriberId": updated.subscriber_id }),
                    )
                    .await;
            }
        } else {
            if has_rows {
                self.ctx
                    .ledger
                    .mark_status(tx.as_mut(), payment_id, TransactionStatus::Failed)
                    .await?;
            }
            let updated = sub.apply(
                SubscriptionUpdate::ChargeFailed {
                    max_attempts: self.ctx.config.max_renewal_attempts,
                    retry_at: now + self.ctx.config.renewal_retry_interval,
                },
                now,
            )?;
            tx.update_subscription(&updated, expected).await?;
            tx.commit().await?;

            tracing::info!(
                subscription_id = %updated.id,
                payment_id = %payment_id,
                status = updated.status.as_str(),
                attempts = updated.renewal_attempts,
                "Webhook failed subscription charge"
            );
            self.ctx
                .notify(
                    updated.subscriber_id,
                    NotificationKind::PaymentFailed,
                    serde_json::json!({
                        "subscriptionId": updated.id,
                        "status": updated.status,
                        "attempts": updated.renewal_attempts,
                    }),
                )
                .await;
        }
        Ok(WebhookOutcome::Applied)
    }

    async fn settle_purchase(
        &self,
        mut tx: Box<dyn StoreTx>,
        purchase: Purchase,
        payment_id: &str,
        has_rows: bool,
        success: bool,
    ) -> BillingResult<WebhookOutcome> {
        let now = self.ctx.clock.now();
        let expected = purchase.version;

        if success {
            if has_rows {
                self.ctx
                    .ledger
                    .mark_status(tx.as_mut(), payment_id, TransactionStatus::Completed)
                    .await?;
            } else {
                let pair = LedgerPair::new(
                    purchase.buyer_id,
                    purchase.creator_id,
                    &split(purchase.price, self.ctx.config.fee_percent)?,
                    ChargeKind::ContentPurchase,
                    payment_id,
                    TransactionStatus::Completed,
                    now,
                )?;
                self.ctx.ledger.record_pair(tx.as_mut(), pair).await?;
            }
            let updated = purchase.apply(
                PurchaseUpdate::Complete {
                    payment_ref: Some(payment_id.to_string()),
                },
                now,
            )?;
            tx.update_purchase(&updated, expected).await?;
            tx.commit().await?;
            tracing::info!(purchase_id = %updated.id, payment_id = %payment_id, "Webhook completed purchase");
            notify_purchased(&self.ctx, &updated).await;
        } else {
            if has_rows {
                self.ctx
                    .ledger
                    .mark_status(tx.as_mut(), payment_id, TransactionStatus::Failed)
                    .await?;
            }
            let updated = purchase.apply(PurchaseUpdate::Fail, now)?;
            tx.update_purchase(&updated, expected).await?;
            tx.commit().await?;
            tracing::info!(purchase_id = %updated.id, payment_id = %payment_id, "Webhook failed purchase");
            self.ctx
                .notify(
                    updated.buyer_id,
                    NotificationKind::PurchaseFailed,
                    serde_json::json!({ "purchaseId": updated.id, "postId": updated.post_id }),
                )
                .await;
        }
        Ok(WebhookOutcome::Applied)
    }

    /// Apply a processor refund status to the purchase it reverses
    pub async fn handle_refund_event(
        &self,
        refund_id: &str,
        payment_id: &str,
        status: &str,
    ) -> BillingResult<WebhookOutcome> {
        let status = match RefundStatus::parse(status) {
            Some(status) if status.is_terminal() => status,
            _ => {
                tracing::debug!(refund_id = %refund_id, status = %status, "Ignoring non-terminal refund status");
                return Ok(WebhookOutcome::Ignored);
            }
        };
        let now = self.ctx.clock.now();

        let mut tx = self.ctx.store.begin().await?;
        let purchase = tx.lock_purchase_by_refund(refund_id, Some(payment_id)).await?;
        let rows: Vec<_> = tx
            .lock_transactions_by_ref(refund_id)
            .await?
            .into_iter()
            .filter(|t| t.transaction_type == TransactionType::Refund)
            .collect();
        if !rows.is_empty() && rows.iter().all(|t| t.status.is_terminal()) {
            tracing::debug!(refund_id = %refund_id, "Refund already settled; terminal state is sticky");
            return Ok(WebhookOutcome::Duplicate);
        }
        let has_rows = !rows.is_empty();

        if status.is_success() {
            let Some(purchase) = purchase else {
                return self.complete_refund_rows(tx, refund_id, has_rows).await;
            };
            match (purchase.status, purchase.refund_ref.as_deref()) {
                (PurchaseStatus::Completed, _) => {
                    if purchase.refund_ref.as_deref().is_some_and(|r| r != refund_id) {
                        tracing::warn!(
                            purchase_id = %purchase.id,
                            refund_id = %refund_id,
                            "Refund event does not match the purchase's refund in flight"
                        );
                        return Ok(WebhookOutcome::Ignored);
                    }
                    if has_rows {
                        self.ctx
                            .ledger
                            .mark_status(tx.as_mut(), refund_id, TransactionStatus::Completed)
                            .await?;
                    } else {
                        let original = purchase
                            .external_payment_ref
                            .clone()
                            .unwrap_or_else(|| payment_id.to_string());
                        self.ctx
                            .ledger
                            .record_refund(
                                tx.as_mut(),
                                purchase.buyer_id,
                                purchase.price,
                                refund_id,
                                &original,
                                TransactionStatus::Completed,
                                now,
                            )
                            .await?;
                    }
                    let expected = purchase.version;
                    let updated = purchase.apply(
                        PurchaseUpdate::Refunded {
                            refund_ref: refund_id.to_string(),
                        },
                        now,
                    )?;
                    tx.update_purchase(&updated, expected).await?;
                    tx.commit().await?;
                    tracing::info!(purchase_id = %updated.id, refund_id = %refund_id, "Webhook completed refund");
                    notify_refunded(&self.ctx, &updated).await;
                    Ok(WebhookOutcome::Applied)
                }
                (PurchaseStatus::Refunded, Some(r)) if r == refund_id => {
                    self.complete_refund_rows(tx, refund_id, has_rows).await
                }
                (status, _) => {
                    tracing::warn!(
                        purchase_id = %purchase.id,
                        refund_id = %refund_id,
                        status = status.as_str(),
                        "Refund event for a purchase that cannot be refunded"
                    );
                    Ok(WebhookOutcome::Ignored)
                }
            }
        } else {
            if has_rows {
                self.ctx
                    .ledger
                    .mark_status(tx.as_mut(), refund_id, TransactionStatus::Failed)
                    .await?;
            }
            let mut applied = has_rows;
            if let Some(purchase) = purchase {
                if purchase.status == PurchaseStatus::Completed
                    && purchase.refund_ref.as_deref() == Some(refund_id)
                {
                    let expected = purchase.version;
                    let updated = purchase.apply(PurchaseUpdate::RefundFailed, now)?;
                    tx.update_purchase(&updated, expected).await?;
                    applied = true;
                }
            }
            tx.commit().await?;
            tracing::warn!(refund_id = %refund_id, payment_id = %payment_id, "Refund failed at the processor");
            Ok(if applied {
                WebhookOutcome::Applied
            } else {
                WebhookOutcome::Ignored
            })
        }
    }

    /// Complete refund rows whose purchase needs no further change
    async fn complete_refund_rows(
        &self,
        mut tx: Box<dyn StoreTx>,
        refund_id: &str,
        has_rows: bool,
    ) -> BillingResult<WebhookOutcome> {
        if !has_rows {
            tracing::warn!(refund_id = %refund_id, "Refund event matches no local purchase");
            return Ok(WebhookOutcome::Ignored);
        }
        let marked = self
            .ctx
            .ledger
            .mark_status(tx.as_mut(), refund_id, TransactionStatus::Completed)
            .await?;
        tx.commit().await?;
        Ok(match marked {
            MarkOutcome::Updated(_) => WebhookOutcome::Applied,
            MarkOutcome::AlreadyTerminal | MarkOutcome::NotFound => WebhookOutcome::Duplicate,
        })
    }
}

/// The owner is still waiting on exactly this charge
fn awaits_charge(
    pending_key: &Option<String>,
    external_ref: &Option<String>,
    payment_id: &str,
    reference_id: Option<&str>,
) -> bool {
    let Some(key) = pending_key.as_deref() else {
        return false;
    };
    reference_id == Some(key) || external_ref.as_deref() == Some(payment_id)
}

fn terminal_status(success: bool) -> TransactionStatus {
    if success {
        TransactionStatus::Completed
    } else {
        TransactionStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing() -> WebhookSigning {
        WebhookSigning::new("whsec_test", "https://example.test/payments/webhook")
    }

    #[test]
    fn test_signature_round_trip_and_tamper() {
        let body = br#"{"event_id":"evt_1"}"#;
        let sig = signing().sign(body).unwrap();

        assert!(signing().verify(body, &sig).is_ok());
        assert!(matches!(
            signing().verify(br#"{"event_id":"evt_2"}"#, &sig),
            Err(BillingError::WebhookSignatureInvalid)
        ));
        let other_url = WebhookSigning::new("whsec_test", "https://attacker.test/hook");
        assert!(other_url.verify(body, &sig).is_err());
        assert!(signing().verify(body, "").is_err());
    }

    #[test]
    fn test_parse_payment_event() {
        let body = br#"{
            "event_id": "evt_1",
            "type": "payment.updated",
            "data": {"object": {"payment": {
                "id": "pay_1",
                "status": "COMPLETED",
                "reference_id": "subscribe_abc",
                "amount_money": {"amount": 1000, "currency": "USD"}
            }}}
        }"#;
        let event = WebhookEvent::parse(body).unwrap();
        assert_eq!(
            event,
            WebhookEvent::Payment {
                event_id: "evt_1".into(),
                payment_id: "pay_1".into(),
                reference_id: Some("subscribe_abc".into()),
                status: "COMPLETED".into(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_schema_violations() {
        assert!(matches!(
            WebhookEvent::parse(b"not json"),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
        let missing_object = br#"{"event_id":"evt_1","type":"refund.updated","data":{"object":{}}}"#;
        assert!(matches!(
            WebhookEvent::parse(missing_object),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
        let other = br#"{"event_id":"evt_2","type":"customer.created","data":{"object":{}}}"#;
        assert!(matches!(
            WebhookEvent::parse(other).unwrap(),
            WebhookEvent::Other { .. }
        ));
    }

    #[test]
    fn test_awaits_charge_matches_key_or_payment() {
        let key = Some("renewal_1".to_string());
        assert!(awaits_charge(&key, &None, "pay_1", Some("renewal_1")));
        assert!(awaits_charge(&key, &Some("pay_1".into()), "pay_1", None));
        assert!(!awaits_charge(&key, &Some("pay_0".into()), "pay_1", Some("other")));
        assert!(!awaits_charge(&None, &Some("pay_1".into()), "pay_1", None));
    }
}
