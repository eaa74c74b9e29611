//! Subscription management
//!
//! A subscription links a subscriber to a creator for monthly periods. Every status or
//! period change is an explicit [`SubscriptionUpdate`] applied by
//! [`Subscription::apply`]; services and the webhook processor never edit fields
//! directly.
//!
//! Charges follow intent-first ordering: the idempotency key is persisted on the row
//! (`pending_charge_key`) before the processor is called, then the outcome is applied
//! in a second unit of work. A lost response therefore always leaves a row the webhook
//! processor can match by `reference_id`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{ChargeOutcome, ChargeRequest, IdempotencyKey};
use crate::clock::one_month_after;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{ChargeKind, LedgerPair, TransactionStatus};
use crate::money::{split, Money};
use crate::notify::NotificationKind;
use crate::BillingContext;

pub const SUBSCRIPTIONS_PAGE_SIZE: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(SubscriptionStatus::Pending),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Occupies the single live slot of a subscriber/creator pair
    pub fn is_live(&self) -> bool {
        !matches!(self, SubscriptionStatus::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub creator_id: Uuid,
    pub status: SubscriptionStatus,
    /// Tier price captured at subscribe time; later tier edits do not affect it
    pub price: Money,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    /// Processor id of the latest charge
    pub external_payment_ref: Option<String>,
    /// Reusable card reference used for renewals
    #[serde(skip_serializing)]
    pub payment_method_ref: Option<String>,
    /// Idempotency key of a charge whose outcome is not applied yet
    #[serde(skip_serializing)]
    pub pending_charge_key: Option<String>,
    pub renewal_attempts: i32,
    /// Earliest time the scheduler retries after a declined renewal
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_attempt_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
}

/// Every way a subscription can change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionUpdate {
    /// First charge settled: PENDING -> ACTIVE, period restarts now
    Activate { payment_ref: Option<String> },
    /// Renewal charge settled: period advances in place, PAST_DUE recovers
    Renew { payment_ref: Option<String> },
    /// Record the idempotency key of a charge about to be submitted
    BeginCharge { charge_key: String },
    /// Charge accepted but unsettled, or its outcome is unknown
    AwaitCharge { payment_ref: Option<String> },
    /// Charge definitively failed; a renewal is retried no earlier than `retry_at`
    ChargeFailed {
        max_attempts: i32,
        retry_at: OffsetDateTime,
    },
    ScheduleCancel,
    Resume,
    Cancel,
    ReplacePaymentMethod { payment_method_ref: String },
}

impl SubscriptionUpdate {
    fn action(&self) -> &'static str {
        match self {
            SubscriptionUpdate::Activate { .. } => "activate",
            SubscriptionUpdate::Renew { .. } => "renew",
            SubscriptionUpdate::BeginCharge { .. } => "charge",
            SubscriptionUpdate::AwaitCharge { .. } => "await a charge",
            SubscriptionUpdate::ChargeFailed { .. } => "fail a charge",
            SubscriptionUpdate::ScheduleCancel => "cancel at period end",
            SubscriptionUpdate::Resume => "resume",
            SubscriptionUpdate::Cancel => "cancel",
            SubscriptionUpdate::ReplacePaymentMethod { .. } => "change payment method",
        }
    }
}

impl Subscription {
    /// New PENDING subscription with a tentative first period starting `now`
    pub fn new(
        subscriber_id: Uuid,
        creator_id: Uuid,
        price: Money,
        payment_method_ref: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            subscriber_id,
            creator_id,
            status: SubscriptionStatus::Pending,
            price,
            current_period_start: now,
            current_period_end: one_month_after(now)?,
            cancel_at_period_end: false,
            external_payment_ref: None,
            payment_method_ref,
            pending_charge_key: None,
            renewal_attempts: 0,
            next_attempt_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
            canceled_at: None,
        })
    }

    /// `status == ACTIVE && current_period_end >= now`; status alone is never enough
    pub fn grants_access(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Active && self.current_period_end >= now
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::PastDue
        ) && self.current_period_end <= now
            && !self.backing_off(now)
    }

    /// A declined renewal is waiting for its retry time
    pub fn backing_off(&self, now: OffsetDateTime) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }

    /// First charge whose outcome never came back: no processor payment id is known,
    /// so nothing will settle it unless the stored key is submitted again
    pub fn first_charge_unresolved(&self) -> bool {
        self.status == SubscriptionStatus::Pending
            && self.pending_charge_key.is_some()
            && self.external_payment_ref.is_none()
    }

    /// Apply one update, returning the new row with its version bumped
    pub fn apply(mut self, update: SubscriptionUpdate, now: OffsetDateTime) -> BillingResult<Self> {
        use SubscriptionStatus::*;

        let invalid = |status: SubscriptionStatus, update: &SubscriptionUpdate| {
            BillingError::InvalidSubscriptionState {
                status: status.as_str(),
                action: update.action(),
            }
        };

        match (&update, self.status) {
            (SubscriptionUpdate::Activate { payment_ref }, Pending) => {
                self.status = Active;
                self.current_period_start = now;
                self.current_period_end = one_month_after(now)?;
                self.external_payment_ref = payment_ref.clone().or(self.external_payment_ref.take());
                self.pending_charge_key = None;
                self.renewal_attempts = 0;
                self.next_attempt_at = None;
            }
            (SubscriptionUpdate::Renew { payment_ref }, Active | PastDue) => {
                let continues = self.status == Active
                    && one_month_after(self.current_period_end)? > now;
                let start = if continues { self.current_period_end } else { now };
                self.status = Active;
                self.current_period_start = start;
                self.current_period_end = one_month_after(start)?;
                self.external_payment_ref = payment_ref.clone().or(self.external_payment_ref.take());
                self.pending_charge_key = None;
                self.renewal_attempts = 0;
                self.next_attempt_at = None;
            }
            (SubscriptionUpdate::BeginCharge { charge_key }, Pending | Active | PastDue) => {
                self.pending_charge_key = Some(charge_key.clone());
            }
            (SubscriptionUpdate::AwaitCharge { payment_ref }, Pending | Active | PastDue) => {
                if self.pending_charge_key.is_none() {
                    return Err(invalid(self.status, &update));
                }
                if self.status == Active {
                    self.status = PastDue;
                }
                if payment_ref.is_some() {
                    self.external_payment_ref = payment_ref.clone();
                }
            }
            (SubscriptionUpdate::ChargeFailed { .. }, Pending) => {
                // A first charge that never settled leaves nothing to dun
                self.status = Canceled;
                self.canceled_at = Some(now);
                self.pending_charge_key = None;
            }
            (
                SubscriptionUpdate::ChargeFailed {
                    max_attempts,
                    retry_at,
                },
                Active | PastDue,
            ) => {
                self.renewal_attempts += 1;
                self.pending_charge_key = None;
                if self.renewal_attempts >= *max_attempts {
                    self.status = Canceled;
                    self.canceled_at = Some(now);
                    self.next_attempt_at = None;
                } else {
                    self.status = PastDue;
                    self.next_attempt_at = Some(*retry_at);
                }
            }
            (SubscriptionUpdate::ScheduleCancel, Active | PastDue) => {
                self.cancel_at_period_end = true;
            }
            (SubscriptionUpdate::Resume, Active) => {
                self.cancel_at_period_end = false;
            }
            (SubscriptionUpdate::Cancel, Pending | Active | PastDue) => {
                self.status = Canceled;
                self.canceled_at = Some(now);
                self.pending_charge_key = None;
                self.next_attempt_at = None;
            }
            (SubscriptionUpdate::ReplacePaymentMethod { payment_method_ref }, Active | PastDue) => {
                // A new card is worth trying right away
                self.payment_method_ref = Some(payment_method_ref.clone());
                self.next_attempt_at = None;
            }
            (_, status) => return Err(invalid(status, &update)),
        }

        self.version += 1;
        self.updated_at = now;
        Ok(self)
    }
}

/// Idempotency key of a first charge. `generation` counts earlier subscriptions of the
/// pair, so resubscribing after a cancellation is a new logical charge.
pub fn subscribe_charge_key(
    subscriber_id: Uuid,
    creator_id: Uuid,
    generation: usize,
    payment_method_ref: &str,
) -> IdempotencyKey {
    IdempotencyKey::derive(
        "subscribe",
        &[&subscriber_id, &creator_id, &generation, &payment_method_ref],
    )
}

/// Idempotency key of a renewal: one logical charge per (period, attempt)
pub fn renewal_charge_key(sub: &Subscription) -> IdempotencyKey {
    IdempotencyKey::derive(
        "renewal",
        &[
            &sub.id,
            &sub.current_period_end.unix_timestamp(),
            &sub.renewal_attempts,
        ],
    )
}

/// Result of [`SubscriptionService::renew`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed(Subscription),
    /// `cancel_at_period_end` fired; nothing was charged
    Canceled(Subscription),
    /// Charge declined; PAST_DUE, or CANCELED once the attempts are exhausted
    Declined {
        subscription: Subscription,
        code: Option<String>,
    },
    /// Outcome unknown or unsettled; the webhook processor finishes it
    Pending(Subscription),
    /// Period has not ended yet, or another worker already settled it
    NotDue(Subscription),
}

impl RenewalOutcome {
    pub fn subscription(&self) -> &Subscription {
        match self {
            RenewalOutcome::Renewed(s)
            | RenewalOutcome::Canceled(s)
            | RenewalOutcome::Pending(s)
            | RenewalOutcome::NotDue(s) => s,
            RenewalOutcome::Declined { subscription, .. } => subscription,
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    ctx: Arc<BillingContext>,
    customers: CustomerService,
}

impl SubscriptionService {
    pub fn new(ctx: Arc<BillingContext>) -> Self {
        let customers = CustomerService::new(ctx.clone());
        Self { ctx, customers }
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        self.ctx
            .store
            .get_subscription(id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)
    }

    /// Caller's subscriptions, newest first. `page` starts at 1.
    pub async fn list(
        &self,
        subscriber_id: Uuid,
        status: Option<SubscriptionStatus>,
        page: u32,
    ) -> BillingResult<Vec<Subscription>> {
        let offset = i64::from(page.max(1) - 1) * SUBSCRIPTIONS_PAGE_SIZE;
        self.ctx
            .store
            .list_subscriptions(subscriber_id, status, SUBSCRIPTIONS_PAGE_SIZE, offset)
            .await
    }

    pub async fn has_access(&self, subscriber_id: Uuid, creator_id: Uuid) -> BillingResult<bool> {
        let now = self.ctx.clock.now();
        let subs = self
            .ctx
            .store
            .pair_subscriptions(subscriber_id, creator_id)
            .await?;
        Ok(subs.iter().any(|s| s.grants_access(now)))
    }

    /// Subscribe `subscriber_id` to `creator_id` at the creator's current tier price.
    ///
    /// Returns an ACTIVE subscription when the charge settles synchronously, or a
    /// PENDING one when its outcome is left to the webhook processor.
    pub async fn subscribe(
        &self,
        subscriber_id: Uuid,
        creator_id: Uuid,
        payment_source_token: &str,
    ) -> BillingResult<Subscription> {
        if subscriber_id == creator_id {
            return Err(BillingError::SelfSubscription);
        }
        let price = self
            .ctx
            .catalog
            .creator_tier_price(creator_id)
            .await?
            .ok_or(BillingError::CreatorNotFound)?;
        if price.minor_units < 0 {
            return Err(BillingError::InvalidAmount(format!(
                "tier price of creator {} is negative",
                creator_id
            )));
        }

        let _guard = self
            .ctx
            .locks
            .lock(pair_lock_key(subscriber_id, creator_id))
            .await;
        let now = self.ctx.clock.now();
        let existing = self
            .ctx
            .store
            .pair_subscriptions(subscriber_id, creator_id)
            .await?;

        if let Some(live) = existing.iter().find(|s| s.status.is_live()) {
            if live.first_charge_unresolved() {
                return self.resubmit_first_charge(live.clone()).await;
            }
            let current = live.status == SubscriptionStatus::Pending
                || live.pending_charge_key.is_some()
                || (live.status == SubscriptionStatus::Active && live.current_period_end > now);
            if current {
                return Err(BillingError::AlreadySubscribed);
            }
            if let Some(sub) = self.recover(live.clone(), payment_source_token).await? {
                return Ok(sub);
            }
        }

        let generation = self
            .ctx
            .store
            .pair_subscriptions(subscriber_id, creator_id)
            .await?
            .len();
        self.create(subscriber_id, creator_id, price, payment_source_token, generation)
            .await
    }

    /// Bring a PAST_DUE or lapsed subscription back with a new card. `None` means it was
    /// canceled instead and a fresh subscription should be created.
    async fn recover(
        &self,
        sub: Subscription,
        payment_source_token: &str,
    ) -> BillingResult<Option<Subscription>> {
        tracing::info!(
            subscription_id = %sub.id,
            status = sub.status.as_str(),
            "Subscribe request renews an existing lapsed subscription"
        );

        let _guard = self.ctx.locks.lock(sub_lock_key(sub.id)).await;
        if sub.price.minor_units > 0 {
            let customer_id = self.customers.ensure_customer(sub.subscriber_id).await?;
            let card = self
                .customers
                .save_payment_method(&customer_id, payment_source_token)
                .await?;

            let mut tx = self.ctx.store.begin().await?;
            let locked = tx
                .lock_subscription(sub.id)
                .await?
                .ok_or(BillingError::SubscriptionNotFound)?;
            let expected = locked.version;
            let updated = locked.apply(
                SubscriptionUpdate::ReplacePaymentMethod {
                    payment_method_ref: card,
                },
                self.ctx.clock.now(),
            )?;
            tx.update_subscription(&updated, expected).await?;
            tx.commit().await?;
        }

        match self.renew_locked(sub.id).await? {
            RenewalOutcome::Canceled(_) => Ok(None),
            RenewalOutcome::Declined { code, .. } => Err(BillingError::GatewayDeclined { code }),
            RenewalOutcome::Renewed(s) | RenewalOutcome::Pending(s) | RenewalOutcome::NotDue(s) => {
                Ok(Some(s))
            }
        }
    }

    /// Submit a lost first charge again under its stored key and card. The processor
    /// answers with the original payment if it ever received the first request.
    async fn resubmit_first_charge(&self, sub: Subscription) -> BillingResult<Subscription> {
        let (Some(key), Some(card)) = (
            sub.pending_charge_key.clone(),
            sub.payment_method_ref.clone(),
        ) else {
            return Err(BillingError::AlreadySubscribed);
        };
        let key = IdempotencyKey::from_stored(key);
        tracing::info!(
            subscription_id = %sub.id,
            "Resubmitting first charge whose outcome never arrived"
        );

        let _guard = self.ctx.locks.lock(sub_lock_key(sub.id)).await;
        let customer_id = self.customers.ensure_customer(sub.subscriber_id).await?;
        let request = ChargeRequest {
            customer_id,
            payment_method_ref: card,
            amount: sub.price,
            idempotency_key: key.clone(),
            note: format!("Subscription {}", sub.id),
        };
        let outcome = self.ctx.gateway.charge(&request).await?;

        match self.settle_charge(sub.id, &key, outcome).await? {
            Settled::Applied(sub) | Settled::AlreadySettled(sub) => Ok(sub),
            Settled::Declined { code, .. } => Err(BillingError::GatewayDeclined { code }),
        }
    }

    async fn create(
        &self,
        subscriber_id: Uuid,
        creator_id: Uuid,
        price: Money,
        payment_source_token: &str,
        generation: usize,
    ) -> BillingResult<Subscription> {
        if price.is_zero() {
            let now = self.ctx.clock.now();
            let sub = Subscription::new(subscriber_id, creator_id, price, None, now)?
                .apply(SubscriptionUpdate::Activate { payment_ref: None }, now)?;
            let mut tx = self.ctx.store.begin().await?;
            if tx.lock_live_subscription(subscriber_id, creator_id).await?.is_some() {
                return Err(BillingError::AlreadySubscribed);
            }
            tx.insert_subscription(&sub).await?;
            tx.commit().await?;
            self.notify_activated(&sub).await;
            return Ok(sub);
        }

        let customer_id = self.customers.ensure_customer(subscriber_id).await?;
        let card = self
            .customers
            .save_payment_method(&customer_id, payment_source_token)
            .await?;
        let key = subscribe_charge_key(subscriber_id, creator_id, generation, &card);

        // Intent first: the row exists before the processor sees the charge
        let now = self.ctx.clock.now();
        let sub = Subscription::new(subscriber_id, creator_id, price, Some(card.clone()), now)?
            .apply(
                SubscriptionUpdate::BeginCharge {
                    charge_key: key.to_string(),
                },
                now,
            )?;
        let mut tx = self.ctx.store.begin().await?;
        if tx.lock_live_subscription(subscriber_id, creator_id).await?.is_some() {
            return Err(BillingError::AlreadySubscribed);
        }
        tx.insert_subscription(&sub).await?;
        tx.commit().await?;

        let request = ChargeRequest {
            customer_id,
            payment_method_ref: card,
            amount: price,
            idempotency_key: key.clone(),
            note: format!("Subscription {}", sub.id),
        };
        let outcome = match self.ctx.gateway.charge(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abandon(sub.id, &key).await;
                return Err(e);
            }
        };

        match self.settle_charge(sub.id, &key, outcome).await? {
            Settled::Applied(sub) | Settled::AlreadySettled(sub) => Ok(sub),
            Settled::Declined { code, .. } => Err(BillingError::GatewayDeclined { code }),
        }
    }

    /// Cancel a subscription whose first charge was rejected outright by configuration
    async fn abandon(&self, id: Uuid, key: &IdempotencyKey) {
        let result: BillingResult<()> = async {
            let mut tx = self.ctx.store.begin().await?;
            if let Some(sub) = tx.lock_subscription(id).await? {
                if sub.pending_charge_key.as_deref() == Some(key.as_str())
                    && sub.status == SubscriptionStatus::Pending
                {
                    let expected = sub.version;
                    let canceled = sub.apply(SubscriptionUpdate::Cancel, self.ctx.clock.now())?;
                    tx.update_subscription(&canceled, expected).await?;
                }
            }
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(subscription_id = %id, error = %e, "Failed to abandon pending subscription");
        }
    }

    /// Run one renewal. See [`RenewalOutcome`] for the possible results.
    pub async fn renew(&self, subscription_id: Uuid) -> BillingResult<RenewalOutcome> {
        let _guard = self.ctx.locks.lock(sub_lock_key(subscription_id)).await;
        self.renew_locked(subscription_id).await
    }

    async fn renew_locked(&self, subscription_id: Uuid) -> BillingResult<RenewalOutcome> {
        let now = self.ctx.clock.now();
        let mut tx = self.ctx.store.begin().await?;
        let sub = tx
            .lock_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;

        if !matches!(
            sub.status,
            SubscriptionStatus::Active | SubscriptionStatus::PastDue
        ) {
            return Err(BillingError::InvalidSubscriptionState {
                status: sub.status.as_str(),
                action: "renew",
            });
        }
        if sub.current_period_end > now || sub.backing_off(now) {
            return Ok(RenewalOutcome::NotDue(sub));
        }

        if sub.cancel_at_period_end {
            let expected = sub.version;
            let canceled = sub.apply(SubscriptionUpdate::Cancel, now)?;
            tx.update_subscription(&canceled, expected).await?;
            tx.commit().await?;
            tracing::info!(subscription_id = %subscription_id, "Subscription canceled at period end");
            self.ctx
                .notify(
                    canceled.subscriber_id,
                    NotificationKind::SubscriptionCanceled,
                    serde_json::json!({ "subscriptionId": canceled.id, "atPeriodEnd": true }),
                )
                .await;
            return Ok(RenewalOutcome::Canceled(canceled));
        }

        if sub.price.is_zero() {
            let expected = sub.version;
            let renewed = sub.apply(SubscriptionUpdate::Renew { payment_ref: None }, now)?;
            tx.update_subscription(&renewed, expected).await?;
            tx.commit().await?;
            return Ok(RenewalOutcome::Renewed(renewed));
        }

        let card = match sub.payment_method_ref.clone() {
            Some(card) => card,
            None => {
                return Err(BillingError::InvalidSubscriptionState {
                    status: sub.status.as_str(),
                    action: "renew without a stored payment method",
                })
            }
        };

        // An unsettled earlier attempt is resubmitted under its own key
        let key = match &sub.pending_charge_key {
            Some(existing) => IdempotencyKey::from_stored(existing.clone()),
            None => {
                let key = renewal_charge_key(&sub);
                let expected = sub.version;
                let marked = sub.clone().apply(
                    SubscriptionUpdate::BeginCharge {
                        charge_key: key.to_string(),
                    },
                    now,
                )?;
                tx.update_subscription(&marked, expected).await?;
                key
            }
        };
        tx.commit().await?;

        let customer_id = self.customers.ensure_customer(sub.subscriber_id).await?;
        let request = ChargeRequest {
            customer_id,
            payment_method_ref: card,
            amount: sub.price,
            idempotency_key: key.clone(),
            note: format!("Subscription {} renewal", sub.id),
        };
        let outcome = self.ctx.gateway.charge(&request).await?;

        match self.settle_charge(subscription_id, &key, outcome).await? {
            Settled::Applied(s) if s.status == SubscriptionStatus::Active => {
                Ok(RenewalOutcome::Renewed(s))
            }
            Settled::Applied(s) => Ok(RenewalOutcome::Pending(s)),
            Settled::AlreadySettled(s) => Ok(RenewalOutcome::NotDue(s)),
            Settled::Declined { subscription, code } => {
                Ok(RenewalOutcome::Declined { subscription, code })
            }
        }
    }

    /// Apply a charge outcome to the subscription that recorded `key` as pending
    async fn settle_charge(
        &self,
        subscription_id: Uuid,
        key: &IdempotencyKey,
        outcome: ChargeOutcome,
    ) -> BillingResult<Settled> {
        let now = self.ctx.clock.now();
        let mut tx = self.ctx.store.begin().await?;
        let sub = tx
            .lock_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;

        if sub.pending_charge_key.as_deref() != Some(key.as_str()) {
            tracing::info!(
                subscription_id = %subscription_id,
                "Charge already settled by another worker or a webhook"
            );
            return Ok(Settled::AlreadySettled(sub));
        }

        let first_charge = sub.status == SubscriptionStatus::Pending;
        let expected = sub.version;

        match outcome {
            ChargeOutcome::Completed { payment_id } => {
                let pair = LedgerPair::new(
                    sub.subscriber_id,
                    sub.creator_id,
                    &split(sub.price, self.ctx.config.fee_percent)?,
                    ChargeKind::Subscription,
                    &payment_id,
                    TransactionStatus::Completed,
                    now,
                )?;
                self.ctx.ledger.record_pair(tx.as_mut(), pair).await?;

                let update = if first_charge {
                    SubscriptionUpdate::Activate {
                        payment_ref: Some(payment_id.clone()),
                    }
                } else {
                    SubscriptionUpdate::Renew {
                        payment_ref: Some(payment_id.clone()),
                    }
                };
                let updated = sub.apply(update, now)?;
                tx.update_subscription(&updated, expected).await?;
                tx.commit().await?;

                tracing::info!(
                    subscription_id = %updated.id,
                    payment_id = %payment_id,
                    period_end = %updated.current_period_end,
                    first_charge,
                    "Subscription charge completed"
                );
                if first_charge {
                    self.notify_activated(&updated).await;
                } else {
                    self.ctx
                        .notify(
                            updated.subscriber_id,
                            NotificationKind::SubscriptionRenewed,
                            serde_json::json!({
                                "subscriptionId": updated.id,
                                "periodEnd": updated.current_period_end.unix_timestamp(),
                            }),
                        )
                        .await;
                }
                Ok(Settled::Applied(updated))
            }
            ChargeOutcome::Pending { payment_id } => {
                if let Some(payment_id) = &payment_id {
                    let pair = LedgerPair::new(
                        sub.subscriber_id,
                        sub.creator_id,
                        &split(sub.price, self.ctx.config.fee_percent)?,
                        ChargeKind::Subscription,
                        payment_id,
                        TransactionStatus::Pending,
                        now,
                    )?;
                    self.ctx.ledger.record_pair(tx.as_mut(), pair).await?;
                }
                let updated = sub.apply(
                    SubscriptionUpdate::AwaitCharge {
                        payment_ref: payment_id.clone(),
                    },
                    now,
                )?;
                tx.update_subscription(&updated, expected).await?;
                tx.commit().await?;

                tracing::warn!(
                    subscription_id = %updated.id,
                    payment_id = ?payment_id,
                    status = updated.status.as_str(),
                    "Subscription charge not settled, awaiting webhook"
                );
                Ok(Settled::Applied(updated))
            }
            ChargeOutcome::Declined { code } => {
                // Legs recorded while the charge was accepted but unsettled
                if let Some(payment_ref) = &sub.external_payment_ref {
                    self.ctx
                        .ledger
                        .mark_status(tx.as_mut(), payment_ref, TransactionStatus::Failed)
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
                    decline_code = ?code,
                    attempts = updated.renewal_attempts,
                    status = updated.status.as_str(),
                    "Subscription charge declined"
                );
                if !first_charge {
                    self.notify_payment_failed(&updated).await;
                }
                Ok(Settled::Declined {
                    subscription: updated,
                    code,
                })
            }
        }
    }

    /// Cancel now, or at the end of the paid period
    pub async fn cancel(&self, subscription_id: Uuid, immediate: bool) -> BillingResult<Subscription> {
        let _guard = self.ctx.locks.lock(sub_lock_key(subscription_id)).await;
        let now = self.ctx.clock.now();
        let mut tx = self.ctx.store.begin().await?;
        let sub = tx
            .lock_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;

        if sub.status == SubscriptionStatus::Canceled {
            return Ok(sub);
        }
        if !immediate && sub.cancel_at_period_end {
            return Ok(sub);
        }

        let expected = sub.version;
        let update = if immediate {
            SubscriptionUpdate::Cancel
        } else {
            SubscriptionUpdate::ScheduleCancel
        };
        let updated = sub.apply(update, now)?;
        tx.update_subscription(&updated, expected).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            immediate,
            period_end = %updated.current_period_end,
            "Subscription cancellation applied"
        );
        if immediate {
            self.ctx
                .notify(
                    updated.subscriber_id,
                    NotificationKind::SubscriptionCanceled,
                    serde_json::json!({ "subscriptionId": updated.id, "atPeriodEnd": false }),
                )
                .await;
        }
        Ok(updated)
    }

    /// Undo a scheduled cancellation
    pub async fn resume(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let _guard = self.ctx.locks.lock(sub_lock_key(subscription_id)).await;
        let mut tx = self.ctx.store.begin().await?;
        let sub = tx
            .lock_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;
        if !sub.cancel_at_period_end && sub.status == SubscriptionStatus::Active {
            return Ok(sub);
        }

        let expected = sub.version;
        let updated = sub.apply(SubscriptionUpdate::Resume, self.ctx.clock.now())?;
        tx.update_subscription(&updated, expected).await?;
        tx.commit().await?;
        tracing::info!(subscription_id = %subscription_id, "Subscription resumed");
        Ok(updated)
    }

    async fn notify_activated(&self, sub: &Subscription) {
        self.ctx
            .notify(
                sub.subscriber_id,
                NotificationKind::SubscriptionActivated,
                serde_json::json!({ "subscriptionId": sub.id, "creatorId": sub.creator_id }),
            )
            .await;
        self.ctx
            .notify(
                sub.creator_id,
                NotificationKind::NewSubscriber,
                serde_json::json!({ "subscriptionId": sub.id, "subscriberId": sub.subscriber_id }),
            )
            .await;
    }

    async fn notify_payment_failed(&self, sub: &Subscription) {
        self.ctx
            .notify(
                sub.subscriber_id,
                NotificationKind::PaymentFailed,
                serde_json::json!({
                    "subscriptionId": sub.id,
                    "status": sub.status,
                    "attempts": sub.renewal_attempts,
                }),
            )
            .await;
    }
}

enum Settled {
    Applied(Subscription),
    AlreadySettled(Subscription),
    Declined {
        subscription: Subscription,
        code: Option<String>,
    },
}

pub(crate) fn sub_lock_key(id: Uuid) -> String {
    format!("subscription:{}", id)
}

fn pair_lock_key(subscriber_id: Uuid, creator_id: Uuid) -> String {
    format!("subscribe:{}:{}", subscriber_id, creator_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ChargeReceipt, GatewayError, PaymentStatus};
    use crate::testing::TestHarness;
    use time::macros::datetime;
    use time::Duration;

    fn sample(now: OffsetDateTime) -> Subscription {
        Subscription::new(Uuid::new_v4(), Uuid::new_v4(), Money::usd(1000), Some("ccof_1".into()), now)
            .unwrap()
    }

    #[test]
    fn test_activate_sets_first_period() {
        let now = datetime!(2026-03-10 09:00 UTC);
        let sub = sample(now)
            .apply(SubscriptionUpdate::Activate { payment_ref: Some("pay_1".into()) }, now)
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_start, now);
        assert_eq!(sub.current_period_end, datetime!(2026-04-10 09:00 UTC));
        assert_eq!(sub.external_payment_ref.as_deref(), Some("pay_1"));
        assert_eq!(sub.version, 2);
    }

    #[test]
    fn test_renew_from_active_is_contiguous() {
        let start = datetime!(2026-01-31 12:00 UTC);
        let sub = sample(start)
            .apply(SubscriptionUpdate::Activate { payment_ref: None }, start)
            .unwrap();
        assert_eq!(sub.current_period_end, datetime!(2026-02-28 12:00 UTC));

        let renewed = sub
            .apply(SubscriptionUpdate::Renew { payment_ref: Some("pay_2".into()) }, datetime!(2026-02-28 13:00 UTC))
            .unwrap();
        assert_eq!(renewed.current_period_start, datetime!(2026-02-28 12:00 UTC));
        assert_eq!(renewed.current_period_end, datetime!(2026-03-28 12:00 UTC));
    }

    #[test]
    fn test_recovery_from_past_due_restarts_at_now() {
        let start = datetime!(2026-01-01 00:00 UTC);
        let sub = sample(start)
            .apply(SubscriptionUpdate::Activate { payment_ref: None }, start)
            .unwrap()
            .apply(
                SubscriptionUpdate::ChargeFailed {
                    max_attempts: 4,
                    retry_at: datetime!(2026-02-02 00:00 UTC),
                },
                datetime!(2026-02-01 00:00 UTC),
            )
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.renewal_attempts, 1);
        assert!(!sub.is_due(datetime!(2026-02-01 12:00 UTC)));
        assert!(sub.is_due(datetime!(2026-02-02 00:00 UTC)));

        let recovered_at = datetime!(2026-02-05 08:00 UTC);
        let sub = sub
            .apply(SubscriptionUpdate::Renew { payment_ref: Some("pay_3".into()) }, recovered_at)
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_start, recovered_at);
        assert_eq!(sub.renewal_attempts, 0);
    }

    #[test]
    fn test_dunning_cancels_after_max_attempts() {
        let now = datetime!(2026-01-01 00:00 UTC);
        let mut sub = sample(now)
            .apply(SubscriptionUpdate::Activate { payment_ref: None }, now)
            .unwrap();
        let failed = SubscriptionUpdate::ChargeFailed {
            max_attempts: 3,
            retry_at: now + Duration::days(1),
        };
        for _ in 0..2 {
            sub = sub.apply(failed.clone(), now).unwrap();
            assert_eq!(sub.status, SubscriptionStatus::PastDue);
            assert_eq!(sub.next_attempt_at, Some(now + Duration::days(1)));
        }
        sub = sub.apply(failed, now).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(sub.canceled_at.is_some());
        assert!(sub.next_attempt_at.is_none());
    }

    #[test]
    fn test_canceled_never_reactivates() {
        let now = datetime!(2026-01-01 00:00 UTC);
        let canceled = sample(now)
            .apply(SubscriptionUpdate::Activate { payment_ref: None }, now)
            .unwrap()
            .apply(SubscriptionUpdate::Cancel, now)
            .unwrap();

        for update in [
            SubscriptionUpdate::Activate { payment_ref: None },
            SubscriptionUpdate::Renew { payment_ref: None },
            SubscriptionUpdate::Resume,
            SubscriptionUpdate::Cancel,
        ] {
            let err = canceled.clone().apply(update, now).unwrap_err();
            assert!(matches!(err, BillingError::InvalidSubscriptionState { status: "canceled", .. }));
        }
    }

    #[test]
    fn test_access_requires_unexpired_active() {
        let now = datetime!(2026-01-01 00:00 UTC);
        let sub = sample(now)
            .apply(SubscriptionUpdate::Activate { payment_ref: None }, now)
            .unwrap();
        assert!(sub.grants_access(now + Duration::days(10)));
        assert!(!sub.grants_access(now + Duration::days(40)));
        assert!(!sample(now).grants_access(now));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_self_and_unknown_creator() {
        let h = TestHarness::new();
        let account = Uuid::new_v4();
        let err = h.subscriptions().subscribe(account, account, "cnon_ok").await.unwrap_err();
        assert!(matches!(err, BillingError::SelfSubscription));

        let err = h
            .subscriptions()
            .subscribe(account, Uuid::new_v4(), "cnon_ok")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::CreatorNotFound));
        assert_eq!(h.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_twice_is_rejected() {
        let h = TestHarness::new();
        let (subscriber, creator) = (Uuid::new_v4(), h.creator_with_price(1000));

        h.subscriptions().subscribe(subscriber, creator, "cnon_ok").await.unwrap();
        let err = h
            .subscriptions()
            .subscribe(subscriber, creator, "cnon_ok")
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::AlreadySubscribed));
        assert_eq!(h.gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_decline_persists_nothing_live() {
        let h = TestHarness::new();
        let (subscriber, creator) = (Uuid::new_v4(), h.creator_with_price(1000));
        h.gateway.push_charge(Err(GatewayError::Declined {
            code: Some("CARD_DECLINED".into()),
        }));

        let err = h
            .subscriptions()
            .subscribe(subscriber, creator, "cnon_ok")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::GatewayDeclined { .. }));
        assert!(!h.subscriptions().has_access(subscriber, creator).await.unwrap());
        assert_eq!(h.store.transaction_count().await, 0);

        // A second attempt is a new logical charge and may succeed
        let sub = h.subscriptions().subscribe(subscriber, creator, "cnon_ok").await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        let keys = h.gateway.charge_keys();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn test_subscribe_with_unsettled_charge_stays_pending() {
        let h = TestHarness::new();
        let (subscriber, creator) = (Uuid::new_v4(), h.creator_with_price(1000));
        h.gateway.push_charge(Ok(ChargeReceipt {
            external_payment_id: "pay_slow".into(),
            status: PaymentStatus::Approved,
        }));

        let sub = h.subscriptions().subscribe(subscriber, creator, "cnon_ok").await.unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert_eq!(sub.external_payment_ref.as_deref(), Some("pay_slow"));
        assert!(sub.pending_charge_key.is_some());
        assert!(!h.subscriptions().has_access(subscriber, creator).await.unwrap());
        assert_eq!(h.ledger().get_balance(subscriber).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lost_first_charge_is_resubmitted_on_resubscribe() {
        let h = TestHarness::new();
        let (subscriber, creator) = (Uuid::new_v4(), h.creator_with_price(1000));
        for _ in 0..3 {
            h.gateway
                .push_charge(Err(GatewayError::Transient("timeout".into())));
        }

        let pending = h.subscriptions().subscribe(subscriber, creator, "cnon_ok").await.unwrap();
        assert_eq!(pending.status, SubscriptionStatus::Pending);
        assert!(pending.external_payment_ref.is_none());

        let active = h
            .subscriptions()
            .subscribe(subscriber, creator, "cnon_other")
            .await
            .unwrap();

        assert_eq!(active.id, pending.id);
        assert_eq!(active.status, SubscriptionStatus::Active);
        assert_eq!(active.payment_method_ref, pending.payment_method_ref);
        let keys = h.gateway.charge_keys();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| k == &keys[0]));
        assert!(h.subscriptions().has_access(subscriber, creator).await.unwrap());
        assert_eq!(h.ledger().get_balance(creator).await.unwrap(), 800);

        let err = h
            .subscriptions()
            .subscribe(subscriber, creator, "cnon_ok")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AlreadySubscribed));
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_free_tier_has_no_charge_or_ledger_rows() {
        let h = TestHarness::new();
        let (subscriber, creator) = (Uuid::new_v4(), h.creator_with_price(0));

        let sub = h.subscriptions().subscribe(subscriber, creator, "").await.unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(h.gateway.charge_count(), 0);
        assert_eq!(h.store.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_resume_clears_scheduled_cancel() {
        let h = TestHarness::new();
        let (subscriber, creator) = (Uuid::new_v4(), h.creator_with_price(1000));
        let sub = h.subscriptions().subscribe(subscriber, creator, "cnon_ok").await.unwrap();

        let scheduled = h.subscriptions().cancel(sub.id, false).await.unwrap();
        assert!(scheduled.cancel_at_period_end);
        let resumed = h.subscriptions().resume(sub.id).await.unwrap();
        assert!(!resumed.cancel_at_period_end);
        assert_eq!(resumed.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_immediate_cancel_revokes_access() {
        let h = TestHarness::new();
        let (subscriber, creator) = (Uuid::new_v4(), h.creator_with_price(1000));
        let sub = h.subscriptions().subscribe(subscriber, creator, "cnon_ok").await.unwrap();

        let canceled = h.subscriptions().cancel(sub.id, true).await.unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(!h.subscriptions().has_access(subscriber, creator).await.unwrap());

        let again = h.subscriptions().cancel(sub.id, true).await.unwrap();
        assert_eq!(again.version, canceled.version);
        assert!(h
            .notifier
            .sent_to(subscriber)
            .contains(&NotificationKind::SubscriptionCanceled));
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let h = TestHarness::new();
        let subscriber = Uuid::new_v4();
        let (c1, c2) = (h.creator_with_price(500), h.creator_with_price(700));
        let first = h.subscriptions().subscribe(subscriber, c1, "cnon_ok").await.unwrap();
        h.subscriptions().subscribe(subscriber, c2, "cnon_ok").await.unwrap();
        h.subscriptions().cancel(first.id, true).await.unwrap();

        let all = h.subscriptions().list(subscriber, None, 1).await.unwrap();
        let active = h
            .subscriptions()
            .list(subscriber, Some(SubscriptionStatus::Active), 1)
            .await
            .unwrap();
        let page_two = h.subscriptions().list(subscriber, None, 2).await.unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].creator_id, c2);
        assert!(page_two.is_empty());
    }
}
