//! Postgres [`BillingStore`]
//!
//! Units of work are sqlx transactions; `lock_*` reads use `SELECT ... FOR UPDATE`.
//! The one-live-row rules are enforced by partial unique indexes (see `migrations/`),
//! so two processes racing on the same pair fail at insert instead of both winning.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{
    BillingStore, DueCursor, EventClaim, LiveDuplicate, RefSummary, StoreTx,
    WEBHOOK_PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{TransactionStatus, TransactionType, WalletTransaction};
use crate::money::{Currency, Money};
use crate::purchases::{Purchase, PurchaseStatus};
use crate::subscriptions::{Subscription, SubscriptionStatus};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, subscriber_id, creator_id, status, price_minor, currency,
    current_period_start, current_period_end, cancel_at_period_end,
    external_payment_ref, payment_method_ref, pending_charge_key,
    renewal_attempts, next_attempt_at, version, created_at, updated_at, canceled_at
"#;

const PURCHASE_COLUMNS: &str = r#"
    id, buyer_id, creator_id, post_id, status, price_minor, currency,
    external_payment_ref, payment_method_ref, pending_charge_key, refund_ref, version,
    created_at, updated_at, refunded_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, pair_id, account_id, amount_minor, fee_minor, currency,
    transaction_type, status, external_payment_ref, original_ref, created_at
"#;

const CHARGE_LEG_TYPES: &str =
    "('subscription_payment', 'subscription_earning', 'content_purchase_payment', 'content_purchase_earning')";

const LIVE_SUBSCRIPTION_STATUSES: &str = "('pending', 'active', 'past_due')";

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    subscriber_id: Uuid,
    creator_id: Uuid,
    status: String,
    price_minor: i64,
    currency: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    external_payment_ref: Option<String>,
    payment_method_ref: Option<String>,
    pending_charge_key: Option<String>,
    renewal_attempts: i32,
    next_attempt_at: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    canceled_at: Option<OffsetDateTime>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            subscriber_id: row.subscriber_id,
            creator_id: row.creator_id,
            status: SubscriptionStatus::parse(&row.status)
                .ok_or_else(|| corrupt("subscription status", &row.status))?,
            price: Money::new(row.price_minor, parse_currency(&row.currency)?),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            external_payment_ref: row.external_payment_ref,
            payment_method_ref: row.payment_method_ref,
            pending_charge_key: row.pending_charge_key,
            renewal_attempts: row.renewal_attempts,
            next_attempt_at: row.next_attempt_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            canceled_at: row.canceled_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PurchaseRow {
    id: Uuid,
    buyer_id: Uuid,
    creator_id: Uuid,
    post_id: Uuid,
    status: String,
    price_minor: i64,
    currency: String,
    external_payment_ref: Option<String>,
    payment_method_ref: Option<String>,
    pending_charge_key: Option<String>,
    refund_ref: Option<String>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    refunded_at: Option<OffsetDateTime>,
}

impl TryFrom<PurchaseRow> for Purchase {
    type Error = BillingError;

    fn try_from(row: PurchaseRow) -> BillingResult<Self> {
        Ok(Purchase {
            id: row.id,
            buyer_id: row.buyer_id,
            creator_id: row.creator_id,
            post_id: row.post_id,
            status: PurchaseStatus::parse(&row.status)
                .ok_or_else(|| corrupt("purchase status", &row.status))?,
            price: Money::new(row.price_minor, parse_currency(&row.currency)?),
            external_payment_ref: row.external_payment_ref,
            payment_method_ref: row.payment_method_ref,
            pending_charge_key: row.pending_charge_key,
            refund_ref: row.refund_ref,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            refunded_at: row.refunded_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    pair_id: Option<Uuid>,
    account_id: Uuid,
    amount_minor: i64,
    fee_minor: i64,
    currency: String,
    transaction_type: String,
    status: String,
    external_payment_ref: String,
    original_ref: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for WalletTransaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> BillingResult<Self> {
        Ok(WalletTransaction {
            id: row.id,
            pair_id: row.pair_id,
            account_id: row.account_id,
            amount_minor: row.amount_minor,
            fee_minor: row.fee_minor,
            currency: parse_currency(&row.currency)?,
            transaction_type: TransactionType::parse(&row.transaction_type)
                .ok_or_else(|| corrupt("transaction type", &row.transaction_type))?,
            status: TransactionStatus::parse(&row.status)
                .ok_or_else(|| corrupt("transaction status", &row.status))?,
            external_payment_ref: row.external_payment_ref,
            original_ref: row.original_ref,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RefSummaryRow {
    external_ref: String,
    row_count: i64,
    completed_rows: i64,
    net_sum: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct LiveDuplicateRow {
    subscriber_id: Uuid,
    creator_id: Uuid,
    live_count: i64,
}

fn corrupt(what: &str, value: &str) -> BillingError {
    BillingError::Database(format!("unexpected {} in database: {}", what, value))
}

fn parse_currency(value: &str) -> BillingResult<Currency> {
    Currency::parse(value).ok_or_else(|| corrupt("currency", value))
}

fn convert<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Turn a unique violation of a one-live-row index into the matching domain error
fn map_insert_error(e: sqlx::Error) -> BillingError {
    if let sqlx::Error::Database(db) = &e {
        match db.constraint() {
            Some("subscriptions_one_live_per_pair") => return BillingError::AlreadySubscribed,
            Some("purchases_one_live_per_post") => return BillingError::AlreadyPurchased,
            _ => {}
        }
    }
    e.into()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn get_customer_id(&self, account_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT processor_customer_id FROM billing_accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn save_customer_id(&self, account_id: Uuid, customer_id: &str) -> BillingResult<String> {
        // The no-op update makes RETURNING yield the stored id on conflict
        let (stored,): (String,) = sqlx::query_as(
            r#"
            INSERT INTO billing_accounts (account_id, processor_customer_id)
            VALUES ($1, $2)
            ON CONFLICT (account_id) DO UPDATE SET account_id = EXCLUDED.account_id
            RETURNING processor_customer_id
            "#,
        )
        .bind(account_id)
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn list_subscriptions(
        &self,
        subscriber_id: Uuid,
        status: Option<SubscriptionStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE subscriber_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id
            LIMIT $3 OFFSET $4
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscriber_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn pair_subscriptions(
        &self,
        subscriber_id: Uuid,
        creator_id: Uuid,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE subscriber_id = $1 AND creator_id = $2 ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscriber_id)
        .bind(creator_id)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn list_due_subscriptions(
        &self,
        now: OffsetDateTime,
        after: Option<DueCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status IN ('active', 'past_due')
              AND current_period_end <= $1
              AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
              AND ($2::timestamptz IS NULL OR (current_period_end, id) > ($2, $3::uuid))
            ORDER BY current_period_end, id
            LIMIT $4
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .bind(after.map(|c| c.period_end))
        .bind(after.map(|c| c.id))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn get_purchase(&self, id: Uuid) -> BillingResult<Option<Purchase>> {
        let row: Option<PurchaseRow> = sqlx::query_as(&format!(
            "SELECT {} FROM purchases WHERE id = $1",
            PURCHASE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Purchase::try_from).transpose()
    }

    async fn sum_completed(
        &self,
        account_id: Uuid,
        types: Option<&[TransactionType]>,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<i64> {
        let types: Option<Vec<String>> =
            types.map(|types| types.iter().map(|t| t.as_str().to_string()).collect());
        let (sum,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount_minor), 0)::BIGINT
            FROM wallet_transactions
            WHERE account_id = $1
              AND status = 'completed'
              AND ($2::text[] IS NULL OR transaction_type = ANY($2))
              AND ($3::timestamptz IS NULL OR created_at >= $3)
            "#,
        )
        .bind(account_id)
        .bind(types)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WalletTransaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM wallet_transactions
            WHERE account_id = $1
            ORDER BY created_at DESC, id
            LIMIT $2 OFFSET $3
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let stale_before = now - Duration::minutes(WEBHOOK_PROCESSING_TIMEOUT_MINUTES);

        // Only one concurrent caller gets a row back
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO payment_webhook_events
                (event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', $3)
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = $3,
                error_message = NULL
            WHERE payment_webhook_events.processing_result = 'error'
               OR (payment_webhook_events.processing_result = 'processing'
                   AND payment_webhook_events.processing_started_at < $4)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Failed to claim webhook event");
            BillingError::from(e)
        })?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM payment_webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((result,)) if result == "success" => EventClaim::AlreadyProcessed,
            _ => EventClaim::InProgress,
        })
    }

    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let result = if error.is_some() { "error" } else { "success" };
        sqlx::query(
            r#"
            UPDATE payment_webhook_events
            SET processing_result = $1, error_message = $2, processed_at = NOW()
            WHERE event_id = $3
            "#,
        )
        .bind(result)
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn charge_ref_summaries(&self) -> BillingResult<Vec<RefSummary>> {
        let rows: Vec<RefSummaryRow> = sqlx::query_as(&format!(
            r#"
            SELECT
                external_payment_ref AS external_ref,
                COUNT(*) AS row_count,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed_rows,
                COALESCE(SUM(amount_minor + fee_minor), 0)::BIGINT AS net_sum
            FROM wallet_transactions
            WHERE transaction_type IN {}
            GROUP BY external_payment_ref
            ORDER BY external_payment_ref
            "#,
            CHARGE_LEG_TYPES
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RefSummary {
                external_ref: row.external_ref,
                rows: row.row_count,
                completed_rows: row.completed_rows,
                net_sum: row.net_sum,
            })
            .collect())
    }

    async fn live_subscription_duplicates(&self) -> BillingResult<Vec<LiveDuplicate>> {
        let rows: Vec<LiveDuplicateRow> = sqlx::query_as(&format!(
            r#"
            SELECT subscriber_id, creator_id, COUNT(*) AS live_count
            FROM subscriptions
            WHERE status IN {}
            GROUP BY subscriber_id, creator_id
            HAVING COUNT(*) > 1
            "#,
            LIVE_SUBSCRIPTION_STATUSES
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LiveDuplicate {
                subscriber_id: row.subscriber_id,
                creator_id: row.creator_id,
                live_count: row.live_count,
            })
            .collect())
    }

    async fn invalid_periods(&self) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM subscriptions WHERE current_period_end <= current_period_start",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn fetch_subscription(
        &mut self,
        filter: &str,
        binds: SubscriptionFilter<'_>,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE {} LIMIT 1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS, filter
        );
        let query = sqlx::query_as::<_, SubscriptionRow>(&sql);
        let query = match binds {
            SubscriptionFilter::Id(id) => query.bind(id),
            SubscriptionFilter::Pair(subscriber, creator) => query.bind(subscriber).bind(creator),
            SubscriptionFilter::Charge(payment_ref, key) => query.bind(payment_ref).bind(key),
        };
        let row = query.fetch_optional(&mut *self.tx).await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn fetch_purchase(
        &mut self,
        filter: &str,
        binds: PurchaseFilter<'_>,
    ) -> BillingResult<Option<Purchase>> {
        let sql = format!(
            "SELECT {} FROM purchases WHERE {} LIMIT 1 FOR UPDATE",
            PURCHASE_COLUMNS, filter
        );
        let query = sqlx::query_as::<_, PurchaseRow>(&sql);
        let query = match binds {
            PurchaseFilter::Id(id) => query.bind(id),
            PurchaseFilter::Post(buyer, post) => query.bind(buyer).bind(post),
            PurchaseFilter::Refs(first, second) => query.bind(first).bind(second),
        };
        let row = query.fetch_optional(&mut *self.tx).await?;
        row.map(Purchase::try_from).transpose()
    }
}

enum SubscriptionFilter<'a> {
    Id(Uuid),
    Pair(Uuid, Uuid),
    Charge(&'a str, Option<&'a str>),
}

enum PurchaseFilter<'a> {
    Id(Uuid),
    Post(Uuid, Uuid),
    Refs(&'a str, Option<&'a str>),
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_subscription(&mut self, id: Uuid) -> BillingResult<Option<Subscription>> {
        self.fetch_subscription("id = $1", SubscriptionFilter::Id(id))
            .await
    }

    async fn lock_live_subscription(
        &mut self,
        subscriber_id: Uuid,
        creator_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let filter = format!(
            "subscriber_id = $1 AND creator_id = $2 AND status IN {}",
            LIVE_SUBSCRIPTION_STATUSES
        );
        self.fetch_subscription(&filter, SubscriptionFilter::Pair(subscriber_id, creator_id))
            .await
    }

    async fn lock_subscription_by_charge(
        &mut self,
        payment_ref: &str,
        charge_key: Option<&str>,
    ) -> BillingResult<Option<Subscription>> {
        self.fetch_subscription(
            r#"($2::text IS NOT NULL AND pending_charge_key = $2) OR external_payment_ref = $1
               ORDER BY (pending_charge_key IS NOT DISTINCT FROM $2) DESC"#,
            SubscriptionFilter::Charge(payment_ref, charge_key),
        )
        .await
    }

    async fn insert_subscription(&mut self, sub: &Subscription) -> BillingResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO subscriptions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(sub.id)
        .bind(sub.subscriber_id)
        .bind(sub.creator_id)
        .bind(sub.status.as_str())
        .bind(sub.price.minor_units)
        .bind(sub.price.currency.as_str())
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at_period_end)
        .bind(&sub.external_payment_ref)
        .bind(&sub.payment_method_ref)
        .bind(&sub.pending_charge_key)
        .bind(sub.renewal_attempts)
        .bind(sub.next_attempt_at)
        .bind(sub.version)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .bind(sub.canceled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_insert_error)?;
        Ok(())
    }

    async fn update_subscription(
        &mut self,
        sub: &Subscription,
        expected_version: i64,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $3,
                current_period_start = $4,
                current_period_end = $5,
                cancel_at_period_end = $6,
                external_payment_ref = $7,
                payment_method_ref = $8,
                pending_charge_key = $9,
                renewal_attempts = $10,
                next_attempt_at = $11,
                version = $12,
                updated_at = $13,
                canceled_at = $14
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(sub.id)
        .bind(expected_version)
        .bind(sub.status.as_str())
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at_period_end)
        .bind(&sub.external_payment_ref)
        .bind(&sub.payment_method_ref)
        .bind(&sub.pending_charge_key)
        .bind(sub.renewal_attempts)
        .bind(sub.next_attempt_at)
        .bind(sub.version)
        .bind(sub.updated_at)
        .bind(sub.canceled_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ConcurrentModification);
        }
        Ok(())
    }

    async fn lock_purchase(&mut self, id: Uuid) -> BillingResult<Option<Purchase>> {
        self.fetch_purchase("id = $1", PurchaseFilter::Id(id)).await
    }

    async fn lock_live_purchase(
        &mut self,
        buyer_id: Uuid,
        post_id: Uuid,
    ) -> BillingResult<Option<Purchase>> {
        self.fetch_purchase(
            "buyer_id = $1 AND post_id = $2 AND status IN ('pending', 'completed')",
            PurchaseFilter::Post(buyer_id, post_id),
        )
        .await
    }

    async fn count_purchases(&mut self, buyer_id: Uuid, post_id: Uuid) -> BillingResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM purchases WHERE buyer_id = $1 AND post_id = $2")
                .bind(buyer_id)
                .bind(post_id)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(count)
    }

    async fn lock_purchase_by_charge(
        &mut self,
        payment_ref: &str,
        charge_key: Option<&str>,
    ) -> BillingResult<Option<Purchase>> {
        self.fetch_purchase(
            r#"($2::text IS NOT NULL AND pending_charge_key = $2) OR external_payment_ref = $1
               ORDER BY (pending_charge_key IS NOT DISTINCT FROM $2) DESC"#,
            PurchaseFilter::Refs(payment_ref, charge_key),
        )
        .await
    }

    async fn lock_purchase_by_refund(
        &mut self,
        refund_ref: &str,
        payment_ref: Option<&str>,
    ) -> BillingResult<Option<Purchase>> {
        self.fetch_purchase(
            r#"refund_ref = $1 OR ($2::text IS NOT NULL AND external_payment_ref = $2)
               ORDER BY (refund_ref IS NOT DISTINCT FROM $1) DESC"#,
            PurchaseFilter::Refs(refund_ref, payment_ref),
        )
        .await
    }

    async fn insert_purchase(&mut self, purchase: &Purchase) -> BillingResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO purchases ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
            PURCHASE_COLUMNS
        ))
        .bind(purchase.id)
        .bind(purchase.buyer_id)
        .bind(purchase.creator_id)
        .bind(purchase.post_id)
        .bind(purchase.status.as_str())
        .bind(purchase.price.minor_units)
        .bind(purchase.price.currency.as_str())
        .bind(&purchase.external_payment_ref)
        .bind(&purchase.payment_method_ref)
        .bind(&purchase.pending_charge_key)
        .bind(&purchase.refund_ref)
        .bind(purchase.version)
        .bind(purchase.created_at)
        .bind(purchase.updated_at)
        .bind(purchase.refunded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_insert_error)?;
        Ok(())
    }

    async fn update_purchase(
        &mut self,
        purchase: &Purchase,
        expected_version: i64,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE purchases SET
                status = $3,
                external_payment_ref = $4,
                pending_charge_key = $5,
                refund_ref = $6,
                version = $7,
                updated_at = $8,
                refunded_at = $9
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(purchase.id)
        .bind(expected_version)
        .bind(purchase.status.as_str())
        .bind(&purchase.external_payment_ref)
        .bind(&purchase.pending_charge_key)
        .bind(&purchase.refund_ref)
        .bind(purchase.version)
        .bind(purchase.updated_at)
        .bind(purchase.refunded_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ConcurrentModification);
        }
        Ok(())
    }

    async fn lock_transactions_by_ref(
        &mut self,
        external_ref: &str,
    ) -> BillingResult<Vec<WalletTransaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM wallet_transactions WHERE external_payment_ref = $1 ORDER BY created_at FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(external_ref)
        .fetch_all(&mut *self.tx)
        .await?;
        convert(rows)
    }

    async fn insert_transaction(&mut self, row: &WalletTransaction) -> BillingResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO wallet_transactions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(row.id)
        .bind(row.pair_id)
        .bind(row.account_id)
        .bind(row.amount_minor)
        .bind(row.fee_minor)
        .bind(row.currency.as_str())
        .bind(row.transaction_type.as_str())
        .bind(row.status.as_str())
        .bind(&row.external_payment_ref)
        .bind(&row.original_ref)
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_transaction_status(
        &mut self,
        external_ref: &str,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            "UPDATE wallet_transactions SET status = $3 WHERE external_payment_ref = $1 AND status = $2",
        )
        .bind(external_ref)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
