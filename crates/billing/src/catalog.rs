//! Prices owned by the content side of the platform

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::money::{Currency, Money};

/// A post that can be bought
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedPost {
    pub post_id: Uuid,
    pub creator_id: Uuid,
    pub price: Money,
}

#[async_trait]
pub trait ContentCatalog: Send + Sync {
    /// Monthly price of the creator's subscription tier, `None` if the creator has none
    async fn creator_tier_price(&self, creator_id: Uuid) -> BillingResult<Option<Money>>;

    /// Price of a paid post, `None` if it does not exist or is free to view
    async fn post_price(&self, post_id: Uuid) -> BillingResult<Option<PricedPost>>;
}

/// Reads tier and post prices from the content tables
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
    currency: Currency,
}

impl PgCatalog {
    pub fn new(pool: PgPool, currency: Currency) -> Self {
        Self { pool, currency }
    }
}

#[async_trait]
impl ContentCatalog for PgCatalog {
    async fn creator_tier_price(&self, creator_id: Uuid) -> BillingResult<Option<Money>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT price_minor FROM creator_tiers WHERE creator_id = $1 AND active = true",
        )
        .bind(creator_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(price,)| Money::new(price, self.currency)))
    }

    async fn post_price(&self, post_id: Uuid) -> BillingResult<Option<PricedPost>> {
        let row: Option<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT creator_id, price_minor
            FROM posts
            WHERE id = $1 AND price_minor IS NOT NULL AND deleted_at IS NULL
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(creator_id, price)| PricedPost {
            post_id,
            creator_id,
            price: Money::new(price, self.currency),
        }))
    }
}
