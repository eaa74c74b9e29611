//! Processor customers and stored payment methods

use std::sync::Arc;

use uuid::Uuid;

use crate::client::IdempotencyKey;
use crate::error::{BillingError, BillingResult};
use crate::BillingContext;

#[derive(Clone)]
pub struct CustomerService {
    ctx: Arc<BillingContext>,
}

impl CustomerService {
    pub fn new(ctx: Arc<BillingContext>) -> Self {
        Self { ctx }
    }

    /// Return the account's processor customer id, creating it on first use.
    ///
    /// The remote customer is persisted before the id is returned. A crash between the
    /// remote create and the local save leaves an orphan remote record; the retry reuses
    /// the same idempotency key, so the processor hands back that same customer.
    pub async fn ensure_customer(&self, account_id: Uuid) -> BillingResult<String> {
        if let Some(id) = self.ctx.store.get_customer_id(account_id).await? {
            return Ok(id);
        }

        let _guard = self.ctx.locks.lock(format!("customer:{}", account_id)).await;
        if let Some(id) = self.ctx.store.get_customer_id(account_id).await? {
            return Ok(id);
        }

        let key = IdempotencyKey::derive("customer", &[&account_id]);
        let created = self.ctx.gateway.create_customer(account_id, &key).await?;
        let stored = self.ctx.store.save_customer_id(account_id, &created).await?;

        if stored != created {
            tracing::warn!(
                account_id = %account_id,
                stored_customer = %stored,
                created_customer = %created,
                "Account already had a processor customer; keeping the stored one"
            );
        } else {
            tracing::info!(account_id = %account_id, customer_id = %stored, "Created processor customer");
        }
        Ok(stored)
    }

    /// Turn a one-time source token into a reusable card reference for `customer_id`
    pub async fn save_payment_method(
        &self,
        customer_id: &str,
        source_token: &str,
    ) -> BillingResult<String> {
        if source_token.trim().is_empty() {
            return Err(BillingError::GatewayDeclined {
                code: Some("MISSING_SOURCE".to_string()),
            });
        }
        let key = IdempotencyKey::derive("card", &[&customer_id, &source_token]);
        self.ctx
            .gateway
            .save_payment_method(customer_id, source_token, &key)
            .await
    }
}
