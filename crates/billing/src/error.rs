//! Billing error taxonomy
//!
//! Every fallible billing operation returns [`BillingResult`]. Gateway failures are
//! classified into declined / transient / configuration so callers can decide between
//! surfacing, retrying, and alerting.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("already subscribed to this creator")]
    AlreadySubscribed,

    #[error("cannot subscribe to yourself")]
    SelfSubscription,

    #[error("creator not found or has no subscription tier")]
    CreatorNotFound,

    #[error("post not found or not for sale")]
    PostNotFound,

    #[error("cannot purchase your own post")]
    SelfPurchase,

    #[error("post already purchased")]
    AlreadyPurchased,

    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("purchase not found")]
    PurchaseNotFound,

    #[error("subscription is {status} and cannot {action}")]
    InvalidSubscriptionState {
        status: &'static str,
        action: &'static str,
    },

    #[error("purchase is {status} and cannot {action}")]
    InvalidPurchaseState {
        status: &'static str,
        action: &'static str,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Card or payment method was refused. `code` is the processor's decline code and
    /// is kept for logs only.
    #[error("payment declined")]
    GatewayDeclined { code: Option<String> },

    #[error("payment processor temporarily unavailable: {0}")]
    GatewayTransient(String),

    #[error("payment processor configuration error: {0}")]
    GatewayConfiguration(String),

    /// A ledger invariant does not hold. Never swallowed.
    #[error("ledger inconsistency: {0}")]
    InconsistentLedger(String),

    /// A webhook that was already applied. Handlers translate this into a success no-op.
    #[error("duplicate webhook event {0}")]
    DuplicateWebhookEvent(String),

    #[error("invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("concurrent modification detected, please retry")]
    ConcurrentModification,

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Safe to retry with the same idempotency key
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayTransient(_) | BillingError::ConcurrentModification
        )
    }

    /// Requires operator attention rather than user action
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayConfiguration(_)
                | BillingError::InconsistentLedger(_)
                | BillingError::Config(_)
        )
    }

    /// Message that can be shown to an end user. Never includes processor or database text.
    pub fn user_message(&self) -> String {
        match self {
            BillingError::AlreadySubscribed => "You are already subscribed to this creator.".into(),
            BillingError::SelfSubscription => "You cannot subscribe to yourself.".into(),
            BillingError::CreatorNotFound => "This creator does not offer a subscription.".into(),
            BillingError::PostNotFound => "This post is not available for purchase.".into(),
            BillingError::SelfPurchase => "You cannot purchase your own post.".into(),
            BillingError::AlreadyPurchased => "You already own this post.".into(),
            BillingError::SubscriptionNotFound => "Subscription not found.".into(),
            BillingError::PurchaseNotFound => "Purchase not found.".into(),
            BillingError::InvalidSubscriptionState { status, action } => {
                format!("This subscription is {} and cannot {}.", status, action)
            }
            BillingError::InvalidPurchaseState { status, action } => {
                format!("This purchase is {} and cannot {}.", status, action)
            }
            BillingError::InvalidAmount(_) => "The amount is not valid.".into(),
            BillingError::GatewayDeclined { .. } => {
                "Your payment failed. Please update your payment method.".into()
            }
            BillingError::GatewayTransient(_) | BillingError::ConcurrentModification => {
                "Something went wrong while processing your payment. Please try again.".into()
            }
            BillingError::WebhookSignatureInvalid | BillingError::WebhookPayloadInvalid(_) => {
                "Invalid webhook request.".into()
            }
            BillingError::DuplicateWebhookEvent(_) => "Already processed.".into(),
            BillingError::GatewayConfiguration(_)
            | BillingError::InconsistentLedger(_)
            | BillingError::Database(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => {
                "A system error occurred. Our team has been notified.".into()
            }
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            BillingError::GatewayTransient(e.to_string())
        } else {
            BillingError::GatewayConfiguration(e.to_string())
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("serialization: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declined_message_does_not_leak_processor_code() {
        let err = BillingError::GatewayDeclined {
            code: Some("INSUFFICIENT_FUNDS".to_string()),
        };
        let msg = err.user_message();
        assert!(!msg.contains("INSUFFICIENT_FUNDS"));
        assert!(msg.contains("update your payment method"));
    }

    #[test]
    fn test_system_errors_share_generic_message() {
        let db = BillingError::Database("relation \"subscriptions\" does not exist".into());
        assert!(!db.user_message().contains("relation"));
        assert_eq!(
            db.user_message(),
            BillingError::GatewayConfiguration("bad token".into()).user_message()
        );
    }

    #[test]
    fn test_classification() {
        assert!(BillingError::GatewayTransient("timeout".into()).is_transient());
        assert!(!BillingError::GatewayDeclined { code: None }.is_transient());
        assert!(BillingError::GatewayConfiguration("x".into()).is_fatal());
        assert!(BillingError::InconsistentLedger("x".into()).is_fatal());
        assert!(!BillingError::AlreadySubscribed.is_fatal());
    }
}
