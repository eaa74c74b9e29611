//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use patronage_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(e) => billing_status(e),
        }
    }

    /// Stable machine-readable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound => "not_found",
            ApiError::Validation(_) => "validation_error",
            ApiError::Billing(e) => billing_code(e),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthorized => "Authentication required".to_string(),
            ApiError::Forbidden => "You do not have access to this resource".to_string(),
            ApiError::NotFound => "Not found".to_string(),
            ApiError::Validation(msg) => msg.clone(),
            ApiError::Billing(e) => e.user_message(),
        }
    }
}

fn billing_status(e: &BillingError) -> StatusCode {
    match e {
        BillingError::AlreadySubscribed | BillingError::AlreadyPurchased => StatusCode::CONFLICT,
        BillingError::InvalidSubscriptionState { .. }
        | BillingError::InvalidPurchaseState { .. }
        | BillingError::ConcurrentModification => StatusCode::CONFLICT,
        BillingError::SelfSubscription | BillingError::SelfPurchase => StatusCode::BAD_REQUEST,
        BillingError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
        BillingError::CreatorNotFound
        | BillingError::PostNotFound
        | BillingError::SubscriptionNotFound
        | BillingError::PurchaseNotFound => StatusCode::NOT_FOUND,
        BillingError::GatewayDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
        BillingError::GatewayTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::WebhookSignatureInvalid | BillingError::WebhookPayloadInvalid(_) => {
            StatusCode::BAD_REQUEST
        }
        BillingError::DuplicateWebhookEvent(_) => StatusCode::OK,
        BillingError::GatewayConfiguration(_)
        | BillingError::InconsistentLedger(_)
        | BillingError::Database(_)
        | BillingError::Config(_)
        | BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn billing_code(e: &BillingError) -> &'static str {
    match e {
        BillingError::AlreadySubscribed => "already_subscribed",
        BillingError::SelfSubscription => "self_subscription",
        BillingError::CreatorNotFound => "creator_not_found",
        BillingError::PostNotFound => "post_not_found",
        BillingError::SelfPurchase => "self_purchase",
        BillingError::AlreadyPurchased => "already_purchased",
        BillingError::SubscriptionNotFound => "subscription_not_found",
        BillingError::PurchaseNotFound => "purchase_not_found",
        BillingError::InvalidSubscriptionState { .. } => "invalid_subscription_state",
        BillingError::InvalidPurchaseState { .. } => "invalid_purchase_state",
        BillingError::InvalidAmount(_) => "invalid_amount",
        BillingError::GatewayDeclined { .. } => "payment_declined",
        BillingError::GatewayTransient(_) | BillingError::ConcurrentModification => "try_again",
        BillingError::WebhookSignatureInvalid => "invalid_signature",
        BillingError::WebhookPayloadInvalid(_) => "invalid_payload",
        BillingError::DuplicateWebhookEvent(_) => "duplicate",
        BillingError::GatewayConfiguration(_)
        | BillingError::InconsistentLedger(_)
        | BillingError::Database(_)
        | BillingError::Config(_)
        | BillingError::Internal(_) => "internal_error",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            match &self {
                ApiError::Billing(e) if e.is_fatal() => {
                    tracing::error!(alert = true, error = %e, "Fatal billing error");
                }
                _ => tracing::error!(error = %self, "Request failed"),
            }
        }

        let body = Json(json!({
            "error": self.code(),
            "message": self.message(),
        }));

        (status, body).into_response()
    }
}
