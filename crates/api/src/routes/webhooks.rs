//! Payment processor webhook

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use patronage_billing::{BillingError, SIGNATURE_HEADER};
use serde_json::{json, Value};

use crate::{error::ApiResult, state::AppState};

/// POST /payments/webhook
///
/// Business no-ops (duplicates, unknown payments, non-terminal statuses) answer 200 so
/// the processor stops redelivering. Bad signatures and malformed bodies answer 400;
/// anything else is a 5xx and gets retried.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.billing.webhooks.receive(&body, signature).await {
        Ok(outcome) => {
            tracing::debug!(outcome = outcome.as_str(), "Webhook processed");
            Ok(Json(json!({ "received": true, "outcome": outcome.as_str() })))
        }
        Err(BillingError::DuplicateWebhookEvent(event_id)) => {
            tracing::debug!(event_id = %event_id, "Duplicate webhook delivery");
            Ok(Json(json!({ "received": true, "outcome": "duplicate" })))
        }
        Err(e) => {
            if !matches!(
                e,
                BillingError::WebhookSignatureInvalid | BillingError::WebhookPayloadInvalid(_)
            ) {
                tracing::error!(error = %e, "Webhook processing failed");
            }
            Err(e.into())
        }
    }
}
