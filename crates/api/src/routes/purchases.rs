//! Paid post routes

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use patronage_billing::{Purchase, PurchaseStatus, RefundResult};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub post_id: Uuid,
    pub payment_source_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub reason: String,
}

/// POST /purchases
pub async fn purchase(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PurchaseRequest>,
) -> ApiResult<(StatusCode, Json<Purchase>)> {
    let token = req.payment_source_token.trim();
    if token.is_empty() {
        return Err(ApiError::Validation(
            "paymentSourceToken is required".to_string(),
        ));
    }

    let purchase = state
        .billing
        .purchases
        .purchase(auth_user.account_id, req.post_id, token)
        .await?;

    let status = match purchase.status {
        PurchaseStatus::Pending => StatusCode::ACCEPTED,
        _ => StatusCode::CREATED,
    };
    Ok((status, Json(purchase)))
}

/// POST /purchases/{id}/refund (admin)
pub async fn refund(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(purchase_id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<RefundResult>> {
    auth_user.require_admin()?;

    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::Validation("reason is required".to_string()));
    }

    let result = state
        .billing
        .refunds
        .refund_purchase(purchase_id, reason)
        .await?;

    tracing::info!(
        purchase_id = %purchase_id,
        admin_id = %auth_user.account_id,
        refund_id = %result.external_refund_id,
        completed = result.completed,
        "Purchase refunded"
    );

    Ok(Json(result))
}
