//! Wallet routes

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use patronage_billing::{WalletSummary, WalletTransaction};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

pub const TRANSACTIONS_PAGE_SIZE: i64 = 50;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub transactions: Vec<WalletTransaction>,
    pub page: u32,
}

/// GET /wallet/balance
pub async fn balance(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<WalletSummary>> {
    let summary = state.billing.ledger().summary(auth_user.account_id).await?;
    Ok(Json(summary))
}

/// GET /wallet/transactions?page=
pub async fn transactions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let offset = i64::from(page - 1) * TRANSACTIONS_PAGE_SIZE;

    let transactions = state
        .billing
        .ledger()
        .history(auth_user.account_id, TRANSACTIONS_PAGE_SIZE, offset)
        .await?;

    Ok(Json(HistoryResponse { transactions, page }))
}
