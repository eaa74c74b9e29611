//! Subscription routes

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use patronage_billing::{Subscription, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub creator_id: Uuid,
    pub payment_source_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub page: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResponse {
    pub creator_id: Uuid,
    pub has_access: bool,
}

/// POST /subscriptions
///
/// 201 when the first charge settled, 202 while the processor has not confirmed it.
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let token = req.payment_source_token.trim();
    if token.is_empty() {
        return Err(ApiError::Validation(
            "paymentSourceToken is required".to_string(),
        ));
    }

    let subscription = state
        .billing
        .subscriptions
        .subscribe(auth_user.account_id, req.creator_id, token)
        .await?;

    tracing::info!(
        subscription_id = %subscription.id,
        subscriber_id = %auth_user.account_id,
        creator_id = %req.creator_id,
        status = subscription.status.as_str(),
        "Subscription created"
    );

    let status = match subscription.status {
        SubscriptionStatus::Pending => StatusCode::ACCEPTED,
        _ => StatusCode::CREATED,
    };
    Ok((status, Json(subscription)))
}

/// GET /subscriptions?status=&page=
pub async fn list(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Subscription>>> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(SubscriptionStatus::parse(raw).ok_or_else(|| {
            ApiError::Validation(format!("unknown subscription status: {}", raw))
        })?),
        None => None,
    };

    let subscriptions = state
        .billing
        .subscriptions
        .list(auth_user.account_id, status, query.page.unwrap_or(1))
        .await?;

    Ok(Json(subscriptions))
}

/// DELETE /subscriptions/{id}?immediate=bool
pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(subscription_id): Path<Uuid>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<Subscription>> {
    let existing = state.billing.subscriptions.get(subscription_id).await?;
    auth_user.require_owner_or_admin(existing.subscriber_id)?;

    let subscription = state
        .billing
        .subscriptions
        .cancel(subscription_id, query.immediate)
        .await?;

    tracing::info!(
        subscription_id = %subscription_id,
        actor_id = %auth_user.account_id,
        immediate = query.immediate,
        "Subscription canceled"
    );

    Ok(Json(subscription))
}

/// POST /subscriptions/{id}/resume
pub async fn resume(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(subscription_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let existing = state.billing.subscriptions.get(subscription_id).await?;
    if existing.subscriber_id != auth_user.account_id {
        return Err(ApiError::Forbidden);
    }

    let subscription = state.billing.subscriptions.resume(subscription_id).await?;
    Ok(Json(subscription))
}

/// GET /subscriptions/access/{creator_id}
pub async fn access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<Json<AccessResponse>> {
    let has_access = state
        .billing
        .subscriptions
        .has_access(auth_user.account_id, creator_id)
        .await?;

    Ok(Json(AccessResponse {
        creator_id,
        has_access,
    }))
}
