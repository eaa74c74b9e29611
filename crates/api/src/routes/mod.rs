//! API routes

mod health;
mod purchases;
mod subscriptions;
mod wallet;
mod webhooks;


use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let protected = Router::new()
        .route(
            "/subscriptions",
            post(subscriptions::subscribe).get(subscriptions::list),
        )
        .route("/subscriptions/{id}", delete(subscriptions::cancel))
        .route("/subscriptions/{id}/resume", post(subscriptions::resume))
        .route(
            "/subscriptions/access/{creator_id}",
            get(subscriptions::access),
        )
        .route("/purchases", post(purchases::purchase))
        .route("/purchases/{id}/refund", post(purchases::refund))
        .route("/wallet/balance", get(wallet::balance))
        .route("/wallet/transactions", get(wallet::transactions))
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    // Processor deliveries authenticate by signature, not by bearer token
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/payments/webhook", post(webhooks::payment_webhook));

    Router::new()
        .merge(protected)
        .merge(public)
        .with_state(state)
}
