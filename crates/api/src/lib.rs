// API server clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Patronage API
//!
//! HTTP surface of the billing engine: subscriptions, content purchases, wallet
//! queries and the payment processor webhook.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
