//! Application state

use patronage_billing::BillingService;

use crate::auth::{AuthState, JwtManager};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
    pub jwt_manager: JwtManager,
}

impl AppState {
    pub fn new(billing: BillingService, jwt_secret: &str) -> Self {
        Self {
            billing,
            jwt_manager: JwtManager::new(jwt_secret),
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
