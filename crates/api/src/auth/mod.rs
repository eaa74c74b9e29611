//! Authentication module for Patronage

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager, ADMIN_ROLE};
pub use middleware::{require_auth, AuthError, AuthState, AuthUser};
