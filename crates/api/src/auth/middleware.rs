//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use super::jwt::{JwtManager, ADMIN_ROLE};
use crate::error::ApiError;

const AUTH_COOKIE: &str = "patronage_auth_token";

/// Account behind the current request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub account_id: Uuid,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    /// Owner of the resource, or an administrator
    pub fn require_owner_or_admin(&self, owner_id: Uuid) -> Result<(), ApiError> {
        if self.account_id == owner_id || self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            AuthError::MissingAuth => ("unauthorized", "Authentication required"),
            AuthError::InvalidToken => ("invalid_token", "Invalid or expired token"),
        };

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(AUTH_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(String::from)
            })
        })
}

/// Bearer token from the Authorization header, falling back to the auth cookie
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    extract_token_from_cookie(request)
}

fn authenticate(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state.jwt_manager.validate(token).map_err(|e| {
        tracing::debug!(error = %e, "Access token rejected");
        AuthError::InvalidToken
    })?;

    Ok(AuthUser {
        account_id: claims.sub,
        role: claims.role,
    })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate(&auth_state, &token),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                account_id = %auth_user.account_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(header: (&str, &str)) -> Request {
        Request::builder()
            .uri("/wallet/balance")
            .header(header.0, header.1)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_bearer_header_preferred() {
        let request = request_with(("authorization", "Bearer abc.def.ghi"));
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_cookie_fallback() {
        let request = request_with(("cookie", "theme=dark; patronage_auth_token=tok123"));
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_similarly_named_cookie_ignored() {
        let request = request_with(("cookie", "patronage_auth_token_old=stale"));
        assert_eq!(extract_bearer_token(&request), None);
    }

    #[test]
    fn test_non_bearer_scheme_ignored() {
        let request = request_with(("authorization", "Basic dXNlcjpwYXNz"));
        assert_eq!(extract_bearer_token(&request), None);
    }

    #[test]
    fn test_owner_or_admin() {
        let owner = Uuid::new_v4();
        let user = AuthUser {
            account_id: owner,
            role: "user".into(),
        };
        assert!(user.require_owner_or_admin(owner).is_ok());
        assert!(user.require_owner_or_admin(Uuid::new_v4()).is_err());
        assert!(user.require_admin().is_err());

        let admin = AuthUser {
            account_id: Uuid::new_v4(),
            role: ADMIN_ROLE.into(),
        };
        assert!(admin.require_owner_or_admin(owner).is_ok());
    }
}
