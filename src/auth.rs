use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::handlers::ErrorResponse;
use crate::models::Claims;
use crate::AppState;

/// Extractor that validates the bearer JWT and exposes the caller's claims.
///
/// Add `auth: AuthUser` to a handler's parameters to require authentication.
pub struct AuthUser {
    pub claims: Claims,
}

impl AuthUser {
    /// Caller identity recorded on created instances and tasks
    pub fn subject(&self) -> &str {
        &self.claims.sub
    }
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // Try Authorization header first, then fall back to ?token= query param
        // (WebSocket connections can't send custom headers)
        let token = if let Some(auth_header) = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
        {
            auth_header
                .strip_prefix("Bearer ")
                .ok_or(AuthError::InvalidToken)?
                .to_string()
        } else if let Some(query) = parts.uri.query() {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("token="))
                .ok_or(AuthError::MissingToken)?
                .to_string()
        } else {
            return Err(AuthError::MissingToken);
        };

        let claims = decode_token(&token, &state.config.jwt_secret)?;
        Ok(AuthUser { claims })
    }
}

fn decode_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
    )
    .map_err(|_| AuthError::InvalidToken)?;

    if token_data.claims.sub.trim().is_empty() {
        return Err(AuthError::InvalidToken);
    }
    Ok(token_data.claims)
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authentication token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(sub: &str, secret: &str, exp_offset: i64) -> String {
        token_for_tenant(sub, None, secret, exp_offset)
    }

    fn token_for_tenant(sub: &str, tenant_id: Option<&str>, secret: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            exp: (now + exp_offset) as usize,
            iat: now as usize,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_decodes() {
        let claims = decode_token(&token("user-1", "s3cret", 3600), "s3cret").unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn test_tenant_claim_is_carried_but_not_required() {
        let claims = decode_token(&token_for_tenant("user-1", Some("cust-9"), "s3cret", 3600), "s3cret").unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.tenant_id.as_deref(), Some("cust-9"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        assert!(decode_token(&token("user-1", "s3cret", 3600), "other").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        assert!(decode_token(&token("user-1", "s3cret", -3600), "s3cret").is_err());
    }

    #[test]
    fn test_blank_subject_rejected() {
        assert!(decode_token(&token(" ", "s3cret", 3600), "s3cret").is_err());
    }
}
