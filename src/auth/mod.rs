/*!
 * # Authentication
 *
 * Bearer-token identity for the storefront API. Tokens are HS256 JWTs issued
 * by the storefront's auth service; this module only validates them and
 * exposes the caller as an [`AuthUser`] extractor. Issuing is kept for tests
 * and operational tooling.
 */

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, FromRef, FromRequestParts},
    http::{header, request::Parts},
    response::{IntoResponse, Response},
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::rate_limiter::extract_client_ip;
use crate::security::{actions, SecurityEvent, SecurityLogger, SecuritySeverity};

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,           // Subject (user ID)
    pub email: Option<String>, // User's email
    pub jti: String,           // JWT ID
    pub iat: i64,              // Issued at time
    pub exp: i64,              // Expiration time
    pub nbf: i64,              // Not valid before time
    pub iss: String,           // Issuer
    pub aud: String,           // Audience
}

/// Authenticated caller extracted from the bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub token_id: String,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_audience: String,
    pub jwt_issuer: String,
    pub access_token_expiration: Duration,
}

impl AuthConfig {
    pub fn new(
        jwt_secret: String,
        jwt_audience: String,
        jwt_issuer: String,
        access_token_expiration: Duration,
    ) -> Self {
        Self {
            jwt_secret,
            jwt_audience,
            jwt_issuer,
            access_token_expiration,
        }
    }
}

impl From<&AppConfig> for AuthConfig {
    fn from(config: &AppConfig) -> Self {
        Self::new(
            config.jwt_secret.clone(),
            config.jwt_audience.clone(),
            config.jwt_issuer.clone(),
            Duration::from_secs(config.jwt_expiration),
        )
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token creation failed: {0}")]
    TokenCreation(String),
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::TokenCreation(msg) => ServiceError::InternalError(msg),
            other => ServiceError::Unauthorized(other.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ServiceError::from(self).into_response()
    }
}

/// Validates (and, for tests and tooling, issues) access tokens
#[derive(Debug, Clone)]
pub struct AuthService {
    config: AuthConfig,
    validation: Validation,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.jwt_issuer.as_str()]);
        validation.set_audience(&[config.jwt_audience.as_str()]);
        validation.validate_nbf = true;
        Self { config, validation }
    }

    /// Issues an access token for `user_id`
    pub fn generate_token(&self, user_id: Uuid, email: Option<&str>) -> Result<String, AuthError> {
        let now = Utc::now();
        let expires = now
            + ChronoDuration::from_std(self.config.access_token_expiration)
                .map_err(|_| AuthError::TokenCreation("Invalid token duration".to_string()))?;

        let claims = Claims {
            sub: user_id.to_string(),
            email: email.map(str::to_string),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
            nbf: now.timestamp(),
            iss: self.config.jwt_issuer.clone(),
            aud: self.config.jwt_audience.clone(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenCreation(e.to_string()))
    }

    /// Validate a JWT token and extract the claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &self.validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })
    }

    /// Resolves the caller for a raw `Authorization` header value.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<AuthUser, AuthError> {
        let token = bearer_token(authorization).ok_or(AuthError::MissingToken)?;
        let claims = self.validate_token(token)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)?;
        Ok(AuthUser {
            user_id,
            email: claims.email,
            token_id: claims.jti,
        })
    }
}

/// Token part of a `Bearer <token>` header value.
pub fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<AuthService>: FromRef<S>,
    SecurityLogger: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_service = Arc::<AuthService>::from_ref(state);
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match auth_service.authenticate(header_value) {
            Ok(user) => Ok(user),
            Err(err) => {
                debug!(error = %err, "rejecting unauthenticated request");
                let peer = parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0);
                let ip = extract_client_ip(&parts.headers, peer);
                SecurityLogger::from_ref(state)
                    .record(
                        SecurityEvent::new(
                            actions::UNAUTHENTICATED_REQUEST,
                            SecuritySeverity::High,
                            json!({
                                "method": parts.method.as_str(),
                                "path": parts.uri.path(),
                                "reason": err.to_string(),
                                "token_present": header_value.is_some(),
                            }),
                        )
                        .ip(ip.as_deref())
                        .blocked(),
                    )
                    .await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn service(issuer: &str) -> AuthService {
        AuthService::new(AuthConfig::new(
            "test-secret-that-is-long-enough-for-hs256-signing-in-unit-tests-only".into(),
            "storefront-api".into(),
            issuer.into(),
            Duration::from_secs(600),
        ))
    }

    #[test]
    fn issued_token_round_trips_to_user() {
        let auth = service("storefront-auth");
        let user_id = Uuid::new_v4();
        let token = auth.generate_token(user_id, Some("a@example.com")).unwrap();

        let header = format!("Bearer {}", token);
        let user = auth.authenticate(Some(&header)).unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn rejects_wrong_issuer() {
        let token = service("someone-else").generate_token(Uuid::new_v4(), None).unwrap();
        assert_matches!(
            service("storefront-auth").validate_token(&token),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn missing_or_malformed_header() {
        let auth = service("storefront-auth");
        assert_matches!(auth.authenticate(None), Err(AuthError::MissingToken));
        assert_matches!(auth.authenticate(Some("Basic abc")), Err(AuthError::MissingToken));
        assert_matches!(auth.authenticate(Some("Bearer ")), Err(AuthError::MissingToken));
        assert_matches!(auth.authenticate(Some("Bearer not.a.jwt")), Err(AuthError::InvalidToken));
    }

    #[test]
    fn unauthenticated_maps_to_stable_code() {
        let err = ServiceError::from(AuthError::TokenExpired);
        assert_eq!(err.error_code(), "UNAUTHENTICATED");
    }
}
