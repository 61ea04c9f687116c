//! Authentication middleware for JWT token validation

use axum::{
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::TelehealthError;
use crate::models::{Actor, ParticipantRole};
use crate::state::AppState;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_CLINICIAN: &str = "clinician";

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: Uuid,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
}

/// Authenticated user information
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn actor(&self) -> Actor {
        Actor::User(self.id)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    /// Side of the encounter this user joins as
    pub fn participant_role(&self) -> ParticipantRole {
        if self.has_role(ROLE_CLINICIAN) {
            ParticipantRole::Clinician
        } else {
            ParticipantRole::Client
        }
    }

    pub fn require_role(&self, role: &str) -> Result<(), TelehealthError> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(TelehealthError::Forbidden(format!("{} role required", role)))
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthSetupError {
    #[error("no JWT public key or secret configured")]
    Missing,
    #[error("failed to read public key file: {0}")]
    KeyFile(String),
    #[error("invalid JWT key: {0}")]
    InvalidKey(String),
}

/// Verification key and algorithm for bearer tokens
#[derive(Clone)]
pub struct AuthKeys {
    decoding_key: DecodingKey,
    algorithm: Algorithm,
}

impl AuthKeys {
    /// RS256 when a public key is configured, otherwise HS256 with the shared secret
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthSetupError> {
        if let Some(public_key) = &config.jwt_public_key {
            // If the public key looks like a file path, read it from disk
            let pem = if public_key.starts_with("-----BEGIN") {
                public_key.clone()
            } else {
                std::fs::read_to_string(public_key)
                    .map_err(|e| AuthSetupError::KeyFile(e.to_string()))?
                    .trim()
                    .to_string()
            };
            let decoding_key = DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthSetupError::InvalidKey(e.to_string()))?;
            return Ok(Self {
                decoding_key,
                algorithm: Algorithm::RS256,
            });
        }

        match &config.jwt_secret {
            Some(secret) => Ok(Self::hs256(secret)),
            None => Err(AuthSetupError::Missing),
        }
    }

    pub fn hs256(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm: Algorithm::HS256,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, TelehealthError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;

        let token_data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                debug!("Failed to validate token: {}", e);
                TelehealthError::Unauthorized
            })?;

        Ok(AuthUser {
            id: token_data.claims.sub,
            roles: token_data.claims.roles,
        })
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, TelehealthError> {
    let token = bearer_token(req.headers()).ok_or(TelehealthError::Unauthorized)?;

    let user = state.auth.verify(token).inspect_err(|_| {
        error!(path = %req.uri().path(), "Rejected request with invalid bearer token");
    })?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Caller network origin: first `X-Forwarded-For` hop, else `X-Real-IP`
pub fn client_origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header};

    fn token(secret: &str, exp: u64, roles: &[&str]) -> (Uuid, String) {
        let id = Uuid::new_v4();
        let claims = Claims {
            sub: id,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            exp,
            iat: 0,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        (id, token)
    }

    fn far_future() -> u64 {
        (chrono::Utc::now().timestamp() + 3600) as u64
    }

    #[test]
    fn test_valid_token_yields_user() {
        let keys = AuthKeys::hs256("secret");
        let (id, token) = token("secret", far_future(), &["clinician"]);

        let user = keys.verify(&token).unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.participant_role(), ParticipantRole::Clinician);
        assert!(user.require_role(ROLE_ADMIN).is_err());
    }

    #[test]
    fn test_wrong_secret_and_expired_tokens_are_rejected() {
        let keys = AuthKeys::hs256("secret");
        let (_, forged) = token("other", far_future(), &[]);
        assert!(matches!(keys.verify(&forged), Err(TelehealthError::Unauthorized)));

        let (_, expired) = token("secret", 1_000, &[]);
        assert!(keys.verify(&expired).is_err());
    }

    #[test]
    fn test_missing_keys_fail_setup() {
        assert!(matches!(
            AuthKeys::from_config(&AuthConfig::default()),
            Err(AuthSetupError::Missing)
        ));
    }

    #[test]
    fn test_origin_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_origin(&headers).as_deref(), Some("10.0.0.2"));

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_origin(&headers).as_deref(), Some("203.0.113.7"));
    }
}
