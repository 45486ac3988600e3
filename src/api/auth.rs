use anyhow::{Context, Result};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::state::AppState;

const TOKEN_EXPIRY_HOURS: i64 = 12;

/// Bearer-token claims. Roles come from the identity provider that issued
/// the token; handlers only check membership.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: usize,
}

pub fn create_jwt(subject: &str, roles: &[String], secret: &str) -> Result<String> {
    let exp =
        (chrono::Utc::now() + chrono::Duration::hours(TOKEN_EXPIRY_HOURS)).timestamp() as usize;
    let claims = Claims {
        sub: subject.to_string(),
        roles: roles.to_vec(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("creating jwt")
}

pub fn verify_jwt(token: &str, secret: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .context("invalid token")?;
    Ok(data.claims)
}

/// Authenticated operator or service extracted from the bearer token.
pub struct AuthUser {
    pub subject: String,
    pub roles: Vec<String>,
}

impl AuthUser {
    /// Role gate: the caller must hold at least one of the listed roles.
    pub fn require_any(&self, allowed: &[&str]) -> Result<(), ApiError> {
        if self.roles.iter().any(|r| allowed.contains(&r.as_str())) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "requires one of roles: {}",
                allowed.join(", ")
            )))
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".into()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("invalid authorization format".into()))?;

        let claims = verify_jwt(token, &state.auth_secret)
            .map_err(|_| ApiError::Unauthorized("invalid or expired token".into()))?;

        Ok(AuthUser {
            subject: claims.sub,
            roles: claims.roles,
        })
    }
}
