use crate::errors::SettlementError;
use crate::handlers::AppState;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Header the banking integration puts the shared secret in.
pub const HOOK_SIGNATURE_HEADER: &str = "x-hook-sign";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
}

/// Authenticated caller of a callable operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub email: Option<String>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
        }
    }
}

pub struct AuthKeys {
    decoding: DecodingKey,
    hook_secret: String,
}

impl AuthKeys {
    pub fn new(jwt_secret: &str, hook_secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(jwt_secret.as_bytes()),
            hook_secret: hook_secret.to_string(),
        }
    }

    pub fn verify_token(&self, token: &str) -> Result<Caller, SettlementError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(|e| {
                tracing::debug!(error = %e, "Rejected bearer token");
                SettlementError::Unauthenticated
            })?;

        Ok(Caller {
            user_id: data.claims.sub,
            email: data.claims.email,
        })
    }

    /// Accepts `x-hook-sign: <secret>` or `Authorization: Bearer <secret>`.
    /// An unset secret rejects everything.
    pub fn verify_hook(&self, headers: &HeaderMap) -> bool {
        if self.hook_secret.is_empty() {
            return false;
        }

        let presented = headers
            .get(HOOK_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .or_else(|| bearer_token(headers));

        presented.map_or(false, |sig| constant_time_eq(sig.as_bytes(), self.hook_secret.as_bytes()))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = SettlementError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(SettlementError::Unauthenticated)?;
        state.auth.verify_token(token)
    }
}
