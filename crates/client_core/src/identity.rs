use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use shared::domain::UserId;
use thiserror::Error;

pub type Claims = Map<String, Value>;

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("authentication token not found")]
    Missing,
    #[error("authentication token is malformed")]
    Malformed,
    #[error("authentication token has expired")]
    Expired,
    #[error("authentication token has no usable `{0}` claim")]
    MissingClaim(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    pub fn from_claims(claims: &Claims) -> Result<Self, IdentityError> {
        let user_id = match claims.get("userId") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(IdentityError::MissingClaim("userId")),
        };
        let username = claims
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            user_id: UserId(user_id),
            username,
        })
    }

    pub fn from_token(token: &str) -> Result<Self, IdentityError> {
        let claims = decode_claims(token).ok_or(IdentityError::Malformed)?;
        Self::from_claims(&claims)
    }
}

pub fn decode_claims(token: &str) -> Option<Claims> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return None;
    };
    // Tolerate the standard alphabet as well as base64url.
    let normalized = payload.replace('+', "-").replace('/', "_");
    let bytes = PAYLOAD_ENGINE.decode(normalized).ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(claims) => Some(claims),
        _ => None,
    }
}

fn exp_seconds(token: &str) -> Option<f64> {
    decode_claims(token)?.get("exp")?.as_f64()
}

pub fn expiry(token: &str) -> Option<DateTime<Utc>> {
    let exp = exp_seconds(token)?;
    DateTime::from_timestamp_millis((exp * 1000.0) as i64)
}

/// Fails closed: a token without a numeric `exp`, or one that cannot be
/// decoded, counts as expired.
pub fn is_expired_at(token: &str, now: DateTime<Utc>) -> bool {
    match exp_seconds(token) {
        Some(exp) => now.timestamp_millis() as f64 >= exp * 1000.0,
        None => true,
    }
}

pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, Utc::now())
}

/// Claims are decoded, never verified. Nothing here is a security decision.
pub fn resolve_identity(token: Option<&str>, now: DateTime<Utc>) -> Result<Identity, IdentityError> {
    let token = token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(IdentityError::Missing)?;
    let claims = decode_claims(token).ok_or(IdentityError::Malformed)?;
    if is_expired_at(token, now) {
        return Err(IdentityError::Expired);
    }
    Identity::from_claims(&claims)
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
