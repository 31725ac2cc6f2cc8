//! Session tokens handed to agents at container start.
//!
//! Tokens are HS256 JWTs. Expiry is checked against the town's [`Clock`]
//! rather than the system time so tests can age tokens deterministically.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TownError};

/// Default session lifetime.
pub const DEFAULT_TTL: Duration = Duration::hours(8);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub agent_id: String,
    pub rig_id: String,
    pub town_id: String,
    pub user_id: String,
    pub iat: i64,
    pub exp: i64,
}

/// Who a token is minted for.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub agent_id: &'a str,
    pub rig_id: &'a str,
    pub town_id: &'a str,
    pub user_id: &'a str,
}

pub fn mint(secret: &str, subject: Subject<'_>, now: DateTime<Utc>, ttl: Duration) -> Result<String> {
    if secret.is_empty() {
        return Err(TownError::Config("token secret must not be empty".into()));
    }
    let claims = SessionClaims {
        agent_id: subject.agent_id.to_string(),
        rig_id: subject.rig_id.to_string(),
        town_id: subject.town_id.to_string(),
        user_id: subject.user_id.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Checks the signature, then expiry against `now`.
pub fn verify(secret: &str, token: &str, now: DateTime<Utc>) -> Result<SessionClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.required_spec_claims = HashSet::from(["exp".to_string()]);

    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    if data.claims.exp <= now.timestamp() {
        return Err(TownError::Invalid("session token expired".into()));
    }
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-with-some-length";

    fn subject() -> Subject<'static> {
        Subject {
            agent_id: "a1",
            rig_id: "r1",
            town_id: "t1",
            user_id: "u1",
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000, 0).unwrap()
    }

    #[test]
    fn minted_token_verifies() {
        let token = mint(SECRET, subject(), now(), DEFAULT_TTL).unwrap();
        let claims = verify(SECRET, &token, now() + Duration::hours(1)).unwrap();
        assert_eq!(claims.agent_id, "a1");
        assert_eq!(claims.town_id, "t1");
        assert_eq!(claims.exp - claims.iat, 8 * 60 * 60);
    }

    #[test]
    fn claims_use_camel_case() {
        let token = mint(SECRET, subject(), now(), DEFAULT_TTL).unwrap();
        let json = serde_json::to_value(verify(SECRET, &token, now()).unwrap()).unwrap();
        assert!(json.get("agentId").is_some());
        assert!(json.get("rigId").is_some());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = mint(SECRET, subject(), now(), Duration::minutes(5)).unwrap();
        let err = verify(SECRET, &token, now() + Duration::minutes(6)).unwrap_err();
        assert!(matches!(err, TownError::Invalid(_)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = mint(SECRET, subject(), now(), DEFAULT_TTL).unwrap();
        assert!(matches!(
            verify("other-secret", &token, now()).unwrap_err(),
            TownError::Token(_)
        ));
    }
}
