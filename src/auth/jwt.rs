//! HS256 bearer token validation (§4.1).
//!
//! Only the `sub` claim is honored for the core proxy — OIDC `id_token`
//! fallbacks (`preferred_username`, `email`) belong to the admin/OIDC CRUD
//! surface this crate does not implement (§9 open question).

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

pub fn create_access_token(secret: &str, username: &str, expire_minutes: i64) -> Result<String> {
    let exp = (chrono::Utc::now() + chrono::Duration::minutes(expire_minutes)).timestamp();
    let claims = Claims {
        sub: username.to_string(),
        exp,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| Error::FatalInternal(format!("failed to sign token: {e}")))
}

/// Validate an HS256 token and return its `sub` claim.
pub fn verify_token(secret: &str, token: &str) -> Result<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|_| Error::Unauthenticated)?;
    Ok(data.claims.sub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_valid_token() {
        let token = create_access_token("secret", "alice", 60).unwrap();
        assert_eq!(verify_token("secret", &token).unwrap(), "alice");
    }

    #[test]
    fn rejects_tokens_signed_with_a_different_secret() {
        let token = create_access_token("secret", "alice", 60).unwrap();
        assert!(verify_token("other-secret", &token).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let token = create_access_token("secret", "alice", -1).unwrap();
        assert!(verify_token("secret", &token).is_err());
    }
}
