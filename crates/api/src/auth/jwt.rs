//! Bearer token verification.
//!
//! Tokens are minted by the account service and signed with a shared HS256
//! secret. The subject is the account id that owns projects and credits.
//! When `JWT_ISSUER` is configured the `iss` claim must match it.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use pagecraft_core::types::DbId;
use serde::{Deserialize, Serialize};

/// Claims this server reads from an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: DbId,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    /// Required `iss` claim, if any.
    pub issuer: Option<String>,
    /// Clock skew tolerated on `exp`, in seconds.
    pub leeway_secs: u64,
}

impl JwtConfig {
    /// | Env Var            | Required | Default |
    /// |--------------------|----------|---------|
    /// | `JWT_SECRET`       | **yes**  | --      |
    /// | `JWT_ISSUER`       | no       | unset   |
    /// | `JWT_LEEWAY_SECS`  | no       | `30`    |
    ///
    /// # Panics
    ///
    /// Panics if `JWT_SECRET` is missing or empty, or the leeway is not a
    /// number.
    pub fn from_env() -> Self {
        let secret =
            std::env::var("JWT_SECRET").expect("JWT_SECRET must be set in the environment");
        assert!(!secret.is_empty(), "JWT_SECRET must not be empty");

        let leeway_secs = match std::env::var("JWT_LEEWAY_SECS") {
            Ok(raw) => raw.parse().expect("JWT_LEEWAY_SECS must be a whole number of seconds"),
            Err(_) => 30,
        };

        Self {
            secret,
            issuer: std::env::var("JWT_ISSUER").ok().filter(|s| !s.is_empty()),
            leeway_secs,
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway_secs;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
            validation.set_required_spec_claims(&["exp", "iss"]);
        }
        validation
    }
}

/// Why a bearer token was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
}

/// Verify a token's signature, expiry and issuer.
pub fn verify_token(token: &str, config: &JwtConfig) -> Result<AccessClaims, TokenError> {
    decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &config.validation(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid,
    })
}

/// Mint a token for `account_id` valid for `ttl_secs`.
///
/// Used by tests and local tooling; production tokens come from the account
/// service.
pub fn issue_token(
    account_id: DbId,
    ttl_secs: i64,
    config: &JwtConfig,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now().timestamp();
    let claims = AccessClaims {
        sub: account_id,
        exp: now + ttl_secs,
        iat: now,
        iss: config.issuer.clone(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(secret: &str, issuer: Option<&str>) -> JwtConfig {
        JwtConfig {
            secret: secret.to_string(),
            issuer: issuer.map(str::to_string),
            leeway_secs: 0,
        }
    }

    #[test]
    fn issued_token_verifies() {
        let config = config("test-secret-that-is-long-enough-for-hmac", None);
        let token = issue_token(42, 900, &config).unwrap();

        let claims = verify_token(&token, &config).unwrap();
        assert_eq!(claims.sub, 42);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let config = config("test-secret-that-is-long-enough-for-hmac", None);
        let token = issue_token(1, -300, &config).unwrap();

        assert_eq!(verify_token(&token, &config), Err(TokenError::Expired));
    }

    #[test]
    fn foreign_secret_is_invalid() {
        let token = issue_token(1, 900, &config("secret-alpha", None)).unwrap();

        assert_eq!(
            verify_token(&token, &config("secret-bravo", None)),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn issuer_must_match_when_configured() {
        let strict = config("shared", Some("accounts.pagecraft"));
        let other = issue_token(1, 900, &config("shared", Some("elsewhere"))).unwrap();
        let missing = issue_token(1, 900, &config("shared", None)).unwrap();
        let good = issue_token(1, 900, &strict).unwrap();

        assert_eq!(verify_token(&other, &strict), Err(TokenError::Invalid));
        assert_eq!(verify_token(&missing, &strict), Err(TokenError::Invalid));
        assert!(verify_token(&good, &strict).is_ok());
    }

    #[test]
    fn garbage_is_invalid() {
        let config = config("shared", None);
        assert_eq!(verify_token("not.a.token", &config), Err(TokenError::Invalid));
    }
}
