//! Token verification for the upgrade handshake.
//!
//! Every connection presents a bearer token which must pass full signature
//! and expiry verification before any gateway state is created. There is no
//! unverified-decode path.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::AuthConfig;

/// Authentication errors. All fatal at handshake time.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token's `exp` claim is in the past.
    #[error("Token expired")]
    Expired,

    /// Bad signature, malformed token, or missing identity claims.
    #[error("Invalid token: {0}")]
    Invalid(String),

    /// The verifier itself is misconfigured.
    #[error("Auth configuration error: {0}")]
    Config(String),
}

/// A verified identity extracted from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    preferred_username: String,
}

/// Verifies bearer tokens into identities.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Build a verifier from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the algorithm is unknown or key material is
    /// missing or unreadable.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let verifier = match config.algorithm.as_str() {
            "HS256" => {
                let secret = config.hmac_secret.as_deref().ok_or_else(|| {
                    AuthError::Config("HS256 requires auth.hmac_secret or BEACON_JWT_SECRET".into())
                })?;
                Self::hs256(secret.as_bytes())
            }
            "RS256" => {
                let path = config.public_key_path.as_deref().ok_or_else(|| {
                    AuthError::Config("RS256 requires auth.public_key_path".into())
                })?;
                let pem = std::fs::read(path).map_err(|e| {
                    AuthError::Config(format!("Cannot read public key {path}: {e}"))
                })?;
                let key = DecodingKey::from_rsa_pem(&pem)
                    .map_err(|e| AuthError::Config(format!("Invalid public key {path}: {e}")))?;
                Self::with_key(key, Algorithm::RS256)
            }
            other => {
                return Err(AuthError::Config(format!(
                    "Unsupported auth algorithm: {other}"
                )))
            }
        };

        Ok(match &config.issuer {
            Some(issuer) => verifier.with_issuer(issuer),
            None => verifier,
        })
    }

    /// Build an HS256 verifier from a shared secret.
    #[must_use]
    pub fn hs256(secret: &[u8]) -> Self {
        Self::with_key(DecodingKey::from_secret(secret), Algorithm::HS256)
    }

    fn with_key(key: DecodingKey, algorithm: Algorithm) -> Self {
        Self {
            key,
            validation: Validation::new(algorithm),
        }
    }

    /// Require a specific `iss` claim.
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Verify a token and extract its identity.
    ///
    /// # Errors
    ///
    /// Returns an error on bad signature, expiry, issuer mismatch, or
    /// missing `sub`/`preferred_username` claims.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data =
            jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
                match e.kind() {
                    ErrorKind::ExpiredSignature => AuthError::Expired,
                    _ => AuthError::Invalid(e.to_string()),
                }
            })?;

        debug!(user = %data.claims.preferred_username, "Token verified");
        Ok(Identity {
            user_id: data.claims.sub,
            username: data.claims.preferred_username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"test-secret";

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        preferred_username: String,
        exp: u64,
    }

    fn make_token(secret: &[u8], exp_offset_secs: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = TestClaims {
            sub: "u1".to_string(),
            preferred_username: "alice".to_string(),
            exp: (now + exp_offset_secs) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn test_verify_roundtrip() {
        let verifier = TokenVerifier::hs256(SECRET);
        let identity = verifier.verify(&make_token(SECRET, 3600)).unwrap();
        assert_eq!(
            identity,
            Identity {
                user_id: "u1".to_string(),
                username: "alice".to_string(),
            }
        );
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = TokenVerifier::hs256(SECRET);
        assert!(matches!(
            verifier.verify(&make_token(SECRET, -3600)),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let verifier = TokenVerifier::hs256(SECRET);
        assert!(matches!(
            verifier.verify(&make_token(b"other-secret", 3600)),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let verifier = TokenVerifier::hs256(SECRET);
        assert!(verifier.verify("not-a-token").is_err());
    }

    #[test]
    fn test_missing_identity_claims_rejected() {
        #[derive(Serialize)]
        struct BareClaims {
            sub: String,
            exp: u64,
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let token = encode(
            &Header::default(),
            &BareClaims {
                sub: "u1".to_string(),
                exp: now + 3600,
            },
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let verifier = TokenVerifier::hs256(SECRET);
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_from_config_requires_key_material() {
        let config = AuthConfig {
            algorithm: "HS256".to_string(),
            hmac_secret: None,
            public_key_path: None,
            issuer: None,
        };
        assert!(matches!(
            TokenVerifier::from_config(&config),
            Err(AuthError::Config(_))
        ));
    }
}
