//! Authentication: API tokens and bearer JWTs resolving to a principal.

mod extractor;

pub use extractor::ApiAuth;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};
use crate::models::Role;

/// API token prefix.
const TOKEN_PREFIX: &str = "ja_";
/// Length of the random part of a token.
const TOKEN_RANDOM_LENGTH: usize = 32;

/// Issued JWT lifetime in seconds.
const JWT_LIFETIME_SECS: i64 = 365 * 24 * 3600;

/// Generate a new random API token; returns the token and its sha256 hex.
/// Only the hash is stored.
pub fn generate_token() -> (String, String) {
    let random_part: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(TOKEN_RANDOM_LENGTH)
        .map(char::from)
        .collect();

    let token = format!("{}{}", TOKEN_PREFIX, random_part);
    let hash = hash_token(&token);
    (token, hash)
}

/// Hash an API token using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Bearer token claims: subject, expiry, role strings.
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl JwtClaims {
    pub fn roles(&self) -> Vec<Role> {
        self.roles.iter().filter_map(|r| Role::parse(r)).collect()
    }
}

/// Sign a JWT for `username` with the Ed25519 private key (`--jwt` pathway).
pub fn sign_jwt(private_key_pem: &str, username: &str, roles: &[Role]) -> AppResult<String> {
    let key = EncodingKey::from_ed_pem(private_key_pem.as_bytes())
        .map_err(|e| AppError::Internal(format!("Bad JWT private key: {}", e)))?;

    let claims = JwtClaims {
        sub: username.to_string(),
        exp: chrono::Utc::now().timestamp() + JWT_LIFETIME_SECS,
        roles: roles.iter().map(|r| r.as_str().to_string()).collect(),
    };

    jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), &claims, &key)
        .map_err(|e| AppError::Internal(format!("Cannot sign JWT: {}", e)))
}

/// Verify a bearer JWT against the Ed25519 public key.
pub fn verify_jwt(public_key_pem: &str, token: &str) -> AppResult<JwtClaims> {
    let key = DecodingKey::from_ed_pem(public_key_pem.as_bytes())
        .map_err(|e| AppError::Internal(format!("Bad JWT public key: {}", e)))?;

    let data = jsonwebtoken::decode::<JwtClaims>(token, &key, &Validation::new(Algorithm::EdDSA))
        .map_err(|e| AppError::Unauthorized(format!("Invalid bearer token: {}", e)))?;

    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token() {
        let (token, hash) = generate_token();
        assert!(token.starts_with(TOKEN_PREFIX));
        assert_eq!(token.len(), TOKEN_PREFIX.len() + TOKEN_RANDOM_LENGTH);
        assert_eq!(hash, hash_token(&token));
        assert_eq!(hash.len(), 64); // SHA-256 produces 64 hex chars
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_token("ja_abc"), hash_token("ja_abc"));
        assert_ne!(hash_token("ja_abc"), hash_token("ja_abd"));
    }

    #[test]
    fn test_claims_role_parsing() {
        let claims = JwtClaims {
            sub: "ingest".to_string(),
            exp: 0,
            roles: vec!["api".to_string(), "bogus".to_string()],
        };
        assert_eq!(claims.roles(), vec![Role::Api]);
    }
}
