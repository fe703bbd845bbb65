//! Authentication support for the sync server.
//!
//! This module provides token-based authentication using HMAC-SHA256.
//! Tokens include an issue time for expiration checking.
//!
//! ## Token Format
//!
//! `{claims}.{signature}` where both halves are hex encoded:
//! - claims: JSON object `{sub, lib, type, permissions, iat}` with `iat` in
//!   Unix milliseconds
//! - signature: HMAC-SHA256 over the raw claims bytes

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tidepool_sync_protocol::ReplicaType;

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60), // 24 hours
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Identity proven by a valid token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// Authenticated user.
    pub user_id: String,
    /// Library the token grants access to.
    pub library_id: String,
    /// How the replica may participate.
    pub replica_type: ReplicaType,
    /// Application-defined permission names.
    pub permissions: Vec<String>,
}

impl TokenInfo {
    /// Creates token info without extra permissions.
    pub fn new(
        user_id: impl Into<String>,
        library_id: impl Into<String>,
        replica_type: ReplicaType,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            library_id: library_id.into(),
            replica_type,
            permissions: Vec::new(),
        }
    }

    /// Adds a permission.
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }
}

#[derive(Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    lib: String,
    #[serde(rename = "type")]
    replica_type: ReplicaType,
    #[serde(default)]
    permissions: Vec<String>,
    iat: u64,
}

/// Token validator for incoming connections.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a signed token for `info`, issued now.
    pub fn create_token(&self, info: &TokenInfo) -> ServerResult<String> {
        self.create_token_at(info, now_millis())
    }

    fn create_token_at(&self, info: &TokenInfo, issued_at: u64) -> ServerResult<String> {
        let claims = TokenClaims {
            sub: info.user_id.clone(),
            lib: info.library_id.clone(),
            replica_type: info.replica_type,
            permissions: info.permissions.clone(),
            iat: issued_at,
        };
        let payload =
            serde_json::to_vec(&claims).map_err(|e| ServerError::Internal(e.to_string()))?;
        let signature = self.sign(&payload)?;
        Ok(format!("{}.{}", hex::encode(&payload), hex::encode(signature)))
    }

    /// Validates a token for `expected_library`.
    ///
    /// # Returns
    ///
    /// The identity carried by the token, or `NotAuthorized` if it is
    /// malformed, forged, expired, or issued for another library.
    pub fn validate_token(&self, token: &str, expected_library: &str) -> ServerResult<TokenInfo> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| ServerError::NotAuthorized("Malformed token".into()))?;
        let payload = hex::decode(payload)
            .map_err(|_| ServerError::NotAuthorized("Malformed token".into()))?;
        let signature = hex::decode(signature)
            .map_err(|_| ServerError::NotAuthorized("Malformed token".into()))?;

        // Verify signature
        let mut mac = self.mac()?;
        mac.update(&payload);
        if mac.verify_slice(&signature).is_err() {
            return Err(ServerError::NotAuthorized("Invalid signature".into()));
        }

        let claims: TokenClaims = serde_json::from_slice(&payload)
            .map_err(|_| ServerError::NotAuthorized("Malformed claims".into()))?;

        if claims.lib != expected_library {
            return Err(ServerError::NotAuthorized("Library mismatch".into()));
        }

        // Check expiration
        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if now_millis() > claims.iat.saturating_add(expiry_millis) {
            return Err(ServerError::NotAuthorized("Token expired".into()));
        }

        Ok(TokenInfo {
            user_id: claims.sub,
            library_id: claims.lib,
            replica_type: claims.replica_type,
            permissions: claims.permissions,
        })
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(e.to_string()))
    }

    /// Signs data with HMAC-SHA256.
    fn sign(&self, data: &[u8]) -> ServerResult<[u8; 32]> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    fn info() -> TokenInfo {
        TokenInfo::new("user-1", "notes", ReplicaType::Realtime).with_permission("admin")
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token(&info()).unwrap();
        let validated = validator.validate_token(&token, "notes").unwrap();
        assert_eq!(validated, info());
    }

    #[test]
    fn reject_wrong_library() {
        let validator = validator();
        let token = validator.create_token(&info()).unwrap();
        let result = validator.validate_token(&token, "other");
        assert!(matches!(result, Err(ServerError::NotAuthorized(_))));
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let token = validator.create_token(&info()).unwrap();
        let (payload, signature) = token.split_once('.').unwrap();
        let mut forged = hex::decode(payload).unwrap();
        forged[2] ^= 0x01;
        let forged = format!("{}.{}", hex::encode(forged), signature);
        assert!(validator.validate_token(&forged, "notes").is_err());
    }

    #[test]
    fn reject_other_secret() {
        let token = validator().create_token(&info()).unwrap();
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other.validate_token(&token, "notes").is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = validator();
        let issued = now_millis() - 25 * 60 * 60 * 1000;
        let token = validator.create_token_at(&info(), issued).unwrap();
        assert!(validator.validate_token(&token, "notes").is_err());
    }

    #[test]
    fn reject_malformed() {
        let validator = validator();
        assert!(validator.validate_token("no-dot", "notes").is_err());
        assert!(validator.validate_token("zz.zz", "notes").is_err());
    }
}
