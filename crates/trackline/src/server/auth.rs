//! Device credential verification and issuance.
//!
//! Credentials are HS256 JWTs. The `deviceId` claim is bound at issuance and
//! is the only source of a record's device id on the server.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;

/// Claims carried by a device credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaims {
    /// Subject; the device id for credentials minted here.
    pub sub: String,
    /// Device the credential is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Carrier display name at activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Device label at activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Why a request could not be authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No `Authorization` header.
    #[error("missing authorization header")]
    MissingHeader,

    /// The header is not `Bearer <token>`.
    #[error("malformed authorization header")]
    MalformedHeader,

    /// Signature, expiry or format check failed.
    #[error("invalid credential: {0}")]
    InvalidToken(String),

    /// The credential carries no device binding.
    #[error("credential has no deviceId claim")]
    MissingDeviceClaim,
}

/// Extract the token from a `Bearer` authorization header value.
#[must_use]
pub fn extract_bearer(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Verifies device credentials.
pub struct CredentialVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl CredentialVerifier {
    /// Create a verifier for the shared secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if the token does not verify.
    pub fn verify(&self, token: &str) -> std::result::Result<DeviceClaims, AuthError> {
        decode::<DeviceClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Authenticate an `Authorization` header value and return the bound device id.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] describing the first check that failed.
    pub fn authenticate(&self, header: Option<&str>) -> std::result::Result<String, AuthError> {
        let header = header.ok_or(AuthError::MissingHeader)?;
        let token = extract_bearer(header).ok_or(AuthError::MalformedHeader)?;
        let claims = self.verify(token)?;

        claims
            .device_id
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingDeviceClaim)
    }
}

/// Signs device credentials.
pub struct CredentialIssuer {
    key: EncodingKey,
}

impl std::fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialIssuer").finish_non_exhaustive()
    }
}

impl CredentialIssuer {
    /// Create an issuer for the shared secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Sign a credential bound to a device.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue(
        &self,
        device_id: &str,
        user_name: Option<&str>,
        title: Option<&str>,
        ttl: Duration,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = DeviceClaims {
            sub: device_id.to_string(),
            device_id: Some(device_id.to_string()),
            user_name: user_name.map(str::to_string),
            title: title.map(str::to_string),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.key)?)
    }
}
