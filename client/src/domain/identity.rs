//! Identity token handling and user key derivation.
//!
//! Tokens are read for routing hints only: the payload is decoded without
//! verifying the signature, because the remote endpoints enforce
//! authorisation on every request.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::document::DocumentId;
use super::tenant::TenantId;

/// Namespace prefix of user profile document keys.
pub const USER_ID_PREFIX: &str = "user_";

/// Errors raised while reading token claims.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenDecodeError {
    /// Token did not have three dot-separated parts.
    #[error("token must have three dot-separated parts")]
    Malformed,
    /// Payload was not valid base64.
    #[error("token payload is not base64")]
    InvalidEncoding,
    /// Payload was not a JSON object.
    #[error("token payload is not a JSON object")]
    InvalidPayload,
}

/// A signed session token. The raw value is wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken(Zeroizing<String>);

impl IdentityToken {
    /// Wrap a raw token string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Zeroizing::new(raw.into()))
    }

    /// Raw token for the `Authorization` header.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Decode the payload claims.
    pub fn claims(&self) -> Result<TokenClaims, TokenDecodeError> {
        let mut parts = self.0.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenDecodeError::Malformed);
        };
        let payload = decode_segment(payload)?;
        match serde_json::from_slice::<Value>(&payload) {
            Ok(Value::Object(claims)) => Ok(TokenClaims::from_map(claims)),
            _ => Err(TokenDecodeError::InvalidPayload),
        }
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityToken(<redacted>)")
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, TokenDecodeError> {
    let unpadded = segment.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(unpadded)
        .or_else(|_| STANDARD_NO_PAD.decode(unpadded))
        .map_err(|_| TokenDecodeError::InvalidEncoding)
}

/// Claims this client reads from the token payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// `sub` claim.
    pub subject: Option<String>,
    /// Active tenant claim, if any form of it is present.
    pub active_tenant: Option<TenantId>,
}

impl TokenClaims {
    fn from_map(claims: Map<String, Value>) -> Self {
        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|sub| !sub.trim().is_empty())
            .map(str::to_owned);
        let metadata_claim = claims
            .get("metadata")
            .and_then(|metadata| metadata.get("active_tenant_id"));
        let active_tenant = [
            claims.get("active_tenant_id"),
            metadata_claim,
            claims.get("tenant_id"),
        ]
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(|raw| TenantId::new(raw).ok());
        Self {
            subject,
            active_tenant,
        }
    }
}

/// Stable, privacy-preserving user identifier: lowercase hex SHA-256 of the
/// subject claim.
///
/// # Examples
/// ```
/// use client::domain::UserKey;
///
/// let key = UserKey::from_subject("user_2abc");
/// assert_eq!(key.as_str().len(), 64);
/// assert!(key.document_id().as_str().starts_with("user_"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey(String);

impl UserKey {
    /// Derive the key for a subject.
    pub fn from_subject(subject: &str) -> Self {
        Self(hex::encode(Sha256::digest(subject.as_bytes())))
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Local profile document key, `user_{key}`.
    pub fn document_id(&self) -> DocumentId {
        DocumentId::with_prefix(USER_ID_PREFIX, &self.0)
    }

    /// Whether a profile key in either spelling belongs to this user.
    pub fn owns(&self, raw_id: &str) -> bool {
        raw_id.strip_prefix(USER_ID_PREFIX).unwrap_or(raw_id) == self.0
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
