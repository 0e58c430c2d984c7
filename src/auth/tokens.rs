//! Signed credential encoding and verification
//!
//! Token prefixes:
//! - `acct-` : account session, issued at login, used on the REST surface
//! - `dev-` : role-scoped device session, presented to the broker as password
//!
//! Both are `<prefix><base64url(json claims)>.<base64url(HMAC-SHA256)>`.
//! A valid signature is necessary but not sufficient: the registry decides
//! whether the credential is still honored.

use crate::auth::claims::{Claims, SessionKind};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const ACCOUNT_TOKEN_PREFIX: &str = "acct-";
pub const DEVICE_TOKEN_PREFIX: &str = "dev-";

/// Tolerated clock skew when checking `nbf`
const NOT_BEFORE_LEEWAY_SECS: i64 = 1;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("credential has expired")]
    Expired,

    #[error("malformed credential: {0}")]
    Malformed(String),

    #[error("invalid credential signature")]
    SignatureInvalid,

    #[error("credential is not valid yet")]
    NotYetValid,

    #[error("invalid credential claims: {0}")]
    ClaimsInvalid(String),

    #[error("credential is not active")]
    NotActive,
}

impl CredentialError {
    /// Message shown to the holder of the rejected credential
    pub fn user_message(&self) -> &'static str {
        match self {
            CredentialError::Expired => "Your session has expired, please sign in again",
            CredentialError::Malformed(_) => "The credential could not be read",
            CredentialError::SignatureInvalid => "The credential was not issued by this service",
            CredentialError::NotYetValid => "The credential is not valid yet",
            CredentialError::ClaimsInvalid(_) => "The credential is missing required information",
            CredentialError::NotActive => {
                "This session was signed out or taken over by another device"
            }
        }
    }
}

pub fn prefix_for(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Account => ACCOUNT_TOKEN_PREFIX,
        SessionKind::Device => DEVICE_TOKEN_PREFIX,
    }
}

/// Signs and verifies credentials with a shared secret
#[derive(Clone)]
pub struct TokenCodec {
    secret: Arc<[u8]>,
}

impl TokenCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        let secret: Vec<u8> = secret.into();
        Self {
            secret: Arc::from(secret),
        }
    }

    fn mac(&self, payload_b64: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(payload_b64.as_bytes());
        mac
    }

    /// Sign claims. Only validates required fields; registering the
    /// credential is the caller's job (see `Credentials::issue`).
    pub fn encode<C: Claims>(&self, claims: &C) -> Result<String, CredentialError> {
        claims.validate()?;

        let payload_json =
            serde_json::to_vec(claims).map_err(|e| CredentialError::Malformed(e.to_string()))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);
        let signature = self.mac(&payload_b64).finalize().into_bytes();
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature);

        Ok(format!(
            "{}{}.{}",
            prefix_for(C::KIND),
            payload_b64,
            signature_b64
        ))
    }

    /// Verify signature, claims and temporal bounds
    pub fn decode<C: Claims>(&self, token: &str) -> Result<C, CredentialError> {
        self.decode_at(token, Utc::now().timestamp())
    }

    pub fn decode_at<C: Claims>(&self, token: &str, now: i64) -> Result<C, CredentialError> {
        let claims: C = self.decode_unchecked(token)?;

        if now >= claims.expires_at() {
            return Err(CredentialError::Expired);
        }
        if now + NOT_BEFORE_LEEWAY_SECS < claims.not_before() {
            return Err(CredentialError::NotYetValid);
        }

        Ok(claims)
    }

    /// Verify signature and claims but ignore `exp` / `nbf`.
    /// For introspection only, never for authorization.
    pub fn decode_unchecked<C: Claims>(&self, token: &str) -> Result<C, CredentialError> {
        let prefix = prefix_for(C::KIND);
        let content = token.strip_prefix(prefix).ok_or_else(|| {
            CredentialError::Malformed(format!("expected '{}' credential", prefix))
        })?;

        let (payload_b64, signature_b64) = content
            .split_once('.')
            .ok_or_else(|| CredentialError::Malformed("missing signature".into()))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;

        // Constant-time comparison
        self.mac(payload_b64)
            .verify_slice(&signature)
            .map_err(|_| CredentialError::SignatureInvalid)?;

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;

        let value: serde_json::Value = serde_json::from_slice(&payload_json)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;

        let claims: C = serde_json::from_value(value)
            .map_err(|e| CredentialError::ClaimsInvalid(e.to_string()))?;

        claims.validate()?;
        Ok(claims)
    }
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenCodec([REDACTED])")
    }
}
