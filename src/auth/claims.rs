//! Claims carried by account and device credentials

use crate::auth::tokens::CredentialError;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Issued tokens become valid slightly before their issue time to absorb clock skew
const NOT_BEFORE_SKEW_SECS: i64 = 1;

/// Credential kind, also the namespace of its registry entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Account,
    Device,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Account => "account",
            SessionKind::Device => "device",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

/// Mutually-exclusive device roles. A user holds each at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Transmitter,
    Receiver,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Transmitter, Role::Receiver, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Transmitter => "transmitter",
            Role::Receiver => "receiver",
            Role::Admin => "admin",
        }
    }

    /// Admin devices may read any device- or user-scoped topic
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Roles that take part in transmitter/receiver pairing
    pub fn is_peer(&self) -> bool {
        matches!(self, Role::Transmitter | Role::Receiver)
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transmitter" => Ok(Role::Transmitter),
            "receiver" => Ok(Role::Receiver),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Username portion of a device client id: every hyphen-delimited segment
/// except the trailing two. Empty when there are fewer than three segments.
pub fn extract_username(client_id: &str) -> &str {
    let mut parts = client_id.rsplitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(_), Some(username)) => username,
        _ => "",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid device client id '{0}'")]
pub struct InvalidClientId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid username '{0}'")]
pub struct InvalidUsername(pub String);

/// Usernames become literal topic levels, so they may not be empty or
/// carry MQTT wildcards, level separators or NUL.
pub fn validate_username(username: &str) -> Result<(), InvalidUsername> {
    if username.is_empty() || username.contains(|c: char| matches!(c, '+' | '#' | '/' | '\0')) {
        return Err(InvalidUsername(username.to_string()));
    }
    Ok(())
}

/// Device client id of the form `<username>-<role>-<sequence>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceClientId {
    id: String,
    /// Byte length of the username prefix
    username_len: usize,
    role: Role,
    sequence: u32,
}

impl DeviceClientId {
    pub fn new(username: &str, role: Role, sequence: u32) -> Result<Self, InvalidClientId> {
        let id = format!("{}-{}-{:03}", username, role.as_str(), sequence);
        if validate_username(username).is_err() {
            return Err(InvalidClientId(id));
        }
        Ok(Self {
            id,
            username_len: username.len(),
            role,
            sequence,
        })
    }

    pub fn parse(id: &str) -> Result<Self, InvalidClientId> {
        let invalid = || InvalidClientId(id.to_string());

        let mut parts = id.rsplitn(3, '-');
        let (seq, role, username) = match (parts.next(), parts.next(), parts.next()) {
            (Some(seq), Some(role), Some(username)) => (seq, role, username),
            _ => return Err(invalid()),
        };

        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        validate_username(username).map_err(|_| invalid())?;
        let sequence = seq.parse().map_err(|_| invalid())?;
        let role = role.parse().map_err(|_| invalid())?;

        Ok(Self {
            id: id.to_string(),
            username_len: username.len(),
            role,
            sequence,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.id[..self.username_len]
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for DeviceClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl TryFrom<String> for DeviceClientId {
    type Error = InvalidClientId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceClientId> for String {
    fn from(value: DeviceClientId) -> Self {
        value.id
    }
}

/// Behaviour shared by both credential payloads
pub trait Claims: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: SessionKind;

    fn user_id(&self) -> &Uuid;
    fn jti(&self) -> &str;
    /// Identity the registry entry must match: the client-session id for
    /// accounts, the device client id for devices
    fn holder(&self) -> &str;
    fn issued_at(&self) -> i64;
    fn expires_at(&self) -> i64;
    fn not_before(&self) -> i64;

    fn role(&self) -> Option<Role> {
        None
    }

    /// Check required fields; temporal bounds are checked by the codec
    fn validate(&self) -> Result<(), CredentialError>;
}

fn timestamps(ttl: Duration) -> (i64, i64, i64) {
    let iat = Utc::now().timestamp();
    let exp = iat + ttl.as_secs() as i64;
    (iat, exp, iat - NOT_BEFORE_SKEW_SECS)
}

/// Account session obtained through normal login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountClaims {
    pub user_id: Uuid,
    pub username: String,
    /// Distinguishes concurrent logins of the same user
    pub client_session_id: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
    /// Seconds of remaining lifetime under which the token is refreshed
    pub buffer_time: i64,
}

impl AccountClaims {
    pub fn new(user_id: Uuid, username: impl Into<String>, ttl: Duration, buffer: Duration) -> Self {
        let (iat, exp, nbf) = timestamps(ttl);
        Self {
            user_id,
            username: username.into(),
            client_session_id: Uuid::new_v4().to_string(),
            jti: Uuid::new_v4().to_string(),
            iat,
            exp,
            nbf,
            buffer_time: buffer.as_secs() as i64,
        }
    }

    /// Successor claims for a proactive refresh: same user, fresh session and jti
    pub fn refreshed(&self, ttl: Duration) -> Self {
        Self::new(
            self.user_id,
            self.username.clone(),
            ttl,
            Duration::from_secs(self.buffer_time.max(0) as u64),
        )
    }

    /// True when the remaining lifetime has dropped below the buffer
    pub fn needs_refresh(&self, now: i64) -> bool {
        self.exp - now < self.buffer_time
    }
}

impl Claims for AccountClaims {
    const KIND: SessionKind = SessionKind::Account;

    fn user_id(&self) -> &Uuid {
        &self.user_id
    }

    fn jti(&self) -> &str {
        &self.jti
    }

    fn holder(&self) -> &str {
        &self.client_session_id
    }

    fn issued_at(&self) -> i64 {
        self.iat
    }

    fn expires_at(&self) -> i64 {
        self.exp
    }

    fn not_before(&self) -> i64 {
        self.nbf
    }

    fn validate(&self) -> Result<(), CredentialError> {
        if self.user_id.is_nil() {
            return Err(CredentialError::ClaimsInvalid("user id is empty".into()));
        }
        validate_username(&self.username).map_err(|e| CredentialError::ClaimsInvalid(e.to_string()))?;
        if self.client_session_id.is_empty() {
            return Err(CredentialError::ClaimsInvalid("client session id is empty".into()));
        }
        if self.jti.is_empty() {
            return Err(CredentialError::ClaimsInvalid("jti is empty".into()));
        }
        Ok(())
    }
}

/// Role-scoped device session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClaims {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    pub client_id: DeviceClientId,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
}

impl DeviceClaims {
    pub fn new(user_id: Uuid, client_id: DeviceClientId, ttl: Duration) -> Self {
        let (iat, exp, nbf) = timestamps(ttl);
        Self {
            user_id,
            username: client_id.username().to_string(),
            role: client_id.role(),
            client_id,
            jti: Uuid::new_v4().to_string(),
            iat,
            exp,
            nbf,
        }
    }
}

impl Claims for DeviceClaims {
    const KIND: SessionKind = SessionKind::Device;

    fn user_id(&self) -> &Uuid {
        &self.user_id
    }

    fn jti(&self) -> &str {
        &self.jti
    }

    fn holder(&self) -> &str {
        self.client_id.as_str()
    }

    fn issued_at(&self) -> i64 {
        self.iat
    }

    fn expires_at(&self) -> i64 {
        self.exp
    }

    fn not_before(&self) -> i64 {
        self.nbf
    }

    fn role(&self) -> Option<Role> {
        Some(self.role)
    }

    fn validate(&self) -> Result<(), CredentialError> {
        if self.user_id.is_nil() {
            return Err(CredentialError::ClaimsInvalid("user id is empty".into()));
        }
        validate_username(&self.username).map_err(|e| CredentialError::ClaimsInvalid(e.to_string()))?;
        if self.jti.is_empty() {
            return Err(CredentialError::ClaimsInvalid("jti is empty".into()));
        }
        if self.client_id.username() != self.username || self.client_id.role() != self.role {
            return Err(CredentialError::ClaimsInvalid(format!(
                "client id '{}' does not belong to {} as {}",
                self.client_id, self.username, self.role
            )));
        }
        Ok(())
    }
}
