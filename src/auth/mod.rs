//! Credentials and authorization rules
//!
//! Token types:
//! - `acct-` prefix: account session, exchanged for device sessions
//! - `dev-` prefix: role-scoped device session, used to connect to the broker
//!
//! Roles:
//! - `transmitter`, `receiver`: paired peers, one of each per user
//! - `admin`: read access to every device- and user-scoped topic

mod acl;
mod claims;
mod credentials;
mod registry;
mod tokens;

pub use acl::{AclPolicy, Action, Decision, Rule};
pub use claims::{
    extract_username, validate_username, AccountClaims, Claims, DeviceClaims, DeviceClientId,
    InvalidClientId, InvalidUsername, Role, SessionKind, UnknownRole,
};
pub use credentials::Credentials;
pub use registry::{ActiveSession, SessionRegistry};
pub use tokens::{
    prefix_for, CredentialError, TokenCodec, ACCOUNT_TOKEN_PREFIX, DEVICE_TOKEN_PREFIX,
};

use crate::storage::StorageError;
use thiserror::Error;

/// Credential rejection or a storage failure while checking it
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
