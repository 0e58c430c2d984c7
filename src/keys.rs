//! Key layout in the shared keyed store
//!
//! - `active:<kind>:<user>:<jti>` : active-session registry entry
//! - `roles:<user>` : hash role -> assignment
//! - `role-holders:<role>` : hash user -> holder
//! - `connections` : hash client id -> connection record
//! - `seq:<user>:<role>` : device sequence counter
//! - `kick-notifications` : FIFO queue of evictions

use crate::auth::{Role, SessionKind};
use uuid::Uuid;

pub const CONNECTIONS: &str = "connections";
pub const KICK_QUEUE: &str = "kick-notifications";

pub fn active(kind: SessionKind, user_id: &Uuid, jti: &str) -> String {
    format!("{}{}", active_prefix(kind, user_id), jti)
}

/// Prefix shared by every registry entry of one user and kind
pub fn active_prefix(kind: SessionKind, user_id: &Uuid) -> String {
    format!("active:{}:{}:", kind.as_str(), user_id)
}

pub fn roles(user_id: &Uuid) -> String {
    format!("roles:{}", user_id)
}

pub fn role_holders(role: Role) -> String {
    format!("role-holders:{}", role.as_str())
}

pub fn sequence(user_id: &Uuid, role: Role) -> String {
    format!("seq:{}:{}", user_id, role.as_str())
}
