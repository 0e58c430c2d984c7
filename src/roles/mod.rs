//! Role assignment store and conflict resolution
//!
//! Each (user, role) pair is held by at most one device. State per pair:
//!
//! ```text
//! Unassigned -> Assigned(A) -> Assigned(B) -> Unassigned
//!                          takeover      release / sweep
//! ```
//!
//! All transitions are a single guarded transaction over the assignment,
//! the reverse index, the connection records and the new holder's registry
//! entry. A takeover also enqueues a [`KickNotification`] for the evicted
//! device in the same transaction; its credential is revoked later by the
//! kick worker.

use crate::auth::{
    ActiveSession, DeviceClaims, DeviceClientId, InvalidClientId, Role, SessionKind, SessionRegistry,
};
use crate::config::ServiceConfig;
use crate::keys;
use crate::storage::{from_value, to_value, KeyedStore, StorageError, Transaction};
use crate::tracker::{ConnectionRecord, ConnectionTracker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Reason attached to takeover kicks
pub const REASON_ROLE_TAKEN: &str = "role_taken_by_another_device";

/// Free-form description supplied by the device (model, os, app version...)
pub type DeviceInfo = Map<String, Value>;

#[derive(Debug, Error)]
pub enum RoleError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    InvalidClientId(#[from] InvalidClientId),

    #[error("role assignment still contended after {attempts} attempts")]
    Contended { attempts: u32 },
}

/// Current holder of a (user, role) pair, stored in `roles:<user>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub user_id: Uuid,
    pub client_id: String,
    pub jti: String,
    #[serde(default)]
    pub device_info: DeviceInfo,
    pub assigned_at: DateTime<Utc>,
}

/// Reverse index entry, stored in `role-holders:<role>` under the user id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleHolder {
    pub user_id: Uuid,
    pub client_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// Queued when a device loses its role to another device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickNotification {
    pub target_client_id: String,
    pub kicker_client_id: String,
    pub user_id: Uuid,
    pub role: Role,
    /// Credential of the evicted device, captured with the eviction
    #[serde(default)]
    pub jti: Option<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// The device currently blocking an assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDevice {
    pub client_id: String,
    pub device_model: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_device: Option<ConflictDevice>,
    pub can_force_kick: bool,
}

impl ConflictCheck {
    fn clear() -> Self {
        Self {
            has_conflict: false,
            conflict_device: None,
            can_force_kick: false,
        }
    }

    fn blocked_by(device: ConflictDevice) -> Self {
        Self {
            has_conflict: true,
            conflict_device: Some(device),
            can_force_kick: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssignRequest {
    /// Credential the device will use while holding the role. Its registry
    /// entry is written by the assignment itself.
    pub claims: DeviceClaims,
    pub device_info: DeviceInfo,
    pub force_takeover: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignOutcome {
    /// The candidate now holds the role; `evicted` names the kicked device
    Assigned { evicted: Option<String> },
    /// Another device holds the role and takeover was not requested
    Conflict(ConflictDevice),
}

#[derive(Clone)]
pub struct RoleAssignments {
    store: Arc<dyn KeyedStore>,
    registry: SessionRegistry,
    tracker: ConnectionTracker,
    assignment_ttl: Duration,
    sequence_ttl: Duration,
    max_attempts: u32,
}

impl RoleAssignments {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        registry: SessionRegistry,
        tracker: ConnectionTracker,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            registry,
            tracker,
            assignment_ttl: config.assignment_ttl,
            sequence_ttl: config.sequence_ttl,
            max_attempts: config.assign_attempts.max(1),
        }
    }

    /// Allocate the next device client id for a user's role
    pub async fn next_client_id(
        &self,
        user_id: &Uuid,
        username: &str,
        role: Role,
    ) -> Result<DeviceClientId, RoleError> {
        let seq = self
            .store
            .increment(&keys::sequence(user_id, role), self.sequence_ttl)
            .await?;
        let seq = u32::try_from(seq)
            .map_err(|_| StorageError::Serialization(format!("sequence {} out of range", seq)))?;
        Ok(DeviceClientId::new(username, role, seq)?)
    }

    pub async fn holder(&self, user_id: &Uuid, role: Role) -> Result<Option<Assignment>, RoleError> {
        match self.store.hash_get(&keys::roles(user_id), role.as_str()).await? {
            Some(value) => Ok(Some(from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Every role the user currently holds
    pub async fn assignments(&self, user_id: &Uuid) -> Result<Vec<(Role, Assignment)>, RoleError> {
        let mut held = Vec::new();
        for (field, value) in self.store.hash_get_all(&keys::roles(user_id)).await? {
            if let Ok(role) = field.parse::<Role>() {
                held.push((role, from_value(value)?));
            }
        }
        held.sort_by_key(|(role, _)| *role);
        Ok(held)
    }

    /// Reverse index: who holds `role`, per user
    pub async fn holders(&self, role: Role) -> Result<Vec<RoleHolder>, RoleError> {
        self.store
            .hash_get_all(&keys::role_holders(role))
            .await?
            .into_iter()
            .map(|(_, value)| from_value(value).map_err(RoleError::from))
            .collect()
    }

    async fn describe(&self, assignment: &Assignment) -> Result<ConflictDevice, RoleError> {
        let record = self.tracker.get(&assignment.client_id).await?;
        let (connected_at, last_activity) = match record {
            Some(r) => (r.connected_at, r.last_ping),
            None => (assignment.assigned_at, assignment.assigned_at),
        };
        let device_model = assignment
            .device_info
            .get("device_model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        Ok(ConflictDevice {
            client_id: assignment.client_id.clone(),
            device_model,
            connected_at,
            last_activity,
            device_info: assignment.device_info.clone(),
        })
    }

    /// Would giving `role` to `candidate` displace another device?
    pub async fn check_conflict(
        &self,
        user_id: &Uuid,
        role: Role,
        candidate: &str,
    ) -> Result<ConflictCheck, RoleError> {
        match self.holder(user_id, role).await? {
            Some(current) if current.client_id != candidate => {
                Ok(ConflictCheck::blocked_by(self.describe(&current).await?))
            }
            _ => Ok(ConflictCheck::clear()),
        }
    }

    /// Give the request's role to its device and register its credential.
    ///
    /// A different current holder is either reported (no force) or evicted
    /// in the same transaction that installs the candidate, so the evicted
    /// credential is always registered by the time its kick is read. Lost
    /// races are retried from a fresh read.
    pub async fn assign_role(&self, req: &AssignRequest) -> Result<AssignOutcome, RoleError> {
        let claims = &req.claims;
        let user_id = claims.user_id;
        let role = claims.client_id.role();
        let candidate = claims.client_id.as_str();
        let roles_key = keys::roles(&user_id);
        let holders_key = keys::role_holders(role);
        let user_field = user_id.to_string();
        let session = ActiveSession::for_claims(claims);

        for attempt in 1..=self.max_attempts {
            let now = Utc::now();

            let current_raw = self.store.hash_get(&roles_key, role.as_str()).await?;
            let current: Option<Assignment> = current_raw.clone().map(from_value).transpose()?;
            let holder_raw = self.store.hash_get(&holders_key, &user_field).await?;

            let (evicted, superseded) = match current {
                Some(a) if a.client_id != candidate => {
                    if !req.force_takeover {
                        return Ok(AssignOutcome::Conflict(self.describe(&a).await?));
                    }
                    (Some(a), None)
                }
                // Same device asking again: its older credential is replaced
                Some(a) if a.jti != claims.jti => (None, Some(a.jti)),
                _ => (None, None),
            };

            let mut tx = Transaction::new()
                .expect_field(&roles_key, role.as_str(), current_raw)
                .expect_field(&holders_key, &user_field, holder_raw);

            if let Some(prev) = &evicted {
                let conn_raw = self.store.hash_get(keys::CONNECTIONS, &prev.client_id).await?;
                let jti = conn_raw
                    .clone()
                    .and_then(|raw| from_value::<ConnectionRecord>(raw).ok())
                    .filter(|r| r.user_id == user_id)
                    .map(|r| r.jti)
                    .unwrap_or_else(|| prev.jti.clone());

                let kick = KickNotification {
                    target_client_id: prev.client_id.clone(),
                    kicker_client_id: candidate.to_string(),
                    user_id,
                    role,
                    jti: Some(jti),
                    reason: REASON_ROLE_TAKEN.to_string(),
                    timestamp: now,
                };

                tx = tx
                    .expect_field(keys::CONNECTIONS, &prev.client_id, conn_raw)
                    .enqueue(keys::KICK_QUEUE, to_value(&kick)?)
                    .hash_delete(keys::CONNECTIONS, &prev.client_id);
            }

            if let Some(old_jti) = &superseded {
                tx = tx.delete(keys::active(SessionKind::Device, &user_id, old_jti));
            }

            let assignment = Assignment {
                user_id,
                client_id: candidate.to_string(),
                jti: claims.jti.clone(),
                device_info: req.device_info.clone(),
                assigned_at: now,
            };
            let holder = RoleHolder {
                user_id,
                client_id: candidate.to_string(),
                assigned_at: now,
            };
            let record = ConnectionRecord::new(
                user_id,
                claims.client_id.username(),
                role,
                &claims.jti,
                now,
            );

            tx = tx
                .put(session.key(), to_value(&session)?, Some(session.remaining(now)))
                .hash_put(&roles_key, role.as_str(), to_value(&assignment)?)
                .hash_put(&holders_key, &user_field, to_value(&holder)?)
                .hash_put(keys::CONNECTIONS, candidate, to_value(&record)?)
                .expire(&roles_key, self.assignment_ttl)
                .expire(&holders_key, self.assignment_ttl);

            match self.store.commit(tx).await {
                Ok(()) => {
                    let evicted = evicted.map(|a| a.client_id);
                    info!(
                        user_id = %user_id,
                        role = %role,
                        client_id = %candidate,
                        evicted = ?evicted,
                        "Role assigned"
                    );
                    return Ok(AssignOutcome::Assigned { evicted });
                }
                Err(e) if e.is_conflict() => {
                    debug!(user_id = %user_id, role = %role, attempt, "Assignment raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RoleError::Contended {
            attempts: self.max_attempts,
        })
    }

    /// Release `role` if `client_id` still holds it, dropping its connection
    /// record and revoking its credential. False if someone else holds it.
    pub async fn release(
        &self,
        user_id: &Uuid,
        role: Role,
        client_id: &str,
    ) -> Result<bool, RoleError> {
        let roles_key = keys::roles(user_id);
        let holders_key = keys::role_holders(role);
        let user_field = user_id.to_string();

        for attempt in 1..=self.max_attempts {
            let Some(raw) = self.store.hash_get(&roles_key, role.as_str()).await? else {
                return Ok(false);
            };
            let assignment: Assignment = from_value(raw.clone())?;
            if assignment.client_id != client_id {
                return Ok(false);
            }

            let mut tx = Transaction::new()
                .expect_field(&roles_key, role.as_str(), Some(raw))
                .hash_delete(&roles_key, role.as_str())
                .hash_delete(keys::CONNECTIONS, client_id);

            if let Some(holder_raw) = self.store.hash_get(&holders_key, &user_field).await? {
                let same = from_value::<RoleHolder>(holder_raw.clone())
                    .map(|h| h.client_id == client_id)
                    .unwrap_or(false);
                if same {
                    tx = tx
                        .expect_field(&holders_key, &user_field, Some(holder_raw))
                        .hash_delete(&holders_key, &user_field);
                }
            }

            match self.store.commit(tx).await {
                Ok(()) => {
                    self.registry
                        .revoke(SessionKind::Device, user_id, &assignment.jti)
                        .await?;
                    info!(user_id = %user_id, role = %role, client_id = %client_id, "Role released");
                    return Ok(true);
                }
                Err(e) if e.is_conflict() => {
                    debug!(user_id = %user_id, role = %role, attempt, "Release raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RoleError::Contended {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    struct Fixture {
        store: Arc<dyn KeyedStore>,
        roles: RoleAssignments,
        tracker: ConnectionTracker,
        user: Uuid,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
        let tracker = ConnectionTracker::new(store.clone());
        let roles = RoleAssignments::new(
            store.clone(),
            SessionRegistry::new(store.clone()),
            tracker.clone(),
            &ServiceConfig::default(),
        );
        Fixture {
            store,
            roles,
            tracker,
            user: Uuid::new_v4(),
        }
    }

    fn claims(user: Uuid, role: Role, seq: u32) -> DeviceClaims {
        DeviceClaims::new(
            user,
            DeviceClientId::new("alice", role, seq).unwrap(),
            Duration::from_secs(3600),
        )
    }

    fn request(user: Uuid, seq: u32, force: bool) -> AssignRequest {
        let mut device_info = DeviceInfo::new();
        device_info.insert("device_model".into(), format!("Pixel {}", seq).into());
        AssignRequest {
            claims: claims(user, Role::Transmitter, seq),
            device_info,
            force_takeover: force,
        }
    }

    #[tokio::test]
    async fn test_first_assignment_has_no_conflict() {
        let f = fixture();
        let outcome = f.roles.assign_role(&request(f.user, 1, false)).await.unwrap();
        assert_eq!(outcome, AssignOutcome::Assigned { evicted: None });

        let holder = f.roles.holder(&f.user, Role::Transmitter).await.unwrap().unwrap();
        assert_eq!(holder.client_id, "alice-transmitter-001");
        assert!(f.tracker.get("alice-transmitter-001").await.unwrap().is_some());
        assert_eq!(f.store.queue_len(keys::KICK_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_same_device_reassign_is_not_a_conflict() {
        let f = fixture();
        let first = request(f.user, 1, false);
        f.roles.assign_role(&first).await.unwrap();

        let check = f
            .roles
            .check_conflict(&f.user, Role::Transmitter, "alice-transmitter-001")
            .await
            .unwrap();
        assert!(!check.has_conflict);

        let again = request(f.user, 1, false);
        f.roles.assign_role(&again).await.unwrap();
        assert_eq!(f.store.queue_len(keys::KICK_QUEUE).await.unwrap(), 0);

        // The newer credential replaces the older one in the same commit
        assert!(!f.roles.registry.is_active(&first.claims).await.unwrap());
        assert!(f.roles.registry.is_active(&again.claims).await.unwrap());
        let record = f.tracker.get("alice-transmitter-001").await.unwrap().unwrap();
        assert_eq!(record.jti, again.claims.jti);
    }

    #[tokio::test]
    async fn test_conflict_without_force_changes_nothing() {
        let f = fixture();
        f.roles.assign_role(&request(f.user, 1, false)).await.unwrap();

        let rejected = request(f.user, 2, false);
        let outcome = f.roles.assign_role(&rejected).await.unwrap();
        match outcome {
            AssignOutcome::Conflict(device) => {
                assert_eq!(device.client_id, "alice-transmitter-001");
                assert_eq!(device.device_model, "Pixel 1");
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let holder = f.roles.holder(&f.user, Role::Transmitter).await.unwrap().unwrap();
        assert_eq!(holder.client_id, "alice-transmitter-001");
        assert!(f.tracker.get("alice-transmitter-002").await.unwrap().is_none());
        assert!(!f.roles.registry.is_active(&rejected.claims).await.unwrap());
        assert_eq!(f.store.queue_len(keys::KICK_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_forced_takeover_queues_one_kick() {
        let f = fixture();
        let first = request(f.user, 1, false);
        f.roles.assign_role(&first).await.unwrap();

        let second = request(f.user, 2, true);
        let outcome = f.roles.assign_role(&second).await.unwrap();
        assert_eq!(
            outcome,
            AssignOutcome::Assigned {
                evicted: Some("alice-transmitter-001".into())
            }
        );

        assert!(f.tracker.get("alice-transmitter-001").await.unwrap().is_none());
        assert!(f.tracker.get("alice-transmitter-002").await.unwrap().is_some());

        let holders = f.roles.holders(Role::Transmitter).await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].client_id, "alice-transmitter-002");

        assert_eq!(f.store.queue_len(keys::KICK_QUEUE).await.unwrap(), 1);
        let kick: KickNotification =
            from_value(f.store.pop_blocking(keys::KICK_QUEUE).await.unwrap()).unwrap();
        assert_eq!(kick.target_client_id, "alice-transmitter-001");
        assert_eq!(kick.kicker_client_id, "alice-transmitter-002");
        assert_eq!(kick.jti.as_deref(), Some(first.claims.jti.as_str()));

        // Both credentials are registered; the worker revokes the first
        assert!(f.roles.registry.is_active(&first.claims).await.unwrap());
        assert!(f.roles.registry.is_active(&second.claims).await.unwrap());
        assert_eq!(kick.reason, REASON_ROLE_TAKEN);
    }

    #[tokio::test]
    async fn test_roles_are_independent() {
        let f = fixture();
        f.roles.assign_role(&request(f.user, 1, false)).await.unwrap();

        let receiver = AssignRequest {
            claims: claims(f.user, Role::Receiver, 1),
            ..request(f.user, 9, false)
        };
        let outcome = f.roles.assign_role(&receiver).await.unwrap();
        assert_eq!(outcome, AssignOutcome::Assigned { evicted: None });
        assert_eq!(f.roles.assignments(&f.user).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let f = fixture();
        f.roles.assign_role(&request(f.user, 1, false)).await.unwrap();

        assert!(!f
            .roles
            .release(&f.user, Role::Transmitter, "alice-transmitter-009")
            .await
            .unwrap());
        assert!(f
            .roles
            .release(&f.user, Role::Transmitter, "alice-transmitter-001")
            .await
            .unwrap());

        assert!(f.roles.holder(&f.user, Role::Transmitter).await.unwrap().is_none());
        assert!(f.roles.holders(Role::Transmitter).await.unwrap().is_empty());
        assert!(f.tracker.get("alice-transmitter-001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sequence_allocation() {
        let f = fixture();
        let first = f.roles.next_client_id(&f.user, "alice", Role::Receiver).await.unwrap();
        let second = f.roles.next_client_id(&f.user, "alice", Role::Receiver).await.unwrap();
        let other = f.roles.next_client_id(&f.user, "alice", Role::Admin).await.unwrap();

        assert_eq!(first.as_str(), "alice-receiver-001");
        assert_eq!(second.as_str(), "alice-receiver-002");
        assert_eq!(other.as_str(), "alice-admin-001");
    }

    #[tokio::test(start_paused = true)]
    async fn test_assignment_ttl() {
        let f = fixture();
        f.roles.assign_role(&request(f.user, 1, false)).await.unwrap();

        tokio::time::advance(ServiceConfig::default().assignment_ttl + Duration::from_secs(1)).await;
        assert!(f.roles.holder(&f.user, Role::Transmitter).await.unwrap().is_none());
    }
}
