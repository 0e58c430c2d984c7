//! Session service: the operations behind the REST surface and the CLI
//!
//! Built once with an injected store and transport; every component gets
//! its handles at construction.

use crate::auth::{
    validate_username, AccountClaims, AclPolicy, Action, ActiveSession, AuthError, Credentials,
    Decision, DeviceClaims, DeviceClientId, Role, SessionKind, SessionRegistry, TokenCodec,
};
use crate::config::ServiceConfig;
use crate::gateway::Gateway;
use crate::roles::{AssignOutcome, AssignRequest, ConflictCheck, DeviceInfo, RoleAssignments, RoleError};
use crate::storage::{KeyedStore, StorageError};
use crate::tracker::ConnectionTracker;
use crate::transport::TransportHandle;
use crate::worker::{Background, KickWorker, SweepTask};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),
}

/// A signed account credential and its claims
#[derive(Debug, Clone)]
pub struct IssuedAccount {
    pub token: String,
    pub claims: AccountClaims,
}

impl IssuedAccount {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.claims.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceTokenRequest {
    pub role: String,
    #[serde(default, alias = "force_kick_existing")]
    pub force_takeover: bool,
    #[serde(default)]
    pub device_info: Option<DeviceInfo>,
    /// Reuse an id previously issued to this device
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceToken {
    pub client_id: String,
    pub token: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DeviceIssue {
    Issued(DeviceToken),
    Conflict(ConflictCheck),
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSession {
    #[serde(flatten)]
    pub session: ActiveSession,
    /// The credential is the one currently holding its role
    pub holds_role: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceRevocation {
    pub released: bool,
    pub revoked: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
}

impl ConnectionEventKind {
    /// Accepts both webhook spellings, `client_connected` and `client.connected`
    pub fn parse(event: &str) -> Option<Self> {
        match event.replace('.', "_").as_str() {
            "client_connected" => Some(Self::Connected),
            "client_disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct SessionService {
    config: ServiceConfig,
    store: Arc<dyn KeyedStore>,
    credentials: Credentials,
    roles: RoleAssignments,
    tracker: ConnectionTracker,
    gateway: Gateway,
    transport: TransportHandle,
}

impl SessionService {
    pub fn new(store: Arc<dyn KeyedStore>, transport: TransportHandle, config: ServiceConfig) -> Self {
        let registry = SessionRegistry::new(store.clone());
        let credentials = Credentials::new(TokenCodec::new(config.token_secret.clone()), registry.clone());
        let tracker = ConnectionTracker::new(store.clone());
        let roles = RoleAssignments::new(store.clone(), registry, tracker.clone(), &config);
        let gateway = Gateway::new(
            credentials.clone(),
            tracker.clone(),
            AclPolicy::new(&config.topic_prefix),
        );

        Self {
            config,
            store,
            credentials,
            roles,
            tracker,
            gateway,
            transport,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn roles(&self) -> &RoleAssignments {
        &self.roles
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    fn registry(&self) -> &SessionRegistry {
        self.credentials.registry()
    }

    /// Start the kick consumer and the staleness sweep
    pub fn spawn_background(&self) -> Background {
        let kick = KickWorker::new(
            self.store.clone(),
            self.registry().clone(),
            self.tracker.clone(),
            self.transport.clone(),
            &self.config,
        );
        let sweep = SweepTask::new(self.store.clone(), self.tracker.clone(), &self.config);
        Background::spawn(kick, sweep)
    }

    // Account sessions

    pub async fn issue_account(&self, user_id: Uuid, username: &str) -> Result<IssuedAccount, ServiceError> {
        validate_username(username).map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        let claims = AccountClaims::new(user_id, username, self.config.account_ttl, self.config.account_buffer);
        let token = self.credentials.issue(&claims).await?;
        info!(user_id = %user_id, username = %username, "Issued account credential");
        Ok(IssuedAccount { token, claims })
    }

    pub async fn verify_account(&self, token: &str) -> Result<AccountClaims, ServiceError> {
        Ok(self.credentials.verify(token).await?)
    }

    /// Successor credential when `claims` is inside its refresh buffer
    pub async fn refresh_account(&self, claims: &AccountClaims) -> Result<Option<IssuedAccount>, ServiceError> {
        if !claims.needs_refresh(Utc::now().timestamp()) {
            return Ok(None);
        }
        let next = claims.refreshed(self.config.account_ttl);
        let token = self.credentials.issue(&next).await?;
        info!(user_id = %claims.user_id, "Refreshed account credential");
        Ok(Some(IssuedAccount { token, claims: next }))
    }

    pub async fn logout(&self, claims: &AccountClaims) -> Result<bool, ServiceError> {
        let revoked = self.credentials.revoke(claims).await?;
        info!(user_id = %claims.user_id, revoked, "Account logout");
        Ok(revoked)
    }

    // Device sessions

    fn parse_role(role: &str) -> Result<Role, ServiceError> {
        role.parse::<Role>()
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))
    }

    /// A client id supplied by the caller, if it belongs to them and the role
    fn reusable_client_id(
        account: &AccountClaims,
        role: Role,
        requested: Option<&str>,
    ) -> Result<Option<DeviceClientId>, ServiceError> {
        let Some(id) = requested.filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let parsed = DeviceClientId::parse(id).map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        if parsed.username() != account.username || parsed.role() != role {
            return Err(ServiceError::Forbidden(format!(
                "client id {} does not belong to this account and role",
                id
            )));
        }
        Ok(Some(parsed))
    }

    pub async fn check_conflict(
        &self,
        account: &AccountClaims,
        role: &str,
        client_id: Option<&str>,
    ) -> Result<ConflictCheck, ServiceError> {
        let role = Self::parse_role(role)?;
        let candidate = Self::reusable_client_id(account, role, client_id)?;
        let candidate = candidate.as_ref().map(DeviceClientId::as_str).unwrap_or_default();
        Ok(self.roles.check_conflict(&account.user_id, role, candidate).await?)
    }

    /// Exchange an account session for a role-scoped device credential
    pub async fn issue_device(
        &self,
        account: &AccountClaims,
        request: DeviceTokenRequest,
    ) -> Result<DeviceIssue, ServiceError> {
        let role = Self::parse_role(&request.role)?;
        validate_username(&account.username).map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        let reused = Self::reusable_client_id(account, role, request.client_id.as_deref())?;
        let user_id = account.user_id;

        if !request.force_takeover {
            let candidate = reused.as_ref().map(DeviceClientId::as_str).unwrap_or_default();
            let check = self.roles.check_conflict(&user_id, role, candidate).await?;
            if check.has_conflict {
                return Ok(DeviceIssue::Conflict(check));
            }
        }

        let client_id = match reused {
            Some(id) => id,
            None => self.roles.next_client_id(&user_id, &account.username, role).await?,
        };
        let claims = DeviceClaims::new(user_id, client_id.clone(), self.config.device_ttl);
        // Signed before assignment; the token is only handed out once the
        // assignment has registered it
        let token = self.credentials.codec().encode(&claims).map_err(AuthError::from)?;
        let expires_at = Utc.timestamp_opt(claims.exp, 0).single().unwrap_or_else(Utc::now);

        let request = AssignRequest {
            claims,
            device_info: request.device_info.unwrap_or_default(),
            force_takeover: request.force_takeover,
        };

        match self.roles.assign_role(&request).await? {
            AssignOutcome::Assigned { .. } => {}
            AssignOutcome::Conflict(device) => {
                return Ok(DeviceIssue::Conflict(ConflictCheck {
                    has_conflict: true,
                    conflict_device: Some(device),
                    can_force_kick: true,
                }));
            }
        }

        info!(user_id = %user_id, client_id = %client_id, role = %role, "Issued device credential");
        Ok(DeviceIssue::Issued(DeviceToken {
            client_id: client_id.to_string(),
            token,
            role,
            expires_at,
        }))
    }

    /// Release the device's role and revoke every credential it holds
    pub async fn revoke_device(
        &self,
        account: &AccountClaims,
        client_id: &str,
    ) -> Result<DeviceRevocation, ServiceError> {
        let parsed = DeviceClientId::parse(client_id).map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        if parsed.username() != account.username {
            return Err(ServiceError::Forbidden(format!("client id {} belongs to another user", client_id)));
        }

        let mut revoked = 0;
        for session in self.registry().list_active(SessionKind::Device, &account.user_id).await? {
            if session.holder == client_id
                && self.registry().revoke(SessionKind::Device, &account.user_id, &session.jti).await?
            {
                revoked += 1;
            }
        }

        let released = self.roles.release(&account.user_id, parsed.role(), client_id).await?;

        if !released && revoked == 0 {
            return Err(ServiceError::NotFound(format!("no active credential for {}", client_id)));
        }
        info!(user_id = %account.user_id, client_id = %client_id, released, revoked, "Revoked device");
        Ok(DeviceRevocation { released, revoked })
    }

    pub async fn list_devices(&self, user_id: &Uuid) -> Result<Vec<DeviceSession>, ServiceError> {
        let held = self.roles.assignments(user_id).await?;
        let mut devices = Vec::new();

        for session in self.registry().list_active(SessionKind::Device, user_id).await? {
            let holds_role = held
                .iter()
                .any(|(_, a)| a.client_id == session.holder && a.jti == session.jti);
            let last_activity = match self.tracker.get(&session.holder).await? {
                Some(record) if record.jti == session.jti => Some(record.last_ping),
                _ => None,
            };
            devices.push(DeviceSession {
                session,
                holds_role,
                last_activity,
            });
        }
        Ok(devices)
    }

    /// Every active session of a user, both kinds
    pub async fn list_sessions(&self, user_id: &Uuid) -> Result<Vec<ActiveSession>, ServiceError> {
        let mut sessions = self.registry().list_active(SessionKind::Account, user_id).await?;
        sessions.extend(self.registry().list_active(SessionKind::Device, user_id).await?);
        Ok(sessions)
    }

    /// Release all of a user's roles and revoke all their device credentials
    pub async fn revoke_user_devices(&self, user_id: &Uuid) -> Result<u64, ServiceError> {
        for (role, assignment) in self.roles.assignments(user_id).await? {
            self.roles.release(user_id, role, &assignment.client_id).await?;
        }
        let revoked = self.registry().revoke_all(SessionKind::Device, user_id).await?;
        info!(user_id = %user_id, revoked, "Revoked all device credentials");
        Ok(revoked)
    }

    /// Device liveness ping, authenticated by the device credential itself
    pub async fn heartbeat(&self, device_token: &str) -> Result<DeviceClientId, ServiceError> {
        let claims = self.gateway.verify_device(device_token).await?;
        if !self.tracker.heartbeat(claims.client_id.as_str(), Utc::now()).await? {
            return Err(ServiceError::NotFound(format!("no connection for {}", claims.client_id)));
        }
        Ok(claims.client_id)
    }

    /// Broker connect/disconnect notification. False when the device has no record.
    pub async fn connection_event(
        &self,
        kind: ConnectionEventKind,
        client_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let found = match kind {
            ConnectionEventKind::Connected => self.tracker.mark_connected(client_id, at).await?,
            ConnectionEventKind::Disconnected => self.tracker.mark_disconnected(client_id, at).await?,
        };
        Ok(found)
    }

    pub async fn authenticate(&self, client_id: &str, username: &str, password: &str) -> Decision {
        self.gateway.authenticate(client_id, username, password).await
    }

    pub async fn authorize(&self, client_id: &str, topic: &str, action: Action) -> Decision {
        self.gateway.authorize(client_id, topic, action).await
    }
}
