//! Broker-facing decisions: connect authentication and per-topic ACL
//!
//! Every failure path denies. Storage errors are logged at error level and
//! also deny; an unavailable store never opens access.

use crate::auth::{
    AclPolicy, Action, AuthError, Claims, Credentials, Decision, DeviceClaims, DeviceClientId,
    SessionKind,
};
use crate::storage::StorageError;
use crate::topics::Topic;
use crate::tracker::ConnectionTracker;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct Gateway {
    credentials: Credentials,
    tracker: ConnectionTracker,
    policy: AclPolicy,
}

impl Gateway {
    pub fn new(credentials: Credentials, tracker: ConnectionTracker, policy: AclPolicy) -> Self {
        Self {
            credentials,
            tracker,
            policy,
        }
    }

    pub fn policy(&self) -> &AclPolicy {
        &self.policy
    }

    /// Connect check. `password` carries the device credential.
    pub async fn authenticate(&self, client_id: &str, username: &str, password: &str) -> Decision {
        let claims: DeviceClaims = match self.credentials.codec().decode(password) {
            Ok(c) => c,
            Err(e) => {
                info!(client_id = %client_id, reason = %e.user_message(), "Connect denied");
                return Decision::Deny;
            }
        };

        if claims.client_id.as_str() != client_id || claims.username != username {
            info!(
                client_id = %client_id,
                username = %username,
                claimed_client_id = %claims.client_id,
                "Connect denied: credential issued to another identity"
            );
            return Decision::Deny;
        }

        match self.credentials.registry().ensure_active(&claims).await {
            Ok(()) => {
                debug!(client_id = %client_id, "Connect allowed");
                Decision::Allow
            }
            Err(AuthError::Credential(e)) => {
                info!(client_id = %client_id, reason = %e.user_message(), "Connect denied");
                Decision::Deny
            }
            Err(AuthError::Storage(e)) => {
                error!(client_id = %client_id, error = %e, "Connect denied: registry unavailable");
                Decision::Deny
            }
        }
    }

    /// Publish/subscribe check for a connected device
    pub async fn authorize(&self, client_id: &str, topic: &str, action: Action) -> Decision {
        let client = match DeviceClientId::parse(client_id) {
            Ok(c) => c,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "ACL denied: not a device client id");
                return Decision::Deny;
            }
        };

        let parsed = match action {
            Action::Subscribe => Topic::parse_filter(topic),
            Action::Publish => Topic::parse_name(topic),
        };
        let topic = match parsed {
            Ok(t) => t,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "ACL denied: invalid topic");
                return Decision::Deny;
            }
        };

        let Some(rule) = self.policy.evaluate(&client, &topic, action) else {
            debug!(client_id = %client_id, topic = %topic, action = %action, "ACL denied: no rule");
            return Decision::Deny;
        };

        match self.session_live(&client).await {
            Ok(true) => {
                debug!(client_id = %client_id, topic = %topic, action = %action, rule = ?rule, "ACL allowed");
                Decision::Allow
            }
            Ok(false) => {
                info!(client_id = %client_id, topic = %topic, "ACL denied: session no longer active");
                Decision::Deny
            }
            Err(e) => {
                error!(client_id = %client_id, error = %e, "ACL denied: store unavailable");
                Decision::Deny
            }
        }
    }

    /// The device still has a connection record whose credential is active
    async fn session_live(&self, client: &DeviceClientId) -> Result<bool, StorageError> {
        let Some(record) = self.tracker.get(client.as_str()).await? else {
            return Ok(false);
        };
        let entry = self
            .credentials
            .registry()
            .lookup(SessionKind::Device, &record.user_id, &record.jti)
            .await?;
        Ok(matches!(entry, Some(e) if e.holder == client.as_str()))
    }

    /// Verify a device bearer credential outside the broker path
    pub async fn verify_device(&self, token: &str) -> Result<DeviceClaims, AuthError> {
        let claims: DeviceClaims = self.credentials.verify(token).await?;
        debug!(client_id = %claims.holder(), "Device credential verified");
        Ok(claims)
    }
}
