//! Active-session registry
//!
//! A credential is honored only while its registry entry exists and names
//! the same holder the credential claims. Deleting the entry is how a
//! session is logged out or kicked; the signed token itself stays
//! structurally valid until `exp`.

use crate::auth::claims::{Claims, Role, SessionKind};
use crate::auth::tokens::CredentialError;
use crate::auth::AuthError;
use crate::keys;
use crate::storage::{from_value, to_value, KeyedStore, StorageError, Transaction};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Registry record for one issued credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub kind: SessionKind,
    pub user_id: Uuid,
    pub jti: String,
    /// Client-session id (account) or device client id (device)
    pub holder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ActiveSession {
    pub fn for_claims<C: Claims>(claims: &C) -> Self {
        let created_at = Utc
            .timestamp_opt(claims.issued_at(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        let expires_at = Utc
            .timestamp_opt(claims.expires_at(), 0)
            .single()
            .unwrap_or(created_at);
        Self {
            kind: C::KIND,
            user_id: *claims.user_id(),
            jti: claims.jti().to_string(),
            holder: claims.holder().to_string(),
            role: claims.role(),
            created_at,
            expires_at,
        }
    }

    /// Time left until the credential expires, at least one second
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now)
            .to_std()
            .unwrap_or_default()
            .max(Duration::from_secs(1))
    }

    pub fn key(&self) -> String {
        keys::active(self.kind, &self.user_id, &self.jti)
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn KeyedStore>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self { store }
    }

    /// Record a freshly issued credential, TTL = its remaining lifetime
    pub async fn store<C: Claims>(&self, claims: &C) -> Result<(), StorageError> {
        let entry = ActiveSession::for_claims(claims);
        let tx = Transaction::new().put(
            entry.key(),
            to_value(&entry)?,
            Some(entry.remaining(Utc::now())),
        );
        self.store.commit(tx).await?;

        debug!(
            kind = %entry.kind,
            user_id = %entry.user_id,
            jti = %entry.jti,
            holder = %entry.holder,
            "Registered credential"
        );
        Ok(())
    }

    pub async fn lookup(
        &self,
        kind: SessionKind,
        user_id: &Uuid,
        jti: &str,
    ) -> Result<Option<ActiveSession>, StorageError> {
        match self.store.get(&keys::active(kind, user_id, jti)).await? {
            Some(value) => Ok(Some(from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Present and held by the same client the credential names
    pub async fn is_active<C: Claims>(&self, claims: &C) -> Result<bool, StorageError> {
        let entry = self.lookup(C::KIND, claims.user_id(), claims.jti()).await?;
        Ok(matches!(entry, Some(e) if e.holder == claims.holder()))
    }

    /// Like [`is_active`](Self::is_active) but reports absence as `NotActive`
    pub async fn ensure_active<C: Claims>(&self, claims: &C) -> Result<(), AuthError> {
        if self.is_active(claims).await? {
            Ok(())
        } else {
            Err(CredentialError::NotActive.into())
        }
    }

    /// Returns whether an entry was removed
    pub async fn revoke(
        &self,
        kind: SessionKind,
        user_id: &Uuid,
        jti: &str,
    ) -> Result<bool, StorageError> {
        let removed = self.store.delete(&keys::active(kind, user_id, jti)).await?;
        debug!(kind = %kind, user_id = %user_id, jti = %jti, removed, "Revoked credential");
        Ok(removed)
    }

    pub async fn revoke_all(&self, kind: SessionKind, user_id: &Uuid) -> Result<u64, StorageError> {
        let entries = self
            .store
            .scan_prefix(&keys::active_prefix(kind, user_id))
            .await?;

        let mut count = 0;
        for (key, _) in entries {
            if self.store.delete(&key).await? {
                count += 1;
            }
        }

        debug!(kind = %kind, user_id = %user_id, count, "Revoked all credentials");
        Ok(count)
    }

    pub async fn list_active(
        &self,
        kind: SessionKind,
        user_id: &Uuid,
    ) -> Result<Vec<ActiveSession>, StorageError> {
        let entries = self
            .store
            .scan_prefix(&keys::active_prefix(kind, user_id))
            .await?;

        let mut sessions = entries
            .into_iter()
            .map(|(_, value)| from_value::<ActiveSession>(value))
            .collect::<Result<Vec<_>, _>>()?;
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }
}
