//! Connection records and staleness eviction
//!
//! Every device that currently holds a role has one record in the
//! `connections` hash. The record is created by role assignment, refreshed
//! by heartbeats and broker connect/disconnect events, and removed by
//! release, takeover or the staleness sweep.

use crate::auth::Role;
use crate::keys;
use crate::roles::{Assignment, RoleHolder};
use crate::storage::{from_value, to_value, KeyedStore, StorageError, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    /// Credential the device was issued with this role
    pub jti: String,
    pub connected_at: DateTime<Utc>,
    /// Last heartbeat or broker event
    pub last_ping: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    pub fn new(user_id: Uuid, username: &str, role: Role, jti: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            username: username.to_string(),
            role,
            jti: jti.to_string(),
            connected_at: now,
            last_ping: now,
            disconnected_at: None,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match (now - self.last_ping).to_std() {
            Ok(age) => age > threshold,
            // last_ping in the future
            Err(_) => false,
        }
    }
}

/// Result of one sweep pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    pub roles_released: usize,
}

#[derive(Clone)]
pub struct ConnectionTracker {
    store: Arc<dyn KeyedStore>,
    max_attempts: u32,
}

impl ConnectionTracker {
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self {
            store,
            max_attempts: 5,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub async fn get(&self, client_id: &str) -> Result<Option<ConnectionRecord>, StorageError> {
        match self.store.hash_get(keys::CONNECTIONS, client_id).await? {
            Some(value) => Ok(Some(from_value(value)?)),
            None => Ok(None),
        }
    }

    /// All records that still decode; corrupt entries are skipped
    pub async fn all(&self) -> Result<Vec<(String, ConnectionRecord)>, StorageError> {
        Ok(self
            .raw_records()
            .await?
            .into_iter()
            .map(|(id, _, record)| (id, record))
            .collect())
    }

    async fn raw_records(&self) -> Result<Vec<(String, Value, ConnectionRecord)>, StorageError> {
        let entries = self.store.hash_get_all(keys::CONNECTIONS).await?;
        let mut records = Vec::with_capacity(entries.len());
        for (client_id, value) in entries {
            match from_value::<ConnectionRecord>(value.clone()) {
                Ok(record) => records.push((client_id, value, record)),
                Err(e) => warn!(client_id = %client_id, error = %e, "Skipping unreadable connection record"),
            }
        }
        Ok(records)
    }

    /// Guarded read-modify-write of one record. Returns false if absent.
    async fn update<F>(&self, client_id: &str, mut apply: F) -> Result<bool, StorageError>
    where
        F: FnMut(&mut ConnectionRecord) + Send,
    {
        for _ in 0..self.max_attempts {
            let Some(raw) = self.store.hash_get(keys::CONNECTIONS, client_id).await? else {
                return Ok(false);
            };
            let mut record: ConnectionRecord = from_value(raw.clone())?;
            apply(&mut record);

            let tx = Transaction::new()
                .expect_field(keys::CONNECTIONS, client_id, Some(raw))
                .hash_put(keys::CONNECTIONS, client_id, to_value(&record)?);

            match self.store.commit(tx).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::Conflict(format!("{}/{}", keys::CONNECTIONS, client_id)))
    }

    /// Refresh last-ping. False when the device holds no connection record.
    pub async fn heartbeat(&self, client_id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let found = self
            .update(client_id, |record| {
                record.last_ping = now;
            })
            .await?;
        debug!(client_id = %client_id, found, "Heartbeat");
        Ok(found)
    }

    pub async fn mark_connected(&self, client_id: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        self.update(client_id, |record| {
            record.last_ping = at;
            record.disconnected_at = None;
        })
        .await
    }

    /// The record stays; staleness is measured from the disconnect
    pub async fn mark_disconnected(&self, client_id: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        self.update(client_id, |record| {
            record.last_ping = at;
            record.disconnected_at = Some(at);
        })
        .await
    }

    /// Remove every record silent for longer than `threshold` and release the
    /// roles they hold, as a single transaction. The whole pass is retried
    /// when a concurrent write touches any of the same entries.
    pub async fn sweep_stale(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<SweepReport, StorageError> {
        for attempt in 1..=self.max_attempts {
            let stale: Vec<_> = self
                .raw_records()
                .await?
                .into_iter()
                .filter(|(_, _, record)| record.is_stale(now, threshold))
                .collect();

            if stale.is_empty() {
                return Ok(SweepReport::default());
            }

            let mut tx = Transaction::new();
            let mut report = SweepReport::default();

            for (client_id, raw, record) in stale {
                tx = tx
                    .expect_field(keys::CONNECTIONS, &client_id, Some(raw))
                    .hash_delete(keys::CONNECTIONS, &client_id);

                let roles_key = keys::roles(&record.user_id);
                let role_field = record.role.as_str();
                if let Some(raw) = self.store.hash_get(&roles_key, role_field).await? {
                    let held = from_value::<Assignment>(raw.clone())
                        .map(|a| a.client_id == client_id)
                        .unwrap_or(false);
                    if held {
                        tx = tx
                            .expect_field(&roles_key, role_field, Some(raw))
                            .hash_delete(&roles_key, role_field);
                        report.roles_released += 1;
                    }
                }

                let holders_key = keys::role_holders(record.role);
                let user_field = record.user_id.to_string();
                if let Some(raw) = self.store.hash_get(&holders_key, &user_field).await? {
                    let held = from_value::<RoleHolder>(raw.clone())
                        .map(|h| h.client_id == client_id)
                        .unwrap_or(false);
                    if held {
                        tx = tx
                            .expect_field(&holders_key, &user_field, Some(raw))
                            .hash_delete(&holders_key, &user_field);
                    }
                }

                report.evicted.push(client_id);
            }

            match self.store.commit(tx).await {
                Ok(()) => {
                    info!(
                        evicted = report.evicted.len(),
                        roles_released = report.roles_released,
                        "Evicted stale connections"
                    );
                    return Ok(report);
                }
                Err(e) if e.is_conflict() => {
                    debug!(attempt, "Sweep raced a concurrent update, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::Conflict(keys::CONNECTIONS.to_string()))
    }
}
