//! Single consumer of the kick queue

use crate::auth::{AclPolicy, Role, SessionKind, SessionRegistry};
use crate::config::ServiceConfig;
use crate::keys;
use crate::roles::KickNotification;
use crate::storage::{from_value, KeyedStore, StorageError};
use crate::tracker::ConnectionTracker;
use crate::transport::TransportHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const REVOKE_ATTEMPTS: u32 = 5;

/// Control message pushed to the evicted device
#[derive(Debug, Serialize)]
struct RoleRevoked<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    revoked_role: Role,
    reason: &'a str,
    kicked_by_client_id: &'a str,
    timestamp: DateTime<Utc>,
}

/// What happened to one kick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KickReport {
    pub notified: bool,
    pub disconnected: bool,
    pub revoked: bool,
}

#[derive(Clone)]
pub struct KickWorker {
    store: Arc<dyn KeyedStore>,
    registry: SessionRegistry,
    tracker: ConnectionTracker,
    transport: TransportHandle,
    policy: AclPolicy,
    disconnect_attempts: u32,
    disconnect_backoff: Duration,
}

impl KickWorker {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        registry: SessionRegistry,
        tracker: ConnectionTracker,
        transport: TransportHandle,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            registry,
            tracker,
            transport,
            policy: AclPolicy::new(&config.topic_prefix),
            disconnect_attempts: config.disconnect_attempts.max(1),
            disconnect_backoff: config.disconnect_backoff,
        }
    }

    /// Drain the queue until `shutdown` flips. Shutdown interrupts only the
    /// wait for work; a pop that has started is always carried through
    /// `process`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Kick worker started");
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let waited = tokio::select! {
                _ = shutdown.changed() => break,
                waited = self.store.wait_for_item(keys::KICK_QUEUE) => waited,
            };

            let popped = match waited {
                Ok(()) => self.store.try_pop(keys::KICK_QUEUE).await,
                Err(e) => Err(e),
            };

            match popped {
                Ok(Some(value)) => {
                    backoff = INITIAL_BACKOFF;
                    match from_value::<KickNotification>(value) {
                        Ok(kick) => {
                            self.process(&kick).await;
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed kick notification"),
                    }
                }
                // Another consumer took it first
                Ok(None) => backoff = INITIAL_BACKOFF,
                Err(e) => {
                    error!(error = %e, retry_in = ?backoff, "Failed to read kick queue");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        info!("Kick worker stopped");
    }

    /// Notify, disconnect, then revoke. Only the revocation is mandatory.
    pub async fn process(&self, kick: &KickNotification) -> KickReport {
        info!(
            target_client_id = %kick.target_client_id,
            kicker_client_id = %kick.kicker_client_id,
            role = %kick.role,
            "Processing kick"
        );

        let notified = self.notify(kick).await;
        let disconnected = self.disconnect(&kick.target_client_id).await;
        let revoked = self.revoke_with_retry(kick).await;

        KickReport {
            notified,
            disconnected,
            revoked,
        }
    }

    async fn notify(&self, kick: &KickNotification) -> bool {
        let message = RoleRevoked {
            kind: "role_revoked",
            revoked_role: kick.role,
            reason: &kick.reason,
            kicked_by_client_id: &kick.kicker_client_id,
            timestamp: Utc::now(),
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to encode kick notification");
                return false;
            }
        };

        let topic = self.policy.client_topic(&kick.target_client_id, "control");
        match self.transport.publish(&topic, &payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(client_id = %kick.target_client_id, error = %e, "Kick notification not delivered");
                false
            }
        }
    }

    async fn disconnect(&self, client_id: &str) -> bool {
        for attempt in 1..=self.disconnect_attempts {
            match self.transport.disconnect(client_id).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(client_id = %client_id, attempt, error = %e, "Broker disconnect failed");
                    if attempt < self.disconnect_attempts {
                        tokio::time::sleep(self.disconnect_backoff * attempt).await;
                    }
                }
            }
        }
        false
    }

    async fn revoke_with_retry(&self, kick: &KickNotification) -> bool {
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=REVOKE_ATTEMPTS {
            match self.revoke(kick).await {
                Ok(revoked) => return revoked,
                Err(e) => {
                    error!(client_id = %kick.target_client_id, attempt, error = %e, "Kick revocation failed");
                    if attempt < REVOKE_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
        false
    }

    async fn revoke(&self, kick: &KickNotification) -> Result<bool, StorageError> {
        let jti = match &kick.jti {
            Some(jti) => jti.clone(),
            // Older entries carry no jti; only a record still owned by the
            // evicted user can name it
            None => match self.tracker.get(&kick.target_client_id).await? {
                Some(record) if record.user_id == kick.user_id => record.jti,
                _ => {
                    debug!(client_id = %kick.target_client_id, "No connection record, nothing to revoke");
                    return Ok(false);
                }
            },
        };

        let revoked = self
            .registry
            .revoke(SessionKind::Device, &kick.user_id, &jti)
            .await?;
        info!(client_id = %kick.target_client_id, user_id = %kick.user_id, revoked, "Revoked kicked device credential");
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DeviceClaims, DeviceClientId};
    use crate::roles::REASON_ROLE_TAKEN;
    use crate::storage::{to_value, MemoryStore, Transaction};
    use crate::transport::{Transport, TransportError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<(String, serde_json::Value)>>,
        disconnects: Mutex<u32>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Request("broker down".into()));
            }
            let value = serde_json::from_slice(payload).unwrap();
            self.published.lock().push((topic.to_string(), value));
            Ok(())
        }

        async fn disconnect(&self, _client_id: &str) -> Result<(), TransportError> {
            *self.disconnects.lock() += 1;
            if self.fail {
                return Err(TransportError::Request("broker down".into()));
            }
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<dyn KeyedStore>,
        registry: SessionRegistry,
        recorder: Arc<Recorder>,
        worker: KickWorker,
    }

    fn fixture(fail: bool) -> Fixture {
        let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(store.clone());
        let recorder = Arc::new(Recorder {
            fail,
            ..Default::default()
        });
        let config = ServiceConfig {
            disconnect_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let worker = KickWorker::new(
            store.clone(),
            registry.clone(),
            ConnectionTracker::new(store.clone()),
            TransportHandle::new(recorder.clone()),
            &config,
        );
        Fixture {
            store,
            registry,
            recorder,
            worker,
        }
    }

    fn device(user: Uuid) -> DeviceClaims {
        DeviceClaims::new(
            user,
            DeviceClientId::new("alice", Role::Transmitter, 1).unwrap(),
            Duration::from_secs(3600),
        )
    }

    fn kick_for(claims: &DeviceClaims, jti: Option<String>) -> KickNotification {
        KickNotification {
            target_client_id: claims.client_id.as_str().to_string(),
            kicker_client_id: "alice-transmitter-002".into(),
            user_id: claims.user_id,
            role: Role::Transmitter,
            jti,
            reason: REASON_ROLE_TAKEN.into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_process_notifies_and_revokes() {
        let f = fixture(false);
        let claims = device(Uuid::new_v4());
        f.registry.store(&claims).await.unwrap();

        let report = f.worker.process(&kick_for(&claims, Some(claims.jti.clone()))).await;
        assert_eq!(
            report,
            KickReport {
                notified: true,
                disconnected: true,
                revoked: true
            }
        );
        assert!(!f.registry.is_active(&claims).await.unwrap());

        let published = f.recorder.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "nfc_relay/clients/alice-transmitter-001/control");
        assert_eq!(published[0].1["type"], "role_revoked");
        assert_eq!(published[0].1["revoked_role"], "transmitter");
        assert_eq!(published[0].1["kicked_by_client_id"], "alice-transmitter-002");
    }

    #[tokio::test]
    async fn test_delivery_failure_still_revokes() {
        let f = fixture(true);
        let claims = device(Uuid::new_v4());
        f.registry.store(&claims).await.unwrap();

        let report = f.worker.process(&kick_for(&claims, Some(claims.jti.clone()))).await;
        assert!(!report.notified);
        assert!(!report.disconnected);
        assert!(report.revoked);
        assert_eq!(*f.recorder.disconnects.lock(), 3);
        assert!(!f.registry.is_active(&claims).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_jti_without_record_is_noop() {
        let f = fixture(false);
        let claims = device(Uuid::new_v4());
        f.registry.store(&claims).await.unwrap();

        let report = f.worker.process(&kick_for(&claims, None)).await;
        assert!(!report.revoked);
        assert!(f.registry.is_active(&claims).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops() {
        let f = fixture(false);
        let claims = device(Uuid::new_v4());
        f.registry.store(&claims).await.unwrap();

        let kick = kick_for(&claims, Some(claims.jti.clone()));
        f.store
            .commit(
                Transaction::new()
                    .enqueue(keys::KICK_QUEUE, serde_json::json!({"garbage": true}))
                    .enqueue(keys::KICK_QUEUE, to_value(&kick).unwrap()),
            )
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.worker.clone().run(rx));

        for _ in 0..100 {
            if !f.registry.is_active(&claims).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.registry.is_active(&claims).await.unwrap());
        assert_eq!(f.store.queue_len(keys::KICK_QUEUE).await.unwrap(), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// Memory store whose pops stall until released
    #[derive(Default)]
    struct StalledPop {
        inner: MemoryStore,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl KeyedStore for StalledPop {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
            self.inner.get(key).await
        }
        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>, StorageError> {
            self.inner.scan_prefix(prefix).await
        }
        async fn hash_get(&self, key: &str, field: &str) -> Result<Option<serde_json::Value>, StorageError> {
            self.inner.hash_get(key, field).await
        }
        async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, serde_json::Value)>, StorageError> {
            self.inner.hash_get_all(key).await
        }
        async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StorageError> {
            self.inner.increment(key, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key).await
        }
        async fn commit(&self, tx: Transaction) -> Result<(), StorageError> {
            self.inner.commit(tx).await
        }
        async fn try_pop(&self, queue: &str) -> Result<Option<serde_json::Value>, StorageError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.try_pop(queue).await
        }
        async fn wait_for_item(&self, queue: &str) -> Result<(), StorageError> {
            self.inner.wait_for_item(queue).await
        }
        async fn queue_len(&self, queue: &str) -> Result<usize, StorageError> {
            self.inner.queue_len(queue).await
        }
        async fn purge_expired(&self) -> Result<u64, StorageError> {
            self.inner.purge_expired().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_pop_still_processes_kick() {
        let stalled = Arc::new(StalledPop::default());
        let store: Arc<dyn KeyedStore> = stalled.clone();
        let registry = SessionRegistry::new(store.clone());
        let worker = KickWorker::new(
            store.clone(),
            registry.clone(),
            ConnectionTracker::new(store.clone()),
            TransportHandle::unset(),
            &ServiceConfig::default(),
        );

        let claims = device(Uuid::new_v4());
        registry.store(&claims).await.unwrap();
        let kick = kick_for(&claims, Some(claims.jti.clone()));
        store
            .commit(Transaction::new().enqueue(keys::KICK_QUEUE, to_value(&kick).unwrap()))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        // Shutdown arrives while the pop is in flight
        stalled.entered.notified().await;
        tx.send(true).unwrap();
        stalled.release.notify_one();
        handle.await.unwrap();

        assert!(!registry.is_active(&claims).await.unwrap());
        assert_eq!(store.queue_len(keys::KICK_QUEUE).await.unwrap(), 0);
    }
}
