//! Shared test doubles

#![allow(dead_code)]

use parking_lot::Mutex;
use rolegate::auth::AccountClaims;
use rolegate::config::ServiceConfig;
use rolegate::service::{DeviceIssue, DeviceToken, DeviceTokenRequest, SessionService};
use rolegate::storage::{async_trait, KeyedStore, MemoryStore, StorageError, Transaction};
use rolegate::transport::{Transport, TransportError, TransportHandle};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TEST_SECRET: &[u8] = b"test-secret-for-integration-tests";

/// Records every broker call
#[derive(Default)]
pub struct RecordingTransport {
    pub published: Mutex<Vec<(String, Value)>>,
    pub disconnected: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        self.published.lock().push((topic.to_string(), value));
        Ok(())
    }

    async fn disconnect(&self, client_id: &str) -> Result<(), TransportError> {
        self.disconnected.lock().push(client_id.to_string());
        Ok(())
    }
}

/// Memory store whose every operation can be made to fail
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FailingStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Database("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyedStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.check()?;
        self.inner.get(key).await
    }
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        self.check()?;
        self.inner.scan_prefix(prefix).await
    }
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>, StorageError> {
        self.check()?;
        self.inner.hash_get(key, field).await
    }
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Value)>, StorageError> {
        self.check()?;
        self.inner.hash_get_all(key).await
    }
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StorageError> {
        self.check()?;
        self.inner.increment(key, ttl).await
    }
    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.delete(key).await
    }
    async fn commit(&self, tx: Transaction) -> Result<(), StorageError> {
        self.check()?;
        self.inner.commit(tx).await
    }
    async fn try_pop(&self, queue: &str) -> Result<Option<Value>, StorageError> {
        self.check()?;
        self.inner.try_pop(queue).await
    }
    async fn wait_for_item(&self, queue: &str) -> Result<(), StorageError> {
        self.check()?;
        self.inner.wait_for_item(queue).await
    }
    async fn queue_len(&self, queue: &str) -> Result<usize, StorageError> {
        self.check()?;
        self.inner.queue_len(queue).await
    }
    async fn purge_expired(&self) -> Result<u64, StorageError> {
        self.check()?;
        self.inner.purge_expired().await
    }
}

pub fn config() -> ServiceConfig {
    ServiceConfig {
        disconnect_backoff: Duration::from_millis(1),
        ..ServiceConfig::default()
    }
    .with_secret(TEST_SECRET)
}

pub fn service(store: Arc<dyn KeyedStore>, transport: Arc<RecordingTransport>) -> SessionService {
    SessionService::new(store, TransportHandle::new(transport), config())
}

pub async fn account(service: &SessionService, username: &str) -> AccountClaims {
    service
        .issue_account(Uuid::new_v4(), username)
        .await
        .unwrap()
        .claims
}

pub fn device_request(role: &str, force: bool) -> DeviceTokenRequest {
    DeviceTokenRequest {
        role: role.to_string(),
        force_takeover: force,
        ..Default::default()
    }
}

pub fn expect_issued(issue: DeviceIssue) -> DeviceToken {
    match issue {
        DeviceIssue::Issued(token) => token,
        DeviceIssue::Conflict(check) => panic!("unexpected conflict: {:?}", check),
    }
}

/// Poll `check` until it holds, failing after roughly two seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
