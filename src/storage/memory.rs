//! In-process keyed store
//!
//! One mutex guards every structure so a [`Transaction`] is trivially atomic.
//! TTLs use the tokio clock and are evicted lazily on access.

use crate::storage::{async_trait, Guard, KeyedStore, StorageError, Transaction, WriteOp};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Expiring<Value>>,
    hashes: HashMap<String, Expiring<HashMap<String, Value>>>,
    queues: HashMap<String, VecDeque<Value>>,
}

impl Inner {
    fn evict(&mut self, key: &str, now: Instant) {
        if self.values.get(key).is_some_and(|e| !e.is_live(now)) {
            self.values.remove(key);
        }
        if self.hashes.get(key).is_some_and(|e| !e.is_live(now)) {
            self.hashes.remove(key);
        }
    }

    fn hash_field(&mut self, key: &str, field: &str, now: Instant) -> Option<Value> {
        self.evict(key, now);
        self.hashes
            .get(key)
            .and_then(|h| h.value.get(field))
            .cloned()
    }

    fn check(&mut self, guard: &Guard, now: Instant) -> Result<(), StorageError> {
        match guard {
            Guard::FieldEquals {
                key,
                field,
                expected,
            } => {
                if self.hash_field(key, field, now).as_ref() != expected.as_ref() {
                    return Err(StorageError::Conflict(format!("{}/{}", key, field)));
                }
            }
        }
        Ok(())
    }

    /// Apply one write, returns true when a queue received an item
    fn apply(&mut self, op: WriteOp, now: Instant) -> bool {
        match op {
            WriteOp::Put { key, value, ttl } => {
                self.values.insert(key, Expiring::new(value, ttl));
            }
            WriteOp::Delete { key } => {
                self.values.remove(&key);
                self.hashes.remove(&key);
            }
            WriteOp::HashPut { key, field, value } => {
                self.evict(&key, now);
                self.hashes
                    .entry(key)
                    .or_insert_with(|| Expiring::new(HashMap::new(), None))
                    .value
                    .insert(field, value);
            }
            WriteOp::HashDelete { key, field } => {
                self.evict(&key, now);
                if let Some(hash) = self.hashes.get_mut(&key) {
                    hash.value.remove(&field);
                    if hash.value.is_empty() {
                        self.hashes.remove(&key);
                    }
                }
            }
            WriteOp::Expire { key, ttl } => {
                self.evict(&key, now);
                let at = Some(now + ttl);
                if let Some(entry) = self.values.get_mut(&key) {
                    entry.expires_at = at;
                }
                if let Some(entry) = self.hashes.get_mut(&key) {
                    entry.expires_at = at;
                }
            }
            WriteOp::Enqueue { queue, value } => {
                self.queues.entry(queue).or_default().push_back(value);
                return true;
            }
        }
        false
    }
}

/// Keyed store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    queue_signal: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut inner = self.inner.lock();
        inner.evict(key, Instant::now());
        Ok(inner.values.get(key).map(|e| e.value.clone()))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut entries: Vec<(String, Value)> = inner
            .values
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.inner.lock().hash_field(key, field, Instant::now()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let mut inner = self.inner.lock();
        inner.evict(key, Instant::now());
        let mut fields: Vec<(String, Value)> = inner
            .hashes
            .get(key)
            .map(|h| h.value.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(fields)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock();
        inner.evict(key, Instant::now());
        let current = match inner.values.get(key) {
            Some(entry) => entry.value.as_i64().ok_or_else(|| {
                StorageError::Serialization(format!("counter '{}' is not an integer", key))
            })?,
            None => 0,
        };
        let next = current + 1;
        inner
            .values
            .insert(key.to_string(), Expiring::new(Value::from(next), Some(ttl)));
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        inner.evict(key, Instant::now());
        let existed = inner.values.remove(key).is_some() | inner.hashes.remove(key).is_some();
        Ok(existed)
    }

    async fn commit(&self, tx: Transaction) -> Result<(), StorageError> {
        let Transaction { guards, ops } = tx;
        let mut enqueued = 0;
        {
            let now = Instant::now();
            let mut inner = self.inner.lock();
            for guard in &guards {
                inner.check(guard, now)?;
            }
            for op in ops {
                if inner.apply(op, now) {
                    enqueued += 1;
                }
            }
        }
        for _ in 0..enqueued {
            self.queue_signal.notify_one();
        }
        Ok(())
    }

    async fn try_pop(&self, queue: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .inner
            .lock()
            .queues
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }

    async fn wait_for_item(&self, queue: &str) -> Result<(), StorageError> {
        loop {
            if self.inner.lock().queues.get(queue).is_some_and(|q| !q.is_empty()) {
                return Ok(());
            }
            // notify_one stores a permit when nobody waits, so an enqueue
            // between the check above and this await is not lost
            self.queue_signal.notified().await;
        }
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, StorageError> {
        Ok(self.inner.lock().queues.get(queue).map_or(0, |q| q.len()))
    }

    async fn purge_expired(&self) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.values.len() + inner.hashes.len();
        inner.values.retain(|_, e| e.is_live(now));
        inner.hashes.retain(|_, e| e.is_live(now));
        let after = inner.values.len() + inner.hashes.len();
        Ok((before - after) as u64)
    }
}
