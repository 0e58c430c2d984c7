//! Shared keyed store backing the session registry and role assignments
//!
//! - Memory: single-process store, used by tests and `--store memory`
//! - Postgres: durable store shared by every rolegate instance
//!
//! All multi-key mutations go through [`Transaction`], which applies as a
//! unit or not at all. Guards give optimistic concurrency: if a watched hash
//! field changed since it was read, the commit fails with
//! [`StorageError::Conflict`] and nothing is written.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};

pub use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("transaction conflict on '{0}'")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Precondition checked inside a transaction before any write is applied
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// The hash field must currently hold `expected` (`None` = absent)
    FieldEquals {
        key: String,
        field: String,
        expected: Option<Value>,
    },
}

/// A single write inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        key: String,
        value: Value,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    HashPut {
        key: String,
        field: String,
        value: Value,
    },
    HashDelete {
        key: String,
        field: String,
    },
    /// Set a time-to-live on a plain key or a whole hash
    Expire {
        key: String,
        ttl: Duration,
    },
    /// Append to the tail of a FIFO queue
    Enqueue {
        queue: String,
        value: Value,
    },
}

/// An all-or-nothing group of guarded writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    guards: Vec<Guard>,
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_field(
        mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        expected: Option<Value>,
    ) -> Self {
        self.guards.push(Guard::FieldEquals {
            key: key.into(),
            field: field.into(),
            expected,
        });
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: Value, ttl: Option<Duration>) -> Self {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete { key: key.into() });
        self
    }

    pub fn hash_put(mut self, key: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
        self.ops.push(WriteOp::HashPut {
            key: key.into(),
            field: field.into(),
            value,
        });
        self
    }

    pub fn hash_delete(mut self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.ops.push(WriteOp::HashDelete {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(WriteOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn enqueue(mut self, queue: impl Into<String>, value: Value) -> Self {
        self.ops.push(WriteOp::Enqueue {
            queue: queue.into(),
            value,
        });
        self
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Check if the transaction has no writes
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Keyed store with hashes, counters, FIFO queues and atomic transactions
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Read a plain key
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// All live plain keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError>;

    /// Read one field of a hash
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>, StorageError>;

    /// Read every field of a hash
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Value)>, StorageError>;

    /// Atomically increment a counter, refreshing its TTL. Starts at 1.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StorageError>;

    /// Delete a plain key, returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Apply a transaction atomically
    async fn commit(&self, tx: Transaction) -> Result<(), StorageError>;

    /// Pop the head of a queue without waiting
    async fn try_pop(&self, queue: &str) -> Result<Option<Value>, StorageError>;

    /// Wait with no timeout until the queue may hold an item. Consumes
    /// nothing, so dropping the future never loses work.
    async fn wait_for_item(&self, queue: &str) -> Result<(), StorageError>;

    /// Pop the head of a queue, waiting with no timeout until one exists.
    /// Not cancellation-safe: a dropped pop may have removed an item.
    async fn pop_blocking(&self, queue: &str) -> Result<Value, StorageError> {
        loop {
            if let Some(value) = self.try_pop(queue).await? {
                return Ok(value);
            }
            self.wait_for_item(queue).await?;
        }
    }

    /// Number of items waiting in a queue
    async fn queue_len(&self, queue: &str) -> Result<usize, StorageError>;

    /// Drop expired entries, returns how many were removed
    async fn purge_expired(&self) -> Result<u64, StorageError>;
}

/// Encode a record as a store value
pub fn to_value<T: Serialize>(record: &T) -> Result<Value, StorageError> {
    serde_json::to_value(record).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Decode a store value into a record
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}
