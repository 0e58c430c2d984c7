//! Outbound capability towards the MQTT broker
//!
//! The service never speaks MQTT itself. Notifications and forced disconnects
//! go through a [`Transport`], which may be absent: an unset
//! [`TransportHandle`] turns every call into a logged no-op.

mod broker;

pub use broker::{BrokerConfig, BrokerHttpTransport};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker request failed: {0}")]
    Request(String),

    #[error("broker rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` to `topic` on behalf of the server
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Drop the broker session of `client_id`. Unknown clients are not an error.
    async fn disconnect(&self, client_id: &str) -> Result<(), TransportError>;
}

/// Optional transport, set once at wiring time
#[derive(Clone, Default)]
pub struct TransportHandle {
    inner: Option<Arc<dyn Transport>>,
}

impl TransportHandle {
    pub fn unset() -> Self {
        Self { inner: None }
    }

    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Some(transport),
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        match &self.inner {
            Some(t) => t.publish(topic, payload).await,
            None => {
                debug!(topic = %topic, "No transport configured, dropping publish");
                Ok(())
            }
        }
    }

    pub async fn disconnect(&self, client_id: &str) -> Result<(), TransportError> {
        match &self.inner {
            Some(t) => t.disconnect(client_id).await,
            None => {
                debug!(client_id = %client_id, "No transport configured, skipping disconnect");
                Ok(())
            }
        }
    }
}

impl From<Arc<dyn Transport>> for TransportHandle {
    fn from(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport)
    }
}
