//! EMQX management API client

use super::{Transport, TransportError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// e.g. `http://emqx:18083`
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub timeout: Duration,
}

impl BrokerConfig {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Serialize)]
struct PublishBody<'a> {
    topic: &'a str,
    payload: String,
    payload_encoding: &'static str,
    qos: u8,
    retain: bool,
}

impl<'a> PublishBody<'a> {
    fn new(topic: &'a str, payload: &[u8]) -> Self {
        let (payload, payload_encoding) = match std::str::from_utf8(payload) {
            Ok(text) => (text.to_string(), "plain"),
            Err(_) => (STANDARD.encode(payload), "base64"),
        };
        Self {
            topic,
            payload,
            payload_encoding,
            qos: 1,
            retain: false,
        }
    }
}

pub struct BrokerHttpTransport {
    http: reqwest::Client,
    config: BrokerConfig,
}

impl BrokerHttpTransport {
    pub fn new(config: BrokerConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v5{}", self.config.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<(), TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Transport for BrokerHttpTransport {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let resp = self
            .http
            .post(self.url("/publish"))
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
            .json(&PublishBody::new(topic, payload))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Self::check(resp).await?;
        debug!(topic = %topic, "Published via broker API");
        Ok(())
    }

    async fn disconnect(&self, client_id: &str) -> Result<(), TransportError> {
        let resp = self
            .http
            .delete(self.url(&format!("/clients/{}", client_id)))
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!(client_id = %client_id, "Client already gone from broker");
            return Ok(());
        }
        Self::check(resp).await?;
        debug!(client_id = %client_id, "Disconnected via broker API");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let config = BrokerConfig::new("http://emqx:18083/", "key", "secret");
        let transport = BrokerHttpTransport::new(config).unwrap();
        assert_eq!(transport.url("/publish"), "http://emqx:18083/api/v5/publish");
    }

    #[test]
    fn test_publish_body_encoding() {
        let text = PublishBody::new("a/b", br#"{"type":"role_revoked"}"#);
        assert_eq!(text.payload_encoding, "plain");
        assert_eq!(text.payload, r#"{"type":"role_revoked"}"#);

        let binary = PublishBody::new("a/b", &[0xff, 0x00]);
        assert_eq!(binary.payload_encoding, "base64");
        assert_eq!(binary.payload, "/wA=");
    }
}
