//! Runtime configuration shared by every component

use std::fmt;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Service tuning, built from CLI/env in `main` and from `Default` in tests
#[derive(Clone)]
pub struct ServiceConfig {
    /// HMAC key for account and device credentials
    pub token_secret: Vec<u8>,
    /// Lifetime of an account session credential
    pub account_ttl: Duration,
    /// Remaining lifetime under which an account credential is refreshed
    pub account_buffer: Duration,
    /// Lifetime of a device session credential
    pub device_ttl: Duration,
    /// TTL applied to role assignment hashes
    pub assignment_ttl: Duration,
    /// TTL of per-user device sequence counters
    pub sequence_ttl: Duration,
    /// First topic segment of every device topic
    pub topic_prefix: String,
    pub sweep_interval: Duration,
    /// A connection silent for longer than this is evicted
    pub stale_after: Duration,
    /// Attempts before a contended role assignment gives up
    pub assign_attempts: u32,
    /// Broker disconnect attempts per kick
    pub disconnect_attempts: u32,
    pub disconnect_backoff: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            token_secret: b"rolegate-development-secret".to_vec(),
            account_ttl: 7 * DAY,
            account_buffer: DAY,
            device_ttl: DAY,
            assignment_ttl: DAY,
            sequence_ttl: DAY,
            topic_prefix: "nfc_relay".to_string(),
            sweep_interval: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(10 * 60),
            assign_attempts: 5,
            disconnect_attempts: 3,
            disconnect_backoff: Duration::from_millis(500),
        }
    }
}

impl ServiceConfig {
    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.token_secret = secret.into();
        self
    }

    /// Parse a duration like `30s`, `10m`, `24h`, `7d` or plain seconds
    pub fn parse_duration(value: &str) -> Option<Duration> {
        let value = value.trim();
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, unit) = value.split_at(split);
        let n: u64 = digits.parse().ok()?;
        let unit = match unit {
            "" | "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => HOUR,
            "d" => DAY,
            _ => return None,
        };
        unit.checked_mul(u32::try_from(n).ok()?)
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("token_secret", &"[REDACTED]")
            .field("account_ttl", &self.account_ttl)
            .field("account_buffer", &self.account_buffer)
            .field("device_ttl", &self.device_ttl)
            .field("assignment_ttl", &self.assignment_ttl)
            .field("topic_prefix", &self.topic_prefix)
            .field("sweep_interval", &self.sweep_interval)
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}
