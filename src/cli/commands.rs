//! CLI command definitions

use clap::{Args, Parser, Subcommand, ValueEnum};
use rolegate::config::ServiceConfig;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rolegate")]
#[command(about = "Device credentials, role arbitration and broker ACL webhooks", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Backing store
    #[arg(long, value_enum, env = "ROLEGATE_STORE", default_value = "postgres", global = true)]
    pub store: StoreKind,

    /// Database URL (postgres store)
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Credential signing secret
    #[arg(long, env = "ROLEGATE_SECRET", global = true, hide_env_values = true)]
    pub secret: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// In-process, lost on exit
    Memory,
    Postgres,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the webhook and REST server
    Serve(ServeArgs),

    /// Issue an account session credential
    ///
    /// Example:
    ///   rolegate account-token --user-id 3f0c... --username alice
    AccountToken {
        #[arg(long)]
        user_id: uuid::Uuid,

        #[arg(long)]
        username: String,
    },

    /// Release every role of a user and revoke their device credentials
    RevokeUser {
        #[arg(long)]
        user_id: uuid::Uuid,
    },

    /// List a user's active sessions
    Sessions {
        #[arg(long)]
        user_id: uuid::Uuid,
    },

    /// Initialize the database schema
    Init,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8888", env = "ROLEGATE_BIND")]
    pub bind: String,

    /// First topic segment of every device topic
    #[arg(long, default_value = "nfc_relay", env = "ROLEGATE_TOPIC_PREFIX")]
    pub topic_prefix: String,

    /// Account credential lifetime (e.g. 7d)
    #[arg(long, default_value = "7d", value_parser = parse_duration, env = "ROLEGATE_ACCOUNT_TTL")]
    pub account_ttl: Duration,

    /// Remaining account lifetime that triggers a refresh
    #[arg(long, default_value = "1d", value_parser = parse_duration, env = "ROLEGATE_ACCOUNT_BUFFER")]
    pub account_buffer: Duration,

    /// Device credential lifetime
    #[arg(long, default_value = "24h", value_parser = parse_duration, env = "ROLEGATE_DEVICE_TTL")]
    pub device_ttl: Duration,

    /// TTL of role assignment records
    #[arg(long, default_value = "24h", value_parser = parse_duration, env = "ROLEGATE_ASSIGNMENT_TTL")]
    pub assignment_ttl: Duration,

    #[arg(long, default_value = "5m", value_parser = parse_duration, env = "ROLEGATE_SWEEP_INTERVAL")]
    pub sweep_interval: Duration,

    /// Connections silent for longer are evicted
    #[arg(long, default_value = "10m", value_parser = parse_duration, env = "ROLEGATE_STALE_AFTER")]
    pub stale_after: Duration,

    /// Broker management API, e.g. http://emqx:18083
    #[arg(long, env = "ROLEGATE_BROKER_URL")]
    pub broker_url: Option<String>,

    #[arg(long, env = "ROLEGATE_BROKER_API_KEY", default_value = "")]
    pub broker_api_key: String,

    #[arg(long, env = "ROLEGATE_BROKER_API_SECRET", default_value = "", hide_env_values = true)]
    pub broker_api_secret: String,
}

impl ServeArgs {
    pub fn service_config(&self, secret: Vec<u8>) -> ServiceConfig {
        ServiceConfig {
            token_secret: secret,
            account_ttl: self.account_ttl,
            account_buffer: self.account_buffer,
            device_ttl: self.device_ttl,
            assignment_ttl: self.assignment_ttl,
            topic_prefix: self.topic_prefix.clone(),
            sweep_interval: self.sweep_interval,
            stale_after: self.stale_after,
            ..ServiceConfig::default()
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    ServiceConfig::parse_duration(s)
        .ok_or_else(|| format!("Invalid duration: {}. Use e.g. 30s, 10m, 24h, 7d", s))
}
