//! rolegate - device credentials and role arbitration for an MQTT fleet
//!
//! Users exchange an account session for a role-scoped device credential.
//! Each (user, role) is held by one device at a time; a new device may take
//! the role over, which queues a kick for the old one. The broker calls the
//! HTTP webhooks on every connect, publish and subscribe.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod keys;
pub mod roles;
pub mod server;
pub mod service;
pub mod storage;
pub mod topics;
pub mod tracker;
pub mod transport;
pub mod worker;

pub use auth::{Action, Decision, Role};
pub use config::ServiceConfig;
pub use service::SessionService;
pub use storage::{KeyedStore, MemoryStore};
