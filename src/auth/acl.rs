//! Topic access rules for device sessions
//!
//! Rules are evaluated in order and the first match allows. Nothing matches
//! means deny.
//!
//! | # | action    | topic                                         | who                      |
//! |---|-----------|-----------------------------------------------|--------------------------|
//! | 1 | publish   | `<p>/system/reports/...`                      | any device               |
//! | 2 | both      | `<p>/clients/<own client id>/...`             | the device itself        |
//! | 3 | publish   | `<p>/sync/<own username>/...`                 | transmitter and receiver |
//! | 4 | subscribe | `<p>/user/<own username>/notifications`       | devices of that user     |
//! |   |           | `<p>/user/<own username>/status_updates`      |                          |
//! | 5 | subscribe | `<p>/clients/...`, `<p>/user/...`             | admin                    |
//!
//! Notification, status and event topics are written by the server only;
//! no rule grants publish on them, admin included.

use crate::auth::claims::{validate_username, DeviceClientId};
use crate::topics::Topic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Publish,
    Subscribe,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish" | "pub" => Ok(Action::Publish),
            "subscribe" | "sub" => Ok(Action::Subscribe),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Publish => f.write_str("publish"),
            Action::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// Webhook verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// The rule that granted access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    SystemReport,
    OwnClient,
    PeerSync,
    OwnUserTopic,
    AdminRead,
}

const SYSTEM_REPORTS: [&str; 2] = ["system", "reports"];
const CLIENTS: &str = "clients";
const SYNC: &str = "sync";
const USER: &str = "user";
const USER_TOPICS: [&str; 2] = ["notifications", "status_updates"];

/// Topic rules rooted at a configurable prefix
#[derive(Debug, Clone)]
pub struct AclPolicy {
    prefix: Vec<String>,
}

impl AclPolicy {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    fn path(&self, rest: &[&str]) -> Vec<String> {
        let mut path = self.prefix.clone();
        path.extend(rest.iter().map(|s| s.to_string()));
        path
    }

    /// Full topic for a device's own namespace, e.g. its control channel
    pub fn client_topic(&self, client_id: &str, leaf: &str) -> String {
        self.path(&[CLIENTS, client_id, leaf]).join("/")
    }

    pub fn user_topic(&self, username: &str, leaf: &str) -> String {
        self.path(&[USER, username, leaf]).join("/")
    }

    /// First rule granting `action` on `topic` to `client`, if any
    pub fn evaluate(&self, client: &DeviceClientId, topic: &Topic, action: Action) -> Option<Rule> {
        let publish = action == Action::Publish;
        let username = client.username();

        // Own-identity levels below are compared literally; an identity that
        // reads as a wildcard would match every other user's topics
        if validate_username(username).is_err() {
            return None;
        }

        if publish && topic.is_under(&self.path(&SYSTEM_REPORTS)) {
            return Some(Rule::SystemReport);
        }

        if topic.is_under(&self.path(&[CLIENTS, client.as_str()])) {
            return Some(Rule::OwnClient);
        }

        if publish && client.role().is_peer() && topic.is_under(&self.path(&[SYNC, username])) {
            return Some(Rule::PeerSync);
        }

        if !publish
            && USER_TOPICS
                .iter()
                .any(|leaf| topic.is_exactly(&self.path(&[USER, username, *leaf])))
        {
            return Some(Rule::OwnUserTopic);
        }

        if !publish
            && client.role().is_privileged()
            && (topic.is_under(&self.path(&[CLIENTS])) || topic.is_under(&self.path(&[USER])))
        {
            return Some(Rule::AdminRead);
        }

        None
    }

    pub fn decide(&self, client: &DeviceClientId, topic: &Topic, action: Action) -> Decision {
        self.evaluate(client, topic, action).is_some().into()
    }
}

impl Default for AclPolicy {
    fn default() -> Self {
        Self::new("nfc_relay")
    }
}
