//! EMQX HTTP auth, ACL and connection-event hooks

use super::AppState;
use crate::auth::{Action, Decision};
use crate::service::ConnectionEventKind;
use axum::{body::Bytes, extract::State, Json};
use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

/// Replace bare `undefined` tokens with `null`. String contents are left alone.
pub fn sanitize_undefined(body: &str) -> String {
    const TOKEN: &str = "undefined";
    let mut out = String::with_capacity(body.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = body;

    while let Some(c) = rest.chars().next() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
        } else if c == '"' {
            in_string = true;
        } else if rest.starts_with(TOKEN) {
            out.push_str("null");
            rest = &rest[TOKEN.len()..];
            continue;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

fn parse_body<T: DeserializeOwned>(body: &Bytes, hook: &str) -> Option<T> {
    let text = String::from_utf8_lossy(body);
    match serde_json::from_str(&sanitize_undefined(&text)) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(hook, error = %e, "Unreadable webhook body");
            None
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct AuthRequest {
    clientid: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AuthResponse {
    result: Decision,
    is_superuser: bool,
}

pub(crate) async fn authenticate(State(state): State<AppState>, body: Bytes) -> Json<AuthResponse> {
    let result = match parse_body::<AuthRequest>(&body, "auth") {
        Some(AuthRequest {
            clientid: Some(client_id),
            username: Some(username),
            password: Some(password),
        }) => state.service.authenticate(&client_id, &username, &password).await,
        _ => Decision::Deny,
    };
    Json(AuthResponse {
        result,
        is_superuser: false,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct AclRequest {
    clientid: Option<String>,
    username: Option<String>,
    topic: Option<String>,
    action: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AclResponse {
    result: Decision,
}

pub(crate) async fn authorize(State(state): State<AppState>, body: Bytes) -> Json<AclResponse> {
    let Some(req) = parse_body::<AclRequest>(&body, "acl") else {
        return Json(AclResponse { result: Decision::Deny });
    };

    let action = req.action.as_deref().and_then(|a| a.parse::<Action>().ok());
    let result = match (req.clientid, req.topic, action) {
        (Some(client_id), Some(topic), Some(action)) => {
            state.service.authorize(&client_id, &topic, action).await
        }
        _ => {
            debug!(username = ?req.username, "ACL request missing fields");
            Decision::Deny
        }
    };
    Json(AclResponse { result })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ConnectionStatusRequest {
    #[serde(alias = "event")]
    event_type: Option<String>,
    clientid: Option<String>,
    username: Option<String>,
    /// Milliseconds since the epoch
    connected_at: Option<i64>,
    disconnected_at: Option<i64>,
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct HookAck {
    result: &'static str,
}

fn from_millis(ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

pub(crate) async fn connection_status(State(state): State<AppState>, body: Bytes) -> Json<HookAck> {
    let ack = Json(HookAck { result: "ok" });
    let Some(req) = parse_body::<ConnectionStatusRequest>(&body, "connection_status") else {
        return ack;
    };

    let kind = req.event_type.as_deref().and_then(ConnectionEventKind::parse);
    let (Some(kind), Some(client_id)) = (kind, req.clientid) else {
        debug!(event = ?req.event_type, "Ignoring connection event");
        return ack;
    };

    let at = match kind {
        ConnectionEventKind::Connected => from_millis(req.connected_at),
        ConnectionEventKind::Disconnected => from_millis(req.disconnected_at),
    };

    match state.service.connection_event(kind, &client_id, at).await {
        Ok(found) => debug!(
            client_id = %client_id,
            username = ?req.username,
            reason = ?req.reason,
            found,
            "Connection event"
        ),
        Err(e) => warn!(client_id = %client_id, error = %e, "Failed to record connection event"),
    }
    ack
}
