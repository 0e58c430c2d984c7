//! Device credential REST API, authenticated by an account session

use super::AppState;
use crate::auth::{AccountClaims, AuthError};
use crate::roles::{ConflictCheck, RoleError};
use crate::service::{DeviceIssue, DeviceTokenRequest, ServiceError};
use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

pub const NEW_TOKEN_HEADER: &str = "new-token";
pub const NEW_EXPIRES_AT_HEADER: &str = "new-expires-at";

const CODE_OK: i32 = 0;
const CODE_ERROR: i32 = 7;

/// Response body of every REST endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: i32,
    pub data: T,
    pub msg: String,
}

fn ok<T: Serialize>(data: T, msg: &str) -> Json<Envelope<T>> {
    Json(Envelope {
        code: CODE_OK,
        data,
        msg: msg.to_string(),
    })
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(ConflictCheck),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Auth(AuthError::Credential(e)) => ApiError::Unauthorized(e.user_message().to_string()),
            ServiceError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            ServiceError::Forbidden(msg) => ApiError::Forbidden(msg),
            ServiceError::NotFound(msg) => ApiError::NotFound(msg),
            ServiceError::Role(RoleError::Contended { .. }) => {
                ApiError::Unavailable("role is being reassigned, try again".to_string())
            }
            other => {
                error!(error = %other, "Request failed");
                ApiError::Internal("internal error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            ApiError::Conflict(check) => serde_json::json!({
                "code": CODE_ERROR,
                "data": check,
                "msg": "role is held by another device",
            }),
            ApiError::Unauthorized(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unavailable(msg)
            | ApiError::Internal(msg) => serde_json::json!({
                "code": CODE_ERROR,
                "data": {},
                "msg": msg,
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Credential from `x-token` or `Authorization: Bearer`
fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-token")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Require a live account session; hands out a successor credential in
/// response headers once the current one is inside its refresh buffer.
pub(crate) async fn require_account(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer(request.headers())
        .ok_or_else(|| ApiError::Unauthorized("not logged in or session invalid".to_string()))?
        .to_string();

    let claims = state.service.verify_account(&token).await?;
    let refreshed = state.service.refresh_account(&claims).await?;

    request.extensions_mut().insert(claims);
    let mut response = next.run(request).await;

    if let Some(next_session) = refreshed {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&next_session.token) {
            headers.insert(NEW_TOKEN_HEADER, value);
        }
        headers.insert(
            NEW_EXPIRES_AT_HEADER,
            HeaderValue::from(next_session.expires_at().timestamp()),
        );
    }
    Ok(response)
}

pub(crate) async fn issue_device_token(
    State(state): State<AppState>,
    Extension(account): Extension<AccountClaims>,
    Json(request): Json<DeviceTokenRequest>,
) -> Result<Response, ApiError> {
    match state.service.issue_device(&account, request).await? {
        DeviceIssue::Issued(token) => Ok(ok(token, "device credential issued").into_response()),
        DeviceIssue::Conflict(check) => Err(ApiError::Conflict(check)),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConflictQuery {
    role: String,
    #[serde(default)]
    client_id: Option<String>,
}

pub(crate) async fn check_conflict(
    State(state): State<AppState>,
    Extension(account): Extension<AccountClaims>,
    Json(query): Json<ConflictQuery>,
) -> Result<Response, ApiError> {
    let check = state
        .service
        .check_conflict(&account, &query.role, query.client_id.as_deref())
        .await?;
    Ok(ok(check, "conflict check complete").into_response())
}

pub(crate) async fn revoke_device_token(
    State(state): State<AppState>,
    Extension(account): Extension<AccountClaims>,
    Path(client_id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state.service.revoke_device(&account, &client_id).await?;
    Ok(ok(outcome, "device credential revoked").into_response())
}

pub(crate) async fn list_device_tokens(
    State(state): State<AppState>,
    Extension(account): Extension<AccountClaims>,
) -> Result<Response, ApiError> {
    let devices = state.service.list_devices(&account.user_id).await?;
    Ok(ok(devices, "ok").into_response())
}

pub(crate) async fn logout(
    State(state): State<AppState>,
    Extension(account): Extension<AccountClaims>,
) -> Result<Response, ApiError> {
    state.service.logout(&account).await?;
    Ok(ok(serde_json::json!({}), "logged out").into_response())
}

/// Device liveness ping; the bearer is the device credential
pub(crate) async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = bearer(&headers)
        .ok_or_else(|| ApiError::Unauthorized("missing device credential".to_string()))?;
    let client_id = state.service.heartbeat(token).await?;
    Ok(ok(serde_json::json!({ "client_id": client_id.as_str() }), "ok").into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialError;

    #[test]
    fn test_bearer_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer acct-abc"));
        assert_eq!(bearer(&headers), Some("acct-abc"));

        headers.insert("x-token", HeaderValue::from_static("acct-xyz"));
        assert_eq!(bearer(&headers), Some("acct-xyz"));
    }

    #[test]
    fn test_error_mapping() {
        let expired: ApiError = ServiceError::Auth(CredentialError::Expired.into()).into();
        assert_eq!(expired.status_code(), StatusCode::UNAUTHORIZED);

        let contended: ApiError = ServiceError::Role(RoleError::Contended { attempts: 5 }).into();
        assert_eq!(contended.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let forbidden: ApiError = ServiceError::Forbidden("x".into()).into();
        assert_eq!(forbidden.status_code(), StatusCode::FORBIDDEN);
    }
}
