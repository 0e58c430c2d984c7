//! HTTP surface: broker webhooks and the device credential REST API
//!
//! Webhooks always answer 200; a deny is expressed in the body. The broker
//! treats any other status as its own failure.

mod api;
mod webhooks;

pub use api::{ApiError, Envelope, NEW_EXPIRES_AT_HEADER, NEW_TOKEN_HEADER};
pub use webhooks::sanitize_undefined;

use crate::service::SessionService;
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SessionService>,
}

impl AppState {
    pub fn new(service: SessionService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let account_api = Router::new()
        .route("/device-tokens", post(api::issue_device_token).get(api::list_device_tokens))
        .route("/device-tokens/conflict", post(api::check_conflict))
        .route("/device-tokens/{client_id}", delete(api::revoke_device_token))
        .route("/session", delete(api::logout))
        .route_layer(middleware::from_fn_with_state(state.clone(), api::require_account));

    let api = account_api.route("/devices/heartbeat", post(api::heartbeat));

    Router::new()
        .route("/auth", post(webhooks::authenticate))
        .route("/acl", post(webhooks::authorize))
        .route("/hooks/connection_status", post(webhooks::connection_status))
        .nest("/api", api)
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

pub async fn run_server<F>(addr: SocketAddr, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}
