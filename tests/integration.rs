//! End-to-end flows through the service and the HTTP surface

mod common;

use common::*;
use rolegate::auth::{Action, Decision};
use rolegate::keys;
use rolegate::server::{serve, AppState, Envelope};
use rolegate::service::DeviceIssue;
use rolegate::storage::{KeyedStore, MemoryStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[tokio::test]
async fn test_takeover_scenario() {
    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::default());
    let service = service(store.clone(), transport.clone());
    let user = account(&service, "alice").await;

    // A acquires the role with no prior holder
    let a = expect_issued(service.issue_device(&user, device_request("transmitter", false)).await.unwrap());
    assert_eq!(service.authenticate(&a.client_id, "alice", &a.token).await, Decision::Allow);
    let a_control = format!("nfc_relay/clients/{}/control", a.client_id);
    assert_eq!(service.authorize(&a.client_id, &a_control, Action::Subscribe).await, Decision::Allow);

    // B without force: conflict, A untouched
    match service.issue_device(&user, device_request("transmitter", false)).await.unwrap() {
        DeviceIssue::Conflict(check) => {
            assert!(check.has_conflict);
            assert!(check.can_force_kick);
            assert_eq!(check.conflict_device.unwrap().client_id, a.client_id);
        }
        DeviceIssue::Issued(t) => panic!("expected conflict, got {}", t.client_id),
    }
    assert_eq!(service.authenticate(&a.client_id, "alice", &a.token).await, Decision::Allow);
    assert_eq!(store.queue_len(keys::KICK_QUEUE).await.unwrap(), 0);

    // B with force: A is queued for eviction, B holds the role
    let b = expect_issued(service.issue_device(&user, device_request("transmitter", true)).await.unwrap());
    assert_ne!(a.client_id, b.client_id);
    assert_eq!(store.queue_len(keys::KICK_QUEUE).await.unwrap(), 1);

    let holder = service
        .roles()
        .holder(&user.user_id, rolegate::Role::Transmitter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(holder.client_id, b.client_id);

    // The evicted device loses ACL access at once: its connection record is gone
    assert_eq!(service.authorize(&a.client_id, &a_control, Action::Subscribe).await, Decision::Deny);

    let background = service.spawn_background();
    let (svc, evicted) = (&service, &a);
    eventually(move || async move {
        svc.authenticate(&evicted.client_id, "alice", &evicted.token).await == Decision::Deny
    })
    .await;
    background.shutdown().await;

    assert_eq!(store.queue_len(keys::KICK_QUEUE).await.unwrap(), 0);
    assert_eq!(service.authenticate(&b.client_id, "alice", &b.token).await, Decision::Allow);
    let b_control = format!("nfc_relay/clients/{}/control", b.client_id);
    assert_eq!(service.authorize(&b.client_id, &b_control, Action::Publish).await, Decision::Allow);

    let published = transport.published.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, a_control);
    assert_eq!(published[0].1["type"], "role_revoked");
    assert_eq!(published[0].1["kicked_by_client_id"], b.client_id.as_str());
    assert_eq!(*transport.disconnected.lock(), vec![a.client_id.clone()]);
}

#[tokio::test]
async fn test_user_topics_between_users() {
    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
    let service = service(store, Arc::new(RecordingTransport::default()));

    let alice = account(&service, "alice").await;
    let bob = account(&service, "bob").await;
    let root = account(&service, "root").await;

    let a = expect_issued(service.issue_device(&alice, device_request("receiver", false)).await.unwrap());
    let b = expect_issued(service.issue_device(&bob, device_request("receiver", false)).await.unwrap());
    let admin = expect_issued(service.issue_device(&root, device_request("admin", false)).await.unwrap());

    let alice_notes = "nfc_relay/user/alice/notifications";
    assert_eq!(service.authorize(&a.client_id, alice_notes, Action::Subscribe).await, Decision::Allow);
    assert_eq!(service.authorize(&b.client_id, alice_notes, Action::Subscribe).await, Decision::Deny);
    assert_eq!(service.authorize(&admin.client_id, alice_notes, Action::Subscribe).await, Decision::Allow);

    for id in [&a.client_id, &b.client_id, &admin.client_id] {
        assert_eq!(service.authorize(id, alice_notes, Action::Publish).await, Decision::Deny);
    }
    assert_eq!(
        service
            .authorize(&a.client_id, "nfc_relay/user/alice/notifications/extra", Action::Subscribe)
            .await,
        Decision::Deny
    );
    assert_eq!(
        service.authorize(&a.client_id, "nfc_relay/user/alice", Action::Subscribe).await,
        Decision::Deny
    );
}

struct TestServer {
    base: String,
    http: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn start(service: rolegate::SessionService) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve(listener, AppState::new(service), async {
            let _ = stopped.await;
        }));
        Self {
            base: format!("http://{}", addr),
            http: reqwest::Client::new(),
            stop: Some(stop),
            handle,
        }
    }

    async fn post(&self, path: &str, body: &str) -> Value {
        let resp = self
            .http
            .post(format!("{}{}", self.base, path))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "webhooks always answer 200");
        resp.json().await.unwrap()
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_http_surface() {
    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
    let service = service(store, Arc::new(RecordingTransport::default()));
    let issued = service.issue_account(uuid::Uuid::new_v4(), "alice").await.unwrap();
    let server = TestServer::start(service).await;

    let health = server.http.get(format!("{}/health", server.base)).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "ok");

    // No account credential
    let resp = server
        .http
        .post(format!("{}/api/device-tokens", server.base))
        .json(&json!({"role": "receiver"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Issue a device credential
    let resp = server
        .http
        .post(format!("{}/api/device-tokens", server.base))
        .header("x-token", &issued.token)
        .json(&json!({"role": "receiver", "device_info": {"device_model": "Pixel 8"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get(rolegate::server::NEW_TOKEN_HEADER).is_none());
    let body: Envelope<Value> = resp.json().await.unwrap();
    assert_eq!(body.code, 0);
    let client_id = body.data["client_id"].as_str().unwrap().to_string();
    let token = body.data["token"].as_str().unwrap().to_string();
    assert_eq!(client_id, "alice-receiver-001");

    // Second device without force is a 409 carrying the holder
    let resp = server
        .http
        .post(format!("{}/api/device-tokens", server.base))
        .bearer_auth(&issued.token)
        .json(&json!({"role": "receiver"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["has_conflict"], true);
    assert_eq!(body["data"]["conflict_device"]["client_id"], client_id.as_str());
    assert_eq!(body["data"]["conflict_device"]["device_model"], "Pixel 8");

    // Broker webhooks
    let auth = server
        .post(
            "/auth",
            &json!({"clientid": client_id, "username": "alice", "password": token}).to_string(),
        )
        .await;
    assert_eq!(auth, json!({"result": "allow", "is_superuser": false}));

    let denied = server
        .post("/auth", r#"{"clientid":"alice-receiver-001","username":undefined,"password":undefined}"#)
        .await;
    assert_eq!(denied["result"], "deny");

    let garbage = server.post("/auth", "not json").await;
    assert_eq!(garbage["result"], "deny");

    let acl = server
        .post(
            "/acl",
            &json!({
                "clientid": client_id,
                "username": "alice",
                "topic": "nfc_relay/user/alice/status_updates",
                "action": "subscribe"
            })
            .to_string(),
        )
        .await;
    assert_eq!(acl, json!({"result": "allow"}));

    let hook = server
        .post(
            "/hooks/connection_status",
            &json!({"event": "client.disconnected", "clientid": client_id, "username": "alice", "disconnected_at": 1_700_000_000_000_i64, "reason": "normal"})
                .to_string(),
        )
        .await;
    assert_eq!(hook["result"], "ok");

    // Heartbeat with the device credential
    let resp = server
        .http
        .post(format!("{}/api/devices/heartbeat", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // List, revoke, list again
    let list: Envelope<Vec<Value>> = server
        .http
        .get(format!("{}/api/device-tokens", server.base))
        .header("x-token", &issued.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.data.len(), 1);
    assert_eq!(list.data[0]["holder"], client_id.as_str());

    let resp = server
        .http
        .delete(format!("{}/api/device-tokens/{}", server.base, client_id))
        .header("x-token", &issued.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let auth = server
        .post(
            "/auth",
            &json!({"clientid": client_id, "username": "alice", "password": token}).to_string(),
        )
        .await;
    assert_eq!(auth["result"], "deny");

    // Logout invalidates the account credential
    let resp = server
        .http
        .delete(format!("{}/api/session", server.base))
        .header("x-token", &issued.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = server
        .http
        .get(format!("{}/api/device-tokens", server.base))
        .header("x-token", &issued.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    server.stop().await;
}

#[tokio::test]
async fn test_refresh_headers() {
    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
    let config = rolegate::ServiceConfig {
        account_ttl: std::time::Duration::from_secs(300),
        account_buffer: std::time::Duration::from_secs(600),
        ..config()
    };
    let service = rolegate::SessionService::new(
        store,
        rolegate::transport::TransportHandle::unset(),
        config,
    );
    let issued = service.issue_account(uuid::Uuid::new_v4(), "alice").await.unwrap();
    let server = TestServer::start(service).await;

    let resp = server
        .http
        .get(format!("{}/api/device-tokens", server.base))
        .header("x-token", &issued.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let next = resp
        .headers()
        .get(rolegate::server::NEW_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert_ne!(next, issued.token);
    assert!(resp.headers().get(rolegate::server::NEW_EXPIRES_AT_HEADER).is_some());

    // The successor works
    let resp = server
        .http
        .get(format!("{}/api/device-tokens", server.base))
        .header("x-token", &next)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    server.stop().await;
}
