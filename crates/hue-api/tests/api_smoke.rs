use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use hue_api::{build_router, AppState};
use hue_core::identity::derive_identity;
use hue_core::models::DeviceState;
use hue_deconz::{UpstreamAdapter, UpstreamError};
use hue_pairing::session::DEFAULT_CONFIRMED_GRACE;
use hue_pairing::{
    IndicatorEvent, ManualClock, PairingSessionManager, PairingSettings, RecordingSink,
};
use hue_storage::FileStorage;
use serde_json::{json, Value};
use tempfile::TempDir;
use time::Duration;
use tower::util::ServiceExt;

struct TestBridge {
    app: axum::Router,
    clock: Arc<ManualClock>,
    sink: Arc<RecordingSink>,
    temp_dir: TempDir,
}

fn new_bridge(security_mode: bool) -> TestBridge {
    new_bridge_with(security_mode, None)
}

fn new_bridge_with(security_mode: bool, upstream: Option<Arc<dyn UpstreamAdapter>>) -> TestBridge {
    let temp_dir = TempDir::new().expect("temp dir");
    let clock = Arc::new(ManualClock::default());
    let sink = Arc::new(RecordingSink::default());
    let pairing = Arc::new(PairingSessionManager::new(
        PairingSettings::new(30, security_mode),
        clock.clone(),
        sink.clone(),
    ));
    let mac = "AA:BB:CC:DD:EE:FF".parse().unwrap();
    let identity = derive_identity(&mac, Some(Ipv4Addr::new(192, 168, 1, 10))).unwrap();

    let mut state = AppState::new(FileStorage::new(temp_dir.path()), pairing, identity);
    if let Some(upstream) = upstream {
        state = state.with_upstream(upstream);
    }
    TestBridge {
        app: build_router(state),
        clock,
        sink,
        temp_dir,
    }
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn pair(app: &axum::Router) -> Value {
    send(app, "POST", "/api", Some(json!({"devicetype": "hue_app#phone"}))).await.1
}

#[tokio::test]
async fn pairing_before_press_is_refused() {
    let bridge = new_bridge(false);
    let body = pair(&bridge.app).await;
    assert_eq!(body[0]["error"]["type"], 101);
    assert_eq!(body[0]["error"]["description"], "link button not pressed");
}

#[tokio::test]
async fn press_then_pair_issues_username() {
    let bridge = new_bridge(false);
    let (status, pressed) = send(&bridge.app, "POST", "/api/linkbutton/press", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pressed["success"], true);
    assert_eq!(pressed["timeout"], 30);

    let body = send(
        &bridge.app,
        "POST",
        "/api",
        Some(json!({"devicetype": "hue_app#phone", "generateclientkey": true})),
    )
    .await
    .1;
    let username = body[0]["success"]["username"].as_str().expect("username");
    assert_eq!(username.len(), 32);
    assert_eq!(body[0]["success"]["clientkey"].as_str().map(str::len), Some(32));

    let stored = FileStorage::new(bridge.temp_dir.path())
        .get_client(username)
        .unwrap()
        .expect("whitelisted");
    assert_eq!(stored.name, "hue_app#phone");
}

#[tokio::test]
async fn secure_pairing_needs_three_requests() {
    let bridge = new_bridge(true);
    send(&bridge.app, "GET", "/api/linkbutton/press", None).await;

    for received in 1..=2 {
        bridge.clock.advance(Duration::seconds(5));
        let body = pair(&bridge.app).await;
        assert_eq!(body[0]["error"]["type"], 101);
        assert_eq!(
            body[0]["error"]["description"],
            format!("link button confirmation {received} of 3 received")
        );
    }

    let (_, status) = send(&bridge.app, "GET", "/api/linkbutton/status", None).await;
    assert_eq!(status["confirmations_received"], 2);
    assert_eq!(status["leds"]["pattern"], json!(["solid", "solid", "blinking"]));

    bridge.clock.advance(Duration::seconds(5));
    let body = pair(&bridge.app).await;
    assert!(body[0]["success"]["username"].is_string());
    assert_eq!(
        FileStorage::new(bridge.temp_dir.path())
            .list_whitelist()
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn second_press_conflicts() {
    let bridge = new_bridge(false);
    send(&bridge.app, "POST", "/api/linkbutton/press", None).await;
    let (status, body) = send(&bridge.app, "POST", "/api/linkbutton/press", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn status_tracks_window() {
    let bridge = new_bridge(true);
    let (_, idle) = send(&bridge.app, "GET", "/api/linkbutton/status", None).await;
    assert_eq!(idle["button_pressed"], false);
    assert_eq!(idle["leds"]["led1"], false);

    send(&bridge.app, "POST", "/api/linkbutton/press", None).await;
    bridge.clock.advance(Duration::seconds(10));
    let (_, active) = send(&bridge.app, "GET", "/api/linkbutton/status", None).await;
    assert_eq!(active["button_pressed"], true);
    assert_eq!(active["status"], "awaiting_confirmation");
    assert_eq!(active["time_remaining"], 20);
    assert_eq!(active["leds"]["led3"], true);
}

#[tokio::test]
async fn expired_window_refuses_pairing() {
    let bridge = new_bridge(false);
    send(&bridge.app, "POST", "/api/linkbutton/press", None).await;
    bridge.clock.advance(Duration::seconds(31));

    let body = pair(&bridge.app).await;
    assert_eq!(body[0]["error"]["type"], 101);
    let (_, status) = send(&bridge.app, "GET", "/api/linkbutton/status", None).await;
    assert_eq!(status["status"], "idle");
}

#[tokio::test]
async fn reset_closes_window() {
    let bridge = new_bridge(false);
    send(&bridge.app, "POST", "/api/linkbutton/press", None).await;
    let (status, body) = send(&bridge.app, "POST", "/api/linkbutton/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let body = pair(&bridge.app).await;
    assert_eq!(body[0]["error"]["type"], 101);
}

#[tokio::test]
async fn config_exposes_identity() {
    let bridge = new_bridge(false);
    let (status, body) = send(&bridge.app, "GET", "/api/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bridgeid"], "AABBCCFFFEDDEEFF");
    assert_eq!(body["mac"], "aa:bb:cc:dd:ee:ff");
    assert_eq!(body["ipaddress"], "192.168.1.10");
    assert_eq!(body["linkbutton"], false);
}

#[tokio::test]
async fn invalid_pairing_body_is_reported() {
    let bridge = new_bridge(false);
    let req = Request::builder()
        .method("POST")
        .uri("/api")
        .body(Body::from("not json"))
        .unwrap();
    let res = bridge.app.clone().oneshot(req).await.unwrap();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body[0]["error"]["type"], 2);
}

#[derive(Default)]
struct RecordingUpstream {
    states: Mutex<Vec<DeviceState>>,
    fail: bool,
}

#[async_trait]
impl UpstreamAdapter for RecordingUpstream {
    async fn forward(&self, state: &DeviceState) -> Result<(), UpstreamError> {
        self.states.lock().unwrap().push(state.clone());
        if self.fail {
            return Err(UpstreamError::Unreachable {
                address: "10.0.0.2".into(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }
}

async fn paired_username(bridge: &TestBridge) -> String {
    send(&bridge.app, "POST", "/api/linkbutton/press", None).await;
    pair(&bridge.app).await[0]["success"]["username"]
        .as_str()
        .expect("username")
        .to_string()
}

#[tokio::test]
async fn light_state_requires_whitelisted_user() {
    let upstream = Arc::new(RecordingUpstream::default());
    let bridge = new_bridge_with(false, Some(upstream.clone()));

    let (_, body) = send(
        &bridge.app,
        "PUT",
        "/api/stranger/lights/1/state",
        Some(json!({"on": true})),
    )
    .await;
    assert_eq!(body[0]["error"]["type"], 1);
    assert!(upstream.states.lock().unwrap().is_empty());
}

#[tokio::test]
async fn light_state_is_forwarded_upstream() {
    let upstream = Arc::new(RecordingUpstream::default());
    let bridge = new_bridge_with(false, Some(upstream.clone()));
    let username = paired_username(&bridge).await;

    let (status, body) = send(
        &bridge.app,
        "PUT",
        &format!("/api/{username}/lights/4/state"),
        Some(json!({"on": true, "bri": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"success": {"/lights/4/state/on": true}},
            {"success": {"/lights/4/state/bri": 100}},
        ])
    );

    let states = upstream.states.lock().unwrap().clone();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].device_id, "4");
    assert_eq!(states[0].bri, Some(100));
}

#[tokio::test]
async fn upstream_failure_does_not_fail_local_update() {
    let upstream = Arc::new(RecordingUpstream {
        fail: true,
        ..RecordingUpstream::default()
    });
    let bridge = new_bridge_with(false, Some(upstream.clone()));
    let username = paired_username(&bridge).await;

    let (status, body) = send(
        &bridge.app,
        "PUT",
        &format!("/api/{username}/lights/2/state"),
        Some(json!({"on": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["success"]["/lights/2/state/on"], false);
    assert_eq!(upstream.states.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn whitelist_entry_can_be_deleted() {
    let bridge = new_bridge(false);
    let username = paired_username(&bridge).await;

    let (_, body) = send(
        &bridge.app,
        "DELETE",
        &format!("/api/{username}/config/whitelist/{username}"),
        None,
    )
    .await;
    assert_eq!(
        body[0]["success"],
        format!("/config/whitelist/{username} deleted")
    );

    // The deleted user can no longer act.
    let (_, body) = send(
        &bridge.app,
        "DELETE",
        &format!("/api/{username}/config/whitelist/{username}"),
        None,
    )
    .await;
    assert_eq!(body[0]["error"]["type"], 1);
}

#[tokio::test]
async fn failed_whitelist_write_keeps_window_open() {
    let bridge = new_bridge(false);
    send(&bridge.app, "POST", "/api/linkbutton/press", None).await;

    let blocker = bridge.temp_dir.path().join("storage.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    let (status, _) = send(
        &bridge.app,
        "POST",
        "/api",
        Some(json!({"devicetype": "hue_app#phone"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (_, window) = send(&bridge.app, "GET", "/api/linkbutton/status", None).await;
    assert_eq!(window["status"], "awaiting_confirmation");
    let (status, _) = send(&bridge.app, "POST", "/api/linkbutton/press", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    std::fs::remove_dir(&blocker).unwrap();
    let body = pair(&bridge.app).await;
    let username = body[0]["success"]["username"].as_str().expect("username");
    let whitelist = FileStorage::new(bridge.temp_dir.path())
        .list_whitelist()
        .unwrap();
    assert_eq!(whitelist.len(), 1);
    assert!(whitelist.contains_key(username));
}

#[tokio::test(start_paused = true)]
async fn confirmed_window_returns_to_idle_without_requests() {
    let bridge = new_bridge(false);
    send(&bridge.app, "POST", "/api/linkbutton/press", None).await;
    pair(&bridge.app).await;

    bridge.clock.advance(DEFAULT_CONFIRMED_GRACE);
    tokio::time::sleep(std::time::Duration::from_millis(2_100)).await;
    tokio::task::yield_now().await;

    assert_eq!(
        bridge.sink.events(),
        vec![
            IndicatorEvent::AwaitingConfirmation,
            IndicatorEvent::Confirmed,
            IndicatorEvent::Idle,
        ]
    );
}

#[tokio::test]
async fn malformed_light_state_gets_hue_error() {
    let bridge = new_bridge(false);
    let username = paired_username(&bridge).await;

    let req = Request::builder()
        .method("PUT")
        .uri(format!("/api/{username}/lights/1/state"))
        .header("content-type", "application/json")
        .body(Body::from("{\"on\": tru"))
        .unwrap();
    let res = bridge.app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body[0]["error"]["type"], 2);
    assert_eq!(body[0]["error"]["address"], "/lights/1/state");
}
