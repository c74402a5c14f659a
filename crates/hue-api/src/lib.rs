use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use hue_core::models::{BridgeIdentity, ClientRequest, DeviceState};
use hue_deconz::{forward_or_log, UpstreamAdapter};
use hue_pairing::{
    ConfirmOutcome, IndicatorEvent, LedPattern, PairingError, PairingSessionManager,
    PairingSnapshot, PairingStatus,
};
use hue_storage::{FileStorage, StorageError};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use time::{Duration, OffsetDateTime};

const HUE_ERR_UNAUTHORIZED: u16 = 1;
const HUE_ERR_INVALID_JSON: u16 = 2;
const HUE_ERR_NOT_AVAILABLE: u16 = 3;
const HUE_ERR_LINK_BUTTON: u16 = 101;
const MODEL_ID: &str = "BSB002";
const BRIDGE_NAME: &str = "Hue Emulator";

#[derive(Clone)]
pub struct AppState {
    storage: FileStorage,
    pairing: Arc<PairingSessionManager>,
    identity: BridgeIdentity,
    upstream: Option<Arc<dyn UpstreamAdapter>>,
    indicators_enabled: bool,
}

impl AppState {
    pub fn new(
        storage: FileStorage,
        pairing: Arc<PairingSessionManager>,
        identity: BridgeIdentity,
    ) -> Self {
        Self {
            storage,
            pairing,
            identity,
            upstream: None,
            indicators_enabled: true,
        }
    }

    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamAdapter>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_indicators(mut self, enabled: bool) -> Self {
        self.indicators_enabled = enabled;
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/api", post(create_user))
        .route(
            "/api/linkbutton/press",
            get(press_link_button).post(press_link_button),
        )
        .route("/api/linkbutton/status", get(link_button_status))
        .route("/api/linkbutton/reset", post(reset_link_button))
        .route("/api/config", get(public_config))
        .route("/api/health", get(health))
        .route("/api/:username/lights/:id/state", put(set_light_state))
        .route(
            "/api/:username/config/whitelist/:client_id",
            delete(delete_whitelist_entry),
        )
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

fn invalid_json(address: &str) -> Json<Value> {
    Json(hue_error(
        HUE_ERR_INVALID_JSON,
        address,
        "body contains invalid json",
    ))
}

/// Re-runs the time-driven transitions once `delay` has passed, so expiry and
/// the post-confirmation reset reach the indicator without further requests.
fn arm_pairing_timer(pairing: Arc<PairingSessionManager>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay.try_into().unwrap_or_default()).await;
        pairing.check_expiry();
    });
}

fn hue_error(kind: u16, address: &str, description: &str) -> Value {
    json!([{
        "error": {
            "type": kind,
            "address": address,
            "description": description,
        }
    }])
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: ClientRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!("Rejected pairing request body: {err}");
            return Ok(invalid_json(""));
        }
    };
    tracing::info!(device = %request.device_type, "Authentication request");

    match state.pairing.confirm(&request) {
        Ok(ConfirmOutcome::Confirmed(credential)) => {
            if let Err(err) = state.storage.add_credential(&credential) {
                state.pairing.revert_confirmation(&credential);
                return Err(err.into());
            }
            arm_pairing_timer(
                state.pairing.clone(),
                state.pairing.settings().confirmed_grace,
            );
            let mut success = Map::new();
            success.insert("username".into(), Value::from(credential.client_id));
            if let Some(key) = credential.client_key {
                success.insert("clientkey".into(), Value::from(key));
            }
            Ok(Json(json!([{ "success": success }])))
        }
        Ok(ConfirmOutcome::Pending { received, required }) => Ok(Json(hue_error(
            HUE_ERR_LINK_BUTTON,
            "",
            &format!("link button confirmation {received} of {required} received"),
        ))),
        Err(err) => {
            tracing::debug!(device = %request.device_type, "Pairing refused: {err}");
            Ok(Json(hue_error(HUE_ERR_LINK_BUTTON, "", "link button not pressed")))
        }
    }
}

async fn press_link_button(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let session = state.pairing.open_session()?;
    let window = session.expires_at - session.opened_at;

    arm_pairing_timer(state.pairing.clone(), window);

    let timeout = window.whole_seconds();
    let snapshot = state.pairing.snapshot();
    Ok(Json(json!({
        "success": true,
        "message": format!("Link button activated. Complete pairing within {timeout} seconds."),
        "leds": leds_json(&state, &snapshot),
        "timeout": timeout,
        "time_remaining": snapshot.time_remaining_secs,
        "required_confirmations": session.required_confirmations,
    })))
}

async fn link_button_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.pairing.snapshot();
    let message = match snapshot.status {
        PairingStatus::AwaitingConfirmation => format!(
            "Link button active. {} seconds remaining.",
            snapshot.time_remaining_secs
        ),
        PairingStatus::Confirmed => "Pairing confirmed".to_string(),
        PairingStatus::Idle | PairingStatus::Expired => "Link button not pressed".to_string(),
    };
    Json(json!({
        "button_pressed": snapshot.status == PairingStatus::AwaitingConfirmation,
        "status": snapshot.status,
        "leds": leds_json(&state, &snapshot),
        "time_remaining": snapshot.time_remaining_secs,
        "confirmations_received": snapshot.confirmations_received,
        "required_confirmations": snapshot.required_confirmations,
        "message": message,
    }))
}

async fn reset_link_button(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.pairing.reset();
    Json(json!({
        "success": true,
        "message": "Link button reset",
    }))
}

async fn public_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.pairing.snapshot();
    Json(json!({
        "name": BRIDGE_NAME,
        "bridgeid": state.identity.bridge_id,
        "mac": state.identity.mac,
        "ipaddress": state.identity.advertised_address.to_string(),
        "modelid": MODEL_ID,
        "factorynew": false,
        "linkbutton": snapshot.status == PairingStatus::AwaitingConfirmation,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct LightStateBody {
    on: Option<bool>,
    bri: Option<u8>,
    hue: Option<u16>,
    sat: Option<u8>,
    ct: Option<u16>,
    xy: Option<[f32; 2]>,
}

async fn set_light_state(
    Path((username, id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let address = format!("/lights/{id}/state");
    let body: LightStateBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(err) => {
            tracing::debug!(light = %id, "Rejected light state body: {err}");
            return Ok(invalid_json(&address));
        }
    };
    if !state
        .storage
        .touch_client(&username, OffsetDateTime::now_utc())?
    {
        return Ok(Json(hue_error(
            HUE_ERR_UNAUTHORIZED,
            &address,
            "unauthorized user",
        )));
    }

    let device = DeviceState {
        device_id: id,
        on: body.on,
        bri: body.bri,
        hue: body.hue,
        sat: body.sat,
        ct: body.ct,
        xy: body.xy,
    };

    if let Some(upstream) = state.upstream.as_deref() {
        forward_or_log(upstream, &device).await;
    }

    Ok(Json(Value::Array(state_successes(&address, &device))))
}

async fn delete_whitelist_entry(
    Path((username, client_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let address = format!("/config/whitelist/{client_id}");
    if state.storage.get_client(&username)?.is_none() {
        return Ok(Json(hue_error(
            HUE_ERR_UNAUTHORIZED,
            &address,
            "unauthorized user",
        )));
    }
    if !state.storage.remove_client(&client_id)? {
        return Ok(Json(hue_error(
            HUE_ERR_NOT_AVAILABLE,
            &address,
            &format!("resource, {address}, not available"),
        )));
    }
    tracing::info!(%client_id, "Whitelist entry removed");
    Ok(Json(json!([{ "success": format!("{address} deleted") }])))
}

fn state_successes(address: &str, device: &DeviceState) -> Vec<Value> {
    let fields = [
        ("on", device.on.map(Value::from)),
        ("bri", device.bri.map(Value::from)),
        ("hue", device.hue.map(Value::from)),
        ("sat", device.sat.map(Value::from)),
        ("ct", device.ct.map(Value::from)),
        ("xy", device.xy.map(|xy| Value::from(xy.to_vec()))),
    ];
    fields
        .into_iter()
        .filter_map(|(name, value)| {
            let value = value?;
            let mut success = Map::new();
            success.insert(format!("{address}/{name}"), value);
            Some(json!({ "success": success }))
        })
        .collect()
}

fn indicator_event(snapshot: &PairingSnapshot) -> IndicatorEvent {
    match snapshot.status {
        PairingStatus::AwaitingConfirmation if snapshot.confirmations_received > 0 => {
            IndicatorEvent::PartialConfirmation(snapshot.confirmations_received)
        }
        PairingStatus::AwaitingConfirmation => IndicatorEvent::AwaitingConfirmation,
        PairingStatus::Confirmed => IndicatorEvent::Confirmed,
        PairingStatus::Expired => IndicatorEvent::Expired,
        PairingStatus::Idle => IndicatorEvent::Idle,
    }
}

fn leds_json(state: &AppState, snapshot: &PairingSnapshot) -> Value {
    let pattern = if state.indicators_enabled {
        LedPattern::for_event(indicator_event(snapshot))
    } else {
        LedPattern::OFF
    };
    let [led1, led2, led3] = pattern.leds();
    json!({
        "led1": led1.is_lit(),
        "led2": led2.is_lit(),
        "led3": led3.is_lit(),
        "pattern": pattern,
    })
}

#[derive(Debug)]
pub enum ApiError {
    Storage(StorageError),
    Pairing(PairingError),
}

impl From<StorageError> for ApiError {
    fn from(value: StorageError) -> Self {
        ApiError::Storage(value)
    }
}

impl From<PairingError> for ApiError {
    fn from(value: PairingError) -> Self {
        ApiError::Pairing(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::Pairing(err) => (
                StatusCode::CONFLICT,
                Json(json!({ "success": false, "message": err.to_string() })),
            )
                .into_response(),
            ApiError::Storage(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("storage error: {err}"),
            )
                .into_response(),
        }
    }
}
