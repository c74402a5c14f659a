use serde_json::{Map, Value};

use crate::models::DeviceState;

/// A deCONZ REST request derived from a local device state change.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub path: String,
    pub body: Value,
}

pub fn map_device_state(state: &DeviceState) -> Option<UpstreamRequest> {
    let body = state_body(state);
    if body.is_empty() {
        return None;
    }

    let path = match state.device_id.strip_prefix("group:") {
        Some(group) if !group.is_empty() => format!("groups/{group}/action"),
        Some(_) => return None,
        None if state.device_id.is_empty() => return None,
        None => format!("lights/{}/state", state.device_id),
    };

    Some(UpstreamRequest {
        path,
        body: Value::Object(body),
    })
}

fn state_body(state: &DeviceState) -> Map<String, Value> {
    let mut body = Map::new();
    if let Some(on) = state.on {
        body.insert("on".into(), Value::from(on));
    }
    if let Some(bri) = state.bri {
        body.insert("bri".into(), Value::from(bri));
    }
    // deCONZ rejects a color mode mix; xy wins over hue/sat, which win over ct.
    if let Some([x, y]) = state.xy {
        body.insert("xy".into(), Value::from(vec![x.clamp(0.0, 1.0), y.clamp(0.0, 1.0)]));
    } else if state.hue.is_some() || state.sat.is_some() {
        if let Some(hue) = state.hue {
            body.insert("hue".into(), Value::from(hue));
        }
        if let Some(sat) = state.sat {
            body.insert("sat".into(), Value::from(sat));
        }
    } else if let Some(ct) = state.ct {
        body.insert("ct".into(), Value::from(ct.clamp(153, 500)));
    }
    body
}
