//! In-process stand-in for the farm REST API.

#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub const TOKEN: &str = "test-token";

#[derive(Debug, Default)]
pub struct FarmState {
    pub keys: Vec<String>,
    pub thresholds: BTreeMap<String, (f64, f64)>,
    pub latest: Vec<Value>,
    pub requests: Vec<String>,
}

pub type SharedFarm = Arc<Mutex<FarmState>>;

#[derive(Debug, Deserialize)]
struct ThresholdBody {
    key: String,
    threshold_min: f64,
    threshold_max: f64,
}

pub fn farm(keys: &[&str], thresholds: &[(&str, f64, f64)]) -> SharedFarm {
    Arc::new(Mutex::new(FarmState {
        keys: keys.iter().map(|k| k.to_string()).collect(),
        thresholds: thresholds
            .iter()
            .map(|(key, min, max)| (key.to_string(), (*min, *max)))
            .collect(),
        ..FarmState::default()
    }))
}

/// Serves `state` on an ephemeral port and returns the API base url.
pub async fn spawn_rest(state: SharedFarm) -> String {
    let app = Router::new()
        .route("/api/:entity_type/:entity_id/keys", get(keys))
        .route("/api/:entity_type/:entity_id/thresholds", get(thresholds))
        .route(
            "/api/:entity_type/:entity_id/threshold/:key",
            get(threshold).post(set_threshold).delete(delete_threshold),
        )
        .route("/api/:entity_type/:entity_id/telemetry/latest", get(latest))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/api", addr)
}

fn authorize(headers: &HeaderMap) -> Result<(), StatusCode> {
    let expected = format!("Bearer {}", TOKEN);
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn record(state: &SharedFarm, request: String) {
    state.lock().unwrap().requests.push(request);
}

async fn keys(
    State(state): State<SharedFarm>,
    headers: HeaderMap,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&headers)?;
    record(&state, format!("GET {}/{}/keys", entity_type, entity_id));
    let keys: Vec<Value> = state
        .lock()
        .unwrap()
        .keys
        .iter()
        .map(|key| json!({ "ts_key": key }))
        .collect();
    Ok(Json(Value::Array(keys)))
}

async fn thresholds(
    State(state): State<SharedFarm>,
    headers: HeaderMap,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&headers)?;
    record(&state, format!("GET {}/{}/thresholds", entity_type, entity_id));
    let thresholds: Vec<Value> = state
        .lock()
        .unwrap()
        .thresholds
        .iter()
        .map(|(key, (min, max))| {
            json!({
                "key": key,
                "threshold_min": min,
                "threshold_max": max,
                "modified_at": "2024-05-01T08:00:00Z",
            })
        })
        .collect();
    Ok(Json(Value::Array(thresholds)))
}

async fn threshold(
    State(state): State<SharedFarm>,
    headers: HeaderMap,
    Path((entity_type, entity_id, key)): Path<(String, String, String)>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&headers)?;
    record(&state, format!("GET {}/{}/threshold/{}", entity_type, entity_id, key));
    let band = state.lock().unwrap().thresholds.get(&key).copied();
    match band {
        Some((min, max)) => Ok(Json(json!({ "threshold_min": min, "threshold_max": max }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn set_threshold(
    State(state): State<SharedFarm>,
    headers: HeaderMap,
    Path((entity_type, entity_id, key)): Path<(String, String, String)>,
    Json(body): Json<ThresholdBody>,
) -> Result<StatusCode, StatusCode> {
    authorize(&headers)?;
    if body.key != key {
        return Err(StatusCode::BAD_REQUEST);
    }
    record(&state, format!("POST {}/{}/threshold/{}", entity_type, entity_id, key));
    state
        .lock()
        .unwrap()
        .thresholds
        .insert(key, (body.threshold_min, body.threshold_max));
    Ok(StatusCode::CREATED)
}

async fn delete_threshold(
    State(state): State<SharedFarm>,
    headers: HeaderMap,
    Path((entity_type, entity_id, key)): Path<(String, String, String)>,
) -> Result<StatusCode, StatusCode> {
    authorize(&headers)?;
    record(&state, format!("DELETE {}/{}/threshold/{}", entity_type, entity_id, key));
    match state.lock().unwrap().thresholds.remove(&key) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn latest(
    State(state): State<SharedFarm>,
    headers: HeaderMap,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&headers)?;
    record(&state, format!("GET {}/{}/telemetry/latest", entity_type, entity_id));
    Ok(Json(Value::Array(state.lock().unwrap().latest.clone())))
}
