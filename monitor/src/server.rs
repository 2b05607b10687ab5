use crate::bus::BrokerEndpoint;
use crate::control::{send_control, ControlCommand};
use crate::errors::Error;
use crate::live::WidgetSnapshot;
use crate::topic::{resolve, EntityType};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    widgets: Arc<Vec<watch::Receiver<WidgetSnapshot>>>,
    endpoint: BrokerEndpoint,
    control_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub struct LiveResponse {
    pub data: Vec<WidgetSnapshot>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub topic: String,
    pub sent: bool,
}

/// Read-only view over the running widgets plus the control publisher.
pub fn create_router(
    widgets: Vec<watch::Receiver<WidgetSnapshot>>,
    endpoint: BrokerEndpoint,
    control_timeout: Duration,
) -> Router {
    let state = AppState {
        widgets: Arc::new(widgets),
        endpoint,
        control_timeout,
    };

    Router::new()
        .route("/api/v1/live", get(list_live))
        .route("/api/v1/live/:entity_type/:entity_id", get(get_live))
        .route("/api/v1/devices/:device_id/control", post(post_control))
        .with_state(state)
}

async fn list_live(State(state): State<AppState>) -> Json<LiveResponse> {
    let data: Vec<WidgetSnapshot> = state
        .widgets
        .iter()
        .map(|widget| widget.borrow().clone())
        .collect();

    Json(LiveResponse {
        total: data.len(),
        data,
    })
}

async fn get_live(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(EntityType, String)>,
) -> Result<Json<WidgetSnapshot>, StatusCode> {
    let topic = resolve(entity_type, &entity_id);

    // widgets may have been retargeted, so match on the current topic
    state
        .widgets
        .iter()
        .map(|widget| widget.borrow().clone())
        .find(|snapshot| snapshot.topic == topic.as_str())
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn post_control(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: String,
) -> Result<Json<ControlResponse>, AppError> {
    let command = ControlCommand::new(device_id, body)?;
    send_control(&state.endpoint, &command, state.control_timeout).await?;
    info!("Forwarded control command for {}", command.device_id());

    Ok(Json(ControlResponse {
        topic: command.topic(),
        sent: true,
    }))
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<Error>() {
            Some(Error::InvalidCommand(_)) => StatusCode::BAD_REQUEST,
            Some(Error::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
