//! HTTP request handlers.

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Deserialize, Serialize};
use ssehub_protocol::{CONTENT_TYPE_EVENT_STREAM, Event, HEADER_EVENT_TYPE, HEADER_LAST_EVENT_ID};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::ApiError;
use super::state::AppState;
use crate::client::{Session, StreamRequest, StreamWriter};
use crate::stats::PushStatsSnapshot;

/// Query parameters accepted by the stream endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub uid: Option<String>,
    pub event_type: Option<String>,
    pub last_event_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    /// Targets; missing or empty broadcasts.
    #[serde(default)]
    pub uids: Option<Vec<String>>,
    pub events: Vec<Event>,
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    pub success: bool,
    pub events: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub push: PushStatsSnapshot,
    pub online_clients: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub online_clients: usize,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

/// Open a `text/event-stream` connection.
///
/// The identifier comes from `?uid=` or the configured identifier header.
/// `event_type` and `last_event_id` may be given as query parameters or as the
/// `Event-Type` and `Last-Event-ID` headers.
#[instrument(skip_all)]
pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request = StreamRequest {
        identifier: non_empty(query.uid)
            .or_else(|| header_string(&headers, &state.server.identifier_header)),
        event_type: non_empty(query.event_type)
            .or_else(|| header_string(&headers, HEADER_EVENT_TYPE)),
        last_event_id: non_empty(query.last_event_id)
            .or_else(|| header_string(&headers, HEADER_LAST_EVENT_ID)),
    };

    let (writer, body) = StreamWriter::channel();
    // Nothing cancels this token; the loop ends when the hub disconnects the
    // client or hyper drops the body on request teardown.
    let session = Session::open(&state.hub, request, writer, &CancellationToken::new()).await?;
    let identifier = session.client().identifier().to_string();
    info!(identifier = %identifier, "Stream opened");

    tokio::spawn(async move {
        match session.run().await {
            Ok(()) => debug!(identifier = %identifier, "Stream closed"),
            Err(err) => debug!(identifier = %identifier, error = %err, "Stream closed"),
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, CONTENT_TYPE_EVENT_STREAM)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no") // Disable nginx buffering if present
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::internal(format!("Failed to build stream response: {}", e)))?;

    for (name, value) in state.server.extra_headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid extra header"),
        }
    }

    Ok(response)
}

/// Push events to some or all connected clients.
#[instrument(skip_all)]
pub async fn push_events(
    State(state): State<AppState>,
    payload: Result<Json<PushRequest>, JsonRejection>,
) -> Result<Json<PushResponse>, ApiError> {
    let Json(request) = payload?;
    let uids = request.uids.unwrap_or_default();
    let count = request.events.len();

    state.hub.push(&uids, request.events).await?;

    debug!(events = count, targets = uids.len(), "Pushed events");
    Ok(Json(PushResponse {
        success: true,
        events: count,
    }))
}

pub async fn push_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        push: state.hub.push_stats(),
        online_clients: state.hub.online_clients_num(),
    })
}

/// Queue a heartbeat comment for one connected client.
pub async fn push_heartbeat(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.hub.push_heartbeat(&uid) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("client {} is not connected", uid)))
    }
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let online_clients = state.hub.online_clients_num();
    if state.hub.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "closed",
                online_clients,
            }),
        );
    }
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            online_clients,
        }),
    )
}
