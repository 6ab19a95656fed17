use crate::bus::StreamGap;
use crate::hub::{HistorySnapshot, RunError, RunHub, RunSummary};
use crate::registry::AdmissionConflict;
use crate::rewind::RewindError;
use async_stream::stream;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use runlog_core::events::{ActiveState, Event};
use runlog_core::NEW_THREAD_SENTINEL;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, warn};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct RunRequest {
    #[serde(default = "new_thread")]
    thread_id: String,
    #[serde(default)]
    message: String,
}

fn new_thread() -> String {
    NEW_THREAD_SENTINEL.to_string()
}

#[derive(Debug, Serialize)]
struct RunResponse {
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct ThreadRequest {
    #[serde(default)]
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct RewindRequest {
    #[serde(default)]
    thread_id: String,
    message_index: u64,
    #[serde(default)]
    new_message: String,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    force_refresh: bool,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    thread_id: String,
    from_idx: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct RunsResponse {
    runs: Vec<RunSummary>,
}

pub fn router(hub: Arc<RunHub>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/run", post(start_run))
        .route("/chat", post(start_run))
        .route("/interrupt", post(interrupt))
        .route("/rewind", post(rewind))
        .route("/history", get(history))
        .route("/events", get(stream_events))
        .route("/events/active", get(stream_active))
        .route("/runs", get(list_runs))
        .route("/runs/active", get(active_run))
        .route("/runs/rename", post(rename_run))
        .layer(middleware::from_fn(loopback_only))
        .with_state(hub)
}

/// Serves the API until `shutdown` resolves. Peers must be loopback.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<RunHub>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn loopback_only(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !addr.ip().is_loopback() {
        warn!(event = "peer_rejected", peer = %addr);
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

async fn start_run(
    State(hub): State<Arc<RunHub>>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let thread_id = hub.start_run(&req.thread_id, &req.message).await?;
    Ok(Json(RunResponse { thread_id }))
}

async fn interrupt(
    State(hub): State<Arc<RunHub>>,
    Json(req): Json<ThreadRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = if hub.interrupt(&req.thread_id)? {
        "ok"
    } else {
        "noop"
    };
    Ok(Json(StatusResponse { status }))
}

async fn rewind(
    State(hub): State<Arc<RunHub>>,
    Json(req): Json<RewindRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    hub.rewind(&req.thread_id, req.message_index, &req.new_message)
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

async fn history(
    State(hub): State<Arc<RunHub>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistorySnapshot>, ApiError> {
    Ok(Json(hub.history(&query.thread_id, query.force_refresh).await?))
}

async fn list_runs(State(hub): State<Arc<RunHub>>) -> Result<Json<RunsResponse>, ApiError> {
    Ok(Json(RunsResponse {
        runs: hub.list_runs()?,
    }))
}

async fn active_run(State(hub): State<Arc<RunHub>>) -> Json<ActiveState> {
    Json(hub.active_state())
}

async fn rename_run(
    State(hub): State<Arc<RunHub>>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    hub.rename_run(&req.thread_id, &req.name)?;
    Ok(Json(StatusResponse { status: "ok" }))
}

/// `Last-Event-ID` wins over `from_idx`; the stream resumes after it.
fn resume_cursor(headers: &HeaderMap, from_idx: Option<u64>) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|last| last.saturating_add(1))
        .or(from_idx)
        .unwrap_or(0)
}

async fn stream_events(
    State(hub): State<Arc<RunHub>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let from_cursor = resume_cursor(&headers, query.from_idx);
    let mut subscription = hub.subscribe(&query.thread_id, from_cursor)?;
    debug!(event = "events_subscribed", thread_id = %query.thread_id, from_cursor);

    let stream = stream! {
        while let Some(next) = subscription.next().await {
            match next {
                Ok(event) => yield Ok(event_frame(&event)),
                Err(gap) => {
                    warn!(event = "stream_gap", requested = gap.requested, oldest = gap.oldest);
                    yield Ok(sse_json(SseEvent::default().event("stream_gap"), &gap_body(&gap)));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}

async fn stream_active(
    State(hub): State<Arc<RunHub>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut active = hub.watch_active();
    let stream = stream! {
        loop {
            let state = active.borrow_and_update().clone();
            yield Ok(sse_json(SseEvent::default().event("active_state"), &state));
            if active.changed().await.is_err() {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

fn event_frame(event: &Event) -> SseEvent {
    let frame = SseEvent::default()
        .id(event.cursor.to_string())
        .event(event.kind.as_str());
    sse_json(frame, event)
}

fn sse_json<T: Serialize>(frame: SseEvent, value: &T) -> SseEvent {
    match serde_json::to_string(value) {
        Ok(data) => frame.data(data),
        Err(err) => {
            warn!(event = "sse_encode_failed", error = %err);
            frame.comment("encode failed")
        }
    }
}

fn gap_body(gap: &StreamGap) -> Value {
    json!({
        "error": "stream_gap",
        "requested": gap.requested,
        "oldest_cursor": gap.oldest,
        "event_cursor": gap.next,
    })
}

fn busy_body(conflict: &AdmissionConflict) -> Value {
    json!({
        "status": "busy",
        "active_thread_id": conflict.active_thread_id,
        "active_run_name": conflict.active_run_name,
        "active_run_label": conflict.active_run_label,
    })
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    body: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            body: None,
        }
    }

    fn busy(conflict: &AdmissionConflict) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: conflict.to_string(),
            body: Some(busy_body(conflict)),
        }
    }

    fn gap(gap: &StreamGap) -> Self {
        Self {
            status: StatusCode::GONE,
            message: gap.to_string(),
            body: Some(gap_body(gap)),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match &err {
            RunError::Busy(conflict) => ApiError::busy(conflict),
            RunError::Validation(_) => ApiError::new(StatusCode::BAD_REQUEST, err.to_string()),
            RunError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            RunError::Gap(gap) => ApiError::gap(gap),
            RunError::Store(_) | RunError::Encode(_) => {
                warn!(event = "request_failed", error = %err);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

impl From<RewindError> for ApiError {
    fn from(err: RewindError) -> Self {
        match &err {
            RewindError::Busy(conflict) => ApiError::busy(conflict),
            RewindError::Validation(_) => ApiError::new(StatusCode::BAD_REQUEST, err.to_string()),
            RewindError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            RewindError::Store(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.body.unwrap_or_else(|| {
            json!({
                "error": {
                    "message": self.message,
                    "status": self.status.as_u16(),
                }
            })
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn last_event_id_overrides_from_idx() {
        let mut headers = HeaderMap::new();
        assert_eq!(resume_cursor(&headers, None), 0);
        assert_eq!(resume_cursor(&headers, Some(7)), 7);

        headers.insert("last-event-id", HeaderValue::from_static("11"));
        assert_eq!(resume_cursor(&headers, Some(7)), 12);

        headers.insert("last-event-id", HeaderValue::from_static("garbage"));
        assert_eq!(resume_cursor(&headers, Some(7)), 7);
    }

    #[test]
    fn errors_map_to_status_codes_and_bodies() {
        let conflict = AdmissionConflict {
            active_thread_id: "t2".to_string(),
            active_run_label: "run".to_string(),
            active_run_name: None,
        };
        let busy = ApiError::from(RunError::Busy(conflict));
        assert_eq!(busy.status(), StatusCode::CONFLICT);
        assert_eq!(
            busy.body,
            Some(json!({
                "status": "busy",
                "active_thread_id": "t2",
                "active_run_name": null,
                "active_run_label": "run",
            }))
        );

        let gap = ApiError::from(RunError::Gap(StreamGap {
            requested: 1,
            oldest: 5,
            next: 9,
        }));
        assert_eq!(gap.status(), StatusCode::GONE);
        assert_eq!(gap.body.as_ref().map(|b| b["oldest_cursor"].clone()), Some(json!(5)));

        assert_eq!(
            ApiError::from(RewindError::Validation("bad".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RunError::NotFound("x".to_string())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
