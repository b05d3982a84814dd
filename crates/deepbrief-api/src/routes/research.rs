use std::convert::Infallible;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{FromRequestParts, Path},
    http::{StatusCode, header, request::Parts},
    response::{
        Response,
        sse::{KeepAlive, Sse},
    },
    routing::{get, post},
};
use deepbrief_core::{EVENT_CHANNEL_CAPACITY, EventSink, SinkClosed, StreamEvent, encode_sse};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

use crate::error::AppError;
use crate::state::{AppState, RunState, RunStatus, ServiceMetrics, SseStream};

#[derive(Debug, Deserialize)]
pub struct ResearchRequest {
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: String,
    pub state: RunState,
    pub capacity: ServiceMetrics,
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunStatus>,
    pub capacity: ServiceMetrics,
}

pub fn research_router() -> Router<AppState> {
    Router::new()
        .route("/research", post(research_stream))
        .route("/research/text", post(research_text))
        .route("/research/runs", post(start_run).get(list_runs))
        .route("/research/runs/:id", get(get_run))
        .route("/research/runs/:id/stream", get(stream_run))
}

fn require_query(payload: &ResearchRequest) -> Result<String, AppError> {
    match payload.query.as_deref().map(str::trim) {
        Some(query) if !query.is_empty() => Ok(query.to_string()),
        _ => Err(AppError::bad_request("Missing or invalid 'query'")),
    }
}

/// `POST /research` — the full event stream, SSE-framed.
#[instrument(skip_all)]
async fn research_stream(
    GuardedState(state): GuardedState,
    Json(payload): Json<ResearchRequest>,
) -> Result<Response, AppError> {
    let query = require_query(&payload)?;
    let receiver = state.research_service().stream(query).await?;

    let (frames, body_receiver) =
        mpsc::channel::<Result<String, Infallible>>(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(deepbrief_core::forward(receiver, SseBodySink::new(frames)));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(body_receiver)))
        .map_err(AppError::internal)
}

/// `POST /research/text` — raw text deltas, no framing.
#[instrument(skip_all)]
async fn research_text(
    GuardedState(state): GuardedState,
    Json(payload): Json<ResearchRequest>,
) -> Result<Response, AppError> {
    let query = require_query(&payload)?;
    let receiver = state.research_service().stream(query).await?;

    let (chunks, body_receiver) =
        mpsc::channel::<Result<String, Infallible>>(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(deepbrief_core::forward(receiver, TextBodySink::new(chunks)));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(ReceiverStream::new(body_receiver)))
        .map_err(AppError::internal)
}

#[instrument(skip_all)]
async fn start_run(
    GuardedState(state): GuardedState,
    Json(payload): Json<ResearchRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), AppError> {
    let query = require_query(&payload)?;

    let service = state.research_service();
    let run_id = service.start_run(query);
    let status = service.status(&run_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id,
            state: status.map(|s| s.state).unwrap_or(RunState::Running),
            capacity: service.metrics(),
        }),
    ))
}

async fn get_run(
    GuardedState(state): GuardedState,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatus>, AppError> {
    match state.research_service().status(&run_id) {
        Some(status) => Ok(Json(status)),
        None => Err(AppError::new(StatusCode::NOT_FOUND, "run not found")),
    }
}

async fn list_runs(
    GuardedState(state): GuardedState,
) -> Result<Json<ListRunsResponse>, AppError> {
    let service = state.research_service();
    Ok(Json(ListRunsResponse {
        runs: service.list_runs(),
        capacity: service.metrics(),
    }))
}

async fn stream_run(
    GuardedState(state): GuardedState,
    Path(run_id): Path<String>,
) -> Result<Sse<SseStream>, AppError> {
    match state.research_service().event_stream(&run_id) {
        Some(stream) => {
            crate::metrics::stream_opened(&run_id);
            Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
        }
        None => Err(AppError::new(StatusCode::NOT_FOUND, "run not found")),
    }
}

/// SSE-framing sink over the response body channel.
struct SseBodySink {
    sender: Option<mpsc::Sender<Result<String, Infallible>>>,
}

impl SseBodySink {
    fn new(sender: mpsc::Sender<Result<String, Infallible>>) -> Self {
        Self {
            sender: Some(sender),
        }
    }
}

#[async_trait]
impl EventSink for SseBodySink {
    async fn write(&mut self, event: &StreamEvent) -> Result<(), SinkClosed> {
        let Some(sender) = &self.sender else {
            return Err(SinkClosed);
        };
        sender
            .send(Ok(encode_sse(event)))
            .await
            .map_err(|_| SinkClosed)
    }

    async fn close(&mut self) {
        self.sender.take();
    }
}

/// Raw-text sink: forwards `text` deltas only.
struct TextBodySink {
    sender: Option<mpsc::Sender<Result<String, Infallible>>>,
}

impl TextBodySink {
    fn new(sender: mpsc::Sender<Result<String, Infallible>>) -> Self {
        Self {
            sender: Some(sender),
        }
    }
}

#[async_trait]
impl EventSink for TextBodySink {
    async fn write(&mut self, event: &StreamEvent) -> Result<(), SinkClosed> {
        let Some(sender) = &self.sender else {
            return Err(SinkClosed);
        };
        if let StreamEvent::Text { delta } = event {
            sender
                .send(Ok(delta.clone()))
                .await
                .map_err(|_| SinkClosed)?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.sender.take();
    }
}

pub struct GuardedState(pub AppState);

#[async_trait]
impl FromRequestParts<AppState> for GuardedState {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let app_state = state.clone();

        if let Some(expected) = app_state.auth_token() {
            let provided = parts
                .headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim);

            match provided {
                Some(token) if token == expected.as_str() => {}
                _ => {
                    return Err(AppError::new(
                        StatusCode::UNAUTHORIZED,
                        "invalid auth token",
                    ));
                }
            }
        }

        Ok(GuardedState(app_state))
    }
}
