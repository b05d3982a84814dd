use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use crate::state::{AppState, ServiceMetrics};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    metrics: ServiceMetrics,
}

pub fn health_router() -> Router<AppState> {
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
}

async fn live(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(build_response("ok", state))
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let metrics = state.research_service().metrics();
    if metrics.available_permits == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                metrics,
            }),
        );
    }

    (StatusCode::OK, Json(build_response("ok", state)))
}

fn build_response(status: &'static str, state: AppState) -> HealthResponse {
    HealthResponse {
        status,
        metrics: state.research_service().metrics(),
    }
}
