//! Thin passthroughs to the pipeline's backends.

use axum::{
    Json, Router,
    extract::Path,
    routing::{get, post},
};
use deepbrief_core::{
    Candidate, ScrapeBackend, SearchBackend, SourceDocument, truncate_chars, with_retry,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::AppError;
use crate::routes::GuardedState;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ToolEnvelope<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ToolEnvelope<T> {
    fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchToolRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ScrapeToolRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtractToolRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub prompt: Option<String>,
}

pub fn tools_router() -> Router<AppState> {
    Router::new()
        .route("/search", post(search_tool))
        .route("/scrape", post(scrape_tool))
        .route("/extract", post(extract_tool))
        .route("/crawl/status/:id", get(crawl_status_tool))
}

fn require_field(value: &Option<String>, name: &str) -> Result<String, AppError> {
    match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(AppError::bad_request(format!(
            "Missing or invalid '{name}'"
        ))),
    }
}

#[instrument(skip_all)]
async fn search_tool(
    GuardedState(state): GuardedState,
    Json(payload): Json<SearchToolRequest>,
) -> Result<Json<ToolEnvelope<Vec<Candidate>>>, AppError> {
    let query = require_field(&payload.query, "query")?;

    let runtime = state.runtime();
    let policy = runtime.config.retry.policy();
    let mut candidates = with_retry(policy, || runtime.search.search(&query)).await?;
    if let Some(limit) = payload.limit {
        candidates.truncate(limit);
    }

    Ok(Json(ToolEnvelope::new(candidates)))
}

#[instrument(skip_all)]
async fn scrape_tool(
    GuardedState(state): GuardedState,
    Json(payload): Json<ScrapeToolRequest>,
) -> Result<Json<ToolEnvelope<SourceDocument>>, AppError> {
    let url = require_field(&payload.url, "url")?;

    let runtime = state.runtime();
    let policy = runtime.config.retry.policy();
    let page = with_retry(policy, || runtime.scrape.scrape(&url)).await?;

    Ok(Json(ToolEnvelope::new(SourceDocument {
        url,
        title: page.title.unwrap_or_default(),
        text: truncate_chars(&page.text, runtime.config.scrape.max_chars),
        date: page.date,
    })))
}

/// Structured extraction, with a plain scrape as the fallback when the
/// backend rejects the document as unprocessable.
#[instrument(skip_all)]
async fn extract_tool(
    GuardedState(state): GuardedState,
    Json(payload): Json<ExtractToolRequest>,
) -> Result<Json<ToolEnvelope<Value>>, AppError> {
    let url = require_field(&payload.url, "url")?;

    let firecrawl = state.firecrawl();
    match firecrawl
        .extract(&url, payload.schema.clone(), payload.prompt.clone())
        .await
    {
        Ok(data) => Ok(Json(ToolEnvelope::new(data))),
        Err(err) if err.is_unprocessable() => {
            warn!(url = %url, error = %err, "extract rejected, falling back to scrape");
            let runtime = state.runtime();
            let page = runtime.scrape.scrape(&url).await?;
            let document = SourceDocument {
                url,
                title: page.title.unwrap_or_default(),
                text: truncate_chars(&page.text, runtime.config.scrape.max_chars),
                date: page.date,
            };
            Ok(Json(ToolEnvelope::new(
                serde_json::to_value(document).map_err(AppError::internal)?,
            )))
        }
        Err(err) => Err(err.into()),
    }
}

/// Poll the backend's crawl job until it reports `completed` or the
/// attempt budget is spent; the last payload is returned either way.
#[instrument(skip_all, fields(job_id = %job_id))]
async fn crawl_status_tool(
    GuardedState(state): GuardedState,
    Path(job_id): Path<String>,
) -> Result<Json<ToolEnvelope<Value>>, AppError> {
    let firecrawl = state.firecrawl();
    let poll = state.crawl_poll();

    let mut last = Value::Null;
    for attempt in 0..poll.attempts {
        last = firecrawl.crawl_status(&job_id).await?;
        let status = last
            .get("status")
            .and_then(Value::as_str)
            .or_else(|| last.pointer("/data/status").and_then(Value::as_str))
            .unwrap_or_default();
        if status == "completed" {
            break;
        }
        if attempt + 1 < poll.attempts {
            tokio::time::sleep(poll.interval).await;
        }
    }

    Ok(Json(ToolEnvelope::new(last)))
}
