use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::{ScrapeConfig, SecretValue};
use crate::error::{BackendError, DeepBriefError};
use crate::providers::ScrapeBackend;

/// Page content as returned by the backend, before the stage applies
/// its character budget.
#[derive(Debug, Clone)]
pub struct ScrapedPage {
    pub title: Option<String>,
    pub text: String,
    pub date: Option<DateTime<Utc>>,
}

/// Client for a Firecrawl-compatible scrape/extract backend.
#[derive(Clone)]
pub struct FirecrawlBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretValue>,
}

impl FirecrawlBackend {
    pub fn new(client: reqwest::Client, config: &ScrapeConfig) -> Result<Self, DeepBriefError> {
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key()?,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose()),
            None => request,
        }
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, BackendError> {
        let response = self
            .authorized(self.client.post(self.endpoint(path)))
            .json(&body)
            .send()
            .await
            .map_err(BackendError::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::status(status));
        }
        response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }

    /// Structured extraction with an optional schema and prompt.
    pub async fn extract(
        &self,
        url: &str,
        schema: Option<Value>,
        prompt: Option<String>,
    ) -> Result<Value, BackendError> {
        let mut body = serde_json::json!({ "urls": [url] });
        if let Some(schema) = schema {
            body["schema"] = schema;
        }
        if let Some(prompt) = prompt {
            body["prompt"] = Value::String(prompt);
        }
        let parsed = self.post_json("/v1/extract", body).await?;
        ensure_success(&parsed)?;
        Ok(parsed.get("data").cloned().unwrap_or(Value::Null))
    }

    /// One status poll for a backend-assigned crawl job.
    pub async fn crawl_status(&self, job_id: &str) -> Result<Value, BackendError> {
        let response = self
            .authorized(
                self.client
                    .get(self.endpoint(&format!("/v1/crawl/{job_id}"))),
            )
            .send()
            .await
            .map_err(BackendError::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::status(status));
        }
        response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }
}

#[async_trait]
impl ScrapeBackend for FirecrawlBackend {
    async fn scrape(&self, url: &str) -> Result<ScrapedPage, BackendError> {
        let body = serde_json::json!({
            "url": url,
            "formats": ["markdown"],
            "onlyMainContent": true,
        });
        let parsed = self.post_json("/v1/scrape", body).await?;
        ensure_success(&parsed)?;

        let data = parsed.get("data").unwrap_or(&parsed);
        Ok(ScrapedPage {
            title: data
                .pointer("/metadata/title")
                .and_then(Value::as_str)
                .map(str::to_string),
            text: extract_text(data),
            date: data
                .pointer("/metadata/publishedTime")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|parsed| parsed.with_timezone(&Utc)),
        })
    }
}

fn ensure_success(parsed: &Value) -> Result<(), BackendError> {
    match parsed.get("success").and_then(Value::as_bool) {
        Some(false) => Err(BackendError::Decode(
            "backend reported success=false".into(),
        )),
        _ => Ok(()),
    }
}

/// Best-effort body extraction across the field names the supported
/// backends populate; the stringified object is the last resort.
pub(crate) fn extract_text(data: &Value) -> String {
    const FIELDS: [&str; 4] = ["markdown", "content", "text", "article/content"];
    for field in FIELDS {
        let found = if field.contains('/') {
            data.pointer(&format!("/{field}"))
        } else {
            data.get(field)
        };
        if let Some(text) = found.and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return text.to_string();
            }
        }
    }
    data.to_string()
}
