use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use crate::config::{SearchConfig, SecretValue};
use crate::error::{BackendError, DeepBriefError};
use crate::providers::SearchBackend;
use crate::types::Candidate;

/// Client for a hosted web-search endpoint. Tolerates the response
/// shapes the supported vendors use without caring which one answered.
#[derive(Clone)]
pub struct WebSearchBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretValue>,
    max_candidates: usize,
}

impl WebSearchBackend {
    pub fn new(client: reqwest::Client, config: &SearchConfig) -> Result<Self, DeepBriefError> {
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key()?,
            max_candidates: config.max_candidates,
        })
    }
}

#[async_trait]
impl SearchBackend for WebSearchBackend {
    async fn search(&self, query: &str) -> Result<Vec<Candidate>, BackendError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "query": query }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose());
        }

        let response = request.send().await.map_err(BackendError::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::status(status));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;
        let candidates = normalize_candidates(&body, self.max_candidates);
        tracing::debug!(
            query = %query,
            candidates = candidates.len(),
            "search backend returned candidates"
        );
        Ok(candidates)
    }
}

/// The accepted wire shapes, enumerated. Anything else is an empty batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchWire {
    Bare(Vec<Value>),
    Results { results: Vec<Value> },
    Data { data: Vec<Value> },
}

impl SearchWire {
    fn into_items(self) -> Vec<Value> {
        match self {
            SearchWire::Bare(items) => items,
            SearchWire::Results { results } => results,
            SearchWire::Data { data } => data,
        }
    }
}

/// Decode a raw search response into a deduplicated, capped candidate
/// list. Items without a usable URL are dropped; the first occurrence
/// of each URL wins and insertion order is preserved.
pub(crate) fn normalize_candidates(body: &Value, cap: usize) -> Vec<Candidate> {
    let items = match SearchWire::deserialize(body) {
        Ok(wire) => wire.into_items(),
        Err(_) => Vec::new(),
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates = Vec::new();
    for item in &items {
        let Some(candidate) = candidate_from(item) else {
            continue;
        };
        if !seen.insert(candidate.url.clone()) {
            continue;
        }
        candidates.push(candidate);
        if candidates.len() >= cap {
            break;
        }
    }
    candidates
}

fn candidate_from(item: &Value) -> Option<Candidate> {
    let url = field_str(item, &["url", "link", "href"])
        .or_else(|| item.pointer("/metadata/url").and_then(non_empty_str))?;
    Some(Candidate {
        url,
        title: field_str(item, &["title", "name"]).unwrap_or_default(),
        snippet: field_str(item, &["snippet", "description", "content"]).unwrap_or_default(),
    })
}

fn field_str(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| item.get(key).and_then(non_empty_str))
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
