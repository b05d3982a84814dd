//! The four pipeline stages, expressed as `graph_flow` tasks.
//!
//! Stages communicate through the graph session context and report to
//! the client through the event channel. Every stage except synthesis
//! degrades on failure instead of ending the run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::join_all;
use graph_flow::{Context, NextAction, Task, TaskResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::error::BackendError;
use crate::events::{EventEmitter, PipelineStage};
use crate::providers::{ChatBackend, ScrapeBackend, SearchBackend};
use crate::retry::with_retry;
use crate::types::{Candidate, RankedCandidate, SourceDocument, truncate_chars};
use crate::workflow::PipelineRuntime;

pub(crate) const RERANK_SYSTEM_PROMPT: &str = "You rank web search results for a research \
assistant. Judge relevance to the query, authority of the source, and recency. Reply with \
strict JSON only, no prose and no code fences.";

pub(crate) const SYNTHESIS_SYSTEM_PROMPT: &str = "You are a research analyst. Write a \
research brief in markdown with exactly these sections: a one-paragraph **TL;DR**; a \
**Key points** bullet list; a **Findings** narrative; and a **Sources** table with columns \
index, title, and URL. Cite sources inline with bracketed numeric markers like [1] that \
refer to rows of the Sources table. Only cite sources you were given.";

/// The consumer went away; end the run without touching the stream.
fn cancelled() -> TaskResult {
    TaskResult::new(None, NextAction::End)
}

/// Issues the web search and publishes the normalized candidate batch.
pub struct SearchTask {
    runtime: Arc<PipelineRuntime>,
    events: EventEmitter,
}

impl SearchTask {
    pub(crate) fn new(runtime: Arc<PipelineRuntime>, events: EventEmitter) -> Self {
        Self { runtime, events }
    }
}

#[async_trait]
impl Task for SearchTask {
    fn id(&self) -> &str {
        "search"
    }

    #[instrument(name = "task.search", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let query: String = context.get("query").await.unwrap_or_default();

        if self
            .events
            .status(PipelineStage::Searching, "searching the web")
            .await
            .is_err()
            || self.events.tool_call("web_search", &query).await.is_err()
        {
            return Ok(cancelled());
        }

        let policy = self.runtime.config.retry.policy();
        let backend = self.runtime.search.clone();
        let candidates = match with_retry(policy, || backend.search(&query)).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(
                    error = %err,
                    "search backend failed after retries; continuing without candidates"
                );
                Vec::new()
            }
        };

        if self
            .events
            .tool_output("web_search", &format!("{} candidates", candidates.len()))
            .await
            .is_err()
        {
            return Ok(cancelled());
        }

        info!(candidates = candidates.len(), "search stage complete");
        context.set("search.candidates", &candidates).await;
        context.set_sync("search.has_candidates", !candidates.is_empty());

        Ok(TaskResult::new(
            Some(format!("collected {} candidates", candidates.len())),
            NextAction::ContinueAndExecute,
        ))
    }
}

/// Asks the rerank model for a top-N selection, falling back to the
/// search order when the model's answer is unusable.
pub struct RerankTask {
    runtime: Arc<PipelineRuntime>,
    events: EventEmitter,
}

impl RerankTask {
    pub(crate) fn new(runtime: Arc<PipelineRuntime>, events: EventEmitter) -> Self {
        Self { runtime, events }
    }

    async fn model_ranking(
        &self,
        query: &str,
        candidates: &[Candidate],
        top_n: usize,
    ) -> Result<Option<Vec<RankedCandidate>>, BackendError> {
        let policy = self.runtime.config.retry.policy();
        let chat = self.runtime.chat.clone();
        let model = self.runtime.config.rerank.model.clone();
        let user = build_rerank_prompt(query, candidates, top_n);
        let reply = with_retry(policy, || {
            chat.complete(&model, RERANK_SYSTEM_PROMPT, &user)
        })
        .await?;
        Ok(parse_ranked(&reply, candidates, top_n))
    }
}

#[async_trait]
impl Task for RerankTask {
    fn id(&self) -> &str {
        "rerank"
    }

    #[instrument(name = "task.rerank", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let query: String = context.get("query").await.unwrap_or_default();
        let candidates: Vec<Candidate> =
            context.get("search.candidates").await.unwrap_or_default();
        let top_n = self.runtime.config.rerank.top_n;

        if self
            .events
            .status(
                PipelineStage::Reranking,
                format!("ranking {} candidates", candidates.len()),
            )
            .await
            .is_err()
        {
            return Ok(cancelled());
        }

        let selected = match self.model_ranking(&query, &candidates, top_n).await {
            Ok(Some(ranked)) => ranked,
            Ok(None) => {
                warn!("rerank model returned no usable ranking; using baseline order");
                baseline_ranking(&candidates, top_n)
            }
            Err(err) => {
                warn!(error = %err, "rerank model call failed; using baseline order");
                baseline_ranking(&candidates, top_n)
            }
        };

        debug!(selected = selected.len(), "rerank stage complete");
        context.set("rerank.selected", &selected).await;

        Ok(TaskResult::new(
            Some(format!("selected {} candidates", selected.len())),
            NextAction::ContinueAndExecute,
        ))
    }
}

/// Fetches full text for the selected URLs with bounded fan-out.
/// Failed URLs are dropped; the batch never fails as a whole.
pub struct ScrapeTask {
    runtime: Arc<PipelineRuntime>,
    events: EventEmitter,
}

impl ScrapeTask {
    pub(crate) fn new(runtime: Arc<PipelineRuntime>, events: EventEmitter) -> Self {
        Self { runtime, events }
    }

    async fn scrape_many(&self, selected: &[RankedCandidate]) -> Vec<SourceDocument> {
        let config = &self.runtime.config.scrape;
        let policy = self.runtime.config.retry.policy();
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));

        let fetches = selected.iter().map(|ranked| {
            let semaphore = semaphore.clone();
            let backend = self.runtime.scrape.clone();
            let max_chars = config.max_chars;
            async move {
                let _permit = semaphore.acquire_owned().await.unwrap();
                let url = ranked.candidate.url.as_str();
                match with_retry(policy, || backend.scrape(url)).await {
                    Ok(page) => {
                        let text = truncate_chars(&page.text, max_chars);
                        if text.trim().is_empty() {
                            debug!(url, "scraped page had no text, dropping");
                            return None;
                        }
                        Some(SourceDocument {
                            url: url.to_string(),
                            title: page
                                .title
                                .unwrap_or_else(|| ranked.candidate.title.clone()),
                            text,
                            date: page.date,
                        })
                    }
                    Err(err) => {
                        warn!(url, error = %err, "scrape failed, dropping source");
                        None
                    }
                }
            }
        });

        join_all(fetches).await.into_iter().flatten().collect()
    }
}

#[async_trait]
impl Task for ScrapeTask {
    fn id(&self) -> &str {
        "scrape"
    }

    #[instrument(name = "task.scrape", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let selected: Vec<RankedCandidate> =
            context.get("rerank.selected").await.unwrap_or_default();

        let urls: Vec<&str> = selected
            .iter()
            .map(|ranked| ranked.candidate.url.as_str())
            .collect();
        if self
            .events
            .status(
                PipelineStage::Scraping,
                format!("fetching {} sources", selected.len()),
            )
            .await
            .is_err()
            || self
                .events
                .tool_call("scrape", &urls.join(" "))
                .await
                .is_err()
        {
            return Ok(cancelled());
        }

        let sources = self.scrape_many(&selected).await;

        if self
            .events
            .tool_output(
                "scrape",
                &format!("{} of {} pages fetched", sources.len(), selected.len()),
            )
            .await
            .is_err()
        {
            return Ok(cancelled());
        }

        info!(
            fetched = sources.len(),
            requested = selected.len(),
            "scrape stage complete"
        );
        context.set("scrape.sources", &sources).await;

        Ok(TaskResult::new(
            Some(format!("fetched {} sources", sources.len())),
            NextAction::ContinueAndExecute,
        ))
    }
}

/// Streams the brief from the synthesis model. The only stage whose
/// total failure is terminal for the run.
pub struct SynthesizeTask {
    runtime: Arc<PipelineRuntime>,
    events: EventEmitter,
}

impl SynthesizeTask {
    pub(crate) fn new(runtime: Arc<PipelineRuntime>, events: EventEmitter) -> Self {
        Self { runtime, events }
    }
}

#[async_trait]
impl Task for SynthesizeTask {
    fn id(&self) -> &str {
        "synthesize"
    }

    #[instrument(name = "task.synthesize", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let query: String = context.get("query").await.unwrap_or_default();
        let candidates: Vec<Candidate> =
            context.get("search.candidates").await.unwrap_or_default();
        let sources: Vec<SourceDocument> =
            context.get("scrape.sources").await.unwrap_or_default();

        if self
            .events
            .status(
                PipelineStage::Synthesizing,
                format!("writing brief from {} sources", sources.len()),
            )
            .await
            .is_err()
        {
            return Ok(cancelled());
        }

        let system = self
            .runtime
            .config
            .synthesis
            .system_prompt
            .clone()
            .unwrap_or_else(|| SYNTHESIS_SYSTEM_PROMPT.to_string());
        let user = build_synthesis_prompt(&query, &sources);
        let model = self.runtime.config.synthesis.model.clone();
        let policy = self.runtime.config.retry.policy();
        let chat = self.runtime.chat.clone();

        let mut stream = match with_retry(policy, || chat.stream(&model, &system, &user)).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "synthesis failed before producing output");
                let _ = self.events.error(format!("synthesis failed: {err}")).await;
                context.set("synthesis.failed", true).await;
                return Ok(TaskResult::new(None, NextAction::End));
            }
        };

        let mut brief = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(delta) => {
                    brief.push_str(&delta);
                    if self.events.text(delta).await.is_err() {
                        return Ok(cancelled());
                    }
                }
                Err(err) => {
                    // Whatever streamed so far is preserved.
                    error!(
                        error = %err,
                        streamed_chars = brief.chars().count(),
                        "synthesis stream failed mid-flight"
                    );
                    context.set("synthesis.brief", &brief).await;
                    context.set("synthesis.failed", true).await;
                    let _ = self
                        .events
                        .error(format!("synthesis interrupted: {err}"))
                        .await;
                    return Ok(TaskResult::new(None, NextAction::End));
                }
            }
        }

        let chars_streamed = brief.chars().count();
        context.set("synthesis.brief", &brief).await;

        if self
            .events
            .done(candidates.len(), sources.len(), chars_streamed)
            .await
            .is_err()
        {
            return Ok(cancelled());
        }

        info!(sources = sources.len(), chars_streamed, "synthesis complete");
        Ok(TaskResult::new(
            Some("research brief synthesized".to_string()),
            NextAction::End,
        ))
    }
}

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("invalid code fence regex")
});

fn strip_code_fence(reply: &str) -> &str {
    match CODE_FENCE.captures(reply) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(reply),
        None => reply.trim(),
    }
}

#[derive(Debug, Deserialize)]
struct RankedReply {
    ranked: Vec<RankedEntry>,
}

#[derive(Debug, Deserialize)]
struct RankedEntry {
    url: String,
    score: f64,
    #[serde(default)]
    reason: String,
}

pub(crate) fn build_rerank_prompt(query: &str, candidates: &[Candidate], top_n: usize) -> String {
    let listing = serde_json::to_string_pretty(candidates).unwrap_or_else(|_| "[]".to_string());
    format!(
        "Query: {query}\n\nCandidates:\n{listing}\n\nSelect the {top_n} best candidates. \
Respond with strict JSON of the shape {{\"ranked\": [{{\"url\": \"...\", \"score\": 0.0, \
\"reason\": \"...\"}}]}} with at most {top_n} entries, sorted by score descending."
    )
}

/// Decode the rerank model's reply. `None` means the reply is unusable
/// and the caller should fall back to the baseline order. The model's
/// ordering is trusted as-is.
pub(crate) fn parse_ranked(
    reply: &str,
    candidates: &[Candidate],
    top_n: usize,
) -> Option<Vec<RankedCandidate>> {
    let parsed: RankedReply = serde_json::from_str(strip_code_fence(reply)).ok()?;

    let by_url: HashMap<&str, &Candidate> = candidates
        .iter()
        .map(|candidate| (candidate.url.as_str(), candidate))
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut ranked = Vec::new();
    for entry in parsed.ranked {
        if ranked.len() >= top_n {
            break;
        }
        // Entries for URLs outside the batch are model fabrications.
        let Some(candidate) = by_url.get(entry.url.as_str()) else {
            debug!(url = %entry.url, "rerank entry references unknown url, dropping");
            continue;
        };
        if !seen.insert(entry.url.clone()) {
            continue;
        }
        ranked.push(RankedCandidate {
            candidate: (*candidate).clone(),
            score: entry.score,
            reason: entry.reason,
        });
    }

    if ranked.is_empty() { None } else { Some(ranked) }
}

/// Deterministic degrade path: search order, neutral scores.
pub(crate) fn baseline_ranking(candidates: &[Candidate], top_n: usize) -> Vec<RankedCandidate> {
    candidates
        .iter()
        .take(top_n)
        .cloned()
        .map(|candidate| RankedCandidate {
            candidate,
            score: 0.5,
            reason: "baseline".to_string(),
        })
        .collect()
}

pub(crate) fn build_synthesis_prompt(query: &str, sources: &[SourceDocument]) -> String {
    if sources.is_empty() {
        return format!(
            "Research query: {query}\n\nNo sources could be collected for this query. Write \
the brief from your own knowledge, say so in the TL;DR, and leave the Sources table empty."
        );
    }

    let listing = sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            let date = source
                .date
                .map(|date| date.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "[{}] {}\nURL: {}\nPublished: {}\n\n{}",
                index + 1,
                source.title,
                source.url,
                date,
                source.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    format!("Research query: {query}\n\nSources:\n\n{listing}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate {
                url: format!("http://site{i}.com"),
                title: format!("Site {i}"),
                snippet: format!("snippet {i}"),
            })
            .collect()
    }

    #[test]
    fn valid_reply_is_parsed_in_model_order() {
        let batch = candidates(3);
        let reply = r#"{"ranked": [
            {"url": "http://site2.com", "score": 0.9, "reason": "best"},
            {"url": "http://site0.com", "score": 0.4, "reason": "ok"}
        ]}"#;
        let ranked = parse_ranked(reply, &batch, 8).expect("should parse");
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].candidate.url, "http://site2.com");
        assert_eq!(ranked[0].score, 0.9);
        assert_eq!(ranked[1].candidate.url, "http://site0.com");
    }

    #[test]
    fn fenced_reply_is_unwrapped() {
        let batch = candidates(1);
        let reply = "```json\n{\"ranked\": [{\"url\": \"http://site0.com\", \"score\": 1.0}]}\n```";
        let ranked = parse_ranked(reply, &batch, 8).expect("should parse");
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].reason, "");
    }

    #[test]
    fn unusable_replies_yield_none() {
        let batch = candidates(2);
        assert!(parse_ranked("not json at all", &batch, 8).is_none());
        assert!(parse_ranked(r#"{"ranked": []}"#, &batch, 8).is_none());
        assert!(parse_ranked(r#"{"results": []}"#, &batch, 8).is_none());
        // Every entry fabricated -> nothing usable.
        let fabricated = r#"{"ranked": [{"url": "http://invented.com", "score": 1.0}]}"#;
        assert!(parse_ranked(fabricated, &batch, 8).is_none());
    }

    #[test]
    fn fabricated_and_duplicate_entries_are_dropped() {
        let batch = candidates(3);
        let reply = r#"{"ranked": [
            {"url": "http://site1.com", "score": 0.9},
            {"url": "http://invented.com", "score": 0.8},
            {"url": "http://site1.com", "score": 0.7},
            {"url": "http://site0.com", "score": 0.6}
        ]}"#;
        let ranked = parse_ranked(reply, &batch, 8).expect("should parse");
        let urls: Vec<_> = ranked.iter().map(|r| r.candidate.url.as_str()).collect();
        assert_eq!(urls, vec!["http://site1.com", "http://site0.com"]);
    }

    #[test]
    fn output_is_capped_at_top_n() {
        let batch = candidates(10);
        let entries = (0..10)
            .map(|i| format!(r#"{{"url": "http://site{i}.com", "score": 0.5}}"#))
            .collect::<Vec<_>>()
            .join(",");
        let reply = format!(r#"{{"ranked": [{entries}]}}"#);
        let ranked = parse_ranked(&reply, &batch, 4).expect("should parse");
        assert_eq!(ranked.len(), 4);
    }

    #[test]
    fn baseline_is_identity_truncation_with_neutral_scores() {
        let batch = candidates(5);
        let ranked = baseline_ranking(&batch, 3);
        assert_eq!(ranked.len(), 3);
        for (index, entry) in ranked.iter().enumerate() {
            assert_eq!(entry.candidate.url, batch[index].url);
            assert_eq!(entry.score, 0.5);
            assert_eq!(entry.reason, "baseline");
        }
        assert!(baseline_ranking(&[], 3).is_empty());
    }

    #[test]
    fn code_fence_stripping_handles_plain_and_fenced() {
        assert_eq!(strip_code_fence("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[test]
    fn rerank_prompt_embeds_query_and_candidates() {
        let prompt = build_rerank_prompt("rust web frameworks", &candidates(2), 5);
        assert!(prompt.contains("Query: rust web frameworks"));
        assert!(prompt.contains("http://site0.com"));
        assert!(prompt.contains("at most 5 entries"));
    }

    #[test]
    fn synthesis_prompt_numbers_sources_from_one() {
        let sources = vec![
            SourceDocument {
                url: "http://a.com".into(),
                title: "A".into(),
                text: "alpha".into(),
                date: None,
            },
            SourceDocument {
                url: "http://b.com".into(),
                title: "B".into(),
                text: "beta".into(),
                date: None,
            },
        ];
        let prompt = build_synthesis_prompt("test", &sources);
        assert!(prompt.contains("[1] A"));
        assert!(prompt.contains("[2] B"));
        assert!(prompt.contains("Published: unknown"));
    }

    #[test]
    fn synthesis_prompt_degrades_without_sources() {
        let prompt = build_synthesis_prompt("test", &[]);
        assert!(prompt.contains("No sources could be collected"));
    }
}
