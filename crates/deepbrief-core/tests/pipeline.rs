//! End-to-end pipeline behavior against scripted backends.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use deepbrief_core::{
    BackendError, Candidate, ChatBackend, ChatStream, EVENT_CHANNEL_CAPACITY, EventEmitter,
    LimitsConfig, LlmConfig, PipelineRuntime, RerankConfig, ResearchConfig, ResearchOptions,
    RetryConfig, ScrapeBackend, ScrapeConfig, ScrapedPage, SearchBackend, SearchConfig,
    StreamEvent, SynthesisConfig, run_pipeline, run_research, stream_research,
};

fn test_config() -> ResearchConfig {
    ResearchConfig {
        search: SearchConfig {
            endpoint: "http://search.invalid/search".into(),
            api_key_env: String::new(),
            max_candidates: 30,
        },
        scrape: ScrapeConfig {
            base_url: "http://scrape.invalid".into(),
            api_key_env: String::new(),
            max_chars: 4_000,
            concurrency: 4,
        },
        llm: LlmConfig {
            base_url: "http://llm.invalid".into(),
            api_key_env: String::new(),
        },
        rerank: RerankConfig {
            model: "rerank-model".into(),
            top_n: 8,
        },
        synthesis: SynthesisConfig {
            model: "synthesis-model".into(),
            system_prompt: None,
        },
        retry: RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
        },
        limits: LimitsConfig {
            deadline_secs: 10,
            step_budget: 12,
        },
    }
}

fn candidates(n: usize) -> Vec<Candidate> {
    (0..n)
        .map(|i| Candidate {
            url: format!("http://site{i}.com"),
            title: format!("Site {i}"),
            snippet: format!("snippet {i}"),
        })
        .collect()
}

struct MockSearch {
    candidates: Vec<Candidate>,
    fail: bool,
    calls: AtomicUsize,
}

impl MockSearch {
    fn returning(candidates: Vec<Candidate>) -> Arc<Self> {
        Arc::new(Self {
            candidates,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            candidates: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SearchBackend for MockSearch {
    async fn search(&self, _query: &str) -> Result<Vec<Candidate>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BackendError::Status { status: 500 });
        }
        Ok(self.candidates.clone())
    }
}

struct MockScrape {
    fail_urls: HashSet<String>,
    calls: AtomicUsize,
}

impl MockScrape {
    fn ok() -> Arc<Self> {
        Self::failing_for(&[])
    }

    fn failing_for(urls: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail_urls: urls.iter().map(|url| url.to_string()).collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ScrapeBackend for MockScrape {
    async fn scrape(&self, url: &str) -> Result<ScrapedPage, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_urls.contains(url) {
            return Err(BackendError::Status { status: 404 });
        }
        Ok(ScrapedPage {
            title: Some(format!("Title for {url}")),
            text: format!("content fetched from {url}"),
            date: None,
        })
    }
}

enum StreamScript {
    Deltas(Vec<&'static str>),
    FailAfter(Vec<&'static str>),
    FailToStart,
    NeverFinishes,
}

struct MockChat {
    rerank_reply: Option<&'static str>,
    script: StreamScript,
    complete_calls: AtomicUsize,
}

impl MockChat {
    fn new(rerank_reply: Option<&'static str>, script: StreamScript) -> Arc<Self> {
        Arc::new(Self {
            rerank_reply,
            script,
            complete_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ChatBackend for MockChat {
    async fn complete(
        &self,
        _model: &str,
        _system: &str,
        _user: &str,
    ) -> Result<String, BackendError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        match self.rerank_reply {
            Some(reply) => Ok(reply.to_string()),
            None => Err(BackendError::Status { status: 500 }),
        }
    }

    async fn stream(
        &self,
        _model: &str,
        _system: &str,
        _user: &str,
    ) -> Result<ChatStream, BackendError> {
        match &self.script {
            StreamScript::Deltas(deltas) => {
                let items: Vec<Result<String, BackendError>> =
                    deltas.iter().map(|delta| Ok(delta.to_string())).collect();
                Ok(futures::stream::iter(items).boxed())
            }
            StreamScript::FailAfter(deltas) => {
                let mut items: Vec<Result<String, BackendError>> =
                    deltas.iter().map(|delta| Ok(delta.to_string())).collect();
                items.push(Err(BackendError::Transport("connection dropped".into())));
                Ok(futures::stream::iter(items).boxed())
            }
            StreamScript::FailToStart => Err(BackendError::Status { status: 500 }),
            StreamScript::NeverFinishes => Ok(futures::stream::pending().boxed()),
        }
    }
}

fn runtime(
    search: Arc<MockSearch>,
    scrape: Arc<MockScrape>,
    chat: Arc<MockChat>,
    config: ResearchConfig,
) -> Arc<PipelineRuntime> {
    Arc::new(PipelineRuntime::new(search, scrape, chat, config))
}

async fn collect_events(
    mut receiver: tokio::sync::mpsc::Receiver<StreamEvent>,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(event);
    }
    events
}

fn streamed_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Text { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn happy_path_with_rerank_fallback_streams_brief() {
    let search = MockSearch::returning(candidates(1));
    let scrape = MockScrape::ok();
    // Rerank model is down; synthesis streams two deltas.
    let chat = MockChat::new(None, StreamScript::Deltas(vec!["Hello", " world"]));
    let runtime = runtime(search, scrape.clone(), chat, test_config());

    let events = collect_events(stream_research(runtime, ResearchOptions::new("test"))).await;

    assert!(matches!(events.first(), Some(StreamEvent::Status { .. })));
    assert_eq!(streamed_text(&events), "Hello world");
    match events.last() {
        Some(StreamEvent::Done {
            candidates,
            sources,
            chars_streamed,
        }) => {
            assert_eq!(*candidates, 1);
            assert_eq!(*sources, 1);
            assert_eq!(*chars_streamed, "Hello world".len());
        }
        other => panic!("expected done as the last event, got {other:?}"),
    }
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, StreamEvent::Error { .. }))
    );
    assert_eq!(scrape.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_candidates_still_reach_synthesis() {
    let search = MockSearch::returning(Vec::new());
    let scrape = MockScrape::ok();
    let chat = MockChat::new(None, StreamScript::Deltas(vec!["From background knowledge."]));
    let runtime = runtime(search, scrape.clone(), chat.clone(), test_config());

    let events = collect_events(stream_research(runtime, ResearchOptions::new("test"))).await;

    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    assert_eq!(streamed_text(&events), "From background knowledge.");
    // Rerank and scrape were skipped entirely.
    assert_eq!(chat.complete_calls.load(Ordering::SeqCst), 0);
    assert_eq!(scrape.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn search_failure_degrades_like_an_empty_batch() {
    let search = MockSearch::failing();
    let scrape = MockScrape::ok();
    let chat = MockChat::new(None, StreamScript::Deltas(vec!["Best effort."]));
    let runtime = runtime(search.clone(), scrape, chat, test_config());

    let events = collect_events(stream_research(runtime, ResearchOptions::new("test"))).await;

    // Two attempts per the retry budget, then the degrade path.
    assert_eq!(search.calls.load(Ordering::SeqCst), 2);
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, StreamEvent::Error { .. }))
    );
}

#[tokio::test]
async fn failed_scrapes_are_dropped_without_failing_the_batch() {
    let search = MockSearch::returning(candidates(5));
    let scrape = MockScrape::failing_for(&["http://site1.com", "http://site3.com"]);
    let chat = MockChat::new(None, StreamScript::Deltas(vec!["ok"]));
    let runtime = runtime(search, scrape, chat, test_config());

    let outcome = run_research(runtime, ResearchOptions::new("test"))
        .await
        .expect("pipeline should succeed");

    assert_eq!(outcome.candidate_count, 5);
    assert_eq!(outcome.sources.len(), 3);
    let urls: Vec<_> = outcome
        .sources
        .iter()
        .map(|source| source.url.as_str())
        .collect();
    assert!(!urls.contains(&"http://site1.com"));
    assert!(!urls.contains(&"http://site3.com"));
}

#[tokio::test]
async fn valid_rerank_reply_narrows_the_scrape_batch() {
    let search = MockSearch::returning(candidates(5));
    let scrape = MockScrape::ok();
    let chat = MockChat::new(
        Some(r#"{"ranked": [{"url": "http://site4.com", "score": 0.9, "reason": "fresh"}]}"#),
        StreamScript::Deltas(vec!["ok"]),
    );
    let runtime = runtime(search, scrape.clone(), chat, test_config());

    let outcome = run_research(runtime, ResearchOptions::new("test"))
        .await
        .expect("pipeline should succeed");

    assert_eq!(scrape.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.sources.len(), 1);
    assert_eq!(outcome.sources[0].url, "http://site4.com");
}

#[tokio::test]
async fn synthesis_failure_before_output_is_terminal() {
    let search = MockSearch::returning(candidates(1));
    let scrape = MockScrape::ok();
    let chat = MockChat::new(None, StreamScript::FailToStart);
    let runtime = runtime(search, scrape, chat, test_config());

    let events = collect_events(stream_research(
        runtime.clone(),
        ResearchOptions::new("test"),
    ))
    .await;

    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, StreamEvent::Done { .. }))
    );

    let result = run_research(runtime, ResearchOptions::new("test")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn mid_stream_failure_preserves_partial_output() {
    let search = MockSearch::returning(candidates(1));
    let scrape = MockScrape::ok();
    let chat = MockChat::new(None, StreamScript::FailAfter(vec!["partial"]));
    let runtime = runtime(search, scrape, chat, test_config());

    let events = collect_events(stream_research(runtime, ResearchOptions::new("test"))).await;

    assert_eq!(streamed_text(&events), "partial");
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, StreamEvent::Done { .. }))
    );
}

#[tokio::test]
async fn deadline_is_enforced() {
    let mut config = test_config();
    config.limits.deadline_secs = 1;

    let search = MockSearch::returning(candidates(1));
    let scrape = MockScrape::ok();
    let chat = MockChat::new(None, StreamScript::NeverFinishes);
    let runtime = runtime(search, scrape, chat, config);

    let events = collect_events(stream_research(runtime, ResearchOptions::new("test"))).await;

    match events.last() {
        Some(StreamEvent::Error { message }) => assert!(message.contains("deadline")),
        other => panic!("expected deadline error, got {other:?}"),
    }
}

#[tokio::test]
async fn dropped_consumer_stops_the_pipeline() {
    let search = MockSearch::returning(candidates(1));
    let scrape = MockScrape::ok();
    let chat = MockChat::new(None, StreamScript::NeverFinishes);
    let runtime = runtime(search, scrape, chat, test_config());

    let (events, receiver) = EventEmitter::channel(EVENT_CHANNEL_CAPACITY);
    drop(receiver);

    let handle = tokio::spawn(run_pipeline(runtime, ResearchOptions::new("test"), events));
    let joined = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("pipeline must stop once the consumer is gone");
    assert!(joined.is_ok());
}
