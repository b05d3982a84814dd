use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::response::sse::Event;
use dashmap::DashMap;
use deepbrief_core::{
    DeepBriefError, EVENT_CHANNEL_CAPACITY, EventEmitter, FirecrawlBackend, OpenAiChatBackend,
    PipelineRuntime, ResearchConfig, ResearchOptions, StreamEvent, WebSearchBackend, run_pipeline,
};
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{self as stream, Stream, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    research: Arc<ResearchService>,
    runtime: Arc<PipelineRuntime>,
    firecrawl: Arc<FirecrawlBackend>,
    auth_token: Option<Arc<String>>,
    crawl_poll: CrawlPoll,
}

#[derive(Clone, Copy, Debug)]
pub struct CrawlPoll {
    pub attempts: usize,
    pub interval: Duration,
}

impl AppState {
    pub fn try_new(
        app_config: &AppConfig,
        config: ResearchConfig,
    ) -> Result<Self, DeepBriefError> {
        let client = reqwest::Client::new();
        let search = Arc::new(WebSearchBackend::new(client.clone(), &config.search)?);
        let firecrawl = Arc::new(FirecrawlBackend::new(client.clone(), &config.scrape)?);
        let chat = Arc::new(OpenAiChatBackend::new(client, &config.llm)?);

        let runtime = Arc::new(PipelineRuntime::new(
            search,
            firecrawl.clone(),
            chat,
            config,
        ));
        let research = Arc::new(ResearchService::new(
            runtime.clone(),
            app_config.max_concurrency,
        ));

        Ok(Self {
            research,
            runtime,
            firecrawl,
            auth_token: app_config
                .auth_token
                .as_ref()
                .map(|token| Arc::new(token.to_string())),
            crawl_poll: CrawlPoll {
                attempts: app_config.crawl_poll_attempts,
                interval: app_config.crawl_poll_interval,
            },
        })
    }

    pub fn research_service(&self) -> Arc<ResearchService> {
        self.research.clone()
    }

    pub fn runtime(&self) -> Arc<PipelineRuntime> {
        self.runtime.clone()
    }

    pub fn firecrawl(&self) -> Arc<FirecrawlBackend> {
        self.firecrawl.clone()
    }

    pub fn auth_token(&self) -> Option<Arc<String>> {
        self.auth_token.clone()
    }

    pub fn crawl_poll(&self) -> CrawlPoll {
        self.crawl_poll
    }
}

/// Runs research pipelines under a concurrency cap and keeps a registry
/// of named runs with live event tails.
pub struct ResearchService {
    runtime: Arc<PipelineRuntime>,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    runs: Arc<DashMap<String, RunRecord>>,
    streams: Arc<DashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl ResearchService {
    pub fn new(runtime: Arc<PipelineRuntime>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            runtime,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            runs: Arc::new(DashMap::new()),
            streams: Arc::new(DashMap::new()),
        }
    }

    /// Request-scoped run: the caller owns the receiver; dropping it
    /// cancels the pipeline.
    pub async fn stream(&self, query: String) -> Result<mpsc::Receiver<StreamEvent>> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        let runtime = self.runtime.clone();
        let (events, receiver) = EventEmitter::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = run_pipeline(runtime, ResearchOptions::new(query), events).await {
                error!(error = %err, "research request failed");
            }
        });

        Ok(receiver)
    }

    /// Registered run: events fan out over a broadcast channel so late
    /// subscribers can tail the stream while it is live.
    pub fn start_run(&self, query: String) -> String {
        let run_id = Uuid::new_v4().to_string();

        let sender = self
            .streams
            .entry(run_id.clone())
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(32);
                tx
            })
            .clone();
        self.runs.insert(run_id.clone(), RunRecord::Running);
        crate::metrics::run_started(&run_id, self.running_runs(), self.available_permits());

        let semaphore = self.semaphore.clone();
        let runtime = self.runtime.clone();
        let runs = self.runs.clone();
        let streams = self.streams.clone();
        let run_id_for_task = run_id.clone();

        tokio::spawn(async move {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    runs.insert(
                        run_id_for_task.clone(),
                        RunRecord::Failed {
                            error: err.to_string(),
                        },
                    );
                    streams.remove(&run_id_for_task);
                    return;
                }
            };

            let (events, mut receiver) = EventEmitter::channel(EVENT_CHANNEL_CAPACITY);
            let forwarder = {
                let sender = sender.clone();
                tokio::spawn(async move {
                    while let Some(event) = receiver.recv().await {
                        // No subscriber is fine; the record keeps the outcome.
                        let _ = sender.send(event);
                    }
                })
            };

            let options =
                ResearchOptions::new(query).with_session_id(run_id_for_task.clone());
            let result = run_pipeline(runtime, options, events).await;
            drop(permit);
            let _ = forwarder.await;

            match result {
                Ok(outcome) => {
                    info!(run_id = %run_id_for_task, "run completed");
                    runs.insert(
                        run_id_for_task.clone(),
                        RunRecord::Completed {
                            brief: outcome.brief,
                            sources: outcome.sources.len(),
                            candidates: outcome.candidate_count,
                        },
                    );
                    crate::metrics::run_completed(
                        &run_id_for_task,
                        running_count(&runs),
                        semaphore.available_permits(),
                    );
                }
                Err(err) => {
                    error!(run_id = %run_id_for_task, error = %err, "run failed");
                    runs.insert(
                        run_id_for_task.clone(),
                        RunRecord::Failed {
                            error: err.to_string(),
                        },
                    );
                    crate::metrics::run_failed(
                        &run_id_for_task,
                        running_count(&runs),
                        semaphore.available_permits(),
                        &err.to_string(),
                    );
                }
            }

            streams.remove(&run_id_for_task);
        });

        run_id
    }

    pub fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs
            .get(run_id)
            .map(|record| status_view(run_id, record.value()))
    }

    pub fn list_runs(&self) -> Vec<RunStatus> {
        self.runs
            .iter()
            .map(|entry| status_view(entry.key(), entry.value()))
            .collect()
    }

    pub fn event_stream(&self, run_id: &str) -> Option<SseStream> {
        if let Some(record) = self.runs.get(run_id) {
            match record.value() {
                RunRecord::Completed {
                    brief,
                    sources,
                    candidates,
                } => {
                    let event = into_sse_event(&StreamEvent::Done {
                        candidates: *candidates,
                        sources: *sources,
                        chars_streamed: brief.chars().count(),
                    });
                    let stream = stream::iter(vec![Result::<Event, Infallible>::Ok(event)]);
                    return Some(Box::pin(stream));
                }
                RunRecord::Failed { error } => {
                    let event = into_sse_event(&StreamEvent::Error {
                        message: error.clone(),
                    });
                    let stream = stream::iter(vec![Result::<Event, Infallible>::Ok(event)]);
                    return Some(Box::pin(stream));
                }
                RunRecord::Running => {}
            }
        }

        self.streams.get(run_id).map(|sender| {
            let rx = sender.subscribe();
            let stream = BroadcastStream::new(rx).filter_map(|event| match event {
                Ok(event) => Some(Result::<Event, Infallible>::Ok(into_sse_event(&event))),
                Err(err) => {
                    warn!(error = %err, "run event stream lagged");
                    None
                }
            });
            Box::pin(stream) as SseStream
        })
    }

    pub fn metrics(&self) -> ServiceMetrics {
        ServiceMetrics {
            max_concurrency: self.max_concurrency,
            available_permits: self.available_permits(),
            running_runs: self.running_runs(),
            total_runs: self.runs.len(),
        }
    }

    fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn running_runs(&self) -> usize {
        running_count(&self.runs)
    }
}

fn running_count(runs: &DashMap<String, RunRecord>) -> usize {
    runs.iter()
        .filter(|entry| matches!(entry.value(), RunRecord::Running))
        .count()
}

fn status_view(run_id: &str, record: &RunRecord) -> RunStatus {
    match record {
        RunRecord::Running => RunStatus {
            run_id: run_id.to_string(),
            state: RunState::Running,
            brief: None,
            error: None,
            sources: None,
        },
        RunRecord::Completed { brief, sources, .. } => RunStatus {
            run_id: run_id.to_string(),
            state: RunState::Completed,
            brief: Some(brief.clone()),
            error: None,
            sources: Some(*sources),
        },
        RunRecord::Failed { error } => RunStatus {
            run_id: run_id.to_string(),
            state: RunState::Failed,
            brief: None,
            error: Some(error.clone()),
            sources: None,
        },
    }
}

fn into_sse_event(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

pub type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

#[derive(Debug)]
enum RunRecord {
    Running,
    Completed {
        brief: String,
        sources: usize,
        candidates: usize,
    },
    Failed {
        error: String,
    },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<usize>,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ServiceMetrics {
    pub max_concurrency: usize,
    pub available_permits: usize,
    pub running_runs: usize,
    pub total_runs: usize,
}
