use std::sync::Arc;

use anyhow::{Result, anyhow};
use graph_flow::{
    ExecutionStatus, FlowRunner, GraphBuilder, InMemorySessionStorage, Session, SessionStorage,
    Task,
};
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

use crate::config::ResearchConfig;
use crate::error::DeepBriefError;
use crate::events::{EVENT_CHANNEL_CAPACITY, EventEmitter, PipelineStage, StreamEvent};
use crate::providers::{
    ChatBackend, FirecrawlBackend, OpenAiChatBackend, ScrapeBackend, SearchBackend,
    WebSearchBackend,
};
use crate::tasks::{RerankTask, ScrapeTask, SearchTask, SynthesizeTask};
use crate::types::{Candidate, SourceDocument};

/// Backends plus configuration, assembled once at startup and shared by
/// every run. Tests inject their own backend implementations here.
pub struct PipelineRuntime {
    pub search: Arc<dyn SearchBackend>,
    pub scrape: Arc<dyn ScrapeBackend>,
    pub chat: Arc<dyn ChatBackend>,
    pub config: ResearchConfig,
}

impl PipelineRuntime {
    pub fn new(
        search: Arc<dyn SearchBackend>,
        scrape: Arc<dyn ScrapeBackend>,
        chat: Arc<dyn ChatBackend>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            search,
            scrape,
            chat,
            config,
        }
    }

    /// Wire up the reqwest-backed providers described by `config`.
    pub fn from_config(config: ResearchConfig) -> Result<Self, DeepBriefError> {
        let client = reqwest::Client::new();
        Ok(Self {
            search: Arc::new(WebSearchBackend::new(client.clone(), &config.search)?),
            scrape: Arc::new(FirecrawlBackend::new(client.clone(), &config.scrape)?),
            chat: Arc::new(OpenAiChatBackend::new(client, &config.llm)?),
            config,
        })
    }
}

/// Exposes the pipeline tasks so callers can extend the graph.
#[derive(Clone)]
pub struct BasePipelineTasks {
    pub search: Arc<SearchTask>,
    pub rerank: Arc<RerankTask>,
    pub scrape: Arc<ScrapeTask>,
    pub synthesize: Arc<SynthesizeTask>,
}

impl BasePipelineTasks {
    fn new(runtime: Arc<PipelineRuntime>, events: EventEmitter) -> Self {
        Self {
            search: Arc::new(SearchTask::new(runtime.clone(), events.clone())),
            rerank: Arc::new(RerankTask::new(runtime.clone(), events.clone())),
            scrape: Arc::new(ScrapeTask::new(runtime.clone(), events.clone())),
            synthesize: Arc::new(SynthesizeTask::new(runtime, events)),
        }
    }
}

fn build_graph(
    runtime: Arc<PipelineRuntime>,
    events: EventEmitter,
) -> (Arc<graph_flow::Graph>, BasePipelineTasks) {
    let tasks = BasePipelineTasks::new(runtime, events);

    let builder = GraphBuilder::new("deepbrief_pipeline")
        .add_task(tasks.search.clone())
        .add_task(tasks.rerank.clone())
        .add_task(tasks.scrape.clone())
        .add_task(tasks.synthesize.clone())
        // A dry search skips straight to synthesis instead of aborting.
        .add_conditional_edge(
            tasks.search.id(),
            |ctx| ctx.get_sync::<bool>("search.has_candidates").unwrap_or(false),
            tasks.rerank.id(),
            tasks.synthesize.id(),
        )
        .add_edge(tasks.rerank.id(), tasks.scrape.id())
        .add_edge(tasks.scrape.id(), tasks.synthesize.id())
        .set_start_task(tasks.search.id());

    let graph = Arc::new(builder.build());

    (graph, tasks)
}

fn new_session_id() -> String {
    format!("run-{}", Uuid::new_v4())
}

/// Options for one research run.
#[derive(Debug, Clone)]
pub struct ResearchOptions {
    pub query: String,
    pub session_id: Option<String>,
}

impl ResearchOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// What a completed run left behind.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub session_id: String,
    pub brief: String,
    pub sources: Vec<SourceDocument>,
    pub candidate_count: usize,
}

/// Drive one run end-to-end, reporting through `events`. Infrastructure
/// failures (deadline, step budget, graph errors) emit a terminal
/// `error` event here; synthesis failures already emitted theirs inside
/// the stage.
pub async fn run_pipeline(
    runtime: Arc<PipelineRuntime>,
    options: ResearchOptions,
    events: EventEmitter,
) -> Result<ResearchOutcome> {
    let limits = runtime.config.limits.clone();
    let (graph, tasks) = build_graph(runtime, events.clone());

    let storage = Arc::new(InMemorySessionStorage::new());
    let runner = FlowRunner::new(graph, storage.clone());

    let session_id = options.session_id.clone().unwrap_or_else(new_session_id);
    let session = Session::new_from_task(session_id.clone(), tasks.search.id());
    session.context.set("query", options.query.clone()).await;
    storage
        .save(session)
        .await
        .map_err(|err| anyhow!("failed to persist session: {err}"))?;

    // Liveness flush: clients see this before the first backend call.
    if events
        .status(PipelineStage::Started, "research started")
        .await
        .is_err()
    {
        return Err(anyhow!("client disconnected before the run started"));
    }

    let drive = async {
        let mut steps = 0usize;
        loop {
            let result = runner
                .run(&session_id)
                .await
                .map_err(|err| anyhow!("graph execution failure: {err}"))?;

            match result.status {
                ExecutionStatus::Completed => break,
                ExecutionStatus::WaitingForInput => {
                    steps += 1;
                    if steps >= limits.step_budget {
                        return Err(anyhow!("step budget exhausted after {steps} iterations"));
                    }
                    continue;
                }
                ExecutionStatus::Error(message) => return Err(anyhow!(message)),
            }
        }
        Ok(())
    };

    let driven = match tokio::time::timeout(limits.deadline(), drive).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "research deadline of {}s exceeded",
            limits.deadline_secs
        )),
    };
    if let Err(err) = driven {
        let _ = events.error(err.to_string()).await;
        return Err(err);
    }

    let session = storage
        .get(&session_id)
        .await
        .map_err(|err| anyhow!("failed to reload session: {err}"))?
        .ok_or_else(|| anyhow!("session missing after execution"))?;

    let brief: String = session
        .context
        .get("synthesis.brief")
        .await
        .unwrap_or_default();

    if session
        .context
        .get::<bool>("synthesis.failed")
        .await
        .unwrap_or(false)
    {
        return Err(anyhow!(
            "synthesis failed (streamed {} chars before failing)",
            brief.chars().count()
        ));
    }

    let sources: Vec<SourceDocument> = session
        .context
        .get("scrape.sources")
        .await
        .unwrap_or_default();
    let candidates: Vec<Candidate> = session
        .context
        .get("search.candidates")
        .await
        .unwrap_or_default();

    Ok(ResearchOutcome {
        session_id,
        brief,
        sources,
        candidate_count: candidates.len(),
    })
}

/// Run the pipeline to completion and return the buffered outcome.
pub async fn run_research(
    runtime: Arc<PipelineRuntime>,
    options: ResearchOptions,
) -> Result<ResearchOutcome> {
    let (events, mut receiver) = EventEmitter::channel(EVENT_CHANNEL_CAPACITY);
    let drain = tokio::spawn(async move { while receiver.recv().await.is_some() {} });

    let outcome = run_pipeline(runtime, options, events).await;
    let _ = drain.await;
    outcome
}

/// Spawn the pipeline and hand back its event stream. Dropping the
/// receiver cancels the run.
pub fn stream_research(
    runtime: Arc<PipelineRuntime>,
    options: ResearchOptions,
) -> mpsc::Receiver<StreamEvent> {
    let (events, receiver) = EventEmitter::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        if let Err(err) = run_pipeline(runtime, options, events).await {
            error!(error = %err, "research pipeline failed");
        }
    });
    receiver
}
