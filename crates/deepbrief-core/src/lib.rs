//! DeepBrief core: the search → rerank → scrape → synthesize research
//! pipeline and its streaming delivery machinery.
//!
//! This crate owns the pipeline stages, the provider clients they call,
//! and the event channel/relay pair that carries the resulting brief to
//! a consumer one delta at a time. HTTP and CLI frontends live in their
//! own crates.

mod config;
mod error;
mod events;
mod providers;
mod relay;
mod retry;
mod tasks;
mod types;
mod workflow;

pub use config::{
    ConfigLoader, LimitsConfig, LlmConfig, RerankConfig, ResearchConfig, RetryConfig,
    ScrapeConfig, SearchConfig, SecretValue, SynthesisConfig, require_env,
};
pub use error::{BackendError, DeepBriefError};
pub use events::{
    EVENT_CHANNEL_CAPACITY, EventEmitter, PipelineStage, StreamClosed, StreamEvent,
    TOOL_PAYLOAD_BUDGET, ToolPhase,
};
pub use providers::{
    ChatBackend, ChatStream, FirecrawlBackend, OpenAiChatBackend, ScrapeBackend, ScrapedPage,
    SearchBackend, WebSearchBackend,
};
pub use relay::{EventSink, SinkClosed, encode_sse, forward};
pub use retry::{RetryPolicy, with_retry};
pub use tasks::{RerankTask, ScrapeTask, SearchTask, SynthesizeTask};
pub use types::{Candidate, RankedCandidate, SourceDocument, truncate_chars};
pub use workflow::{
    BasePipelineTasks, PipelineRuntime, ResearchOptions, ResearchOutcome, run_pipeline,
    run_research, stream_research,
};
