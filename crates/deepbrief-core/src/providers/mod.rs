//! Clients for the hosted backends the pipeline calls out to.

mod llm;
mod scrape;
mod search;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BackendError;
use crate::types::Candidate;

pub use llm::OpenAiChatBackend;
pub use scrape::{FirecrawlBackend, ScrapedPage};
pub use search::WebSearchBackend;

/// One configured web-search backend.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Candidate>, BackendError>;
}

/// One configured scrape/extract backend.
#[async_trait]
pub trait ScrapeBackend: Send + Sync {
    async fn scrape(&self, url: &str) -> Result<ScrapedPage, BackendError>;
}

/// Token deltas as they arrive from a streaming chat completion.
pub type ChatStream = BoxStream<'static, Result<String, BackendError>>;

/// An OpenAI-compatible chat-completion backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Buffered completion; used where the reply is parsed as a whole.
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, BackendError>;

    /// Streaming completion. The returned stream is single-pass and
    /// non-restartable; an `Err` item ends it.
    async fn stream(&self, model: &str, system: &str, user: &str)
    -> Result<ChatStream, BackendError>;
}
