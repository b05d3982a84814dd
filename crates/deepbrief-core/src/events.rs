//! Event bus between the pipeline stages and the streaming relay.
//!
//! Every client-visible pipeline event flows through this channel; the
//! relay on the other end frames and forwards them. A closed channel
//! means the consumer went away, which stages treat as cancellation.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::truncate_chars;

/// Capacity of the per-run event channel; the bounded send is what
/// gives the producer/consumer pair its backpressure.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Character budget for tool-event payloads (`args`/`output`).
pub const TOOL_PAYLOAD_BUDGET: usize = 300;

/// Client-visible pipeline lifecycle stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Started,
    Searching,
    Reranking,
    Scraping,
    Synthesizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Call,
    Output,
}

/// One frame of the research stream. `done` is always last on success;
/// `error` is terminal wherever it appears.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        stage: PipelineStage,
        message: String,
    },
    Text {
        delta: String,
    },
    Tool {
        phase: ToolPhase,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Error {
        message: String,
    },
    Done {
        candidates: usize,
        sources: usize,
        chars_streamed: usize,
    },
}

impl StreamEvent {
    /// SSE event name for this frame.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Status { .. } => "status",
            StreamEvent::Text { .. } => "text",
            StreamEvent::Tool { .. } => "tool",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Done { .. })
    }
}

/// Raised when the consumer side of the event channel is gone.
#[derive(Debug, Error)]
#[error("event stream closed by consumer")]
pub struct StreamClosed;

/// Sender half handed to every pipeline stage.
#[derive(Clone)]
pub struct EventEmitter {
    sender: mpsc::Sender<StreamEvent>,
}

impl EventEmitter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub async fn emit(&self, event: StreamEvent) -> Result<(), StreamClosed> {
        self.sender.send(event).await.map_err(|_| StreamClosed)
    }

    pub async fn status(
        &self,
        stage: PipelineStage,
        message: impl Into<String>,
    ) -> Result<(), StreamClosed> {
        self.emit(StreamEvent::Status {
            stage,
            message: message.into(),
        })
        .await
    }

    pub async fn text(&self, delta: impl Into<String>) -> Result<(), StreamClosed> {
        self.emit(StreamEvent::Text {
            delta: delta.into(),
        })
        .await
    }

    pub async fn tool_call(&self, name: &str, args: &str) -> Result<(), StreamClosed> {
        self.emit(StreamEvent::Tool {
            phase: ToolPhase::Call,
            name: name.to_string(),
            args: Some(truncate_chars(args, TOOL_PAYLOAD_BUDGET)),
            output: None,
        })
        .await
    }

    pub async fn tool_output(&self, name: &str, output: &str) -> Result<(), StreamClosed> {
        self.emit(StreamEvent::Tool {
            phase: ToolPhase::Output,
            name: name.to_string(),
            args: None,
            output: Some(truncate_chars(output, TOOL_PAYLOAD_BUDGET)),
        })
        .await
    }

    pub async fn error(&self, message: impl Into<String>) -> Result<(), StreamClosed> {
        self.emit(StreamEvent::Error {
            message: message.into(),
        })
        .await
    }

    pub async fn done(
        &self,
        candidates: usize,
        sources: usize,
        chars_streamed: usize,
    ) -> Result<(), StreamClosed> {
        self.emit(StreamEvent::Done {
            candidates,
            sources,
            chars_streamed,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (emitter, mut receiver) = EventEmitter::channel(8);
        emitter
            .status(PipelineStage::Started, "research started")
            .await
            .unwrap();
        emitter.text("Hello").await.unwrap();

        assert!(matches!(
            receiver.recv().await.unwrap(),
            StreamEvent::Status {
                stage: PipelineStage::Started,
                ..
            }
        ));
        assert!(
            matches!(receiver.recv().await.unwrap(), StreamEvent::Text { delta } if delta == "Hello")
        );
    }

    #[tokio::test]
    async fn dropped_receiver_reports_stream_closed() {
        let (emitter, receiver) = EventEmitter::channel(1);
        drop(receiver);
        assert!(emitter.text("late").await.is_err());
    }

    #[tokio::test]
    async fn tool_payloads_are_truncated_to_budget() {
        let (emitter, mut receiver) = EventEmitter::channel(1);
        let long = "x".repeat(TOOL_PAYLOAD_BUDGET * 2);
        emitter.tool_call("web_search", &long).await.unwrap();
        match receiver.recv().await.unwrap() {
            StreamEvent::Tool { args, .. } => {
                assert_eq!(args.unwrap().chars().count(), TOOL_PAYLOAD_BUDGET);
            }
            other => panic!("expected tool event, got {other:?}"),
        }
    }

    #[test]
    fn serialization_is_snake_case_tagged() {
        let event = StreamEvent::Text {
            delta: "chunk".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["delta"], "chunk");

        let done = StreamEvent::Done {
            candidates: 3,
            sources: 2,
            chars_streamed: 10,
        };
        assert_eq!(serde_json::to_value(&done).unwrap()["type"], "done");
    }
}
