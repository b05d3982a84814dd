//! Bridges the pipeline's event channel to a transport-specific sink.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::StreamEvent;

/// Raised by a sink whose consumer (HTTP client, terminal) went away.
#[derive(Debug, Error)]
#[error("event sink closed by consumer")]
pub struct SinkClosed;

/// Where relayed events land: an SSE body, a raw-text body, stdout.
#[async_trait]
pub trait EventSink: Send {
    async fn write(&mut self, event: &StreamEvent) -> Result<(), SinkClosed>;

    /// Release the underlying transport. Must tolerate repeated calls.
    async fn close(&mut self);
}

/// Serialize one event as an SSE frame. The `data:` payload is the full
/// JSON encoding of the event, the event name its type tag.
pub fn encode_sse(event: &StreamEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| {
        serde_json::json!({
            "type": "error",
            "message": "failed to serialize stream event",
        })
        .to_string()
    });
    format!("event: {}\ndata: {data}\n\n", event.name())
}

/// Forwards events one at a time until the channel ends, a terminal
/// event passes through, or the sink's consumer disappears. The sink is
/// closed exactly once on every exit path.
pub async fn forward<S: EventSink>(mut receiver: mpsc::Receiver<StreamEvent>, mut sink: S) {
    while let Some(event) = receiver.recv().await {
        if sink.write(&event).await.is_err() {
            debug!("event sink closed by consumer, stopping relay");
            break;
        }
        if event.is_terminal() {
            break;
        }
    }
    // Dropping the receiver here cancels the producing pipeline.
    drop(receiver);
    sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventEmitter, PipelineStage};

    struct RecordingSink {
        written: Vec<StreamEvent>,
        closes: usize,
        fail_after: Option<usize>,
    }

    impl RecordingSink {
        fn new(fail_after: Option<usize>) -> Self {
            Self {
                written: Vec::new(),
                closes: 0,
                fail_after,
            }
        }
    }

    #[async_trait]
    impl EventSink for &mut RecordingSink {
        async fn write(&mut self, event: &StreamEvent) -> Result<(), SinkClosed> {
            if let Some(limit) = self.fail_after {
                if self.written.len() >= limit {
                    return Err(SinkClosed);
                }
            }
            self.written.push(event.clone());
            Ok(())
        }

        async fn close(&mut self) {
            self.closes += 1;
        }
    }

    #[tokio::test]
    async fn closes_exactly_once_on_normal_completion() {
        let (emitter, receiver) = EventEmitter::channel(8);
        emitter
            .status(PipelineStage::Started, "research started")
            .await
            .unwrap();
        emitter.text("Hello").await.unwrap();
        emitter.done(0, 0, 5).await.unwrap();
        drop(emitter);

        let mut sink = RecordingSink::new(None);
        forward(receiver, &mut sink).await;

        assert_eq!(sink.written.len(), 3);
        assert_eq!(sink.closes, 1);
    }

    #[tokio::test]
    async fn closes_exactly_once_when_consumer_aborts_mid_stream() {
        let (emitter, receiver) = EventEmitter::channel(8);
        for index in 0..4 {
            emitter.text(format!("chunk-{index}")).await.unwrap();
        }
        drop(emitter);

        let mut sink = RecordingSink::new(Some(2));
        forward(receiver, &mut sink).await;

        assert_eq!(sink.written.len(), 2);
        assert_eq!(sink.closes, 1);
    }

    #[tokio::test]
    async fn relay_stops_after_terminal_event() {
        let (emitter, receiver) = EventEmitter::channel(8);
        emitter.error("upstream failed").await.unwrap();
        emitter.text("never delivered").await.unwrap();
        drop(emitter);

        let mut sink = RecordingSink::new(None);
        forward(receiver, &mut sink).await;

        assert_eq!(sink.written.len(), 1);
        assert!(matches!(sink.written[0], StreamEvent::Error { .. }));
        assert_eq!(sink.closes, 1);
    }

    #[tokio::test]
    async fn dropping_the_relay_cancels_the_producer() {
        let (emitter, receiver) = EventEmitter::channel(1);
        drop(receiver);
        assert!(emitter.text("orphaned").await.is_err());
    }

    #[test]
    fn sse_framing_matches_the_wire_contract() {
        let event = StreamEvent::Text {
            delta: "Hello".into(),
        };
        assert_eq!(
            encode_sse(&event),
            "event: text\ndata: {\"type\":\"text\",\"delta\":\"Hello\"}\n\n"
        );
    }
}
