use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{LlmConfig, SecretValue};
use crate::error::{BackendError, DeepBriefError};
use crate::providers::{ChatBackend, ChatStream};

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiChatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretValue>,
}

impl OpenAiChatBackend {
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Result<Self, DeepBriefError> {
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key()?,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        model: &str,
        system: &str,
        user: &str,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let request = ChatCompletionsRequest {
            model: model.to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            stream,
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose());
        }

        let response = builder.send().await.map_err(BackendError::transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::status(status));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatBackend {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, BackendError> {
        let response = self.send(model, system, user, false).await?;
        let parsed: ChatCompletionsResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;
        Ok(parsed
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .unwrap_or_default())
    }

    async fn stream(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<ChatStream, BackendError> {
        let response = self.send(model, system, user, true).await?;

        let (sender, receiver) = mpsc::channel::<Result<String, BackendError>>(16);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            'chunks: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = sender.send(Err(BackendError::transport(err))).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                for payload in drain_frames(&mut buffer) {
                    if payload == "[DONE]" {
                        break 'chunks;
                    }
                    match delta_content(&payload) {
                        Ok(Some(delta)) => {
                            if sender.send(Ok(delta)).await.is_err() {
                                // Consumer gone; dropping `body` aborts the call.
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            let _ = sender.send(Err(err)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(receiver).boxed())
    }
}

/// Drain every complete SSE frame from `buffer`, returning the `data:`
/// payloads. Partial frames stay buffered until the next chunk.
fn drain_frames(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(boundary) = buffer.windows(2).position(|window| window == b"\n\n") {
        let frame = String::from_utf8_lossy(&buffer[..boundary]).into_owned();
        buffer.drain(..boundary + 2);
        for line in frame.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
    }
    payloads
}

/// Pull the text delta out of one streamed chunk, if it carries one.
fn delta_content(payload: &str) -> Result<Option<String>, BackendError> {
    let chunk: ChatCompletionsChunk =
        serde_json::from_str(payload).map_err(|err| BackendError::Decode(err.to_string()))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content))
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_on_blank_line() {
        let mut buffer = b"data: one\n\ndata: two\n\n".to_vec();
        assert_eq!(drain_frames(&mut buffer), vec!["one", "two"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_frames_stay_buffered_across_chunks() {
        let mut buffer = b"data: {\"choi".to_vec();
        assert!(drain_frames(&mut buffer).is_empty());
        buffer.extend_from_slice(b"ces\":[]}\n\ndata: next");
        assert_eq!(drain_frames(&mut buffer), vec!["{\"choices\":[]}"]);
        assert_eq!(buffer, b"data: next");
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut buffer = b": keep-alive\nevent: message\ndata: payload\n\n".to_vec();
        assert_eq!(drain_frames(&mut buffer), vec!["payload"]);
    }

    #[test]
    fn delta_content_reads_streamed_chunks() {
        let payload = r#"{"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(delta_content(payload).unwrap(), Some("Hello".to_string()));

        // Role-only preamble chunk carries no text.
        let preamble = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(delta_content(preamble).unwrap(), None);

        assert!(delta_content("not json").is_err());
    }
}
