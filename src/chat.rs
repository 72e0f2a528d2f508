//! Streaming chat completion
//!
//! The controller hands a conversation to a [`ChatModel`] and receives reply
//! fragments as they are generated.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ChatConfig;
use crate::{Error, Result};

/// A chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Incremental output of a chat stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Reply text fragment
    Text(String),
    /// Reasoning text fragment (not spoken)
    Thinking(String),
    /// The model invoked a tool; `artifact` is an image it produced, if any
    ToolInvoked {
        name: String,
        artifact: Option<PathBuf>,
    },
}

/// Streams a reply for a conversation
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Stream a reply into `events`, resolving when the stream ends
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<()>;
}

/// Chat client for OpenAI-compatible `/chat/completions` endpoints
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl OpenAiChat {
    /// Create a new chat client
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &ChatConfig, api_key: Option<SecretString>) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.expose_secret().is_empty())
            .ok_or_else(|| Error::Config("OpenAI API key required for chat".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
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
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
}

/// A decoded server-sent event line
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Events(Vec<ChatEvent>),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)?;
    let mut events = Vec::new();
    for choice in chunk.choices {
        let delta = choice.delta;
        if let Some(thinking) = delta.reasoning_content.filter(|t| !t.is_empty()) {
            events.push(ChatEvent::Thinking(thinking));
        }
        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            events.push(ChatEvent::Text(text));
        }
        for call in delta.tool_calls {
            if let Some(name) = call.function.and_then(|f| f.name) {
                events.push(ChatEvent::ToolInvoked {
                    name,
                    artifact: None,
                });
            }
        }
    }
    Ok(SseLine::Events(events))
}

/// Take the next complete line off `pending`
///
/// Bytes are buffered until a newline arrives, so a UTF-8 character split
/// across network chunks is decoded whole.
fn next_line(pending: &mut Vec<u8>) -> Option<Result<String>> {
    let newline = pending.iter().position(|b| *b == b'\n')?;
    let line: Vec<u8> = pending.drain(..=newline).collect();
    Some(String::from_utf8(line).map_err(|e| Error::Chat(format!("invalid UTF-8 in stream: {e}"))))
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<()> {
        let request = CompletionRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
        };

        tracing::debug!(model = %self.model, messages = messages.len(), "starting chat stream");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Chat(format!("chat API error {status}: {body}")));
        }

        let mut stream = response.bytes_stream();
        let mut pending = Vec::new();

        while let Some(chunk) = stream.next().await {
            pending.extend_from_slice(&chunk?);

            while let Some(line) = next_line(&mut pending) {
                match line.and_then(|line| parse_sse_line(&line)) {
                    Ok(SseLine::Events(batch)) => {
                        for event in batch {
                            if events.send(event).is_err() {
                                // Receiver gone: the turn was cancelled
                                return Ok(());
                            }
                        }
                    }
                    Ok(SseLine::Done) => {
                        tracing::debug!("chat stream complete");
                        return Ok(());
                    }
                    Ok(SseLine::Skip) => {}
                    Err(e) => tracing::warn!(error = %e, "skipping malformed chat chunk"),
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(
            parse_sse_line(line).unwrap(),
            SseLine::Events(vec![ChatEvent::Text("Hello".to_string())])
        );
    }

    #[test]
    fn test_parse_reasoning_and_tool() {
        let line = r#"data: {"choices":[{"delta":{"reasoning_content":"hmm","tool_calls":[{"index":0,"function":{"name":"take_photo"}}]}}]}"#;
        assert_eq!(
            parse_sse_line(line).unwrap(),
            SseLine::Events(vec![
                ChatEvent::Thinking("hmm".to_string()),
                ChatEvent::ToolInvoked {
                    name: "take_photo".to_string(),
                    artifact: None
                },
            ])
        );
    }

    #[test]
    fn test_parse_done_and_comments() {
        assert_eq!(parse_sse_line("data: [DONE]\r\n").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("\n").unwrap(), SseLine::Skip);
    }

    #[test]
    fn test_missing_key_rejected() {
        assert!(matches!(
            OpenAiChat::new(&ChatConfig::default(), None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_line_waits_for_split_character() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"你好。\"}}]}\n".as_bytes();
        // Cut inside the first character
        let cut = line.iter().position(|b| *b >= 0x80).unwrap() + 1;

        let mut pending = line[..cut].to_vec();
        assert!(next_line(&mut pending).is_none());

        pending.extend_from_slice(&line[cut..]);
        let decoded = next_line(&mut pending).unwrap().unwrap();
        assert!(pending.is_empty());
        assert_eq!(
            parse_sse_line(&decoded).unwrap(),
            SseLine::Events(vec![ChatEvent::Text("你好。".to_string())])
        );
    }

    #[tokio::test]
    async fn test_stream_survives_chunk_split_inside_character() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"你好。\"}}]}\n\ndata: [DONE]\n\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{body}"
        );
        let response = response.into_bytes();
        let cut = response.iter().position(|b| *b >= 0x80).unwrap() + 1;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request.ends_with(b"true}") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "request truncated");
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(&response[..cut]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            socket.write_all(&response[cut..]).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let config = ChatConfig {
            base_url: format!("http://{addr}"),
            ..ChatConfig::default()
        };
        let chat = OpenAiChat::new(&config, Some(SecretString::from("test-key".to_string()))).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        chat.stream_chat(vec![ChatMessage::user("hi")], tx).await.unwrap();
        server.await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events, vec![ChatEvent::Text("你好。".to_string())]);
    }
}
