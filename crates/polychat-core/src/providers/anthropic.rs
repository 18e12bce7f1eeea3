use super::lines::LineReader;
use super::provider::{ChatAdapter, ChatMessage, CompletionRequest, Role, StreamChunk};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Display;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const STREAM_PREFIX: &str = "data:";
const STREAM_END_TOKEN: &str = "event: message_stop";
const API_KEY_HEADER: &str = "x-api-key";
const VERSION_HEADER: &str = "anthropic-version";
const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_MAXIMUM_TOKEN: u32 = 4096;

const KNOWN_TYPES: [&str; 8] = [
    "message_start",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "message_delta",
    "message_stop",
    "ping",
    "error",
];

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub block_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContentDelta {
    #[serde(rename = "type", default)]
    pub delta_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageDeltaInfo {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// One decoded event of the Messages streaming API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageResponseChunk {
    MessageStart {
        #[serde(default)]
        message: MessageInfo,
    },
    ContentBlockStart {
        index: u32,
        #[serde(default)]
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaInfo,
        #[serde(default)]
        usage: Usage,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorDetail,
    },
}

impl MessageResponseChunk {
    fn error(error_type: &str, message: impl Into<String>) -> Self {
        MessageResponseChunk::Error {
            error: ErrorDetail {
                error_type: error_type.to_string(),
                message: message.into(),
            },
        }
    }
}

/// Outcome of reading one line of the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    /// Termination sentinel reached.
    End,
    /// Line carries nothing for us.
    Skip,
    Chunk(MessageResponseChunk),
}

pub fn parse_line(line: &str) -> SseLine {
    if line.starts_with(STREAM_END_TOKEN) {
        return SseLine::End;
    }
    let Some(payload) = line.strip_prefix(STREAM_PREFIX).map(str::trim_start) else {
        return SseLine::Skip;
    };

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => return decode_failure(line, e),
    };
    let Some(ty) = value.as_object().map(|obj| obj.get("type").and_then(Value::as_str)) else {
        warn!("Invalid JSON structure: {payload}");
        return SseLine::Skip;
    };
    if !ty.is_some_and(|t| KNOWN_TYPES.contains(&t)) {
        warn!("Unknown event type: {ty:?} for line: {line}");
        return SseLine::Skip;
    }

    match serde_json::from_value::<MessageResponseChunk>(value) {
        Ok(chunk) => SseLine::Chunk(chunk),
        Err(e) => decode_failure(line, e),
    }
}

fn decode_failure(line: &str, e: impl Display) -> SseLine {
    error!("Failed to parse line: {line}: {e}");
    SseLine::Chunk(MessageResponseChunk::error(
        "deserialization_error",
        format!(
            "Something went wrong while trying to deserialize a response from the server. Details: {e}"
        ),
    ))
}

/// Read typed chunks from a byte stream until the sentinel, end of input, or
/// until the receiver is dropped.
pub async fn stream_events_from<S, B, E>(
    body: S,
    tx: &mpsc::Sender<MessageResponseChunk>,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut lines = LineReader::new(body);
    loop {
        let next = tokio::select! {
            next = lines.next_line() => next?,
            _ = tx.closed() => {
                debug!("chunk receiver dropped, closing event stream");
                break;
            }
        };
        let Some(line) = next else {
            break;
        };
        match parse_line(&line) {
            SseLine::End => break,
            SseLine::Skip => continue,
            SseLine::Chunk(chunk) => {
                if tx.send(chunk).await.is_err() {
                    debug!("chunk receiver dropped, closing event stream");
                    break;
                }
            }
        }
    }
    Ok(())
}

// ── Adapter ───────────────────────────────────────────────────────────────────

pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicAdapter {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn messages_url(&self) -> String {
        if self.base_url.ends_with('/') {
            format!("{}v1/messages", self.base_url)
        } else {
            format!("{}/v1/messages", self.base_url)
        }
    }

    /// Stream the raw typed chunks of one request. Transport failures arrive as
    /// an `error` chunk of type `network_error`.
    pub async fn stream_chunks(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<MessageResponseChunk>,
    ) {
        let body = build_body(request);
        let resp = self
            .client
            .post(self.messages_url())
            .header(API_KEY_HEADER, &self.api_key)
            .header(VERSION_HEADER, ANTHROPIC_VERSION)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await;

        let result = match resp {
            Ok(resp) if !resp.status().is_success() => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                let message = serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                    .unwrap_or(text);
                let _ = tx
                    .send(MessageResponseChunk::error(
                        "api_error",
                        format!("status {status}: {message}"),
                    ))
                    .await;
                Ok(())
            }
            Ok(resp) => stream_events_from(resp.bytes_stream(), &tx).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            let _ = tx
                .send(MessageResponseChunk::error("network_error", e.to_string()))
                .await;
        }
    }
}

fn build_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            json!({
                "role": m.role.as_str(),
                "content": [{ "type": "text", "text": m.content }]
            })
        })
        .collect()
}

fn build_body(request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": build_messages(&request.messages),
        "max_tokens": ANTHROPIC_MAXIMUM_TOKEN,
        "stream": true
    });
    if let Some(sys) = &request.system {
        body["system"] = json!(sys);
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        body["top_p"] = json!(p);
    }
    body
}

#[async_trait]
impl ChatAdapter for AnthropicAdapter {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<MessageResponseChunk>(64);

        let translate = async move {
            loop {
                // Returning drops `raw_rx`, which stops the reader as well.
                let chunk = tokio::select! {
                    chunk = raw_rx.recv() => chunk,
                    _ = tx.closed() => return,
                };
                let Some(chunk) = chunk else {
                    break;
                };
                let out = match chunk {
                    MessageResponseChunk::ContentBlockDelta { delta, .. } if !delta.text.is_empty() => {
                        StreamChunk::Delta { text: delta.text }
                    }
                    MessageResponseChunk::Error { error } => StreamChunk::Error {
                        message: error.message,
                    },
                    _ => continue,
                };
                if tx.send(out).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamChunk::Done).await;
        };

        tokio::join!(self.stream_chunks(request, raw_tx), translate);
        Ok(())
    }
}
