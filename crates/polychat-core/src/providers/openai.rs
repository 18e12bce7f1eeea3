use super::lines::LineReader;
use super::provider::{send_failure, ChatAdapter, ChatMessage, CompletionRequest, StreamChunk};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Adapter for servers speaking the OpenAI chat-completions streaming protocol
/// (OpenAI itself, Groq, and other compatible hosts).
pub struct OpenAiCompatibleAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatibleAdapter {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

fn build_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

fn build_body(request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": build_messages(&request.messages),
        "stream": true
    });
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        body["top_p"] = json!(p);
    }
    body
}

/// Text delta carried by one streamed chunk, if any.
fn delta_text(chunk: &Value) -> Option<&str> {
    chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|t| !t.is_empty())
}

fn error_message(chunk: &Value) -> Option<String> {
    let err = chunk.get("error").filter(|e| !e.is_null())?;
    Some(
        err["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
    )
}

#[async_trait]
impl ChatAdapter for OpenAiCompatibleAdapter {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let body = build_body(request);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let raw_resp = match self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                send_failure(&tx, e.to_string()).await;
                return Ok(());
            }
        };
        if !raw_resp.status().is_success() {
            let status = raw_resp.status();
            let body_text = raw_resp.text().await.unwrap_or_default();
            send_failure(&tx, format!("status {status}: {body_text}")).await;
            return Ok(());
        }

        let mut lines = LineReader::new(raw_resp.bytes_stream());
        loop {
            let next = tokio::select! {
                next = lines.next_line() => next,
                _ = tx.closed() => {
                    debug!("consumer went away, closing chat completion stream");
                    return Ok(());
                }
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    send_failure(&tx, e.to_string()).await;
                    return Ok(());
                }
            };

            let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
                continue;
            };
            if data == "[DONE]" {
                break;
            }

            let chunk: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    warn!("skipping undecodable chunk ({e}): {data}");
                    continue;
                }
            };

            if let Some(message) = error_message(&chunk) {
                send_failure(&tx, message).await;
                return Ok(());
            }

            if let Some(text) = delta_text(&chunk) {
                let delta = StreamChunk::Delta {
                    text: text.to_string(),
                };
                if tx.send(delta).await.is_err() {
                    return Ok(());
                }
            }
        }

        let _ = tx.send(StreamChunk::Done).await;
        Ok(())
    }
}
