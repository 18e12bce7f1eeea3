use super::provider::{send_failure, ChatAdapter, CompletionRequest, StreamChunk};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

/// Single request/response chat adapter (Ollama's native `/api/chat`). The one
/// reply is replayed to the caller as a stream of at most one delta.
pub struct SimpleJsonAdapter {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    message: Option<ReplyMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

impl SimpleJsonAdapter {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn fetch(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let resp = self.client.post(&url).json(&build_body(request)).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let detail = serde_json::from_str::<ChatReply>(&text)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(text);
            anyhow::bail!("status {status}: {detail}");
        }

        let reply: ChatReply = serde_json::from_str(&text)?;
        if let Some(err) = reply.error {
            anyhow::bail!(err);
        }
        Ok(reply.message.map(|m| m.content).unwrap_or_default())
    }
}

fn build_body(request: &CompletionRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();

    let mut options = json!({});
    if let Some(t) = request.temperature {
        options["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        options["top_p"] = json!(p);
    }

    json!({
        "model": request.model,
        "messages": messages,
        "stream": false,
        "options": options
    })
}

#[async_trait]
impl ChatAdapter for SimpleJsonAdapter {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let reply = tokio::select! {
            reply = self.fetch(request) => reply,
            _ = tx.closed() => {
                debug!("consumer went away before the Ollama reply arrived");
                return Ok(());
            }
        };
        match reply {
            Ok(text) => {
                if !text.is_empty() && tx.send(StreamChunk::Delta { text }).await.is_err() {
                    return Ok(());
                }
                let _ = tx.send(StreamChunk::Done).await;
            }
            Err(e) => send_failure(&tx, format!("{e:#}")).await,
        }
        Ok(())
    }
}
