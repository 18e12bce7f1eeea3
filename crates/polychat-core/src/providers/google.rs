use super::lines::LineReader;
use super::provider::{send_failure, ChatAdapter, ChatMessage, CompletionRequest, Role, StreamChunk};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

pub struct GoogleAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GoogleAdapter {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

fn build_contents(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .filter_map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "model",
                Role::System => return None,
            };
            Some(json!({ "role": role, "parts": [{ "text": m.content }] }))
        })
        .collect()
}

fn build_body(request: &CompletionRequest) -> Value {
    let mut generation_config = json!({});
    if let Some(t) = request.temperature {
        generation_config["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        generation_config["topP"] = json!(p);
    }

    let mut body = json!({
        "contents": build_contents(&request.messages),
        "generationConfig": generation_config,
        "safetySettings": [
            { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_ONLY_HIGH" },
            { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE" }
        ]
    });
    if let Some(sys) = &request.system {
        body["systemInstruction"] = json!({ "parts": [{ "text": sys }] });
    }
    body
}

/// Concatenated text parts of the first candidate.
fn chunk_text(chunk: &Value) -> String {
    chunk["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ChatAdapter for GoogleAdapter {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            request.model
        );
        let raw_resp = match self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&build_body(request))
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
                    debug!("consumer went away, closing Gemini stream");
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

            // Chunks that cannot be read are skipped, not fatal.
            let Ok(chunk) = serde_json::from_str::<Value>(data) else {
                debug!("skipping unreadable Gemini chunk: {data}");
                continue;
            };
            if let Some(err) = chunk.get("error") {
                let message = err["message"].as_str().unwrap_or("unknown error").to_string();
                send_failure(&tx, message).await;
                return Ok(());
            }

            let text = chunk_text(&chunk);
            if !text.is_empty() && tx.send(StreamChunk::Delta { text }).await.is_err() {
                return Ok(());
            }
        }

        let _ = tx.send(StreamChunk::Done).await;
        Ok(())
    }
}
