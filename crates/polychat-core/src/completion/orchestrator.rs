use super::projector::project;
use crate::config::{AppConfig, ProviderConfig, SettingsStore};
use crate::conversation::model::Message;
use crate::error::CompletionError;
use crate::providers::local::LoadParams;
use crate::providers::provider::{
    AdapterFamily, ChatAdapter, CompletionRequest, ErrorPolicy, ProviderKind, StreamChunk,
};
use crate::providers::{
    AnthropicAdapter, GoogleAdapter, LocalAdapter, LocalModelHandle, OpenAiCompatibleAdapter,
    SimpleJsonAdapter,
};
use anyhow::Result;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// What callers of [`CompletionService::complete`] observe.
///
/// `Loading` comes first and `Done` last, exactly once each. At most one
/// `Error` is sent and no `Token` follows it.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Loading,
    Token(String),
    Error(String),
    Done,
}

/// Local model to prepare before generating.
struct LocalLoad {
    handle: LocalModelHandle,
    path: PathBuf,
    params: LoadParams,
    system_prompt: Option<String>,
}

impl LocalLoad {
    async fn run(self) -> Result<bool> {
        let LocalLoad {
            handle,
            path,
            params,
            system_prompt,
        } = self;
        let loaded = tokio::task::spawn_blocking(move || {
            handle.load_or_reuse(&path, &params, system_prompt.as_deref())
        })
        .await??;
        Ok(loaded)
    }
}

pub struct CompletionService {
    settings: Arc<dyn SettingsStore>,
    local: LocalModelHandle,
    client: Client,
    config: AppConfig,
}

impl CompletionService {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        local: LocalModelHandle,
        config: AppConfig,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        Ok(Self::with_client(settings, local, config, builder.build()?))
    }

    pub fn with_client(
        settings: Arc<dyn SettingsStore>,
        local: LocalModelHandle,
        config: AppConfig,
        client: Client,
    ) -> Self {
        Self {
            settings,
            local,
            client,
            config,
        }
    }

    pub fn local_model(&self) -> &LocalModelHandle {
        &self.local
    }

    /// Ask `kind` to answer `question` given the earlier `history`.
    ///
    /// Missing configuration fails here. Everything after that is reported on
    /// the returned channel. Dropping the receiver cancels the request.
    ///
    /// Local completions must not overlap: the session keeps one turn log.
    pub async fn complete(
        &self,
        kind: ProviderKind,
        history: &[Message],
        question: &Message,
    ) -> Result<mpsc::Receiver<StreamEvent>, CompletionError> {
        let config = self.provider_config(kind).await?;
        let local = match kind.family() {
            AdapterFamily::Local => Some(self.local_load(&config)?),
            _ => None,
        };

        let mut conversation = history.to_vec();
        conversation.push(question.clone());
        let request = project(&config, &conversation);
        let local = local.map(|load| LocalLoad {
            system_prompt: request.system.clone(),
            ..load
        });
        let adapter = self.adapter_for(&config);
        debug!(
            "Completing with {} ({} turns, model {:?})",
            kind,
            request.messages.len(),
            request.model
        );

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if tx.send(StreamEvent::Loading).await.is_err() {
                return;
            }
            let failure = match local {
                Some(load) => load.run().await.err().map(|e| format!("{e:#}")),
                None => None,
            };
            match failure {
                Some(message) => {
                    error!("{message}");
                    let _ = tx.send(StreamEvent::Error(message)).await;
                }
                None => drive(adapter, request, kind, &tx).await,
            }
            let _ = tx.send(StreamEvent::Done).await;
        });

        Ok(rx)
    }

    /// Load the configured local model ahead of the first request. Failures
    /// are logged and otherwise ignored.
    pub async fn preload_local_model(&self) {
        let config = match self.settings.fetch_provider_config(ProviderKind::Local).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!("Local provider not configured, nothing to preload");
                return;
            }
            Err(e) => {
                error!("Could not read local provider settings: {e:#}");
                return;
            }
        };
        let Ok(load) = self.local_load(&config) else {
            debug!("No offline model selected, nothing to preload");
            return;
        };
        let load = LocalLoad {
            system_prompt: Some(super::projector::system_prompt(&config)),
            ..load
        };
        match load.run().await {
            Ok(true) => info!("Offline model preloaded"),
            Ok(false) => debug!("Offline model already loaded"),
            Err(e) => error!("Failed to preload offline model: {e:#}"),
        }
    }

    async fn provider_config(&self, kind: ProviderKind) -> Result<ProviderConfig, CompletionError> {
        self.settings
            .fetch_provider_config(kind)
            .await?
            .ok_or(CompletionError::MissingConfig(kind))
    }

    fn local_load(&self, config: &ProviderConfig) -> Result<LocalLoad, CompletionError> {
        let path = config
            .model_path
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(CompletionError::MissingModelPath)?;
        Ok(LocalLoad {
            handle: self.local.clone(),
            path,
            params: LoadParams {
                context_size: config.context_size,
                threads: self.config.local_threads,
                min_p: self.config.local_min_p,
                temperature: config.temperature.unwrap_or(self.config.local_temperature),
            },
            system_prompt: None,
        })
    }

    fn adapter_for(&self, config: &ProviderConfig) -> Box<dyn ChatAdapter> {
        let api_key = config.api_key.clone().unwrap_or_default();
        let client = self.client.clone();
        match config.kind.family() {
            AdapterFamily::OpenAiCompatible => Box::new(OpenAiCompatibleAdapter::new(
                client,
                &config.base_url,
                api_key,
            )),
            AdapterFamily::Anthropic => {
                Box::new(AnthropicAdapter::new(client, &config.base_url, api_key))
            }
            AdapterFamily::SimpleJson => Box::new(SimpleJsonAdapter::new(client, &config.base_url)),
            AdapterFamily::Google => Box::new(GoogleAdapter::new(client, &config.base_url, api_key)),
            AdapterFamily::Local => Box::new(LocalAdapter::new(self.local.clone())),
        }
    }
}

/// Run the adapter and forward its output as events. Sends everything except
/// the final `Done`.
async fn drive(
    adapter: Box<dyn ChatAdapter>,
    request: CompletionRequest,
    kind: ProviderKind,
    tx: &mpsc::Sender<StreamEvent>,
) {
    let policy = kind.error_policy();
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(64);

    // Returning drops `chunk_rx`, which stops the adapter.
    let consume = async move {
        loop {
            let chunk = tokio::select! {
                chunk = chunk_rx.recv() => chunk,
                _ = tx.closed() => {
                    debug!("{kind} consumer went away");
                    return None;
                }
            };
            let Some(chunk) = chunk else {
                break;
            };
            match chunk {
                StreamChunk::Delta { text } => {
                    if tx.send(StreamEvent::Token(text)).await.is_err() {
                        debug!("{kind} consumer went away");
                        return None;
                    }
                }
                StreamChunk::Error { message } => match policy {
                    ErrorPolicy::Surface => return Some(message),
                    ErrorPolicy::Swallow => debug!("{kind} stream error (ignored): {message}"),
                },
                StreamChunk::Done => break,
            }
        }
        None
    };

    let (outcome, failure) = tokio::join!(adapter.stream_completion(&request, chunk_tx), consume);
    let failure = match (failure, outcome) {
        (Some(message), _) => Some(message),
        (None, Err(e)) => match policy {
            ErrorPolicy::Surface => Some(format!("{e:#}")),
            ErrorPolicy::Swallow => {
                debug!("{kind} stream error (ignored): {e:#}");
                None
            }
        },
        (None, Ok(())) => None,
    };

    if let Some(message) = failure {
        error!("{kind} completion failed: {message}");
        let _ = tx.send(StreamEvent::Error(message)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::projector::OPENAI_PROMPT;
    use crate::config::InMemorySettingsStore;
    use crate::providers::local::END_OF_GENERATION;
    use crate::test_util::{dead_addr, serve_once, sse, FakeSession};
    use std::sync::atomic::Ordering;

    fn provider(kind: ProviderKind, base_url: String) -> ProviderConfig {
        ProviderConfig {
            enabled: true,
            base_url,
            api_key: Some("key".into()),
            model: Some("some-model".into()),
            ..ProviderConfig::new(kind)
        }
    }

    fn local_provider(path: &str) -> ProviderConfig {
        ProviderConfig {
            enabled: true,
            model_path: Some(PathBuf::from(path)),
            system_prompt: Some("be local".into()),
            ..ProviderConfig::new(ProviderKind::Local)
        }
    }

    fn service(configs: Vec<ProviderConfig>, session: FakeSession) -> CompletionService {
        CompletionService::new(
            Arc::new(InMemorySettingsStore::new(configs)),
            LocalModelHandle::new(session),
            AppConfig::default(),
        )
        .unwrap()
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn assert_well_formed(events: &[StreamEvent]) {
        assert_eq!(events.first(), Some(&StreamEvent::Loading));
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        let count = |want: fn(&StreamEvent) -> bool| events.iter().filter(|e| want(e)).count();
        assert_eq!(count(|e| matches!(e, StreamEvent::Loading)), 1);
        assert_eq!(count(|e| matches!(e, StreamEvent::Done)), 1);
        assert!(count(|e| matches!(e, StreamEvent::Error(_))) <= 1);
        if let Some(pos) = events.iter().position(|e| matches!(e, StreamEvent::Error(_))) {
            assert!(events[pos..].iter().all(|e| !matches!(e, StreamEvent::Token(_))));
        }
    }

    #[tokio::test]
    async fn missing_config_fails_before_streaming() {
        let svc = service(vec![], FakeSession::new(&[]));
        let err = svc
            .complete(ProviderKind::Anthropic, &[], &Message::user("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::MissingConfig(ProviderKind::Anthropic)));
    }

    #[tokio::test]
    async fn local_without_model_path_fails_before_streaming() {
        let svc = service(
            vec![ProviderConfig::new(ProviderKind::Local)],
            FakeSession::new(&[]),
        );
        let err = svc
            .complete(ProviderKind::Local, &[], &Message::user("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::MissingModelPath));
    }

    #[tokio::test]
    async fn openai_tokens_are_forwarded_in_order() {
        let body = sse(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            "[DONE]",
        ]);
        let (addr, captured) = serve_once(200, "text/event-stream", body).await;
        let svc = service(
            vec![provider(ProviderKind::OpenAi, format!("http://{addr}"))],
            FakeSession::new(&[]),
        );

        let history = vec![
            Message::user("a"),
            Message::from_provider(ProviderKind::Anthropic, "not for openai"),
        ];
        let rx = svc
            .complete(ProviderKind::OpenAi, &history, &Message::user("b"))
            .await
            .unwrap();
        let events = collect(rx).await;
        assert_well_formed(&events);
        assert_eq!(
            events,
            vec![
                StreamEvent::Loading,
                StreamEvent::Token("Hel".into()),
                StreamEvent::Token("lo".into()),
                StreamEvent::Done,
            ]
        );

        let req = captured.lock().unwrap().clone().unwrap();
        let messages = req.body["messages"].as_array().unwrap().clone();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"], OPENAI_PROMPT);
        assert_eq!(messages[2]["content"], "b");
    }

    #[tokio::test]
    async fn service_error_ends_the_stream_with_error_then_done() {
        let body = sse(&[
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"par"}}"#,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"tial"}}"#,
        ]);
        let (addr, _) = serve_once(200, "text/event-stream", body).await;
        let svc = service(
            vec![provider(ProviderKind::Anthropic, format!("http://{addr}"))],
            FakeSession::new(&[]),
        );

        let rx = svc
            .complete(ProviderKind::Anthropic, &[], &Message::user("q"))
            .await
            .unwrap();
        let events = collect(rx).await;
        assert_well_formed(&events);
        assert_eq!(
            events,
            vec![
                StreamEvent::Loading,
                StreamEvent::Token("par".into()),
                StreamEvent::Error("Overloaded".into()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn connection_failure_is_reported_in_stream() {
        let addr = dead_addr().await;
        for kind in [ProviderKind::Groq, ProviderKind::Ollama] {
            let svc = service(
                vec![provider(kind, format!("http://{addr}"))],
                FakeSession::new(&[]),
            );
            let events = collect(svc.complete(kind, &[], &Message::user("q")).await.unwrap()).await;
            assert_well_formed(&events);
            assert_eq!(events.len(), 3, "{kind}: {events:?}");
            assert!(matches!(events[1], StreamEvent::Error(_)));
        }
    }

    // Google errors are dropped on purpose to match the shipped app. If that
    // changes, this test should expect an `Error` like the other providers.
    #[tokio::test]
    async fn google_errors_are_swallowed() {
        let (addr, _) = serve_once(
            403,
            "application/json",
            r#"{"error":{"code":403,"message":"API key not valid"}}"#,
        )
        .await;
        let svc = service(
            vec![provider(ProviderKind::Google, format!("http://{addr}"))],
            FakeSession::new(&[]),
        );

        let events = collect(
            svc.complete(ProviderKind::Google, &[], &Message::user("q"))
                .await
                .unwrap(),
        )
        .await;
        assert_well_formed(&events);
        assert_eq!(events, vec![StreamEvent::Loading, StreamEvent::Done]);
    }

    #[tokio::test]
    async fn local_model_is_loaded_once_for_consecutive_requests() {
        let session = FakeSession::new(&["ok", END_OF_GENERATION]);
        let loads = session.loads.clone();
        let log = session.log.clone();
        let svc = service(vec![local_provider("/models/tiny.gguf")], session);

        let first = Message::user("one");
        let events = collect(svc.complete(ProviderKind::Local, &[], &first).await.unwrap()).await;
        assert_eq!(
            events,
            vec![StreamEvent::Loading, StreamEvent::Token("ok".into()), StreamEvent::Done]
        );

        let history = vec![first, Message::from_provider(ProviderKind::Local, "ok")];
        let events = collect(
            svc.complete(ProviderKind::Local, &history, &Message::user("two"))
                .await
                .unwrap(),
        )
        .await;
        assert_well_formed(&events);

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(
            log.lock().unwrap().clone(),
            vec![
                "system:be local".to_string(),
                "generate:one".to_string(),
                "generate:two".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn fresh_conversations_share_one_model_load() {
        let session = FakeSession::new(&["ok", END_OF_GENERATION]);
        let loads = session.loads.clone();
        let svc = service(vec![local_provider("/m/a.gguf")], session);

        for question in ["one", "two"] {
            let events = collect(
                svc.complete(ProviderKind::Local, &[], &Message::user(question))
                    .await
                    .unwrap(),
            )
            .await;
            assert_well_formed(&events);
            assert!(events.contains(&StreamEvent::Token("ok".into())));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_load_failure_is_an_error_event() {
        let svc = service(vec![local_provider("/models/broken.gguf")], FakeSession::failing());

        let events = collect(
            svc.complete(ProviderKind::Local, &[], &Message::user("q"))
                .await
                .unwrap(),
        )
        .await;
        assert_well_formed(&events);
        assert_eq!(events.len(), 3);
        match &events[1] {
            StreamEvent::Error(message) => {
                assert!(message.contains("Failed to load offline model from: /models/broken.gguf"))
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn preload_then_complete_reuses_the_model() {
        let session = FakeSession::new(&[END_OF_GENERATION]);
        let loads = session.loads.clone();
        let svc = service(vec![local_provider("/models/tiny.gguf")], session);

        svc.preload_local_model().await;
        assert!(svc.local_model().is_loaded());

        let events = collect(
            svc.complete(ProviderKind::Local, &[], &Message::user("q"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(events, vec![StreamEvent::Loading, StreamEvent::Done]);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn preload_without_configuration_is_a_no_op() {
        let session = FakeSession::new(&[]);
        let loads = session.loads.clone();
        let svc = service(vec![ProviderConfig::new(ProviderKind::Local)], session);
        svc.preload_local_model().await;
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_the_receiver_releases_the_local_session() {
        let session = FakeSession::new(&["a"; 1000]);
        let svc = service(vec![local_provider("/models/tiny.gguf")], session);

        let mut rx = svc
            .complete(ProviderKind::Local, &[], &Message::user("q"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::Loading));
        drop(rx);

        let next = svc
            .complete(ProviderKind::Local, &[], &Message::user("again"))
            .await
            .unwrap();
        let events = tokio::time::timeout(std::time::Duration::from_secs(5), collect(next))
            .await
            .expect("completion hung after the previous consumer went away");
        assert_well_formed(&events);
    }

    struct SendsOnceThenWaits;

    #[async_trait::async_trait]
    impl ChatAdapter for SendsOnceThenWaits {
        async fn stream_completion(
            &self,
            _request: &CompletionRequest,
            tx: mpsc::Sender<StreamChunk>,
        ) -> Result<()> {
            let _ = tx.send(StreamChunk::Delta { text: "partial".into() }).await;
            tx.closed().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn relay_stops_when_the_caller_hangs_up_mid_stream() {
        let (tx, mut rx) = mpsc::channel(8);
        let caller = async move {
            let first = rx.recv().await;
            drop(rx);
            first
        };
        let relay = drive(
            Box::new(SendsOnceThenWaits),
            CompletionRequest::default(),
            ProviderKind::OpenAi,
            &tx,
        );

        let ((), first) = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            tokio::join!(relay, caller)
        })
        .await
        .expect("relay kept waiting after the caller hung up");
        assert_eq!(first, Some(StreamEvent::Token("partial".into())));
    }
}
