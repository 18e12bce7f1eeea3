//! Local HTTP fixtures for adapter tests.

use futures_util::StreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// A request as seen by the fixture server.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

impl Captured {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Serve exactly one request with a fixed status and body, recording the request.
pub async fn serve_once(
    status: u16,
    content_type: &'static str,
    body: impl Into<String>,
) -> (SocketAddr, Arc<Mutex<Option<Captured>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&captured);
    let body: String = body.into();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let handler = move |req: Request<hyper::body::Incoming>| {
            let sink = Arc::clone(&sink);
            let body = body.clone();
            async move {
                let path = req.uri().path().to_string();
                let query = req.uri().query().map(str::to_string);
                let headers = req
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                    .collect();
                let bytes = req.collect().await.unwrap().to_bytes();
                let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
                *sink.lock().unwrap() = Some(Captured {
                    path,
                    query,
                    headers,
                    body: json,
                });

                let resp = Response::builder()
                    .status(StatusCode::from_u16(status).unwrap())
                    .header("content-type", content_type)
                    .body(Full::new(Bytes::from(body)))
                    .unwrap();
                Ok::<_, Infallible>(resp)
            }
        };
        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service_fn(handler))
            .await
            .ok();
    });

    (addr, captured)
}

/// Serve one request with a 200 response that sends `first` and then never
/// sends anything again nor closes.
pub async fn serve_stalled(content_type: &'static str, first: impl Into<String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let first: String = first.into();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let handler = move |_req: Request<hyper::body::Incoming>| {
            let first = first.clone();
            async move {
                let frames = futures_util::stream::once(async move {
                    Ok::<_, Infallible>(Frame::data(Bytes::from(first)))
                })
                .chain(futures_util::stream::pending());
                let resp = Response::builder()
                    .header("content-type", content_type)
                    .body(StreamBody::new(frames))
                    .unwrap();
                Ok::<_, Infallible>(resp)
            }
        };
        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service_fn(handler))
            .await
            .ok();
    });

    addr
}

/// An address nothing is listening on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Render `data:` payloads as an SSE body.
pub fn sse(payloads: &[&str]) -> String {
    payloads
        .iter()
        .map(|p| format!("data: {p}\n\n"))
        .collect::<String>()
}

/// Drive an adapter to completion and gather everything it sent.
pub async fn collect_chunks(
    adapter: &dyn crate::providers::provider::ChatAdapter,
    request: &crate::providers::provider::CompletionRequest,
) -> Vec<crate::providers::provider::StreamChunk> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let drain = async {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    };
    let (res, chunks) = tokio::join!(adapter.stream_completion(request, tx), drain);
    res.unwrap();
    chunks
}

/// Take at most one chunk, then drop the receiver. Returns that chunk once
/// the adapter has given up, and panics if it never does.
pub async fn first_chunk_then_hang_up(
    adapter: &dyn crate::providers::provider::ChatAdapter,
    request: &crate::providers::provider::CompletionRequest,
) -> Option<crate::providers::provider::StreamChunk> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let consumer = async move {
        let first = tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .ok()
            .flatten();
        drop(rx);
        first
    };
    let run = async { tokio::join!(adapter.stream_completion(request, tx), consumer) };
    let (res, first) = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("adapter kept running after the receiver was dropped");
    res.unwrap();
    first
}

/// Scripted stand-in for an on-device model. Records every call it receives.
pub struct FakeSession {
    pub loads: Arc<std::sync::atomic::AtomicUsize>,
    pub log: Arc<Mutex<Vec<String>>>,
    tokens: Vec<String>,
    loaded: Option<std::path::PathBuf>,
    fail_load: bool,
    generate_error: Option<String>,
}

impl FakeSession {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            loads: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            loaded: None,
            fail_load: false,
            generate_error: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_load: true,
            ..Self::new(&[])
        }
    }

    pub fn with_generate_error(mut self, message: &str) -> Self {
        self.generate_error = Some(message.to_string());
        self
    }
}

impl crate::providers::local::LocalModelSession for FakeSession {
    fn load(&mut self, path: &std::path::Path, _params: &crate::providers::local::LoadParams) -> bool {
        self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_load {
            return false;
        }
        self.log.lock().unwrap().clear();
        self.loaded = Some(path.to_path_buf());
        true
    }

    fn unload(&mut self) {
        self.loaded = None;
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn loaded_path(&self) -> Option<&std::path::Path> {
        self.loaded.as_deref()
    }

    fn append_system_turn(&mut self, text: &str) {
        self.log.lock().unwrap().push(format!("system:{text}"));
    }

    fn append_user_turn(&mut self, text: &str) {
        self.log.lock().unwrap().push(format!("user:{text}"));
    }

    fn append_assistant_turn(&mut self, text: &str) {
        self.log.lock().unwrap().push(format!("assistant:{text}"));
    }

    fn generate(&mut self, prompt: &str) -> anyhow::Result<crate::providers::local::TokenIter<'_>> {
        self.log.lock().unwrap().push(format!("generate:{prompt}"));
        if let Some(message) = self.generate_error.clone() {
            return Ok(Box::new(std::iter::once(Err(anyhow::anyhow!(message)))));
        }
        Ok(Box::new(self.tokens.clone().into_iter().map(Ok)))
    }
}
