//! Shared test fixtures: a spawned gateway, a mock Graph upstream, and a
//! mock Substrate hub.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::protocol::Message;

use m365_gateway::app_context::AppContext;
use m365_gateway::config::GatewayConfig;
use m365_gateway::routers::OpenAIRouter;
use m365_gateway::server::{build_app, AppState};

pub const RS: char = '\u{1e}';

// ============================================================================
// Gateway under test
// ============================================================================

pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
}

pub async fn spawn_app(config: GatewayConfig) -> TestApp {
    let context = Arc::new(AppContext::from_config(config).unwrap());
    let router = Arc::new(OpenAIRouter::new(context.clone()));
    let state = Arc::new(AppState { router, context });
    let app = build_app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{}", addr),
        client: reqwest::Client::new(),
    }
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Unsigned JWT carrying the claims the Substrate transport needs.
pub fn test_jwt(oid: &str, tid: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
    let payload = URL_SAFE_NO_PAD.encode(json!({"oid": oid, "tid": tid}).to_string().as_bytes());
    format!("{}.{}.x", header, payload)
}

/// Split an SSE body into `(event, data)` pairs.
pub fn parse_sse(body: &str) -> Vec<(Option<String>, String)> {
    let mut events = Vec::new();
    for block in body.split("\n\n") {
        let mut event = None;
        let mut data_lines = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }
        if !data_lines.is_empty() {
            events.push((event, data_lines.join("\n")));
        }
    }
    events
}

// ============================================================================
// Mock Graph upstream
// ============================================================================

#[derive(Clone)]
struct GraphState {
    reply: String,
    /// Snapshots used by the streaming endpoint, cumulative
    stream_snapshots: Vec<String>,
    conversations_created: Arc<AtomicUsize>,
    chat_prompts: Arc<Mutex<Vec<String>>>,
}

pub struct MockGraphServer {
    addr: SocketAddr,
    conversations_created: Arc<AtomicUsize>,
    chat_prompts: Arc<Mutex<Vec<String>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockGraphServer {
    pub async fn new(reply: &str) -> Self {
        Self::with_snapshots(reply, vec![reply.to_string()]).await
    }

    /// `snapshots` drive the SSE endpoint; each entry is one cumulative
    /// snapshot of the assistant text.
    pub async fn with_snapshots(reply: &str, snapshots: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let conversations_created = Arc::new(AtomicUsize::new(0));
        let chat_prompts = Arc::new(Mutex::new(Vec::new()));
        let state = GraphState {
            reply: reply.to_string(),
            stream_snapshots: snapshots,
            conversations_created: conversations_created.clone(),
            chat_prompts: chat_prompts.clone(),
        };

        let app = Router::new()
            .route("/copilot/conversations", post(create_conversation))
            .route(
                "/copilot/conversations/{id}/chat",
                post(buffered_chat),
            )
            .route(
                "/copilot/conversations/{id}/chatOverStream",
                post(stream_chat),
            )
            .with_state(state);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        Self {
            addr,
            conversations_created,
            chat_prompts,
            _handle: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn conversations_created(&self) -> usize {
        self.conversations_created.load(Ordering::SeqCst)
    }

    pub fn chat_prompts(&self) -> Vec<String> {
        self.chat_prompts.lock().clone()
    }
}

async fn create_conversation(State(state): State<GraphState>) -> Response {
    let count = state.conversations_created.fetch_add(1, Ordering::SeqCst);
    Json(json!({"id": format!("conv-graph-{}", count + 1)})).into_response()
}

async fn request_prompt(request: Request<Body>) -> Option<String> {
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .ok()?;
    let value: Value = serde_json::from_slice(&body).ok()?;
    value
        .get("message")
        .and_then(|m| m.get("text"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

async fn buffered_chat(State(state): State<GraphState>, request: Request<Body>) -> Response {
    let prompt = request_prompt(request).await.unwrap_or_default();
    state.chat_prompts.lock().push(prompt.clone());
    Json(json!({
        "messages": [
            {"text": prompt},
            {"text": state.reply},
        ]
    }))
    .into_response()
}

async fn stream_chat(State(state): State<GraphState>, request: Request<Body>) -> Response {
    let prompt = request_prompt(request).await.unwrap_or_default();
    state.chat_prompts.lock().push(prompt.clone());

    let mut body = String::new();
    for snapshot in &state.stream_snapshots {
        let event = json!({"messages": [
            {"text": prompt},
            {"text": snapshot},
        ]});
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/event-stream")],
        body,
    )
        .into_response()
}

// ============================================================================
// Mock Substrate hub
// ============================================================================

#[derive(Clone)]
pub enum SubstrateScript {
    /// Stream each delta, then a final bot snapshot, then a terminal frame
    DeltasThenBot {
        deltas: Vec<String>,
        bot_text: String,
    },
    /// Reply with one bot message
    Text(String),
    /// First connection completes without assistant content; later
    /// connections answer with the given text
    EmptyThenText(String),
}

pub struct MockSubstrateHub {
    addr: SocketAddr,
    pub seen_conversation_ids: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockSubstrateHub {
    pub async fn start(script: SubstrateScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_conversation_ids = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let seen = seen_conversation_ids.clone();
        let counter = connections.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    break;
                };
                let index = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_hub_connection(
                    tcp,
                    script.clone(),
                    seen.clone(),
                    index,
                ));
            }
        });

        Self {
            addr,
            seen_conversation_ids,
            connections,
            _handle: handle,
        }
    }

    /// Value for `substrate.hubPath`; plain ws scheme for loopback tests.
    pub fn hub_path(&self) -> String {
        format!("ws://{}/hub", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn record(value: &Value) -> Message {
    Message::Text(format!("{}{}", value, RS).into())
}

async fn handle_hub_connection(
    tcp: tokio::net::TcpStream,
    script: SubstrateScript,
    seen: Arc<Mutex<Vec<String>>>,
    connection_index: usize,
) {
    let seen_in_query = seen.clone();
    let mut ws = match tokio_tungstenite::accept_hdr_async(tcp, move |req: &WsRequest, resp: WsResponse| {
        let query = req.uri().query().unwrap_or_default();
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("ConversationId=") {
                let decoded = urlencoding::decode(value).unwrap_or_default().to_string();
                seen_in_query.lock().push(decoded);
            }
        }
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(_) => return,
    };

    // Handshake record from the gateway, then the ack.
    let Some(Ok(_handshake)) = ws.next().await else {
        return;
    };
    let _ = ws.send(record(&json!({}))).await;

    // Consume records until the invocation (the frame carrying arguments).
    let invocation = loop {
        let Some(Ok(message)) = ws.next().await else {
            return;
        };
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Message::Ping(payload) => {
                let _ = ws.send(Message::Pong(payload)).await;
                continue;
            }
            Message::Close(_) => return,
            _ => continue,
        };
        let mut found = None;
        for piece in text.split(RS) {
            if piece.trim().is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(piece) else {
                continue;
            };
            if value.get("arguments").is_some() {
                found = Some(value);
            }
        }
        if let Some(invocation) = found {
            break invocation;
        }
    };

    let conversation_id = invocation["arguments"][0]["conversationId"]
        .as_str()
        .unwrap_or("conv-sub")
        .to_string();

    match script {
        SubstrateScript::DeltasThenBot { deltas, bot_text } => {
            for delta in deltas {
                let _ = ws
                    .send(record(&json!({
                        "type": 1,
                        "arguments": [{"conversationId": conversation_id, "writeAtCursor": delta}]
                    })))
                    .await;
            }
            let _ = ws
                .send(record(&json!({
                    "type": 2,
                    "item": {
                        "conversationId": conversation_id,
                        "messages": [
                            {"author": "bot", "messageType": "Chat", "text": bot_text}
                        ],
                    },
                    "result": {"value": "Success"}
                })))
                .await;
        }
        SubstrateScript::Text(text) => {
            let _ = ws
                .send(record(&json!({
                    "type": 2,
                    "item": {
                        "conversationId": conversation_id,
                        "messages": [
                            {"author": "bot", "messageType": "Chat", "text": text}
                        ],
                    },
                    "result": {"value": "Success"}
                })))
                .await;
        }
        SubstrateScript::EmptyThenText(text) => {
            if connection_index == 0 {
                let _ = ws
                    .send(record(&json!({
                        "type": 3,
                        "result": {"value": "Success"}
                    })))
                    .await;
            } else {
                let _ = ws
                    .send(record(&json!({
                        "type": 2,
                        "item": {
                            "conversationId": conversation_id,
                            "messages": [
                                {"author": "bot", "messageType": "Chat", "text": text}
                            ],
                        },
                        "result": {"value": "Success"}
                    })))
                    .await;
            }
        }
    }

    // Let the gateway close; drain until then.
    while let Some(Ok(message)) = ws.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

// ============================================================================
// Config helpers
// ============================================================================

pub fn graph_config(graph: &MockGraphServer) -> GatewayConfig {
    GatewayConfig {
        graph_base_url: graph.base_url(),
        transport: "graph".to_string(),
        ..Default::default()
    }
}

pub fn substrate_config(hub: &MockSubstrateHub) -> GatewayConfig {
    let mut config = GatewayConfig {
        transport: "substrate".to_string(),
        ..Default::default()
    };
    config.substrate.hub_path = hub.hub_path();
    config.substrate.keep_alive_seconds = 1;
    config.substrate.invocation_timeout_seconds = 10;
    config
}
