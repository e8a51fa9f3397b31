//! Substrate transport: one WebSocket per chat turn, RS-framed hub
//! protocol (handshake, ping, invocation, update/completion frames).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::debug;
use uuid::Uuid;

use crate::config::{GatewayConfig, SubstrateConfig};
use crate::core::{ErrorCode, GatewayError, GatewayResult};
use crate::logging::redact_token;
use crate::protocols::canonical::CanonicalRequest;
use crate::transports::{ChatTransport, StreamUpdate, TransportKind, TurnOutcome};

use super::frames::{
    decode_jwt_claims, encode_record, extract_bot_message_text, extract_conversation_id,
    extract_write_at_cursor, frame_error_message, is_terminal_frame, result_failure,
    split_records,
};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct SubstrateTransport {
    config: Arc<GatewayConfig>,
}

impl SubstrateTransport {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChatTransport for SubstrateTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Substrate
    }

    /// Substrate conversation ids are client-assigned: the hub adopts the
    /// id carried in the connection query on the first turn.
    async fn create_conversation(&self, _auth: &str) -> GatewayResult<String> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn chat_turn(
        &self,
        auth: &str,
        conversation_id: &str,
        request: &CanonicalRequest,
        is_start_of_session: bool,
        updates: Option<mpsc::UnboundedSender<StreamUpdate>>,
    ) -> GatewayResult<TurnOutcome> {
        let substrate = &self.config.substrate;
        let token = auth.strip_prefix("Bearer ").unwrap_or(auth);
        let (oid, tid) = decode_jwt_claims(token).ok_or_else(|| {
            GatewayError::new(
                ErrorCode::SubstrateError,
                StatusCode::BAD_REQUEST,
                "bearer token is not a JWT exposing 'oid' and 'tid' claims",
            )
        })?;

        let url = build_hub_url(substrate, &oid, &tid, conversation_id, token);
        let timeout = Duration::from_secs(substrate.invocation_timeout_seconds.max(1));

        let mut ws_request = url.into_client_request().map_err(|err| {
            GatewayError::substrate(None, format!("invalid substrate hub url: {}", err))
        })?;
        if !substrate.origin.is_empty() {
            let origin = substrate.origin.parse().map_err(|_| {
                GatewayError::substrate(None, "configured substrate origin is not a valid header")
            })?;
            ws_request.headers_mut().insert("Origin", origin);
        }

        debug!(
            conversation_id,
            token = %redact_token(token),
            "opening substrate socket"
        );

        let connected = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(ws_request))
            .await
            .map_err(|_| {
                GatewayError::substrate_timeout("timed out connecting to the substrate hub")
            })?;
        let (mut ws, _handshake) = connected.map_err(|err| {
            GatewayError::substrate(None, format!("substrate connect failed: {}", err))
        })?;

        let result = run_turn(
            &mut ws,
            substrate,
            request,
            conversation_id,
            is_start_of_session,
            updates,
            timeout,
        )
        .await;

        // The socket is closed on every exit path, including errors.
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await;

        result
    }
}

async fn run_turn(
    ws: &mut WsStream,
    substrate: &SubstrateConfig,
    request: &CanonicalRequest,
    conversation_id: &str,
    is_start_of_session: bool,
    updates: Option<mpsc::UnboundedSender<StreamUpdate>>,
    timeout: Duration,
) -> GatewayResult<TurnOutcome> {
    let mut pending = String::new();

    // Handshake: negotiate the JSON protocol, then inspect the first frame.
    send_record(ws, &json!({"protocol": "json", "version": 1})).await?;
    let ack_deadline = Instant::now() + timeout;
    let ack = loop {
        let message = tokio::time::timeout_at(ack_deadline, ws.next())
            .await
            .map_err(|_| GatewayError::substrate_timeout("substrate handshake timed out"))?;
        let Some(message) = message else {
            return Err(GatewayError::substrate(
                None,
                "substrate socket closed during handshake",
            ));
        };
        let message = message.map_err(|err| {
            GatewayError::substrate(None, format!("substrate handshake failed: {}", err))
        })?;
        let Some(text) = inbound_text(ws, message).await? else {
            continue;
        };
        pending.push_str(&text);
        let (records, rest) = split_records(&pending);
        pending = rest;
        let mut records = records.into_iter();
        if let Some(first) = records.next() {
            // Records batched behind the ack go back in front of the buffer.
            let leftover: Vec<String> = records.collect();
            if !leftover.is_empty() {
                let mut requeued = String::new();
                for record in leftover {
                    requeued.push_str(&record);
                    requeued.push(super::frames::RECORD_SEPARATOR);
                }
                requeued.push_str(&pending);
                pending = requeued;
            }
            break first;
        }
    };
    if let Ok(frame) = serde_json::from_str::<Value>(&ack) {
        if let Some(error) = frame_error_message(&frame) {
            return Err(GatewayError::substrate(
                None,
                format!("substrate handshake rejected: {}", error),
            ));
        }
    }

    // Client keep-alive, then the single invocation for this turn.
    send_record(ws, &json!({"type": 6})).await?;
    let invocation = build_invocation(substrate, request, conversation_id, is_start_of_session);
    send_record(ws, &invocation).await?;

    // A background keep-alive pings the peer while the socket is open; the
    // invocation deadline restarts whenever a frame arrives.
    let keep_alive = Duration::from_secs(substrate.keep_alive_seconds.max(1));
    let mut next_keepalive = Instant::now() + keep_alive;
    let mut deadline = Instant::now() + timeout;
    let mut assembly = TurnAssembly::default();

    'receive: loop {
        // Drain complete records already buffered before waiting for more.
        let (records, rest) = split_records(&pending);
        pending = rest;
        let mut saw_terminal = false;
        for record in records {
            let Ok(frame) = serde_json::from_str::<Value>(&record) else {
                continue;
            };
            if assembly.ingest(&frame, updates.as_ref()) {
                saw_terminal = true;
                break;
            }
        }
        if saw_terminal {
            break 'receive;
        }

        let wake_at = next_keepalive.min(deadline);
        match tokio::time::timeout_at(wake_at, ws.next()).await {
            Err(_) => {
                if Instant::now() >= deadline {
                    return Err(GatewayError::substrate_timeout(
                        "substrate invocation timed out waiting for frames",
                    ));
                }
                if send_record(ws, &json!({"type": 6})).await.is_err() {
                    break 'receive;
                }
                next_keepalive = Instant::now() + keep_alive;
            }
            Ok(None) => break 'receive,
            Ok(Some(message)) => {
                let message = message.map_err(|err| {
                    GatewayError::substrate(None, format!("substrate receive failed: {}", err))
                })?;
                deadline = Instant::now() + timeout;
                if matches!(&message, Message::Close(_)) {
                    break 'receive;
                }
                if let Some(text) = inbound_text(ws, message).await? {
                    pending.push_str(&text);
                }
            }
        }
    }

    let (assistant_text, upstream_conversation) = assembly.finish()?;
    Ok(TurnOutcome {
        assistant_text,
        conversation_id: upstream_conversation,
    })
}

/// Decode one inbound message to text, answering pings along the way.
/// Returns None for control frames that carry no records.
async fn inbound_text(ws: &mut WsStream, message: Message) -> GatewayResult<Option<String>> {
    match message {
        Message::Text(text) => Ok(Some(text.to_string())),
        Message::Binary(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).to_string())),
        Message::Ping(payload) => {
            ws.send(Message::Pong(payload)).await.map_err(|err| {
                GatewayError::substrate(None, format!("substrate pong failed: {}", err))
            })?;
            Ok(None)
        }
        _ => Ok(None),
    }
}

async fn send_record(ws: &mut WsStream, value: &Value) -> GatewayResult<()> {
    ws.send(Message::Text(encode_record(value).into()))
        .await
        .map_err(|err| GatewayError::substrate(None, format!("substrate send failed: {}", err)))
}

/// Accumulated state of one invocation.
#[derive(Default)]
struct TurnAssembly {
    bot_text: Option<String>,
    deltas: String,
    conversation_id: Option<String>,
    error: Option<String>,
    result_failure: Option<String>,
}

impl TurnAssembly {
    /// Apply the extraction rules to one frame. Returns true on a terminal
    /// frame.
    fn ingest(
        &mut self,
        frame: &Value,
        updates: Option<&mpsc::UnboundedSender<StreamUpdate>>,
    ) -> bool {
        if let Some(error) = frame_error_message(frame) {
            self.error.get_or_insert(error);
        }

        let conversation_update = extract_conversation_id(frame);
        if let Some(id) = &conversation_update {
            self.conversation_id = Some(id.clone());
        }

        if let Some(delta) = extract_write_at_cursor(frame) {
            self.deltas.push_str(&delta);
            if let Some(updates) = updates {
                let _ = updates.send(StreamUpdate {
                    delta_text: Some(delta),
                    conversation_id: conversation_update.clone(),
                    ..Default::default()
                });
            }
        } else if let Some(id) = conversation_update {
            if let Some(updates) = updates {
                let _ = updates.send(StreamUpdate {
                    conversation_id: Some(id),
                    ..Default::default()
                });
            }
        }

        if let Some(text) = extract_bot_message_text(frame) {
            self.bot_text = Some(text);
        }
        if let Some(failure) = result_failure(frame) {
            self.result_failure.get_or_insert(failure);
        }

        is_terminal_frame(frame)
    }

    /// Final assembly: the last bot snapshot wins; otherwise the
    /// concatenated cursor deltas. Empty output without an upstream error
    /// is itself an error.
    fn finish(self) -> GatewayResult<(String, Option<String>)> {
        if let Some(error) = self.error {
            return Err(GatewayError::substrate(
                None,
                format!("substrate error: {}", error),
            ));
        }
        if let Some(failure) = self.result_failure {
            return Err(GatewayError::substrate(None, failure));
        }
        let text = match self.bot_text {
            Some(text) => text,
            None => self.deltas,
        };
        if text.is_empty() {
            return Err(GatewayError::substrate(
                None,
                "substrate chat returned no assistant content",
            ));
        }
        Ok((text, self.conversation_id))
    }
}

fn build_hub_url(
    substrate: &SubstrateConfig,
    oid: &str,
    tid: &str,
    conversation_id: &str,
    token: &str,
) -> String {
    let mut params: Vec<(&str, String)> = vec![
        ("ClientRequestId", Uuid::new_v4().to_string()),
        ("X-SessionId", Uuid::new_v4().to_string()),
        ("ConversationId", conversation_id.to_string()),
        ("access_token", token.to_string()),
    ];
    if !substrate.source.is_empty() {
        let source = if substrate.quote_source_in_query {
            format!("\"{}\"", substrate.source)
        } else {
            substrate.source.clone()
        };
        params.push(("source", source));
    }
    if !substrate.scenario.is_empty() {
        params.push(("scenario", substrate.scenario.clone()));
    }
    for (key, value) in [
        ("product", &substrate.product),
        ("agentHost", &substrate.agent_host),
        ("licenseType", &substrate.license_type),
        ("agent", &substrate.agent),
        ("variants", &substrate.variants),
    ] {
        if let Some(value) = value {
            params.push((key, value.clone()));
        }
    }

    let query: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect();

    let hub = substrate.hub_path.trim_end_matches('/');
    let base = if hub.starts_with("ws://") || hub.starts_with("wss://") {
        hub.to_string()
    } else {
        format!("wss://{}", hub)
    };
    format!(
        "{}/{}@{}?{}",
        base,
        urlencoding::encode(oid),
        urlencoding::encode(tid),
        query.join("&")
    )
}

/// One invocation frame, shaped for the hub's chat target.
fn build_invocation(
    substrate: &SubstrateConfig,
    request: &CanonicalRequest,
    conversation_id: &str,
    is_start_of_session: bool,
) -> Value {
    let mut location = json!({
        "timeZone": request.location_hint.time_zone,
        "timeZoneOffset": 0,
    });
    if let Some(region) = &request.location_hint.country_or_region {
        location["countryOrRegion"] = json!(region);
    }

    let mut message = json!({
        "author": "user",
        "text": request.prompt_with_context(),
        "inputMethod": "Keyboard",
        "locale": substrate.locale,
        "locationInfo": location,
    });
    if let Some(experience) = &substrate.experience_type {
        message["experienceType"] = json!(experience);
    }

    let mut argument = json!({
        "source": substrate.source,
        "clientCorrelationId": Uuid::new_v4().to_string(),
        "sessionId": Uuid::new_v4().to_string(),
        "conversationId": conversation_id,
        "traceId": Uuid::new_v4().simple().to_string(),
        "isStartOfSession": is_start_of_session,
        "productThreadType": substrate.product_thread_type,
        "clientInfo": {"clientPlatform": substrate.client_platform},
        "message": message,
        "optionsSets": substrate.options_sets,
        "allowedMessageTypes": substrate.allowed_message_types,
    });
    if !substrate.entity_annotation_types.is_empty() {
        argument["entityAnnotationTypes"] = json!(substrate.entity_annotation_types);
    }
    if let Some(resources) = &request.contextual_resources {
        argument["contextualResources"] = resources.clone();
    }

    json!({
        "arguments": [argument],
        "invocationId": "0",
        "target": substrate.invocation_target,
        "type": substrate.invocation_type,
    })
}
