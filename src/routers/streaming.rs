//! Streaming machinery: SSE framing, cumulative-snapshot delta
//! computation, the chat chunk stream, and the Responses event sequence.

use std::io;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, HeaderValue},
    response::Response,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::core::{GatewayError, GatewayResult};
use crate::data_connector::{SharedConversationStorage, SharedResponseStorage};
use crate::protocols::canonical::CanonicalRequest;
use crate::tool_parser::AssistantResponse;
use crate::transports::{SharedChatTransport, StreamUpdate, TransportKind, TurnOutcome};

use super::emitter;

// ============================================================================
// SSE formatting
// ============================================================================

pub fn format_sse_event(event_type: Option<&str>, data: &Value) -> Bytes {
    let json_str = data.to_string();
    let mut block = String::with_capacity(json_str.len() + 32);
    if let Some(event) = event_type {
        block.push_str("event: ");
        block.push_str(event);
        block.push('\n');
    }
    block.push_str("data: ");
    block.push_str(&json_str);
    block.push_str("\n\n");
    Bytes::from(block)
}

pub fn format_sse_data(data: &Value) -> Bytes {
    format_sse_event(None, data)
}

pub fn format_sse_done() -> Bytes {
    Bytes::from("data: [DONE]\n\n")
}

/// A failure surfaced after bytes already reached the client.
pub fn format_sse_error(error: &GatewayError) -> Bytes {
    format_sse_event(Some("error"), &error.to_body())
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-cache"));
    response
}

// ============================================================================
// Delta tracking
// ============================================================================

/// Tracks the bytes already emitted to the client and converts cumulative
/// snapshots into true suffix deltas. A snapshot that does not extend the
/// emitted prefix is skipped: sent bytes are never retracted or reordered.
#[derive(Default)]
pub struct DeltaTracker {
    emitted: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    /// Delta for a cumulative snapshot, when it extends the emitted prefix.
    pub fn on_snapshot(&mut self, latest: &str) -> Option<String> {
        if !latest.starts_with(&self.emitted) {
            return None;
        }
        let delta = &latest[self.emitted.len()..];
        if delta.is_empty() {
            return None;
        }
        let delta = delta.to_string();
        self.emitted = latest.to_string();
        Some(delta)
    }

    /// An already-incremental delta is appended as-is.
    pub fn on_delta(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        self.emitted.push_str(delta);
        Some(delta.to_string())
    }

    /// Trailing-delta rule: on termination the buffered final text may be
    /// longer than everything emitted; the suffix goes out as one last delta.
    pub fn trailing(&mut self, final_text: &str) -> Option<String> {
        self.on_snapshot(final_text)
    }

    fn apply(&mut self, update: &StreamUpdate) -> Option<String> {
        if let Some(delta) = update.delta_text.as_deref() {
            return self.on_delta(delta);
        }
        if let Some(snapshot) = update.snapshot_text.as_deref() {
            return self.on_snapshot(snapshot);
        }
        None
    }
}

// ============================================================================
// Responses event sequence
// ============================================================================

/// Everything echoed into Responses bodies besides the assistant output.
#[derive(Clone)]
pub struct ResponseExtras {
    pub input_echo: Value,
    pub instructions: Option<String>,
    pub previous_response_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Emits the Responses SSE event sequence. Every event carries the same
/// response id and a monotonically increasing sequence number.
pub struct ResponsesEventSequencer {
    pub response_id: String,
    created_at: u64,
    model: String,
    sequence: u64,
    message_item_id: String,
}

impl ResponsesEventSequencer {
    pub fn new(response_id: String, model: String) -> Self {
        Self {
            response_id,
            created_at: emitter::now_unix(),
            model,
            sequence: 0,
            message_item_id: format!("msg_{}", Uuid::new_v4().simple()),
        }
    }

    fn event(&mut self, name: &str, mut payload: Value) -> Bytes {
        payload["type"] = json!(name);
        payload["sequence_number"] = json!(self.sequence);
        self.sequence += 1;
        format_sse_event(Some(name), &payload)
    }

    pub fn envelope(&self, status: &str, output: Vec<Value>, extras: &ResponseExtras) -> Value {
        emitter::response_body(emitter::ResponseBodyParts {
            response_id: &self.response_id,
            created_at: self.created_at,
            model: &self.model,
            status,
            output,
            input_echo: &extras.input_echo,
            instructions: extras.instructions.as_deref(),
            previous_response_id: extras.previous_response_id.as_deref(),
            conversation_id: extras.conversation_id.as_deref(),
        })
    }

    /// `response.created` and `response.in_progress`.
    pub fn begin(&mut self, extras: &ResponseExtras) -> Vec<Bytes> {
        let in_progress = self.envelope("in_progress", Vec::new(), extras);
        vec![
            self.event("response.created", json!({ "response": in_progress })),
            self.event("response.in_progress", json!({ "response": in_progress })),
        ]
    }

    /// Empty placeholder message item (`response.output_item.added`).
    pub fn add_message_placeholder(&mut self) -> Bytes {
        let item = json!({
            "type": "message",
            "id": self.message_item_id,
            "status": "in_progress",
            "role": "assistant",
            "content": [],
        });
        self.event(
            "response.output_item.added",
            json!({ "output_index": 0, "item": item }),
        )
    }

    pub fn text_delta(&mut self, delta: &str) -> Bytes {
        let payload = json!({
            "item_id": self.message_item_id,
            "output_index": 0,
            "content_index": 0,
            "delta": delta,
        });
        self.event("response.output_text.delta", payload)
    }

    fn final_message_item(&self, text: &str) -> Value {
        json!({
            "type": "message",
            "id": self.message_item_id,
            "status": "completed",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text, "annotations": []}],
        })
    }

    /// Terminal events for a text answer: `output_text.done`,
    /// `output_item.done`, `response.completed`. Returns the final body
    /// for persistence.
    pub fn finish_text(&mut self, text: &str, extras: &ResponseExtras) -> (Vec<Bytes>, Value) {
        let item = self.final_message_item(text);
        let body = self.envelope("completed", vec![item.clone()], extras);
        let frames = vec![
            self.event(
                "response.output_text.done",
                json!({
                    "item_id": self.message_item_id,
                    "output_index": 0,
                    "content_index": 0,
                    "text": text,
                }),
            ),
            self.event(
                "response.output_item.done",
                json!({ "output_index": 0, "item": item }),
            ),
            {
                let body = body.clone();
                self.event("response.completed", json!({ "response": body }))
            },
        ];
        (frames, body)
    }

    /// Function-call items are added in final form and skip the text
    /// delta/done events entirely.
    pub fn finish_function_calls(
        &mut self,
        assistant: &AssistantResponse,
        extras: &ResponseExtras,
    ) -> (Vec<Bytes>, Value) {
        let items = emitter::response_output_items(assistant);
        let body = self.envelope("completed", items.clone(), extras);
        let mut frames = Vec::new();
        for (index, item) in items.iter().enumerate() {
            frames.push(self.event(
                "response.output_item.added",
                json!({ "output_index": index, "item": item }),
            ));
            frames.push(self.event(
                "response.output_item.done",
                json!({ "output_index": index, "item": item }),
            ));
        }
        {
            let body = body.clone();
            frames.push(self.event("response.completed", json!({ "response": body })));
        }
        (frames, body)
    }
}

// ============================================================================
// Buffered (canned) streams
// ============================================================================

/// Chat streaming sequence for a fully buffered assistant turn: role chunk,
/// one content or tool-calls chunk, the finish chunk, `[DONE]`.
pub fn chat_buffered_stream(model: &str, assistant: &AssistantResponse) -> Response {
    let id = emitter::generate_chat_id();
    let created = emitter::now_unix();
    let mut out = Vec::new();

    let role = emitter::role_chunk(&id, created, model);
    out.push(format_sse_data(&serde_json::to_value(role).unwrap_or_default()));

    if !assistant.tool_calls.is_empty() {
        let chunk = emitter::tool_calls_chunk(&id, created, model, &assistant.tool_calls);
        out.push(format_sse_data(&serde_json::to_value(chunk).unwrap_or_default()));
    } else if let Some(content) = assistant.content.as_deref() {
        if !content.is_empty() {
            let chunk = emitter::content_chunk(&id, created, model, content);
            out.push(format_sse_data(&serde_json::to_value(chunk).unwrap_or_default()));
        }
    }

    let finish = emitter::finish_chunk(&id, created, model, assistant.finish_reason.as_str());
    out.push(format_sse_data(&serde_json::to_value(finish).unwrap_or_default()));
    out.push(format_sse_done());

    sse_response(Body::from(concat_frames(out)))
}

/// Responses streaming sequence for a fully buffered turn. Returns the
/// response to send plus the final body for persistence.
pub fn responses_buffered_stream(
    model: &str,
    assistant: &AssistantResponse,
    extras: &ResponseExtras,
) -> (Response, String, Value) {
    let mut sequencer =
        ResponsesEventSequencer::new(emitter::generate_response_id(), model.to_string());
    let response_id = sequencer.response_id.clone();
    let mut frames = sequencer.begin(extras);

    let final_body = if assistant.tool_calls.is_empty() {
        frames.push(sequencer.add_message_placeholder());
        let text = assistant.content.clone().unwrap_or_default();
        if !text.is_empty() {
            frames.push(sequencer.text_delta(&text));
        }
        let (tail, body) = sequencer.finish_text(&text, extras);
        frames.extend(tail);
        body
    } else {
        let (tail, body) = sequencer.finish_function_calls(assistant, extras);
        frames.extend(tail);
        body
    };

    (
        sse_response(Body::from(concat_frames(frames))),
        response_id,
        final_body,
    )
}

fn concat_frames(frames: Vec<Bytes>) -> Bytes {
    let mut out = Vec::with_capacity(frames.iter().map(|f| f.len()).sum());
    for frame in frames {
        out.extend_from_slice(&frame);
    }
    Bytes::from(out)
}

// ============================================================================
// Live streams
// ============================================================================

/// Per-request state handed to the live streaming pumps.
pub struct LiveStreamContext {
    pub transport: SharedChatTransport,
    pub auth: String,
    pub canonical: CanonicalRequest,
    pub conversation_id: String,
    pub conversation_created: bool,
    pub scoped_key: String,
    pub conversation_storage: SharedConversationStorage,
    pub model: String,
}

enum FirstSignal {
    /// A text-bearing update arrived; the stream is committed.
    Committed(Vec<StreamUpdate>),
    Finished(GatewayResult<TurnOutcome>),
}

type TurnHandle = tokio::task::JoinHandle<GatewayResult<TurnOutcome>>;

fn flatten_turn(result: Result<GatewayResult<TurnOutcome>, tokio::task::JoinError>) -> GatewayResult<TurnOutcome> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(GatewayError::response_stream(format!(
            "upstream turn task failed: {}",
            err
        ))),
    }
}

/// Launch one upstream turn and wait for the first byte-worthy signal.
/// Nothing is written to the client before this resolves, which is what
/// keeps pre-stream errors eligible for retries and JSON error bodies.
async fn launch_turn(
    ctx: &LiveStreamContext,
    is_start_of_session: bool,
) -> (
    FirstSignal,
    Option<(TurnHandle, mpsc::UnboundedReceiver<StreamUpdate>)>,
) {
    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    let transport = ctx.transport.clone();
    let auth = ctx.auth.clone();
    let canonical = ctx.canonical.clone();
    let conversation_id = ctx.conversation_id.clone();
    let mut turn: TurnHandle = tokio::spawn(async move {
        transport
            .chat_turn(
                &auth,
                &conversation_id,
                &canonical,
                is_start_of_session,
                Some(update_tx),
            )
            .await
    });

    enum Step {
        Update(Option<StreamUpdate>),
        Done(Result<GatewayResult<TurnOutcome>, tokio::task::JoinError>),
    }

    let mut buffered = Vec::new();
    loop {
        let step = tokio::select! {
            update = update_rx.recv() => Step::Update(update),
            result = &mut turn => Step::Done(result),
        };
        match step {
            Step::Update(Some(update)) => {
                let has_text = update.delta_text.is_some() || update.snapshot_text.is_some();
                buffered.push(update);
                if has_text {
                    return (FirstSignal::Committed(buffered), Some((turn, update_rx)));
                }
            }
            Step::Update(None) => {
                let outcome = flatten_turn(turn.await);
                return (FirstSignal::Finished(outcome), None);
            }
            Step::Done(result) => {
                return (FirstSignal::Finished(flatten_turn(result)), None);
            }
        }
    }
}

/// Live pass-through chat stream. Applies the Substrate empty-assistant
/// retry while no byte has been committed. Returns the response together
/// with the conversation id in effect when the stream started.
pub async fn chat_live_stream(mut ctx: LiveStreamContext) -> GatewayResult<(Response, String)> {
    let mut attempt = 0usize;
    loop {
        let is_start = ctx.conversation_created;
        let (signal, running) = launch_turn(&ctx, is_start).await;
        match signal {
            FirstSignal::Finished(Ok(outcome)) => {
                // The turn completed before producing any streamable text;
                // fall back to the canned sequence over the full text.
                let assistant = AssistantResponse::text(outcome.assistant_text);
                let conversation_id = outcome
                    .conversation_id
                    .unwrap_or_else(|| ctx.conversation_id.clone());
                ctx.conversation_storage
                    .set(&ctx.scoped_key, &conversation_id)
                    .await;
                return Ok((chat_buffered_stream(&ctx.model, &assistant), conversation_id));
            }
            FirstSignal::Finished(Err(err)) => {
                if attempt == 0 && empty_assistant_retry_applies(&ctx, &err) {
                    attempt += 1;
                    retry_with_fresh_conversation(&mut ctx).await?;
                    continue;
                }
                return Err(err);
            }
            FirstSignal::Committed(buffered) => {
                let (turn, update_rx) = running.expect("committed stream keeps its turn handle");
                let conversation_id = ctx.conversation_id.clone();
                return Ok((pump_chat_stream(ctx, buffered, turn, update_rx), conversation_id));
            }
        }
    }
}

fn empty_assistant_retry_applies(ctx: &LiveStreamContext, err: &GatewayError) -> bool {
    ctx.transport.kind() == TransportKind::Substrate
        && ctx.conversation_created
        && err.message.contains("substrate chat returned no assistant content")
}

async fn retry_with_fresh_conversation(ctx: &mut LiveStreamContext) -> GatewayResult<()> {
    let fresh = ctx.transport.create_conversation(&ctx.auth).await?;
    warn!(
        old = %ctx.conversation_id,
        new = %fresh,
        "substrate returned no assistant content on a new conversation, retrying once"
    );
    ctx.conversation_storage.set(&ctx.scoped_key, &fresh).await;
    ctx.conversation_id = fresh;
    Ok(())
}

type ByteSender = mpsc::UnboundedSender<Result<Bytes, io::Error>>;

/// Forward one frame, flipping `connected` off once the client is gone.
fn forward(tx: &ByteSender, frame: Bytes, connected: &mut bool) {
    if *connected && tx.send(Ok(frame)).is_err() {
        *connected = false;
    }
}

fn forward_json<T: serde::Serialize>(tx: &ByteSender, value: &T, connected: &mut bool) {
    forward(
        tx,
        format_sse_data(&serde_json::to_value(value).unwrap_or_default()),
        connected,
    );
}

fn pump_chat_stream(
    ctx: LiveStreamContext,
    buffered: Vec<StreamUpdate>,
    turn: TurnHandle,
    mut update_rx: mpsc::UnboundedReceiver<StreamUpdate>,
) -> Response {
    let (byte_tx, byte_rx) = mpsc::unbounded_channel::<Result<Bytes, io::Error>>();
    let chat_id = emitter::generate_chat_id();
    let created = emitter::now_unix();

    tokio::spawn(async move {
        let mut tracker = DeltaTracker::new();
        let mut upstream_conversation: Option<String> = None;
        let mut connected = true;

        let role = emitter::role_chunk(&chat_id, created, &ctx.model);
        forward_json(&byte_tx, &role, &mut connected);

        let mut pending_updates = buffered;
        loop {
            for update in pending_updates.drain(..) {
                if let Some(id) = &update.conversation_id {
                    upstream_conversation = Some(id.clone());
                }
                if let Some(delta) = tracker.apply(&update) {
                    let chunk = emitter::content_chunk(&chat_id, created, &ctx.model, &delta);
                    forward_json(&byte_tx, &chunk, &mut connected);
                }
            }
            if !connected {
                break;
            }
            match update_rx.recv().await {
                Some(update) => pending_updates.push(update),
                None => break,
            }
        }

        if !connected {
            // Client went away; cancel the upstream turn.
            turn.abort();
            return;
        }

        match flatten_turn(turn.await) {
            Ok(outcome) => {
                if let Some(trail) = tracker.trailing(&outcome.assistant_text) {
                    let chunk = emitter::content_chunk(&chat_id, created, &ctx.model, &trail);
                    forward_json(&byte_tx, &chunk, &mut connected);
                }
                let finish = emitter::finish_chunk(&chat_id, created, &ctx.model, "stop");
                forward_json(&byte_tx, &finish, &mut connected);
                forward(&byte_tx, format_sse_done(), &mut connected);
                if let Some(id) = outcome.conversation_id.or(upstream_conversation) {
                    ctx.conversation_storage.set(&ctx.scoped_key, &id).await;
                }
            }
            Err(err) => {
                forward(&byte_tx, format_sse_error(&err), &mut connected);
                forward(&byte_tx, format_sse_done(), &mut connected);
            }
        }
    });

    sse_response(Body::from_stream(UnboundedReceiverStream::new(byte_rx)))
}

/// Live pass-through Responses stream. Returns the response together with
/// the conversation id in effect when the stream started.
pub async fn responses_live_stream(
    mut ctx: LiveStreamContext,
    extras: ResponseExtras,
    response_storage: SharedResponseStorage,
) -> GatewayResult<(Response, String)> {
    let mut attempt = 0usize;
    loop {
        let is_start = ctx.conversation_created;
        let (signal, running) = launch_turn(&ctx, is_start).await;
        match signal {
            FirstSignal::Finished(Ok(outcome)) => {
                let assistant = AssistantResponse::text(outcome.assistant_text);
                let conversation_id = outcome
                    .conversation_id
                    .unwrap_or_else(|| ctx.conversation_id.clone());
                ctx.conversation_storage
                    .set(&ctx.scoped_key, &conversation_id)
                    .await;
                let extras = ResponseExtras {
                    conversation_id: Some(conversation_id.clone()),
                    ..extras
                };
                let (response, response_id, body) =
                    responses_buffered_stream(&ctx.model, &assistant, &extras);
                response_storage
                    .set(&response_id, &body, Some(&conversation_id))
                    .await;
                return Ok((response, conversation_id));
            }
            FirstSignal::Finished(Err(err)) => {
                if attempt == 0 && empty_assistant_retry_applies(&ctx, &err) {
                    attempt += 1;
                    retry_with_fresh_conversation(&mut ctx).await?;
                    continue;
                }
                return Err(err);
            }
            FirstSignal::Committed(buffered) => {
                let (turn, update_rx) = running.expect("committed stream keeps its turn handle");
                let conversation_id = ctx.conversation_id.clone();
                return Ok((
                    pump_responses_stream(ctx, extras, response_storage, buffered, turn, update_rx),
                    conversation_id,
                ));
            }
        }
    }
}

fn pump_responses_stream(
    ctx: LiveStreamContext,
    extras: ResponseExtras,
    response_storage: SharedResponseStorage,
    buffered: Vec<StreamUpdate>,
    turn: TurnHandle,
    mut update_rx: mpsc::UnboundedReceiver<StreamUpdate>,
) -> Response {
    let (byte_tx, byte_rx) = mpsc::unbounded_channel::<Result<Bytes, io::Error>>();
    let mut sequencer =
        ResponsesEventSequencer::new(emitter::generate_response_id(), ctx.model.clone());

    tokio::spawn(async move {
        let mut tracker = DeltaTracker::new();
        let mut upstream_conversation: Option<String> = None;
        let mut connected = true;

        for frame in sequencer.begin(&extras) {
            forward(&byte_tx, frame, &mut connected);
        }
        let placeholder = sequencer.add_message_placeholder();
        forward(&byte_tx, placeholder, &mut connected);

        let mut pending_updates = buffered;
        loop {
            for update in pending_updates.drain(..) {
                if let Some(id) = &update.conversation_id {
                    upstream_conversation = Some(id.clone());
                }
                if let Some(delta) = tracker.apply(&update) {
                    let frame = sequencer.text_delta(&delta);
                    forward(&byte_tx, frame, &mut connected);
                }
            }
            if !connected {
                break;
            }
            match update_rx.recv().await {
                Some(update) => pending_updates.push(update),
                None => break,
            }
        }

        if !connected {
            turn.abort();
            return;
        }

        match flatten_turn(turn.await) {
            Ok(outcome) => {
                if let Some(trail) = tracker.trailing(&outcome.assistant_text) {
                    let frame = sequencer.text_delta(&trail);
                    forward(&byte_tx, frame, &mut connected);
                }
                let conversation_id = outcome
                    .conversation_id
                    .or(upstream_conversation)
                    .unwrap_or_else(|| ctx.conversation_id.clone());
                ctx.conversation_storage
                    .set(&ctx.scoped_key, &conversation_id)
                    .await;

                let extras = ResponseExtras {
                    conversation_id: Some(conversation_id.clone()),
                    ..extras
                };
                let final_text = tracker.emitted().to_string();
                let (frames, body) = sequencer.finish_text(&final_text, &extras);
                for frame in frames {
                    forward(&byte_tx, frame, &mut connected);
                }
                // Stored at stream completion, mirroring the buffered path.
                response_storage
                    .set(&sequencer.response_id, &body, Some(&conversation_id))
                    .await;
            }
            Err(err) => {
                forward(&byte_tx, format_sse_error(&err), &mut connected);
                forward(&byte_tx, format_sse_done(), &mut connected);
            }
        }
    });

    sse_response(Body::from_stream(UnboundedReceiverStream::new(byte_rx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_tracker_snapshot_sequence() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.on_snapshot("Hel").as_deref(), Some("Hel"));
        assert_eq!(tracker.on_snapshot("Hello").as_deref(), Some("lo"));
        // identical snapshot: nothing new
        assert_eq!(tracker.on_snapshot("Hello"), None);
        // non-extending snapshot is skipped, nothing retracted
        assert_eq!(tracker.on_snapshot("Goodbye"), None);
        assert_eq!(tracker.emitted(), "Hello");
    }

    #[test]
    fn test_delta_tracker_prefix_chain_concatenates_to_final() {
        let snapshots = ["S", "Sn", "Snap", "Snapshot"];
        let mut tracker = DeltaTracker::new();
        let mut collected = String::new();
        for snapshot in snapshots {
            if let Some(delta) = tracker.on_snapshot(snapshot) {
                collected.push_str(&delta);
            }
        }
        assert_eq!(collected, "Snapshot");
    }

    #[test]
    fn test_delta_tracker_trailing_rule() {
        let mut tracker = DeltaTracker::new();
        tracker.on_delta("Hel");
        assert_eq!(tracker.trailing("Hello").as_deref(), Some("lo"));
        assert_eq!(tracker.trailing("Hello"), None);
    }

    #[test]
    fn test_sse_framing() {
        let frame = format_sse_event(Some("response.created"), &json!({"a": 1}));
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.starts_with("event: response.created\ndata: {"));
        assert!(text.ends_with("\n\n"));
        assert_eq!(format_sse_done(), Bytes::from("data: [DONE]\n\n"));
    }

    #[test]
    fn test_sequencer_text_sequence_has_seven_events() {
        let extras = ResponseExtras {
            input_echo: json!("hi"),
            instructions: None,
            previous_response_id: None,
            conversation_id: None,
        };
        let mut sequencer = ResponsesEventSequencer::new("resp_1".to_string(), "m".to_string());
        let mut frames = sequencer.begin(&extras);
        frames.push(sequencer.add_message_placeholder());
        frames.push(sequencer.text_delta("Hello."));
        let (tail, body) = sequencer.finish_text("Hello.", &extras);
        frames.extend(tail);

        let rendered: Vec<String> = frames
            .iter()
            .map(|f| String::from_utf8(f.to_vec()).unwrap())
            .collect();
        assert_eq!(rendered.len(), 7);
        let expected = [
            "response.created",
            "response.in_progress",
            "response.output_item.added",
            "response.output_text.delta",
            "response.output_text.done",
            "response.output_item.done",
            "response.completed",
        ];
        for (frame, name) in rendered.iter().zip(expected) {
            assert!(frame.starts_with(&format!("event: {}", name)), "{}", frame);
        }
        // Envelope-bearing events name the same response id throughout.
        assert!(rendered[0].contains("resp_1"));
        assert!(rendered[1].contains("resp_1"));
        assert!(rendered[6].contains("resp_1"));
        assert_eq!(body["output_text"], "Hello.");
        assert_eq!(body["status"], "completed");
    }

    #[test]
    fn test_sequencer_function_call_sequence_skips_text_events() {
        use crate::protocols::chat::{FunctionCallOut, ToolCallOut};
        let extras = ResponseExtras {
            input_echo: json!("call it"),
            instructions: None,
            previous_response_id: None,
            conversation_id: None,
        };
        let assistant = AssistantResponse::tool_calls(vec![ToolCallOut {
            id: "call_1".to_string(),
            tool_type: "function".to_string(),
            function: FunctionCallOut {
                name: "get_time".to_string(),
                arguments: "{}".to_string(),
            },
        }]);
        let mut sequencer = ResponsesEventSequencer::new("resp_2".to_string(), "m".to_string());
        let mut frames = sequencer.begin(&extras);
        let (tail, body) = sequencer.finish_function_calls(&assistant, &extras);
        frames.extend(tail);

        let rendered: Vec<String> = frames
            .iter()
            .map(|f| String::from_utf8(f.to_vec()).unwrap())
            .collect();
        assert!(rendered.iter().all(|f| !f.contains("output_text.delta")));
        assert!(rendered.iter().any(|f| f.starts_with("event: response.output_item.added")));
        assert_eq!(body["output"][0]["type"], "function_call");
    }

    #[test]
    fn test_chat_buffered_stream_is_valid_sse() {
        let assistant = AssistantResponse::text("Hello.".into());
        let response = chat_buffered_stream("m", &assistant);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
    }
}
