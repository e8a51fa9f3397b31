//! Pipeline orchestrator: authorize, parse, resolve transport and
//! conversation, execute the turn with its retry policies, and emit the
//! OpenAI-shaped response.

use std::sync::Arc;

use axum::{
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use tracing::{info, warn};

use crate::app_context::AppContext;
use crate::core::{GatewayError, GatewayResult};
use crate::data_connector::{clamp_list_limit, scoped_conversation_key};
use crate::protocols::canonical::{CanonicalRequest, CanonicalResponses};
use crate::protocols::chat::{ChatCompletionRequest, M365Extensions};
use crate::protocols::responses::ResponsesRequest;
use crate::tool_parser::{build_assistant_response, AssistantResponse};
use crate::transports::{SharedChatTransport, TransportKind, TurnOutcome};

use super::emitter;
use super::streaming::{
    chat_buffered_stream, chat_live_stream, responses_buffered_stream, responses_live_stream,
    LiveStreamContext, ResponseExtras,
};

const TRANSPORT_HEADER: &str = "x-m365-transport";
const CONVERSATION_ID_HEADER: &str = "x-m365-conversation-id";
const CONVERSATION_KEY_HEADER: &str = "x-m365-conversation-key";
const NEW_CONVERSATION_HEADER: &str = "x-m365-new-conversation";
const CONVERSATION_CREATED_HEADER: &str = "x-m365-conversation-created";

/// Resolved conversation state for one request.
#[derive(Debug, Clone)]
struct ConversationHandle {
    id: String,
    created: bool,
    scoped_key: String,
}

pub struct OpenAIRouter {
    ctx: Arc<AppContext>,
}

impl OpenAIRouter {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    // ========================================================================
    // Chat Completions
    // ========================================================================

    pub async fn route_chat(&self, headers: &HeaderMap, body: Bytes) -> Response {
        match self.handle_chat(headers, body).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn handle_chat(&self, headers: &HeaderMap, body: Bytes) -> GatewayResult<Response> {
        let auth = self
            .ctx
            .token_provider
            .resolve_authorization(headers)
            .await
            .ok_or_else(GatewayError::missing_authorization)?;

        let wire: ChatCompletionRequest =
            serde_json::from_slice(&body).map_err(GatewayError::invalid_json)?;
        let canonical = CanonicalRequest::from_chat(&wire, &self.ctx.config)?;

        let transport_kind = self.resolve_transport(
            headers,
            wire.m365.m365_transport.as_deref(),
            wire.transport.as_deref(),
        )?;
        let transport = self.ctx.transport(transport_kind);

        let conversation = self
            .resolve_conversation(transport_kind, &transport, headers, &wire.m365, &canonical, &auth, None)
            .await?;

        let must_buffer =
            !canonical.tooling.tools.is_empty() || canonical.response_format.is_some();

        if canonical.stream && !must_buffer {
            let live = LiveStreamContext {
                transport,
                auth,
                canonical: canonical.clone(),
                conversation_id: conversation.id.clone(),
                conversation_created: conversation.created,
                scoped_key: conversation.scoped_key.clone(),
                conversation_storage: self.ctx.conversation_storage.clone(),
                model: canonical.model.clone(),
            };
            let (response, conversation_id) = chat_live_stream(live).await?;
            return Ok(apply_m365_headers(
                response,
                transport_kind,
                &conversation_id,
                conversation.created,
            ));
        }

        let (assistant, conversation) = self
            .execute_buffered(transport_kind, &transport, &auth, conversation, &canonical)
            .await?;
        if let Some(message) = &assistant.strict_tool_error {
            return Err(GatewayError::invalid_tool_output(message.clone()));
        }

        let response = if canonical.stream {
            chat_buffered_stream(&canonical.model, &assistant)
        } else {
            let include_conversation = self.ctx.config.include_conversation_id_in_response_body;
            let body = emitter::chat_completion_body(
                &canonical.model,
                &assistant,
                include_conversation.then_some(conversation.id.as_str()),
            );
            Json(body).into_response()
        };
        Ok(apply_m365_headers(
            response,
            transport_kind,
            &conversation.id,
            conversation.created,
        ))
    }

    // ========================================================================
    // Responses API
    // ========================================================================

    pub async fn route_responses(&self, headers: &HeaderMap, body: Bytes) -> Response {
        match self.handle_responses(headers, body).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn handle_responses(&self, headers: &HeaderMap, body: Bytes) -> GatewayResult<Response> {
        let auth = self
            .ctx
            .token_provider
            .resolve_authorization(headers)
            .await
            .ok_or_else(GatewayError::missing_authorization)?;

        let wire: ResponsesRequest =
            serde_json::from_slice(&body).map_err(GatewayError::invalid_json)?;
        let CanonicalResponses {
            request: canonical,
            previous_response_id,
            instructions,
            input_echo,
        } = CanonicalRequest::from_responses(&wire, &self.ctx.config)?;

        let transport_kind = self.resolve_transport(
            headers,
            wire.m365.m365_transport.as_deref(),
            wire.transport.as_deref(),
        )?;
        let transport = self.ctx.transport(transport_kind);

        // A previous_response_id must resolve through the link table; an
        // unknown id is a client error, not a silent new conversation.
        let previous_link = match &previous_response_id {
            Some(id) => Some(
                self.ctx
                    .response_storage
                    .get_conversation_link(id)
                    .await
                    .ok_or_else(|| GatewayError::invalid_previous_response_id(id))?,
            ),
            None => None,
        };

        let conversation = self
            .resolve_conversation(
                transport_kind,
                &transport,
                headers,
                &wire.m365,
                &canonical,
                &auth,
                previous_link,
            )
            .await?;

        let extras = ResponseExtras {
            input_echo,
            instructions,
            previous_response_id,
            conversation_id: None,
        };

        let must_buffer =
            !canonical.tooling.tools.is_empty() || canonical.response_format.is_some();

        if canonical.stream && !must_buffer {
            let live = LiveStreamContext {
                transport,
                auth,
                canonical: canonical.clone(),
                conversation_id: conversation.id.clone(),
                conversation_created: conversation.created,
                scoped_key: conversation.scoped_key.clone(),
                conversation_storage: self.ctx.conversation_storage.clone(),
                model: canonical.model.clone(),
            };
            let (response, conversation_id) =
                responses_live_stream(live, extras, self.ctx.response_storage.clone()).await?;
            return Ok(apply_m365_headers(
                response,
                transport_kind,
                &conversation_id,
                conversation.created,
            ));
        }

        let (assistant, conversation) = self
            .execute_buffered(transport_kind, &transport, &auth, conversation, &canonical)
            .await?;
        if let Some(message) = &assistant.strict_tool_error {
            return Err(GatewayError::invalid_tool_output(message.clone()));
        }

        let extras = ResponseExtras {
            conversation_id: Some(conversation.id.clone()),
            ..extras
        };

        let response = if canonical.stream {
            let (response, response_id, final_body) =
                responses_buffered_stream(&canonical.model, &assistant, &extras);
            self.ctx
                .response_storage
                .set(&response_id, &final_body, Some(&conversation.id))
                .await;
            response
        } else {
            let response_id = emitter::generate_response_id();
            let output = emitter::response_output_items(&assistant);
            let body = emitter::response_body(emitter::ResponseBodyParts {
                response_id: &response_id,
                created_at: emitter::now_unix(),
                model: &canonical.model,
                status: "completed",
                output,
                input_echo: &extras.input_echo,
                instructions: extras.instructions.as_deref(),
                previous_response_id: extras.previous_response_id.as_deref(),
                conversation_id: extras.conversation_id.as_deref(),
            });
            self.ctx
                .response_storage
                .set(&response_id, &body, Some(&conversation.id))
                .await;
            Json(body).into_response()
        };
        Ok(apply_m365_headers(
            response,
            transport_kind,
            &conversation.id,
            conversation.created,
        ))
    }

    // ========================================================================
    // Stored responses
    // ========================================================================

    pub async fn get_response(&self, response_id: &str) -> Response {
        if response_id.is_empty() {
            return GatewayError::missing_response_id().into_response();
        }
        match self.ctx.response_storage.get(response_id).await {
            Some(body) => Json(body).into_response(),
            None => GatewayError::response_not_found(response_id).into_response(),
        }
    }

    pub async fn delete_response(&self, response_id: &str) -> Response {
        if response_id.is_empty() {
            return GatewayError::missing_response_id().into_response();
        }
        if self.ctx.response_storage.delete(response_id).await {
            Json(serde_json::json!({
                "id": response_id,
                "object": "response",
                "deleted": true,
            }))
            .into_response()
        } else {
            GatewayError::response_not_found(response_id).into_response()
        }
    }

    pub async fn list_responses(&self, raw_limit: Option<&str>) -> Response {
        let limit = clamp_list_limit(raw_limit);
        let list = self.ctx.response_storage.list(limit).await;
        Json(serde_json::json!({
            "object": "list",
            "data": list.data,
            "has_more": list.has_more,
            "first_id": list.first_id,
            "last_id": list.last_id,
        }))
        .into_response()
    }

    pub fn models(&self) -> Response {
        Json(emitter::models_body(&self.ctx.config.default_model)).into_response()
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    fn resolve_transport(
        &self,
        headers: &HeaderMap,
        body_m365: Option<&str>,
        body_plain: Option<&str>,
    ) -> GatewayResult<TransportKind> {
        let value = header_value(headers, TRANSPORT_HEADER)
            .or_else(|| body_m365.map(String::from))
            .or_else(|| body_plain.map(String::from))
            .unwrap_or_else(|| self.ctx.config.transport.clone());
        TransportKind::parse(&value).ok_or_else(|| GatewayError::invalid_transport(&value))
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_conversation(
        &self,
        kind: TransportKind,
        transport: &SharedChatTransport,
        headers: &HeaderMap,
        m365: &M365Extensions,
        canonical: &CanonicalRequest,
        auth: &str,
        previous_link: Option<String>,
    ) -> GatewayResult<ConversationHandle> {
        let key = header_value(headers, CONVERSATION_KEY_HEADER)
            .or_else(|| m365.m365_conversation_key.clone())
            .unwrap_or_else(|| canonical.user_key.clone());
        let scoped_key = scoped_conversation_key(kind.as_str(), &key);

        let force_new = header_value(headers, NEW_CONVERSATION_HEADER)
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(false)
            || m365.m365_new_conversation == Some(true);

        // An explicitly supplied conversation id must not be blank.
        let explicit = explicit_conversation_id(headers, m365)?;

        if !force_new {
            // Explicit id from header or body wins.
            if let Some(id) = explicit {
                self.ctx.conversation_storage.set(&scoped_key, &id).await;
                return Ok(ConversationHandle {
                    id,
                    created: false,
                    scoped_key,
                });
            }
            // previous_response_id continuation.
            if let Some(id) = previous_link {
                self.ctx.conversation_storage.set(&scoped_key, &id).await;
                return Ok(ConversationHandle {
                    id,
                    created: false,
                    scoped_key,
                });
            }
            // Cached conversation; every use refreshes the TTL.
            if let Some(id) = self.ctx.conversation_storage.get(&scoped_key).await {
                self.ctx.conversation_storage.set(&scoped_key, &id).await;
                return Ok(ConversationHandle {
                    id,
                    created: false,
                    scoped_key,
                });
            }
        }

        let id = transport.create_conversation(auth).await?;
        info!(transport = kind.as_str(), conversation_id = %id, "created conversation");
        self.ctx.conversation_storage.set(&scoped_key, &id).await;
        Ok(ConversationHandle {
            id,
            created: true,
            scoped_key,
        })
    }

    /// Execute one buffered turn, applying both retry policies: the
    /// Substrate empty-assistant retry (fresh conversation) and the strict
    /// tool-output retry (same conversation, Substrate only). Each runs at
    /// most once.
    async fn execute_buffered(
        &self,
        kind: TransportKind,
        transport: &SharedChatTransport,
        auth: &str,
        mut conversation: ConversationHandle,
        canonical: &CanonicalRequest,
    ) -> GatewayResult<(AssistantResponse, ConversationHandle)> {
        let outcome = match transport
            .chat_turn(auth, &conversation.id, canonical, conversation.created, None)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                let retry_applies = kind == TransportKind::Substrate
                    && conversation.created
                    && err
                        .message
                        .contains("substrate chat returned no assistant content");
                if !retry_applies {
                    return Err(err);
                }
                warn!(
                    conversation_id = %conversation.id,
                    "substrate returned no assistant content on a new conversation, retrying once"
                );
                let fresh = transport.create_conversation(auth).await?;
                self.ctx
                    .conversation_storage
                    .set(&conversation.scoped_key, &fresh)
                    .await;
                conversation.id = fresh;
                transport
                    .chat_turn(auth, &conversation.id, canonical, true, None)
                    .await?
            }
        };
        self.adopt_upstream_conversation(&mut conversation, &outcome)
            .await;

        let mut assistant = build_assistant_response(canonical, &outcome.assistant_text);

        if assistant.strict_tool_error.is_some() && kind == TransportKind::Substrate {
            warn!(
                conversation_id = %conversation.id,
                "strict tool output violated, retrying the turn once"
            );
            let retry = transport
                .chat_turn(auth, &conversation.id, canonical, false, None)
                .await?;
            self.adopt_upstream_conversation(&mut conversation, &retry)
                .await;
            assistant = build_assistant_response(canonical, &retry.assistant_text);
        }

        Ok((assistant, conversation))
    }

    async fn adopt_upstream_conversation(
        &self,
        conversation: &mut ConversationHandle,
        outcome: &TurnOutcome,
    ) {
        if let Some(id) = &outcome.conversation_id {
            conversation.id = id.clone();
            self.ctx
                .conversation_storage
                .set(&conversation.scoped_key, id)
                .await;
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
}

/// The explicit conversation id from the header or body, when present.
/// Supplying the field with a blank value is a client error rather than a
/// silent fall-through to conversation creation.
fn explicit_conversation_id(
    headers: &HeaderMap,
    m365: &M365Extensions,
) -> GatewayResult<Option<String>> {
    if let Some(value) = headers.get(CONVERSATION_ID_HEADER) {
        let id = value.to_str().ok().map(str::trim).unwrap_or_default();
        if id.is_empty() {
            return Err(GatewayError::conversation_id_missing());
        }
        return Ok(Some(id.to_string()));
    }
    if let Some(id) = m365.m365_conversation_id.as_deref() {
        let id = id.trim();
        if id.is_empty() {
            return Err(GatewayError::conversation_id_missing());
        }
        return Ok(Some(id.to_string()));
    }
    Ok(None)
}

fn apply_m365_headers(
    mut response: Response,
    kind: TransportKind,
    conversation_id: &str,
    created: bool,
) -> Response {
    let headers = response.headers_mut();
    headers.insert(TRANSPORT_HEADER, HeaderValue::from_static(kind.as_str()));
    if let Ok(value) = HeaderValue::from_str(conversation_id) {
        headers.insert(CONVERSATION_ID_HEADER, value);
    }
    if created {
        headers.insert(CONVERSATION_CREATED_HEADER, HeaderValue::from_static("true"));
    }
    response
}
