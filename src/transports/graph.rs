//! Graph transport: plain HTTPS JSON for conversation creation and
//! buffered chat, SSE for the streamed variant.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::core::{GatewayError, GatewayResult};
use crate::protocols::canonical::CanonicalRequest;

use super::{ChatTransport, StreamUpdate, TransportKind, TurnOutcome};

pub struct GraphTransport {
    client: reqwest::Client,
    config: Arc<GatewayConfig>,
}

impl GraphTransport {
    pub fn new(client: reqwest::Client, config: Arc<GatewayConfig>) -> Self {
        Self { client, config }
    }

    fn chat_url(&self, template: &str, conversation_id: &str) -> String {
        let path = template.replace(
            "{conversationId}",
            urlencoding::encode(conversation_id).as_ref(),
        );
        format!("{}{}", self.config.graph_base_url.trim_end_matches('/'), path)
    }

    fn chat_payload(&self, request: &CanonicalRequest) -> Value {
        let mut location = json!({ "timeZone": request.location_hint.time_zone });
        if let Some(region) = &request.location_hint.country_or_region {
            location["countryOrRegion"] = json!(region);
        }
        let mut payload = json!({
            "message": { "text": request.prompt_with_context() },
            "locationInfo": location,
        });
        if let Some(resources) = &request.contextual_resources {
            payload["contextualResources"] = resources.clone();
        }
        payload
    }

    async fn error_from_response(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let message = match response.text().await {
            Ok(body) => extract_upstream_message(&body),
            Err(err) => format!("failed to read upstream error body: {}", err),
        };
        GatewayError::graph(Some(status), message)
    }
}

#[async_trait]
impl ChatTransport for GraphTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Graph
    }

    async fn create_conversation(&self, auth: &str) -> GatewayResult<String> {
        let url = format!(
            "{}{}",
            self.config.graph_base_url.trim_end_matches('/'),
            self.config.create_conversation_path
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", auth)
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| GatewayError::graph(None, format!("conversation create failed: {}", err)))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| GatewayError::graph(None, format!("conversation create returned invalid JSON: {}", err)))?;
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                GatewayError::graph(None, "conversation create response did not include an id")
            })?;
        debug!(conversation_id = id, "created graph conversation");
        Ok(id.to_string())
    }

    async fn chat_turn(
        &self,
        auth: &str,
        conversation_id: &str,
        request: &CanonicalRequest,
        _is_start_of_session: bool,
        updates: Option<mpsc::UnboundedSender<StreamUpdate>>,
    ) -> GatewayResult<TurnOutcome> {
        let payload = self.chat_payload(request);
        let sent_prompt = request.prompt_with_context();

        match updates {
            None => {
                let url = self.chat_url(&self.config.chat_path_template, conversation_id);
                let response = self
                    .client
                    .post(&url)
                    .header("Authorization", auth)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|err| GatewayError::graph(None, format!("graph chat failed: {}", err)))?;
                if !response.status().is_success() {
                    return Err(Self::error_from_response(response).await);
                }
                let body: Value = response.json().await.map_err(|err| {
                    GatewayError::graph(None, format!("graph chat returned invalid JSON: {}", err))
                })?;
                let text = extract_latest_assistant_text(&body, &sent_prompt).unwrap_or_default();
                Ok(TurnOutcome {
                    assistant_text: text,
                    conversation_id: None,
                })
            }
            Some(updates) => {
                let url =
                    self.chat_url(&self.config.chat_over_stream_path_template, conversation_id);
                let response = self
                    .client
                    .post(&url)
                    .header("Authorization", auth)
                    .header("Accept", "text/event-stream")
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|err| {
                        GatewayError::graph(None, format!("graph stream failed: {}", err))
                    })?;
                if !response.status().is_success() {
                    return Err(Self::error_from_response(response).await);
                }

                // Each SSE data payload is a cumulative snapshot of the
                // conversation; the transformer downstream turns snapshots
                // into deltas. Streaming uses the prompt-exclusion rule
                // without its fallback, so a snapshot holding only the echoed
                // prompt produces no delta.
                let mut upstream = response.bytes_stream();
                let mut pending = String::new();
                let mut latest_text = String::new();
                let mut last_snapshot: Option<Value> = None;
                while let Some(chunk) = upstream.next().await {
                    let chunk = chunk.map_err(|err| {
                        GatewayError::response_stream(format!("graph stream read failed: {}", err))
                    })?;
                    pending.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));

                    let mut done = false;
                    while let Some(pos) = pending.find("\n\n") {
                        let block = pending[..pos].to_string();
                        pending.drain(..pos + 2);
                        let Some(data) = sse_data_payload(&block) else {
                            continue;
                        };
                        if data == "[DONE]" {
                            done = true;
                            break;
                        }
                        let Ok(snapshot) = serde_json::from_str::<Value>(&data) else {
                            warn!("graph stream event was not valid JSON, skipping");
                            continue;
                        };
                        if let Some(text) =
                            extract_assistant_text_excluding_prompt(&snapshot, &sent_prompt)
                        {
                            latest_text = text.clone();
                            let _ = updates.send(StreamUpdate {
                                snapshot_text: Some(text),
                                ..Default::default()
                            });
                        }
                        last_snapshot = Some(snapshot);
                    }
                    if done {
                        break;
                    }
                }

                // The fallback applies only to the final buffered text.
                if latest_text.is_empty() {
                    if let Some(snapshot) = &last_snapshot {
                        latest_text = extract_latest_assistant_text(snapshot, &sent_prompt)
                            .unwrap_or_default();
                    }
                }

                Ok(TurnOutcome {
                    assistant_text: latest_text,
                    conversation_id: None,
                })
            }
        }
    }
}

/// Join the `data:` lines of one SSE block.
fn sse_data_payload(block: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            lines.push(rest.trim_start().to_string());
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Prompt-exclusion rule without the fallback: the last non-empty message
/// text that differs from the prompt we sent, or nothing.
pub fn extract_assistant_text_excluding_prompt(
    snapshot: &Value,
    sent_prompt: &str,
) -> Option<String> {
    collect_message_texts(snapshot)
        .into_iter()
        .rev()
        .find(|text| text.as_str() != sent_prompt)
}

/// Latest assistant text from a Graph conversation snapshot.
///
/// Messages whose text equals the prompt we sent are ignored; the last
/// other non-empty text wins. When everything matched the prompt, fall
/// back to the last non-empty text.
pub fn extract_latest_assistant_text(snapshot: &Value, sent_prompt: &str) -> Option<String> {
    let texts = collect_message_texts(snapshot);
    texts
        .iter()
        .rev()
        .find(|text| text.as_str() != sent_prompt)
        .or_else(|| texts.last())
        .cloned()
}

fn collect_message_texts(snapshot: &Value) -> Vec<String> {
    let mut texts = Vec::new();
    let messages = snapshot
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .or_else(|| snapshot.as_array().cloned());

    if let Some(messages) = messages {
        for message in &messages {
            if let Some(text) = message_text(message) {
                texts.push(text);
            }
        }
    } else if let Some(text) = snapshot
        .get("message")
        .and_then(message_text)
        .or_else(|| message_text(snapshot))
    {
        texts.push(text);
    }
    texts
}

fn message_text(message: &Value) -> Option<String> {
    for key in ["text", "content", "body"] {
        if let Some(text) = message.get(key).and_then(|v| v.as_str()) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn extract_upstream_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for path in [
            value.get("error").and_then(|e| e.get("message")),
            value.get("message"),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(message) = path.as_str() {
                return message.to_string();
            }
        }
    }
    if body.is_empty() {
        "upstream graph call failed".to_string()
    } else {
        body.chars().take(512).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_exclusion_prefers_last_other_text() {
        let snapshot = json!({
            "messages": [
                {"text": "User: hello"},
                {"text": "partial ans"},
                {"text": "partial answer full"}
            ]
        });
        assert_eq!(
            extract_latest_assistant_text(&snapshot, "User: hello").as_deref(),
            Some("partial answer full")
        );
    }

    #[test]
    fn test_prompt_only_snapshot_yields_no_streaming_delta() {
        let snapshot = json!({"messages": [{"text": "hello"}]});
        assert_eq!(
            extract_assistant_text_excluding_prompt(&snapshot, "hello"),
            None
        );
    }

    #[test]
    fn test_prompt_only_snapshot_falls_back_to_last_nonempty() {
        let snapshot = json!({"messages": [{"text": "hello"}]});
        assert_eq!(
            extract_latest_assistant_text(&snapshot, "hello").as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn test_empty_snapshot_yields_none() {
        assert_eq!(
            extract_latest_assistant_text(&json!({"messages": []}), "p"),
            None
        );
    }

    #[test]
    fn test_single_message_object() {
        let snapshot = json!({"message": {"text": "Hello."}});
        assert_eq!(
            extract_latest_assistant_text(&snapshot, "Hi").as_deref(),
            Some("Hello.")
        );
    }

    #[test]
    fn test_sse_data_payload_joins_lines() {
        assert_eq!(
            sse_data_payload("event: update\ndata: {\"a\":\ndata: 1}").as_deref(),
            Some("{\"a\":\n1}")
        );
        assert_eq!(sse_data_payload(": comment only"), None);
    }

    #[test]
    fn test_upstream_message_extraction() {
        assert_eq!(
            extract_upstream_message(r#"{"error":{"message":"denied"}}"#),
            "denied"
        );
        assert_eq!(extract_upstream_message("plain text"), "plain text");
        assert_eq!(extract_upstream_message(""), "upstream graph call failed");
    }
}
