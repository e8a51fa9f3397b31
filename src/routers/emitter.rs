//! OpenAI-shaped body construction: chat completion objects and chunks,
//! Responses bodies and output items.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::protocols::chat::{
    AssistantMessage, ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatMessageDelta,
    ChunkChoice, FunctionCallDelta, ToolCallDelta, ToolCallOut,
};
use crate::tool_parser::AssistantResponse;

pub fn generate_chat_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

pub fn generate_response_id() -> String {
    format!("resp_{}", Uuid::new_v4().simple())
}

fn generate_item_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// ============= Chat Completions =============

pub fn chat_completion_body(
    model: &str,
    assistant: &AssistantResponse,
    conversation_id: Option<&str>,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: generate_chat_id(),
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: assistant.content.clone(),
                tool_calls: if assistant.tool_calls.is_empty() {
                    None
                } else {
                    Some(assistant.tool_calls.clone())
                },
            },
            finish_reason: assistant.finish_reason.as_str().to_string(),
        }],
        conversation_id: conversation_id.map(String::from),
    }
}

fn chunk(id: &str, created: u64, model: &str, delta: ChatMessageDelta, finish: Option<&str>) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish.map(String::from),
        }],
    }
}

pub fn role_chunk(id: &str, created: u64, model: &str) -> ChatCompletionChunk {
    chunk(
        id,
        created,
        model,
        ChatMessageDelta {
            role: Some("assistant".to_string()),
            ..Default::default()
        },
        None,
    )
}

pub fn content_chunk(id: &str, created: u64, model: &str, text: &str) -> ChatCompletionChunk {
    chunk(
        id,
        created,
        model,
        ChatMessageDelta {
            content: Some(text.to_string()),
            ..Default::default()
        },
        None,
    )
}

pub fn tool_calls_chunk(
    id: &str,
    created: u64,
    model: &str,
    calls: &[ToolCallOut],
) -> ChatCompletionChunk {
    let deltas = calls
        .iter()
        .enumerate()
        .map(|(index, call)| ToolCallDelta {
            index: index as u32,
            id: Some(call.id.clone()),
            tool_type: Some(call.tool_type.clone()),
            function: Some(FunctionCallDelta {
                name: Some(call.function.name.clone()),
                arguments: Some(call.function.arguments.clone()),
            }),
        })
        .collect();
    chunk(
        id,
        created,
        model,
        ChatMessageDelta {
            tool_calls: Some(deltas),
            ..Default::default()
        },
        None,
    )
}

pub fn finish_chunk(id: &str, created: u64, model: &str, finish_reason: &str) -> ChatCompletionChunk {
    chunk(id, created, model, ChatMessageDelta::default(), Some(finish_reason))
}

// ============= Responses API =============

/// Output items for a completed assistant turn: one message item, or one
/// function_call item per extracted call.
pub fn response_output_items(assistant: &AssistantResponse) -> Vec<Value> {
    if assistant.tool_calls.is_empty() {
        let text = assistant.content.clone().unwrap_or_default();
        vec![json!({
            "type": "message",
            "id": generate_item_id("msg"),
            "status": "completed",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text, "annotations": []}],
        })]
    } else {
        assistant
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "type": "function_call",
                    "id": generate_item_id("fc"),
                    "call_id": call.id,
                    "name": call.function.name,
                    "arguments": call.function.arguments,
                    "status": "completed",
                })
            })
            .collect()
    }
}

/// Concatenation of every output_text in the output items.
pub fn output_text_of(items: &[Value]) -> String {
    let mut text = String::new();
    for item in items {
        if item.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        if let Some(parts) = item.get("content").and_then(|c| c.as_array()) {
            for part in parts {
                if part.get("type").and_then(|v| v.as_str()) == Some("output_text") {
                    if let Some(part_text) = part.get("text").and_then(|v| v.as_str()) {
                        text.push_str(part_text);
                    }
                }
            }
        }
    }
    text
}

pub struct ResponseBodyParts<'a> {
    pub response_id: &'a str,
    pub created_at: u64,
    pub model: &'a str,
    pub status: &'a str,
    pub output: Vec<Value>,
    pub input_echo: &'a Value,
    pub instructions: Option<&'a str>,
    pub previous_response_id: Option<&'a str>,
    pub conversation_id: Option<&'a str>,
}

/// Build a Responses-API body. The original input items are echoed
/// verbatim; `output_text` is the usual convenience concatenation.
pub fn response_body(parts: ResponseBodyParts<'_>) -> Value {
    let output_text = output_text_of(&parts.output);
    let mut body = json!({
        "id": parts.response_id,
        "object": "response",
        "created_at": parts.created_at,
        "status": parts.status,
        "model": parts.model,
        "output": parts.output,
        "output_text": output_text,
        "input": parts.input_echo,
        "instructions": parts.instructions,
        "previous_response_id": parts.previous_response_id,
        "error": Value::Null,
    });
    if let Some(conversation_id) = parts.conversation_id {
        body["conversation_id"] = json!(conversation_id);
    }
    body
}

/// Minimal single-model listing backed by the configured default.
pub fn models_body(default_model: &str) -> Value {
    json!({
        "object": "list",
        "data": [{
            "id": default_model,
            "object": "model",
            "created": now_unix(),
            "owned_by": "m365-copilot-gateway",
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::chat::FunctionCallOut;

    fn tool_call() -> ToolCallOut {
        ToolCallOut {
            id: "call_1".to_string(),
            tool_type: "function".to_string(),
            function: FunctionCallOut {
                name: "get_time".to_string(),
                arguments: "{\"zone\":\"UTC\"}".to_string(),
            },
        }
    }

    #[test]
    fn test_chat_body_for_text() {
        let body = chat_completion_body("m", &AssistantResponse::text("Hello.".into()), None);
        assert!(body.id.starts_with("chatcmpl-"));
        assert_eq!(body.object, "chat.completion");
        assert_eq!(body.choices[0].finish_reason, "stop");
        assert_eq!(body.choices[0].message.content.as_deref(), Some("Hello."));
        assert!(body.conversation_id.is_none());
    }

    #[test]
    fn test_chat_body_for_tool_calls_nulls_content() {
        let body = chat_completion_body(
            "m",
            &AssistantResponse::tool_calls(vec![tool_call()]),
            Some("conv-1"),
        );
        assert_eq!(body.choices[0].finish_reason, "tool_calls");
        assert!(body.choices[0].message.content.is_none());
        let rendered = serde_json::to_value(&body).unwrap();
        assert!(rendered["choices"][0]["message"]["content"].is_null());
        assert_eq!(rendered["conversation_id"], "conv-1");
    }

    #[test]
    fn test_tool_calls_chunk_indexes_calls() {
        let mut second = tool_call();
        second.id = "call_2".to_string();
        let chunk = tool_calls_chunk("id", 1, "m", &[tool_call(), second]);
        let deltas = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(deltas[0].index, 0);
        assert_eq!(deltas[1].index, 1);
        assert_eq!(
            deltas[0].function.as_ref().unwrap().arguments.as_deref(),
            Some("{\"zone\":\"UTC\"}")
        );
    }

    #[test]
    fn test_response_output_items_message() {
        let items = response_output_items(&AssistantResponse::text("Hello.".into()));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["type"], "message");
        assert_eq!(items[0]["content"][0]["text"], "Hello.");
        assert_eq!(output_text_of(&items), "Hello.");
    }

    #[test]
    fn test_response_output_items_function_call() {
        let items = response_output_items(&AssistantResponse::tool_calls(vec![tool_call()]));
        assert_eq!(items[0]["type"], "function_call");
        assert_eq!(items[0]["call_id"], "call_1");
        assert_eq!(items[0]["name"], "get_time");
        assert_eq!(output_text_of(&items), "");
    }

    #[test]
    fn test_response_body_shape() {
        let input = json!("Say hello");
        let body = response_body(ResponseBodyParts {
            response_id: "resp_1",
            created_at: 7,
            model: "m",
            status: "completed",
            output: response_output_items(&AssistantResponse::text("Hello.".into())),
            input_echo: &input,
            instructions: None,
            previous_response_id: None,
            conversation_id: Some("conv_x"),
        });
        assert_eq!(body["object"], "response");
        assert_eq!(body["output"][0]["type"], "message");
        assert_eq!(body["output_text"], "Hello.");
        assert_eq!(body["input"], "Say hello");
        assert_eq!(body["conversation_id"], "conv_x");
        assert!(body["error"].is_null());
    }
}
