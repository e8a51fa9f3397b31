// Chat Completions API wire types.
//
// Message content and tool declarations are kept as `serde_json::Value`
// leaves: clients send a wide variety of shapes here and canonicalization
// walks the trees instead of rejecting unknown layouts at decode time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============= Request =============

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Transport override accepted without the `m365_` prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(flatten)]
    pub m365: M365Extensions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

fn default_role() -> String {
    "user".to_string()
}

/// Request body extensions, `m365_`-prefixed so they never collide with
/// OpenAI fields. All optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct M365Extensions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_transport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_conversation_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_new_conversation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_time_zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_country_or_region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_location_hint: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_contextual_resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_additional_context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m365_system_prompt: Option<String>,
}

// ============= Response =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String, // "chat.completion"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String, // "stop" | "tool_calls"
}

/// Assistant message in a completion body. `content` serializes as an
/// explicit `null` when tool calls are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String, // "assistant"
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallOut>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallOut {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String, // "function"
    pub function: FunctionCallOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCallOut {
    pub name: String,
    pub arguments: String, // always a valid JSON string
}

// ============= Streaming =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String, // "chat.completion.chunk"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChatMessageDelta,
    pub finish_reason: Option<String>,
}

/// Delta payload holding only the fields set for this chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_accepts_string_and_part_content() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m365-copilot",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": [{"type": "text", "text": "hi"}]}
            ]
        }))
        .unwrap();
        assert_eq!(req.messages.len(), 2);
        assert!(!req.stream);
        assert!(req.m365.m365_transport.is_none());
    }

    #[test]
    fn test_m365_extensions_are_flattened() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "m365_transport": "substrate",
            "m365_conversation_id": "conv-9",
            "m365_new_conversation": true
        }))
        .unwrap();
        assert_eq!(req.m365.m365_transport.as_deref(), Some("substrate"));
        assert_eq!(req.m365.m365_conversation_id.as_deref(), Some("conv-9"));
        assert_eq!(req.m365.m365_new_conversation, Some(true));
    }

    #[test]
    fn test_assistant_message_serializes_null_content() {
        let message = AssistantMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![ToolCallOut {
                id: "call_1".to_string(),
                tool_type: "function".to_string(),
                function: FunctionCallOut {
                    name: "get_time".to_string(),
                    arguments: "{}".to_string(),
                },
            }]),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("content").unwrap().is_null());
    }

    #[test]
    fn test_delta_omits_unset_fields() {
        let delta = ChatMessageDelta {
            role: Some("assistant".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(value, json!({"role": "assistant"}));
    }
}
