// Responses API wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::chat::M365Extensions;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponsesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    /// String or array of input items; preserved verbatim for echoing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// `text.format` maps onto the chat `response_format`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
    /// `reasoning.effort` maps onto the chat `reasoning_effort`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(flatten)]
    pub m365: M365Extensions,
}

/// Query parameters for `GET /v1/responses`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesListQuery {
    /// Raw string so unparseable values clamp to the default instead of 400
    pub limit: Option<String>,
}
