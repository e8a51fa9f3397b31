use crate::protocols::chat::ToolCallOut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
        }
    }
}

/// Structured assistant turn handed to the emitter.
///
/// Invariants: a non-empty `tool_calls` implies `content == None` and
/// `finish_reason == ToolCalls`; a set `strict_tool_error` implies both
/// `content` and `tool_calls` are empty.
#[derive(Debug, Clone)]
pub struct AssistantResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallOut>,
    pub finish_reason: FinishReason,
    pub strict_tool_error: Option<String>,
}

impl AssistantResponse {
    pub fn text(content: String) -> Self {
        Self {
            content: Some(content),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            strict_tool_error: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallOut>) -> Self {
        Self {
            content: None,
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
            strict_tool_error: None,
        }
    }

    pub fn strict_violation(message: String) -> Self {
        Self {
            content: None,
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            strict_tool_error: Some(message),
        }
    }
}
