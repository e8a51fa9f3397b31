//! Tool-call extraction and the strict-mode policy.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::protocols::canonical::{CanonicalRequest, ResponseFormatSpec, ToolChoiceMode, Tooling};
use crate::protocols::chat::{FunctionCallOut, ToolCallOut};

use super::candidates::enumerate_candidates;
use super::types::AssistantResponse;

/// Interpret raw assistant text against the parsed request: salvage tool
/// calls when the request declared tools, enforce strict tool-choice modes,
/// and normalize content under an active response format.
pub fn build_assistant_response(request: &CanonicalRequest, assistant_text: &str) -> AssistantResponse {
    if request.tooling.wants_tool_calls() {
        for candidate in enumerate_candidates(assistant_text) {
            let Ok(value) = serde_json::from_str::<Value>(&candidate) else {
                continue;
            };
            let calls = probe_tool_calls(&value, &request.tooling);
            if !calls.is_empty() {
                return AssistantResponse::tool_calls(calls);
            }
        }

        if request.tooling.is_strict() {
            let message = match (&request.tooling.mode, &request.tooling.function_name) {
                (ToolChoiceMode::Function, Some(name)) => format!(
                    "the assistant did not produce a valid call to the required function '{}'",
                    name
                ),
                _ => "the assistant did not produce a valid tool call although tool_choice \
                      demands one"
                    .to_string(),
            };
            return AssistantResponse::strict_violation(message);
        }
    }

    if let Some(format) = &request.response_format {
        if let Some(value) = extract_format_value(assistant_text, format) {
            return AssistantResponse::text(value.to_string());
        }
    }

    AssistantResponse::text(assistant_text.to_string())
}

/// Re-extract a JSON node matching the requested response format. Returns
/// None when nothing type-compatible parses, in which case the raw text
/// passes through unchanged.
pub fn extract_format_value(text: &str, format: &ResponseFormatSpec) -> Option<Value> {
    for candidate in enumerate_candidates(text) {
        let Ok(value) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        let compatible = match format {
            ResponseFormatSpec::JsonObject => value.is_object(),
            ResponseFormatSpec::JsonSchema { .. } => value.is_object() || value.is_array(),
        };
        if compatible {
            return Some(value);
        }
    }
    None
}

/// Probe a parsed candidate for the known tool-call layouts, in order.
fn probe_tool_calls(value: &Value, tooling: &Tooling) -> Vec<ToolCallOut> {
    // Direct tool_calls array
    if let Some(calls) = collect_accepted(value.get("tool_calls"), tooling) {
        return calls;
    }
    // message.tool_calls
    if let Some(calls) = collect_accepted(
        value.get("message").and_then(|m| m.get("tool_calls")),
        tooling,
    ) {
        return calls;
    }
    // choices[*].message.tool_calls and choices[*].delta.tool_calls
    if let Some(choices) = value.get("choices").and_then(|c| c.as_array()) {
        for choice in choices {
            for holder in ["message", "delta"] {
                if let Some(calls) = collect_accepted(
                    choice.get(holder).and_then(|h| h.get("tool_calls")),
                    tooling,
                ) {
                    return calls;
                }
            }
        }
    }
    // Responses-style output[*] items of type function_call
    if let Some(output) = value.get("output").and_then(|o| o.as_array()) {
        let items: Vec<Value> = output
            .iter()
            .filter(|item| {
                item.get("type").and_then(|t| t.as_str()) == Some("function_call")
            })
            .cloned()
            .collect();
        if !items.is_empty() {
            if let Some(calls) = collect_accepted(Some(&Value::Array(items)), tooling) {
                return calls;
            }
        }
    }
    // Single-call shape {name, arguments}, optionally nested under `function`
    if let Some(call) = parse_call_node(value, tooling) {
        return vec![call];
    }

    Vec::new()
}

fn collect_accepted(node: Option<&Value>, tooling: &Tooling) -> Option<Vec<ToolCallOut>> {
    let calls: Vec<ToolCallOut> = node?
        .as_array()?
        .iter()
        .filter_map(|item| parse_call_node(item, tooling))
        .collect();
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// Parse one call node, applying the acceptance rules: a name must be
/// extractable, must match the forced function when one is set, and must
/// belong to the declared tool list.
fn parse_call_node(node: &Value, tooling: &Tooling) -> Option<ToolCallOut> {
    let function = node.get("function").unwrap_or(node);
    let name = function
        .get("name")
        .and_then(|v| v.as_str())
        .filter(|name| !name.is_empty())?;

    if tooling.mode == ToolChoiceMode::Function
        && tooling.function_name.as_deref() != Some(name)
    {
        return None;
    }
    if !tooling.has_tool(name) {
        return None;
    }

    let arguments_node = function
        .get("arguments")
        .or_else(|| function.get("parameters"));
    let id = node
        .get("id")
        .or_else(|| node.get("call_id"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));

    Some(ToolCallOut {
        id,
        tool_type: "function".to_string(),
        function: FunctionCallOut {
            name: name.to_string(),
            arguments: normalize_arguments(arguments_node),
        },
    })
}

/// Canonicalize an arguments node into a JSON string. Strings are parsed,
/// repaired if needed, and re-serialized; anything unrecoverable is wrapped
/// so the output is still valid JSON.
fn normalize_arguments(node: Option<&Value>) -> String {
    let Some(node) = node else {
        return "{}".to_string();
    };
    match node {
        Value::String(raw) => {
            if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                return parsed.to_string();
            }
            let repaired = repair_control_characters(raw);
            if let Ok(parsed) = serde_json::from_str::<Value>(&repaired) {
                return parsed.to_string();
            }
            json!({ "input": raw }).to_string()
        }
        other => other.to_string(),
    }
}

/// Escape raw newlines, carriage returns, and tabs occurring inside string
/// literals. Upstreams routinely emit multi-line argument values without
/// escaping them, which breaks a strict JSON parse.
fn repair_control_characters(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    let mut in_string = false;
    let mut escape = false;

    for ch in raw.chars() {
        if escape {
            out.push(ch);
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => {
                out.push(ch);
                escape = true;
            }
            '"' => {
                in_string = !in_string;
                out.push(ch);
            }
            '\n' if in_string => out.push_str("\\n"),
            '\r' if in_string => out.push_str("\\r"),
            '\t' if in_string => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}
