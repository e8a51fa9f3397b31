//! Salvage-extraction coverage over the public library API: the shapes
//! upstreams actually emit, plus the argument repair paths.

use m365_gateway::config::GatewayConfig;
use m365_gateway::protocols::canonical::CanonicalRequest;
use m365_gateway::protocols::chat::ChatCompletionRequest;
use m365_gateway::tool_parser::{build_assistant_response, enumerate_candidates, FinishReason};
use serde_json::{json, Value};

fn canonical(tool_choice: Value) -> CanonicalRequest {
    let request: ChatCompletionRequest = serde_json::from_value(json!({
        "messages": [{"role": "user", "content": "use a tool"}],
        "tools": [
            {"type": "function", "function": {"name": "apply_patch",
             "parameters": {"type": "object", "properties": {"diff": {"type": "string"}}}}},
            {"type": "function", "function": {"name": "get_time"}}
        ],
        "tool_choice": tool_choice
    }))
    .unwrap();
    CanonicalRequest::from_chat(&request, &GatewayConfig::default()).unwrap()
}

#[test]
fn test_bare_json_tool_call() {
    let request = canonical(json!("auto"));
    let response = build_assistant_response(
        &request,
        r#"{"tool_calls":[{"name":"get_time","arguments":{}}]}"#,
    );
    assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    assert_eq!(response.tool_calls[0].function.name, "get_time");
    assert_eq!(response.tool_calls[0].function.arguments, "{}");
}

#[test]
fn test_tool_call_embedded_in_prose_and_fence() {
    let request = canonical(json!("auto"));
    let text = concat!(
        "Of course! I will check the time for you.\n\n",
        "```json\n",
        "{\"tool_calls\": [{\"name\": \"get_time\", \"arguments\": {\"zone\": \"CET\"}}]}\n",
        "```\n",
        "Let me know if you need anything else."
    );
    let response = build_assistant_response(&request, text);
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(
        response.tool_calls[0].function.arguments,
        "{\"zone\":\"CET\"}"
    );
    assert!(response.content.is_none());
}

#[test]
fn test_chat_completion_echo_shape() {
    let request = canonical(json!("auto"));
    let text = r#"{"choices":[{"delta":{"tool_calls":[{"id":"call_d","function":{"name":"get_time","arguments":"{}"}}]}}]}"#;
    let response = build_assistant_response(&request, text);
    assert_eq!(response.tool_calls[0].id, "call_d");
}

#[test]
fn test_arguments_with_raw_newlines_are_repaired() {
    let request = canonical(json!("auto"));
    let diff = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-old\n+new";
    // The arguments string itself is JSON whose string literal carries raw
    // newlines, the way upstream models emit multi-line arguments.
    let inner = format!("{{\"diff\": \"{}\"}}", diff);
    assert!(serde_json::from_str::<Value>(&inner).is_err());
    let text = json!({"name": "apply_patch", "arguments": inner}).to_string();
    let response = build_assistant_response(&request, &text);
    assert_eq!(response.tool_calls.len(), 1);
    let arguments: Value =
        serde_json::from_str(&response.tool_calls[0].function.arguments).unwrap();
    assert_eq!(arguments["diff"], diff);
}

#[test]
fn test_unsalvageable_arguments_wrap_as_input() {
    let request = canonical(json!("auto"));
    let response = build_assistant_response(
        &request,
        r#"{"name": "get_time", "arguments": "half past { nine"}"#,
    );
    let arguments: Value =
        serde_json::from_str(&response.tool_calls[0].function.arguments).unwrap();
    assert_eq!(arguments["input"], "half past { nine");
}

#[test]
fn test_first_candidate_with_accepted_call_wins() {
    let request = canonical(json!("auto"));
    // The leading balanced object names an undeclared tool; the later one
    // is valid and must win.
    let text = r#"I considered {"name":"unknown_tool","arguments":{}} but instead: {"name":"get_time","arguments":{}}"#;
    let response = build_assistant_response(&request, text);
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].function.name, "get_time");
}

#[test]
fn test_strict_required_mode_rejects_plain_text() {
    let request = canonical(json!("required"));
    let response = build_assistant_response(&request, "I would rather chat.");
    assert!(response.tool_calls.is_empty());
    assert!(response.content.is_none());
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert!(response.strict_tool_error.is_some());
}

#[test]
fn test_candidate_enumeration_order() {
    let text = "intro {\"a\":1} middle ```\n[2,3]\n``` outro";
    let candidates = enumerate_candidates(text);
    // whole text first, fenced body before bare balanced spans
    assert_eq!(candidates[0], text.trim());
    let fence_pos = candidates.iter().position(|c| c == "[2,3]").unwrap();
    let braces_pos = candidates.iter().position(|c| c == "{\"a\":1}").unwrap();
    assert!(fence_pos < braces_pos);
}

#[test]
fn test_responses_output_shape_extraction() {
    let request = canonical(json!("auto"));
    let text = r#"{"output":[{"type":"function_call","call_id":"call_9","name":"apply_patch","arguments":"{\"diff\":\"x\"}"}]}"#;
    let response = build_assistant_response(&request, text);
    assert_eq!(response.tool_calls[0].id, "call_9");
    assert_eq!(response.tool_calls[0].function.name, "apply_patch");
}
