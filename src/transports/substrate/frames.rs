//! Substrate hub frame handling: RS framing, JWT claim extraction, and the
//! per-frame field extraction rules.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::Value;

/// Records on the wire are separated by the ASCII Record Separator byte;
/// every outbound payload carries a trailing RS terminator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Serialize one outbound record with its RS terminator.
pub fn encode_record(value: &Value) -> String {
    format!("{}{}", value, RECORD_SEPARATOR)
}

/// Split an inbound text payload into complete records. A trailing
/// unterminated fragment is returned separately for re-buffering.
pub fn split_records(buffer: &str) -> (Vec<String>, String) {
    let mut records: Vec<String> = buffer
        .split(RECORD_SEPARATOR)
        .map(|piece| piece.to_string())
        .collect();
    let remainder = if buffer.ends_with(RECORD_SEPARATOR) {
        String::new()
    } else {
        records.pop().unwrap_or_default()
    };
    let records = records
        .into_iter()
        .filter(|record| !record.trim().is_empty())
        .collect();
    (records, remainder)
}

/// Decode the `oid` and `tid` claims from an unverified bearer JWT.
pub fn decode_jwt_claims(token: &str) -> Option<(String, String)> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    let oid = claims.get("oid")?.as_str()?.to_string();
    let tid = claims.get("tid")?.as_str()?.to_string();
    if oid.is_empty() || tid.is_empty() {
        return None;
    }
    Some((oid, tid))
}

/// Conversation ids may appear at several depths; the last non-empty value
/// found in scan order (shallow to deep) wins.
pub fn extract_conversation_id(frame: &Value) -> Option<String> {
    let mut found = None;
    let mut consider = |value: Option<&Value>| {
        if let Some(id) = value.and_then(|v| v.as_str()).filter(|id| !id.is_empty()) {
            found = Some(id.to_string());
        }
    };

    consider(frame.get("conversationId"));
    consider(frame.get("item").and_then(|item| item.get("conversationId")));
    if let Some(arguments) = frame.get("arguments").and_then(|a| a.as_array()) {
        for argument in arguments {
            consider(argument.get("conversationId"));
            consider(argument.get("item").and_then(|item| item.get("conversationId")));
        }
    }
    found
}

/// Concatenated `writeAtCursor` deltas carried by this frame.
pub fn extract_write_at_cursor(frame: &Value) -> Option<String> {
    let arguments = frame.get("arguments")?.as_array()?;
    let mut delta = String::new();
    for argument in arguments {
        if let Some(text) = argument.get("writeAtCursor").and_then(|v| v.as_str()) {
            delta.push_str(text);
        }
    }
    if delta.is_empty() {
        None
    } else {
        Some(delta)
    }
}

/// The latest bot message text in this frame, if any. Bot messages are
/// `author == "bot"` with `messageType` Chat or Disengaged; the text is the
/// first of `text`, `hiddenText`, `spokenText`.
pub fn extract_bot_message_text(frame: &Value) -> Option<String> {
    let mut latest = None;

    let mut scan = |holder: &Value| {
        if let Some(messages) = holder.get("messages").and_then(|m| m.as_array()) {
            for message in messages {
                if message.get("author").and_then(|v| v.as_str()) != Some("bot") {
                    continue;
                }
                let message_type = message.get("messageType").and_then(|v| v.as_str());
                if !matches!(message_type, Some("Chat") | Some("Disengaged")) {
                    continue;
                }
                for key in ["text", "hiddenText", "spokenText"] {
                    if let Some(text) = message.get(key).and_then(|v| v.as_str()) {
                        if !text.is_empty() {
                            latest = Some(text.to_string());
                            break;
                        }
                    }
                }
            }
        }
    };

    scan(frame);
    if let Some(item) = frame.get("item") {
        scan(item);
    }
    if let Some(arguments) = frame.get("arguments").and_then(|a| a.as_array()) {
        for argument in arguments {
            scan(argument);
            if let Some(item) = argument.get("item") {
                scan(item);
            }
        }
    }
    latest
}

pub fn frame_error_message(frame: &Value) -> Option<String> {
    let error = frame.get("error")?;
    Some(match error {
        Value::String(message) => message.clone(),
        other => other.to_string(),
    })
}

/// A terminal frame ends the invocation: integer `type` 2, 3, or 7.
pub fn is_terminal_frame(frame: &Value) -> bool {
    matches!(
        frame.get("type").and_then(|v| v.as_i64()),
        Some(2) | Some(3) | Some(7)
    )
}

/// Success requires the absence of `error` and, when a result is present,
/// a value of Success or ApologyResponseReturned (case-insensitive).
pub fn result_failure(frame: &Value) -> Option<String> {
    let value = frame
        .get("result")
        .and_then(|r| r.get("value"))
        .and_then(|v| v.as_str())?;
    let normalized = value.to_ascii_lowercase();
    if normalized == "success" || normalized == "apologyresponsereturned" {
        None
    } else {
        let message = frame
            .get("result")
            .and_then(|r| r.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or(value);
        Some(format!("substrate result {}: {}", value, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jwt_with_claims(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{}.{}.sig", header, payload)
    }

    #[test]
    fn test_encode_record_appends_terminator() {
        let encoded = encode_record(&json!({"type": 6}));
        assert!(encoded.ends_with(RECORD_SEPARATOR));
        assert_eq!(&encoded[..encoded.len() - 1], "{\"type\":6}");
    }

    #[test]
    fn test_split_records_keeps_trailing_fragment() {
        let input = format!("{{\"a\":1}}{}{{\"b\":", RECORD_SEPARATOR);
        let (records, remainder) = split_records(&input);
        assert_eq!(records, vec!["{\"a\":1}".to_string()]);
        assert_eq!(remainder, "{\"b\":");

        let terminated = format!("{{\"a\":1}}{}", RECORD_SEPARATOR);
        let (records, remainder) = split_records(&terminated);
        assert_eq!(records.len(), 1);
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_decode_jwt_claims() {
        let token = jwt_with_claims(&json!({"oid": "user-1", "tid": "tenant-9"}));
        assert_eq!(
            decode_jwt_claims(&token),
            Some(("user-1".to_string(), "tenant-9".to_string()))
        );
        assert_eq!(decode_jwt_claims("not-a-jwt"), None);
        let missing = jwt_with_claims(&json!({"oid": "user-1"}));
        assert_eq!(decode_jwt_claims(&missing), None);
    }

    #[test]
    fn test_conversation_id_deepest_last_wins() {
        let frame = json!({
            "conversationId": "shallow",
            "arguments": [{"item": {"conversationId": "deep"}}]
        });
        assert_eq!(extract_conversation_id(&frame).as_deref(), Some("deep"));

        let empty_deep = json!({
            "conversationId": "shallow",
            "arguments": [{"item": {"conversationId": ""}}]
        });
        assert_eq!(
            extract_conversation_id(&empty_deep).as_deref(),
            Some("shallow")
        );
    }

    #[test]
    fn test_write_at_cursor_concatenates() {
        let frame = json!({
            "arguments": [{"writeAtCursor": "Hel"}, {"writeAtCursor": "lo"}]
        });
        assert_eq!(extract_write_at_cursor(&frame).as_deref(), Some("Hello"));
        assert_eq!(extract_write_at_cursor(&json!({"arguments": []})), None);
    }

    #[test]
    fn test_bot_message_selection() {
        let frame = json!({
            "arguments": [{
                "messages": [
                    {"author": "user", "messageType": "Chat", "text": "hi"},
                    {"author": "bot", "messageType": "Chat", "text": "partial"},
                    {"author": "bot", "messageType": "InternalSearchQuery", "text": "q"},
                    {"author": "bot", "messageType": "Chat", "hiddenText": "final answer"}
                ]
            }]
        });
        assert_eq!(
            extract_bot_message_text(&frame).as_deref(),
            Some("final answer")
        );
    }

    #[test]
    fn test_terminal_and_result_rules() {
        assert!(is_terminal_frame(&json!({"type": 2})));
        assert!(is_terminal_frame(&json!({"type": 3})));
        assert!(is_terminal_frame(&json!({"type": 7})));
        assert!(!is_terminal_frame(&json!({"type": 1})));

        assert!(result_failure(&json!({"result": {"value": "Success"}})).is_none());
        assert!(
            result_failure(&json!({"result": {"value": "apologyResponseReturned"}})).is_none()
        );
        let failure = result_failure(&json!({
            "result": {"value": "InvalidSession", "message": "session expired"}
        }))
        .unwrap();
        assert!(failure.contains("InvalidSession"));
        assert!(failure.contains("session expired"));
        // no result at all is not a failure
        assert!(result_failure(&json!({"type": 3})).is_none());
    }

    #[test]
    fn test_frame_error_message() {
        assert_eq!(
            frame_error_message(&json!({"error": "handshake rejected"})).as_deref(),
            Some("handshake rejected")
        );
        assert!(frame_error_message(&json!({"type": 6})).is_none());
    }
}
