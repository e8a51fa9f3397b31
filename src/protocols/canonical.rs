//! Canonicalization of OpenAI request shapes.
//!
//! Both the Chat Completions and the Responses surfaces normalize into one
//! internal [`CanonicalRequest`] record: a single prompt string, ordered
//! context entries, a location hint, and normalized tooling. Transports and
//! the emitter only ever see this record.

use serde_json::{json, Value};

use crate::config::GatewayConfig;
use crate::core::{GatewayError, GatewayResult};

use super::chat::{ChatCompletionRequest, ChatMessage, M365Extensions};
use super::responses::ResponsesRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoiceMode {
    Auto,
    None,
    Required,
    Function,
}

#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct Tooling {
    pub tools: Vec<ToolDef>,
    pub mode: ToolChoiceMode,
    pub function_name: Option<String>,
    pub parallel_tool_calls: bool,
}

impl Tooling {
    pub fn none() -> Self {
        Self {
            tools: Vec::new(),
            mode: ToolChoiceMode::None,
            function_name: None,
            parallel_tool_calls: true,
        }
    }

    /// Extraction runs only when tools are declared and the mode allows them.
    pub fn wants_tool_calls(&self) -> bool {
        !self.tools.is_empty() && self.mode != ToolChoiceMode::None
    }

    /// Strict modes turn a missing tool call into an error instead of text.
    pub fn is_strict(&self) -> bool {
        matches!(self.mode, ToolChoiceMode::Required | ToolChoiceMode::Function)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|tool| tool.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormatSpec {
    JsonObject,
    JsonSchema { schema: Option<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub text: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LocationHint {
    /// Always set; falls back to the configured default time zone
    pub time_zone: String,
    pub country_or_region: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub model: String,
    pub stream: bool,
    pub prompt_text: String,
    pub additional_context: Vec<ContextEntry>,
    pub location_hint: LocationHint,
    pub contextual_resources: Option<Value>,
    pub tooling: Tooling,
    pub response_format: Option<ResponseFormatSpec>,
    pub reasoning_effort: Option<String>,
    pub temperature: Option<f64>,
    pub user_key: String,
}

/// A Responses request wraps the canonical record with continuation state
/// and the original input items, preserved verbatim for echoing.
#[derive(Debug, Clone)]
pub struct CanonicalResponses {
    pub request: CanonicalRequest,
    pub previous_response_id: Option<String>,
    pub instructions: Option<String>,
    pub input_echo: Value,
}

impl CanonicalRequest {
    pub fn from_chat(req: &ChatCompletionRequest, config: &GatewayConfig) -> GatewayResult<Self> {
        if req.messages.is_empty() {
            return Err(GatewayError::invalid_request(
                "'messages' must be a non-empty array",
            ));
        }
        let tooling = normalize_tooling(
            req.tools.as_deref(),
            req.tool_choice.as_ref(),
            req.parallel_tool_calls,
        )?;
        let response_format = normalize_response_format(req.response_format.as_ref());
        build_canonical(BuildInput {
            messages: &req.messages,
            leading_context: Vec::new(),
            tooling,
            response_format,
            model: req.model.as_deref(),
            stream: req.stream,
            reasoning_effort: req.reasoning_effort.clone(),
            temperature: req.temperature,
            user: req.user.as_deref(),
            m365: &req.m365,
            config,
        })
    }

    pub fn from_responses(
        req: &ResponsesRequest,
        config: &GatewayConfig,
    ) -> GatewayResult<CanonicalResponses> {
        let input = req.input.clone().unwrap_or(Value::Null);
        let messages = responses_input_to_messages(&input)?;
        if !messages.iter().any(|m| !message_text(m).is_empty()) {
            return Err(GatewayError::invalid_request(
                "'input' does not contain any textual content",
            ));
        }

        let tooling = normalize_tooling(
            req.tools.as_deref(),
            req.tool_choice.as_ref(),
            req.parallel_tool_calls,
        )?;
        let response_format = normalize_text_format(req.text.as_ref());
        let reasoning_effort = req
            .reasoning
            .as_ref()
            .and_then(|r| r.get("effort"))
            .and_then(|v| v.as_str())
            .map(String::from);

        // Instructions become a system-like context entry unless the input
        // items already carried an identical one.
        let mut leading_context = Vec::new();
        if let Some(instructions) = req.instructions.as_deref() {
            let rendered = format!("system: {}", instructions);
            let already_present = messages
                .iter()
                .any(|m| m.role == "system" && message_text(m) == instructions);
            if !already_present {
                leading_context.push(ContextEntry {
                    text: rendered,
                    description: Some("instructions".to_string()),
                });
            }
        }

        let request = build_canonical(BuildInput {
            messages: &messages,
            leading_context,
            tooling,
            response_format,
            model: req.model.as_deref(),
            stream: req.stream,
            reasoning_effort,
            temperature: req.temperature,
            user: req.user.as_deref(),
            m365: &req.m365,
            config,
        })?;

        Ok(CanonicalResponses {
            request,
            previous_response_id: req.previous_response_id.clone(),
            instructions: req.instructions.clone(),
            input_echo: input,
        })
    }

    /// Prompt string sent upstream: a `Context:` block of the additional
    /// context lines when any exist, then the user turn.
    pub fn prompt_with_context(&self) -> String {
        if self.additional_context.is_empty() {
            return self.prompt_text.clone();
        }
        let mut out = String::from("Context:\n");
        for entry in &self.additional_context {
            out.push_str(&entry.text);
            out.push('\n');
        }
        out.push_str("\nUser: ");
        out.push_str(&self.prompt_text);
        out
    }
}

struct BuildInput<'a> {
    messages: &'a [ChatMessage],
    leading_context: Vec<ContextEntry>,
    tooling: Tooling,
    response_format: Option<ResponseFormatSpec>,
    model: Option<&'a str>,
    stream: bool,
    reasoning_effort: Option<String>,
    temperature: Option<f64>,
    user: Option<&'a str>,
    m365: &'a M365Extensions,
    config: &'a GatewayConfig,
}

fn build_canonical(input: BuildInput<'_>) -> GatewayResult<CanonicalRequest> {
    let BuildInput {
        messages,
        mut leading_context,
        tooling,
        response_format,
        model,
        stream,
        reasoning_effort,
        temperature,
        user,
        m365,
        config,
    } = input;

    // The prompt is the last user turn; failing that, the last message.
    let prompt_index = messages
        .iter()
        .rposition(|m| m.role == "user")
        .unwrap_or(messages.len() - 1);
    let prompt_text = message_text(&messages[prompt_index]);

    if let Some(system_prompt) = m365.m365_system_prompt.as_deref() {
        leading_context.insert(
            0,
            ContextEntry {
                text: format!("system: {}", system_prompt),
                description: Some("system prompt".to_string()),
            },
        );
    }

    let mut additional_context = leading_context;
    for (index, message) in messages.iter().enumerate() {
        if index == prompt_index {
            continue;
        }
        let text = message_text(message);
        if text.is_empty() {
            continue;
        }
        additional_context.push(ContextEntry {
            text: format!("{}: {}", message.role, text),
            description: None,
        });
    }

    push_extension_context(&mut additional_context, m365.m365_additional_context.as_ref());

    if tooling.wants_tool_calls() {
        push_compat_context(&mut additional_context, &tooling);
    }
    truncate_to_cap(
        &mut additional_context,
        config.max_additional_context_messages,
    );

    Ok(CanonicalRequest {
        model: model.unwrap_or(&config.default_model).to_string(),
        stream,
        prompt_text,
        additional_context,
        location_hint: resolve_location_hint(m365, config),
        contextual_resources: m365.m365_contextual_resources.clone(),
        tooling,
        response_format,
        reasoning_effort,
        temperature,
        user_key: user.unwrap_or("default").to_string(),
    })
}

/// Render one message as text, applying the tool / tool_calls markers.
fn message_text(message: &ChatMessage) -> String {
    if message.role == "tool" {
        let payload = message
            .content
            .as_ref()
            .map(|content| content_text(&message.role, content))
            .unwrap_or_default();
        let id = message.tool_call_id.as_deref().unwrap_or("unknown");
        return format!("tool[{}]: {}", id, payload);
    }

    let mut parts = Vec::new();
    if let Some(content) = &message.content {
        let text = content_text(&message.role, content);
        if !text.is_empty() {
            parts.push(text);
        }
    }
    if let Some(tool_calls) = &message.tool_calls {
        if !tool_calls.is_null() {
            parts.push(format!("assistant tool_calls: {}", tool_calls));
        }
    }
    parts.join("\n")
}

/// Extract text from any of the content shapes clients send: a plain
/// string, an object with `text`/`value`, or an array of parts.
fn content_text(role: &str, content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Object(obj) => obj
            .get("text")
            .or_else(|| obj.get("value"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        Value::Array(items) => {
            let mut parts = Vec::new();
            for item in items {
                match item {
                    Value::String(text) => parts.push(text.clone()),
                    Value::Object(obj) => {
                        let part_type = obj.get("type").and_then(|v| v.as_str()).unwrap_or("text");
                        match part_type {
                            "text" | "input_text" | "output_text" => {
                                if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                                    parts.push(text.to_string());
                                }
                            }
                            "image_url" | "input_image" => {
                                let url = obj
                                    .get("image_url")
                                    .map(|image| match image {
                                        Value::String(url) => url.clone(),
                                        other => other
                                            .get("url")
                                            .and_then(|v| v.as_str())
                                            .unwrap_or_default()
                                            .to_string(),
                                    })
                                    .unwrap_or_default();
                                parts.push(format!("[{} attached image: {}]", role, url));
                            }
                            _ => {
                                if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                                    parts.push(text.to_string());
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    }
}

fn normalize_tooling(
    tools: Option<&[Value]>,
    tool_choice: Option<&Value>,
    parallel_tool_calls: Option<bool>,
) -> GatewayResult<Tooling> {
    let mut defs = Vec::new();
    for tool in tools.unwrap_or_default() {
        let tool_type = tool.get("type").and_then(|v| v.as_str()).unwrap_or("function");
        if tool_type != "function" {
            continue;
        }
        // Accept both the nested OpenAI shape and a flat {name, parameters}.
        let function = tool.get("function").unwrap_or(tool);
        let Some(name) = function
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|name| !name.is_empty())
        else {
            continue;
        };
        defs.push(ToolDef {
            name: name.to_string(),
            description: function
                .get("description")
                .and_then(|v| v.as_str())
                .map(String::from),
            parameters: function
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| json!({})),
        });
    }

    let (mode, function_name) = match tool_choice {
        None => (
            if defs.is_empty() {
                ToolChoiceMode::None
            } else {
                ToolChoiceMode::Auto
            },
            None,
        ),
        Some(Value::String(choice)) => match choice.as_str() {
            "auto" => (ToolChoiceMode::Auto, None),
            "none" => (ToolChoiceMode::None, None),
            "required" => (ToolChoiceMode::Required, None),
            other => {
                return Err(GatewayError::invalid_request(format!(
                    "unsupported tool_choice '{}'",
                    other
                )))
            }
        },
        Some(Value::Object(obj)) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|v| v.as_str())
                .or_else(|| obj.get("name").and_then(|v| v.as_str()));
            match name {
                Some(name) => (ToolChoiceMode::Function, Some(name.to_string())),
                None => {
                    return Err(GatewayError::invalid_request(
                        "tool_choice object requires function.name",
                    ))
                }
            }
        }
        Some(_) => {
            return Err(GatewayError::invalid_request(
                "tool_choice must be a string or an object",
            ))
        }
    };

    if defs.is_empty() && matches!(mode, ToolChoiceMode::Required | ToolChoiceMode::Function) {
        return Err(GatewayError::invalid_request(
            "tool_choice demands a tool call but no usable tools were declared",
        ));
    }
    if mode == ToolChoiceMode::Function {
        let name = function_name.as_deref().unwrap_or_default();
        if !defs.iter().any(|tool| tool.name == name) {
            return Err(GatewayError::invalid_request(format!(
                "tool_choice names '{}' which is not among the declared tools",
                name
            )));
        }
    }

    Ok(Tooling {
        tools: defs,
        mode,
        function_name,
        parallel_tool_calls: parallel_tool_calls.unwrap_or(true),
    })
}

fn normalize_response_format(value: Option<&Value>) -> Option<ResponseFormatSpec> {
    let value = value?;
    match value.get("type").and_then(|v| v.as_str()) {
        Some("json_object") => Some(ResponseFormatSpec::JsonObject),
        Some("json_schema") => {
            let schema = value
                .get("json_schema")
                .and_then(|js| js.get("schema"))
                .or_else(|| value.get("schema"))
                .cloned();
            Some(ResponseFormatSpec::JsonSchema { schema })
        }
        _ => None,
    }
}

/// Responses `text.format` is the same concept with one more nesting level.
fn normalize_text_format(value: Option<&Value>) -> Option<ResponseFormatSpec> {
    let format = value?.get("format")?;
    match format {
        Value::String(kind) if kind == "json_object" => Some(ResponseFormatSpec::JsonObject),
        Value::Object(_) => normalize_response_format(Some(format)),
        _ => None,
    }
}

/// Translate Responses `input` into the synthetic message list the shared
/// canonicalizer understands.
fn responses_input_to_messages(input: &Value) -> GatewayResult<Vec<ChatMessage>> {
    let mut messages = Vec::new();
    match input {
        Value::String(text) => messages.push(user_message(json!(text))),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(text) => messages.push(user_message(json!(text))),
                    Value::Object(obj) => {
                        match obj.get("type").and_then(|v| v.as_str()) {
                            Some("function_call") => {
                                let name =
                                    obj.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                                let arguments = match obj.get("arguments") {
                                    Some(Value::String(args)) => args.clone(),
                                    Some(other) => other.to_string(),
                                    None => "{}".to_string(),
                                };
                                let id = obj
                                    .get("call_id")
                                    .or_else(|| obj.get("id"))
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("unknown");
                                messages.push(ChatMessage {
                                    role: "assistant".to_string(),
                                    content: None,
                                    name: None,
                                    tool_calls: Some(json!([{
                                        "id": id,
                                        "type": "function",
                                        "function": {"name": name, "arguments": arguments},
                                    }])),
                                    tool_call_id: None,
                                });
                            }
                            Some("function_call_output") => {
                                let output = match obj.get("output") {
                                    Some(Value::String(text)) => json!(text),
                                    Some(other) => json!(other.to_string()),
                                    None => json!(""),
                                };
                                messages.push(ChatMessage {
                                    role: "tool".to_string(),
                                    content: Some(output),
                                    name: None,
                                    tool_calls: None,
                                    tool_call_id: obj
                                        .get("call_id")
                                        .and_then(|v| v.as_str())
                                        .map(String::from),
                                });
                            }
                            Some("message") | None => {
                                let role = obj
                                    .get("role")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("user")
                                    .to_string();
                                messages.push(ChatMessage {
                                    role,
                                    content: obj.get("content").cloned(),
                                    name: None,
                                    tool_calls: None,
                                    tool_call_id: None,
                                });
                            }
                            // Reasoning items and other typed entries carry
                            // nothing the upstream prompt can use.
                            Some(_) => {}
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {
            return Err(GatewayError::invalid_request(
                "'input' must be a string or an array of items",
            ))
        }
    }

    if messages.is_empty() {
        return Err(GatewayError::invalid_request(
            "'input' does not contain any textual content",
        ));
    }
    Ok(messages)
}

fn user_message(content: Value) -> ChatMessage {
    ChatMessage {
        role: "user".to_string(),
        content: Some(content),
        name: None,
        tool_calls: None,
        tool_call_id: None,
    }
}

/// `m365_additional_context`: a string, or an array of strings and
/// `{text, description}` objects.
fn push_extension_context(entries: &mut Vec<ContextEntry>, extension: Option<&Value>) {
    let Some(extension) = extension else { return };
    match extension {
        Value::String(text) => entries.push(ContextEntry {
            text: text.clone(),
            description: None,
        }),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(text) => entries.push(ContextEntry {
                        text: text.clone(),
                        description: None,
                    }),
                    Value::Object(obj) => {
                        if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                            entries.push(ContextEntry {
                                text: text.to_string(),
                                description: obj
                                    .get("description")
                                    .and_then(|v| v.as_str())
                                    .map(String::from),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Inject the OpenAI-compatibility contract: how to emit a tool call, which
/// tools exist, and what the active tool-choice constraint is.
fn push_compat_context(entries: &mut Vec<ContextEntry>, tooling: &Tooling) {
    entries.push(ContextEntry {
        text: "When you decide to call a tool, reply with exactly one JSON object of the form \
               {\"tool_calls\":[{\"name\":\"<tool name>\",\"arguments\":{...}}]} and no other \
               prose. Otherwise answer normally."
            .to_string(),
        description: Some("openai-compatibility".to_string()),
    });

    let tool_list: Vec<Value> = tooling
        .tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            })
        })
        .collect();
    entries.push(ContextEntry {
        text: format!("Available tools: {}", Value::Array(tool_list)),
        description: Some("openai-compatibility".to_string()),
    });

    let constraint = match tooling.mode {
        ToolChoiceMode::Required => {
            "Tool choice: required. You must call one of the available tools.".to_string()
        }
        ToolChoiceMode::Function => format!(
            "Tool choice: you must call the function '{}'.",
            tooling.function_name.as_deref().unwrap_or_default()
        ),
        _ => "Tool choice: auto. Call a tool only when it helps.".to_string(),
    };
    entries.push(ContextEntry {
        text: constraint,
        description: Some("openai-compatibility".to_string()),
    });
}

fn truncate_to_cap(entries: &mut Vec<ContextEntry>, cap: usize) {
    if entries.len() > cap {
        let excess = entries.len() - cap;
        entries.drain(..excess);
    }
}

fn resolve_location_hint(m365: &M365Extensions, config: &GatewayConfig) -> LocationHint {
    let hint = m365.m365_location_hint.as_ref();
    let hint_time_zone = hint
        .and_then(|h| h.get("timeZone").or_else(|| h.get("time_zone")))
        .and_then(|v| v.as_str());
    let hint_region = hint
        .and_then(|h| h.get("countryOrRegion").or_else(|| h.get("country_or_region")))
        .and_then(|v| v.as_str());

    LocationHint {
        time_zone: m365
            .m365_time_zone
            .as_deref()
            .or(hint_time_zone)
            .unwrap_or(&config.default_time_zone)
            .to_string(),
        country_or_region: m365
            .m365_country_or_region
            .as_deref()
            .or(hint_region)
            .map(String::from),
    }
}
