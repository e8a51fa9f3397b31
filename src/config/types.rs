use std::path::Path;

use serde::{Deserialize, Serialize};

/// Main gateway configuration, deserialized from a camelCase JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to, `host:port`
    pub listen_url: String,
    /// Log level (None = info)
    pub log_level: Option<String>,
    /// Log directory (None = stdout only)
    pub log_dir: Option<String>,
    /// Default upstream transport when the request does not pick one
    pub transport: String,
    /// Base URL for the Graph REST transport
    pub graph_base_url: String,
    /// POST path creating a conversation (body `{}`)
    pub create_conversation_path: String,
    /// POST path template for buffered chat; `{conversationId}` is substituted
    pub chat_path_template: String,
    /// POST path template for SSE chat; `{conversationId}` is substituted
    pub chat_over_stream_path_template: String,
    /// Substrate (WebSocket hub) transport settings
    pub substrate: SubstrateConfig,
    /// Model name advertised by `/v1/models` and used when requests omit one
    pub default_model: String,
    /// IANA time zone applied when the request carries no location hint
    pub default_time_zone: String,
    /// Conversation cache TTL; zero or negative means never expire
    pub conversation_ttl_minutes: i64,
    /// Cap on injected compatibility context messages
    pub max_additional_context_messages: usize,
    /// Append `conversation_id` to chat completion bodies
    pub include_conversation_id_in_response_body: bool,
    /// Never trust the inbound `authorization` header
    pub ignore_incoming_authorization_header: bool,
    /// On-disk token cache consulted when no inbound credential is usable
    pub token_file_path: Option<String>,
    /// External command that refreshes the token file; empty disables acquisition
    pub token_command: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_url: "127.0.0.1:8080".to_string(),
            log_level: None,
            log_dir: None,
            transport: "graph".to_string(),
            graph_base_url: "https://graph.microsoft.com/beta".to_string(),
            create_conversation_path: "/copilot/conversations".to_string(),
            chat_path_template: "/copilot/conversations/{conversationId}/chat".to_string(),
            chat_over_stream_path_template: "/copilot/conversations/{conversationId}/chatOverStream"
                .to_string(),
            substrate: SubstrateConfig::default(),
            default_model: "m365-copilot".to_string(),
            default_time_zone: "UTC".to_string(),
            conversation_ttl_minutes: 60,
            max_additional_context_messages: 16,
            include_conversation_id_in_response_body: false,
            ignore_incoming_authorization_header: false,
            token_file_path: None,
            token_command: Vec::new(),
        }
    }
}

/// Substrate hub protocol settings.
///
/// `options_sets` and `allowed_message_types` are sent verbatim; the
/// deployed values vary across service rings so the file is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubstrateConfig {
    /// Hub host and path, without scheme (e.g. `substrate.office.com/m365Copilot/Chathub`)
    pub hub_path: String,
    pub source: String,
    /// Wrap the `source` query value in double quotes
    pub quote_source_in_query: bool,
    pub scenario: String,
    /// `Origin` header presented during the WebSocket handshake
    pub origin: String,
    pub product: Option<String>,
    pub agent_host: Option<String>,
    pub license_type: Option<String>,
    pub agent: Option<String>,
    pub variants: Option<String>,
    pub client_platform: String,
    pub product_thread_type: String,
    /// Bounds the handshake and the whole WebSocket turn, in seconds
    pub invocation_timeout_seconds: u64,
    /// Client keep-alive ping interval while the socket is open, in seconds
    pub keep_alive_seconds: u64,
    pub options_sets: Vec<String>,
    pub allowed_message_types: Vec<String>,
    pub invocation_target: String,
    pub invocation_type: i64,
    pub locale: String,
    pub experience_type: Option<String>,
    pub entity_annotation_types: Vec<String>,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            hub_path: "substrate.office.com/m365Copilot/Chathub".to_string(),
            source: "officeweb".to_string(),
            quote_source_in_query: false,
            scenario: "OfficeWebIntegration".to_string(),
            origin: "https://www.office.com".to_string(),
            product: None,
            agent_host: None,
            license_type: None,
            agent: None,
            variants: None,
            client_platform: "web".to_string(),
            product_thread_type: "Office".to_string(),
            invocation_timeout_seconds: 120,
            keep_alive_seconds: 15,
            options_sets: Vec::new(),
            allowed_message_types: vec!["Chat".to_string(), "Disengaged".to_string()],
            invocation_target: "chat".to_string(),
            invocation_type: 4,
            locale: "en-US".to_string(),
            experience_type: None,
            entity_annotation_types: Vec::new(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFailed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl GatewayConfig {
    /// Load configuration from an optional JSON file, then apply the small
    /// set of environment overrides. A missing path yields pure defaults.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
                        path: path.display().to_string(),
                        source,
                    })?;
                serde_json::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => Self::default(),
        };

        if let Ok(value) = std::env::var("M365_GATEWAY_LISTEN_URL") {
            config.listen_url = value;
        }
        if let Ok(value) = std::env::var("M365_GATEWAY_TRANSPORT") {
            config.transport = value;
        }
        if let Ok(value) = std::env::var("M365_GATEWAY_LOG_LEVEL") {
            config.log_level = Some(value);
        }
        if let Ok(value) = std::env::var("M365_GATEWAY_TOKEN_FILE") {
            config.token_file_path = Some(value);
        }

        Ok(config)
    }
}
