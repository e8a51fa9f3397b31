//! Gateway error type rendered as the conventional OpenAI error body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// Stable machine-readable error codes surfaced in `error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MissingAuthorization,
    InvalidJson,
    InvalidRequest,
    InvalidTransport,
    InvalidPreviousResponseId,
    InvalidToolOutput,
    ConversationIdMissing,
    GraphError,
    SubstrateError,
    ResponseNotFound,
    MissingResponseId,
    ResponseStreamError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingAuthorization => "missing_authorization",
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidTransport => "invalid_transport",
            ErrorCode::InvalidPreviousResponseId => "invalid_previous_response_id",
            ErrorCode::InvalidToolOutput => "invalid_tool_output",
            ErrorCode::ConversationIdMissing => "conversation_id_missing",
            ErrorCode::GraphError => "graph_error",
            ErrorCode::SubstrateError => "substrate_error",
            ErrorCode::ResponseNotFound => "response_not_found",
            ErrorCode::MissingResponseId => "missing_response_id",
            ErrorCode::ResponseStreamError => "response_stream_error",
        }
    }
}

/// A request-scoped failure carrying the HTTP status it should surface as.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub status: StatusCode,
    pub message: String,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn new(code: ErrorCode, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
        }
    }

    pub fn missing_authorization() -> Self {
        Self::new(
            ErrorCode::MissingAuthorization,
            StatusCode::UNAUTHORIZED,
            "no authorization credential could be resolved for the upstream call",
        )
    }

    pub fn invalid_json(err: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidJson,
            StatusCode::BAD_REQUEST,
            format!("request body is not valid JSON: {}", err),
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, StatusCode::BAD_REQUEST, message)
    }

    pub fn invalid_transport(value: &str) -> Self {
        Self::new(
            ErrorCode::InvalidTransport,
            StatusCode::BAD_REQUEST,
            format!(
                "unsupported transport '{}' (expected 'graph' or 'substrate')",
                value
            ),
        )
    }

    pub fn invalid_previous_response_id(id: &str) -> Self {
        Self::new(
            ErrorCode::InvalidPreviousResponseId,
            StatusCode::BAD_REQUEST,
            format!("previous_response_id '{}' is unknown or expired", id),
        )
    }

    pub fn invalid_tool_output(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidToolOutput,
            StatusCode::BAD_REQUEST,
            message,
        )
    }

    pub fn conversation_id_missing() -> Self {
        Self::new(
            ErrorCode::ConversationIdMissing,
            StatusCode::BAD_REQUEST,
            "a conversation id was supplied but is empty",
        )
    }

    pub fn response_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::ResponseNotFound,
            StatusCode::NOT_FOUND,
            format!("response '{}' not found", id),
        )
    }

    pub fn missing_response_id() -> Self {
        Self::new(
            ErrorCode::MissingResponseId,
            StatusCode::BAD_REQUEST,
            "a response id is required",
        )
    }

    /// Upstream Graph failure with the upstream status clamped into 4xx-5xx.
    pub fn graph(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GraphError, clamp_upstream_status(status), message)
    }

    /// Upstream Substrate failure with the upstream status clamped into 4xx-5xx.
    pub fn substrate(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SubstrateError,
            clamp_upstream_status(status),
            message,
        )
    }

    pub fn substrate_timeout(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SubstrateError,
            StatusCode::GATEWAY_TIMEOUT,
            message,
        )
    }

    pub fn response_stream(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ResponseStreamError,
            StatusCode::BAD_GATEWAY,
            message,
        )
    }

    /// Conventional OpenAI error envelope.
    pub fn to_body(&self) -> Value {
        json!({
            "error": {
                "message": self.message,
                "type": error_type_for_status(self.status),
                "param": Value::Null,
                "code": self.code.as_str(),
            }
        })
    }
}

fn error_type_for_status(status: StatusCode) -> &'static str {
    if status == StatusCode::UNAUTHORIZED {
        "authentication_error"
    } else if status.is_client_error() {
        "invalid_request_error"
    } else {
        "server_error"
    }
}

/// Pass upstream statuses through when they are already in the 4xx-5xx
/// range; everything else (including absence) becomes 502.
fn clamp_upstream_status(status: Option<u16>) -> StatusCode {
    match status {
        Some(code) if (400..=599).contains(&code) => {
            StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status, Json(self.to_body())).into_response()
    }
}
