//! Bearer credential resolution for upstream calls.
//!
//! Priority: the inbound `authorization` header (unless configured away),
//! then a cached on-disk token with enough lifetime left, then a
//! single-flight run of the external acquisition command followed by a
//! re-read of the token file.

use std::sync::Arc;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::logging::redact_token;

/// Cached tokens must outlive the request by this margin.
const EXPIRY_MARGIN_SECS: i64 = 60;

pub struct TokenProvider {
    config: Arc<GatewayConfig>,
    /// Serializes external acquisition; the loser of the race re-reads the
    /// file the winner refreshed instead of spawning a second subprocess.
    acquire_lock: Mutex<()>,
}

impl TokenProvider {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self {
            config,
            acquire_lock: Mutex::new(()),
        }
    }

    /// Resolve a `Bearer <token>` value, or None when every path fails.
    pub async fn resolve_authorization(&self, headers: &HeaderMap) -> Option<String> {
        if !self.config.ignore_incoming_authorization_header {
            if let Some(value) = headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
            {
                return Some(ensure_bearer(value));
            }
        }

        if let Some(token) = self.read_cached_token() {
            return Some(ensure_bearer(&token));
        }

        if self.config.token_command.is_empty() {
            return None;
        }

        let _guard = self.acquire_lock.lock().await;
        // A concurrent caller may have refreshed the file while this one
        // waited on the lock.
        if let Some(token) = self.read_cached_token() {
            return Some(ensure_bearer(&token));
        }
        self.run_acquire_command().await;
        self.read_cached_token().map(|token| ensure_bearer(&token))
    }

    fn read_cached_token(&self) -> Option<String> {
        let path = self.config.token_file_path.as_deref()?;
        let contents = std::fs::read_to_string(path).ok()?;
        let value: Value = serde_json::from_str(&contents).ok()?;

        let token = ["access_token", "accessToken", "token"]
            .iter()
            .find_map(|key| value.get(key).and_then(|v| v.as_str()))
            .filter(|token| !token.is_empty())?;

        if let Some(expires_at) = parse_expiry(&value) {
            let remaining = expires_at.timestamp() - Utc::now().timestamp();
            if remaining <= EXPIRY_MARGIN_SECS {
                debug!(token = %redact_token(token), "cached token expires too soon");
                return None;
            }
        }

        Some(token.to_string())
    }

    async fn run_acquire_command(&self) {
        let command = &self.config.token_command;
        let Some(program) = command.first() else {
            return;
        };
        debug!(program = %program, "running token acquisition command");
        match tokio::process::Command::new(program)
            .args(&command[1..])
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(%status, "token acquisition command failed"),
            Err(err) => warn!(error = %err, "token acquisition command could not run"),
        }
    }
}

fn ensure_bearer(value: &str) -> String {
    if value.starts_with("Bearer ") {
        value.to_string()
    } else {
        format!("Bearer {}", value)
    }
}

/// `expires_at`/`expiresAt` as a unix timestamp or an RFC 3339 string.
fn parse_expiry(value: &Value) -> Option<DateTime<Utc>> {
    let field = value.get("expires_at").or_else(|| value.get("expiresAt"))?;
    match field {
        Value::Number(number) => {
            let timestamp = number.as_i64()?;
            DateTime::from_timestamp(timestamp, 0)
        }
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn provider_with(config: GatewayConfig) -> TokenProvider {
        TokenProvider::new(Arc::new(config))
    }

    fn write_token_file(contents: &Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[tokio::test]
    async fn test_inbound_header_wins() {
        let provider = provider_with(GatewayConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(
            provider.resolve_authorization(&headers).await.as_deref(),
            Some("Bearer abc")
        );
    }

    #[tokio::test]
    async fn test_bare_token_gains_bearer_prefix() {
        let provider = provider_with(GatewayConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "abc".parse().unwrap());
        assert_eq!(
            provider.resolve_authorization(&headers).await.as_deref(),
            Some("Bearer abc")
        );
    }

    #[tokio::test]
    async fn test_ignored_header_falls_through_to_file() {
        let file = write_token_file(&json!({
            "access_token": "file-token",
            "expires_at": Utc::now().timestamp() + 3600
        }));
        let config = GatewayConfig {
            ignore_incoming_authorization_header: true,
            token_file_path: Some(file.path().display().to_string()),
            ..Default::default()
        };
        let provider = provider_with(config);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer inbound".parse().unwrap());
        assert_eq!(
            provider.resolve_authorization(&headers).await.as_deref(),
            Some("Bearer file-token")
        );
    }

    #[tokio::test]
    async fn test_expiring_token_is_rejected() {
        let file = write_token_file(&json!({
            "access_token": "stale",
            "expires_at": Utc::now().timestamp() + 30
        }));
        let config = GatewayConfig {
            token_file_path: Some(file.path().display().to_string()),
            ..Default::default()
        };
        let provider = provider_with(config);
        assert_eq!(provider.resolve_authorization(&HeaderMap::new()).await, None);
    }

    #[tokio::test]
    async fn test_no_paths_yields_none() {
        let provider = provider_with(GatewayConfig::default());
        assert_eq!(provider.resolve_authorization(&HeaderMap::new()).await, None);
    }

    #[test]
    fn test_parse_expiry_formats() {
        assert!(parse_expiry(&json!({"expires_at": 1700000000})).is_some());
        assert!(parse_expiry(&json!({"expiresAt": "2031-01-01T00:00:00Z"})).is_some());
        assert!(parse_expiry(&json!({"other": 1})).is_none());
    }
}
