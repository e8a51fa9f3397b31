//! Upstream transports: the Graph REST/SSE client and the Substrate
//! WebSocket driver, behind one trait the orchestrator dispatches on.

pub mod graph;
pub mod substrate;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::GatewayResult;
use crate::protocols::canonical::CanonicalRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Graph,
    Substrate,
}

impl TransportKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "graph" => Some(TransportKind::Graph),
            "substrate" => Some(TransportKind::Substrate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Graph => "graph",
            TransportKind::Substrate => "substrate",
        }
    }
}

/// Incremental signal from an in-flight upstream turn.
///
/// Graph emits cumulative `snapshot_text`; Substrate emits incremental
/// `delta_text`. The stream transformer reconciles both against the bytes
/// already sent to the client.
#[derive(Debug, Clone, Default)]
pub struct StreamUpdate {
    pub delta_text: Option<String>,
    pub snapshot_text: Option<String>,
    pub conversation_id: Option<String>,
}

/// Final result of one upstream chat turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub assistant_text: String,
    /// Upstream-reported conversation id, when it differs from or confirms
    /// the one the turn was posted into
    pub conversation_id: Option<String>,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn create_conversation(&self, auth: &str) -> GatewayResult<String>;

    /// Execute one chat turn. When `updates` is supplied the transport
    /// forwards streaming signals through it as they arrive; the returned
    /// outcome always carries the complete assistant text.
    async fn chat_turn(
        &self,
        auth: &str,
        conversation_id: &str,
        request: &CanonicalRequest,
        is_start_of_session: bool,
        updates: Option<mpsc::UnboundedSender<StreamUpdate>>,
    ) -> GatewayResult<TurnOutcome>;
}

pub type SharedChatTransport = Arc<dyn ChatTransport>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!(TransportKind::parse("graph"), Some(TransportKind::Graph));
        assert_eq!(
            TransportKind::parse("Substrate"),
            Some(TransportKind::Substrate)
        );
        assert_eq!(TransportKind::parse("smtp"), None);
        assert_eq!(TransportKind::Graph.as_str(), "graph");
    }
}
