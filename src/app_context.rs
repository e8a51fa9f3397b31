//! Process-wide shared state: configuration, the upstream HTTP client, the
//! two stores, the token provider, and the transport clients.

use std::sync::Arc;
use std::time::Duration;

use crate::config::GatewayConfig;
use crate::data_connector::{
    MemoryConversationStorage, MemoryResponseStorage, SharedConversationStorage,
    SharedResponseStorage,
};
use crate::token::TokenProvider;
use crate::transports::graph::GraphTransport;
use crate::transports::substrate::SubstrateTransport;
use crate::transports::{SharedChatTransport, TransportKind};

pub struct AppContext {
    pub config: Arc<GatewayConfig>,
    pub client: reqwest::Client,
    pub conversation_storage: SharedConversationStorage,
    pub response_storage: SharedResponseStorage,
    pub token_provider: Arc<TokenProvider>,
    graph: SharedChatTransport,
    substrate: SharedChatTransport,
}

impl AppContext {
    pub fn from_config(config: GatewayConfig) -> Result<Self, String> {
        let config = Arc::new(config);
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| format!("failed to build upstream http client: {}", err))?;

        let conversation_storage: SharedConversationStorage = Arc::new(
            MemoryConversationStorage::new(config.conversation_ttl_minutes),
        );
        let response_storage: SharedResponseStorage =
            Arc::new(MemoryResponseStorage::new(config.conversation_ttl_minutes));
        let token_provider = Arc::new(TokenProvider::new(config.clone()));
        let graph: SharedChatTransport =
            Arc::new(GraphTransport::new(client.clone(), config.clone()));
        let substrate: SharedChatTransport = Arc::new(SubstrateTransport::new(config.clone()));

        Ok(Self {
            config,
            client,
            conversation_storage,
            response_storage,
            token_provider,
            graph,
            substrate,
        })
    }

    pub fn transport(&self, kind: TransportKind) -> SharedChatTransport {
        match kind {
            TransportKind::Graph => self.graph.clone(),
            TransportKind::Substrate => self.substrate.clone(),
        }
    }
}
