//! TTL-bounded mapping from conversation keys to upstream conversation ids.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Keys are scoped per transport so Graph and Substrate conversations never
/// collide. The transport segment is lowercased; the key itself is opaque.
pub fn scoped_conversation_key(transport: &str, key: &str) -> String {
    format!("{}:{}", transport.to_lowercase(), key)
}

#[derive(Debug, Clone)]
struct ConversationEntry {
    conversation_id: String,
    /// None = never expires (zero/negative TTL sentinel)
    expires_at: Option<DateTime<Utc>>,
}

/// Trait describing the conversation cache backend.
#[async_trait]
pub trait ConversationStorage: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, conversation_id: &str);
}

pub type SharedConversationStorage = Arc<dyn ConversationStorage>;

/// In-memory implementation. Expired entries are lazily evicted on every
/// read and write, so no sweeper task is needed.
pub struct MemoryConversationStorage {
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, ConversationEntry>>,
}

impl MemoryConversationStorage {
    pub fn new(ttl_minutes: i64) -> Self {
        Self {
            ttl: (ttl_minutes > 0).then(|| Duration::minutes(ttl_minutes)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn purge(entries: &mut HashMap<String, ConversationEntry>) {
        let now = Utc::now();
        entries.retain(|_, entry| entry.expires_at.is_none_or(|expires| expires > now));
    }
}

#[async_trait]
impl ConversationStorage for MemoryConversationStorage {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.write();
        Self::purge(&mut entries);
        entries.get(key).map(|entry| entry.conversation_id.clone())
    }

    async fn set(&self, key: &str, conversation_id: &str) {
        let mut entries = self.entries.write();
        Self::purge(&mut entries);
        entries.insert(
            key.to_string(),
            ConversationEntry {
                conversation_id: conversation_id.to_string(),
                expires_at: self.ttl.map(|ttl| Utc::now() + ttl),
            },
        );
    }
}
