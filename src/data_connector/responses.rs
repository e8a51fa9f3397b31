//! TTL-bounded store of completed Responses-API bodies plus the
//! `response id -> conversation id` links used for continuation.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;

/// Hard ceiling on a single list page.
const MAX_LIST_LIMIT: usize = 100;
const DEFAULT_LIST_LIMIT: usize = 20;

/// Clamp a raw `limit` query value: absent, unparseable, zero, and negative
/// all fall back to the default; oversized values cap at 100.
pub fn clamp_list_limit(raw: Option<&str>) -> usize {
    let parsed = raw.and_then(|value| value.trim().parse::<i64>().ok());
    match parsed {
        Some(limit) if limit > 0 => (limit as usize).min(MAX_LIST_LIMIT),
        _ => DEFAULT_LIST_LIMIT,
    }
}

#[derive(Debug, Clone)]
struct StoredResponse {
    created_at_unix: i64,
    /// Insertion sequence, breaks ordering ties between same-second writes
    seq: u64,
    body: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ConversationLink {
    conversation_id: String,
    expires_at: Option<DateTime<Utc>>,
}

/// One page of stored responses, most recent first.
#[derive(Debug, Clone)]
pub struct ResponseList {
    pub data: Vec<Value>,
    pub has_more: bool,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
}

#[async_trait]
pub trait ResponseStorage: Send + Sync + 'static {
    /// Store a completed response body. The body is deep-cloned; the
    /// optional conversation id also feeds the link table.
    async fn set(&self, response_id: &str, body: &Value, conversation_id: Option<&str>);

    async fn get(&self, response_id: &str) -> Option<Value>;

    /// Returns false when the id was already absent.
    async fn delete(&self, response_id: &str) -> bool;

    async fn list(&self, limit: usize) -> ResponseList;

    async fn set_conversation_link(&self, response_id: &str, conversation_id: &str);

    async fn get_conversation_link(&self, response_id: &str) -> Option<String>;
}

pub type SharedResponseStorage = Arc<dyn ResponseStorage>;

#[derive(Default)]
struct InnerStore {
    responses: HashMap<String, StoredResponse>,
    links: HashMap<String, ConversationLink>,
    next_seq: u64,
}

/// In-memory implementation with lazy TTL eviction on every operation.
pub struct MemoryResponseStorage {
    ttl: Option<Duration>,
    store: RwLock<InnerStore>,
}

impl MemoryResponseStorage {
    pub fn new(ttl_minutes: i64) -> Self {
        Self {
            ttl: (ttl_minutes > 0).then(|| Duration::minutes(ttl_minutes)),
            store: RwLock::new(InnerStore::default()),
        }
    }

    fn purge(store: &mut InnerStore) {
        let now = Utc::now();
        store
            .responses
            .retain(|_, entry| entry.expires_at.is_none_or(|expires| expires > now));
        store
            .links
            .retain(|_, link| link.expires_at.is_none_or(|expires| expires > now));
    }

    fn expiry(&self) -> Option<DateTime<Utc>> {
        self.ttl.map(|ttl| Utc::now() + ttl)
    }
}

#[async_trait]
impl ResponseStorage for MemoryResponseStorage {
    async fn set(&self, response_id: &str, body: &Value, conversation_id: Option<&str>) {
        let mut store = self.store.write();
        Self::purge(&mut store);
        let seq = store.next_seq;
        store.next_seq += 1;
        store.responses.insert(
            response_id.to_string(),
            StoredResponse {
                created_at_unix: body
                    .get("created_at")
                    .and_then(|v| v.as_i64())
                    .unwrap_or_else(|| Utc::now().timestamp()),
                seq,
                body: body.clone(),
                expires_at: self.expiry(),
            },
        );
        if let Some(conversation_id) = conversation_id {
            store.links.insert(
                response_id.to_string(),
                ConversationLink {
                    conversation_id: conversation_id.to_string(),
                    expires_at: self.expiry(),
                },
            );
        }
    }

    async fn get(&self, response_id: &str) -> Option<Value> {
        let mut store = self.store.write();
        Self::purge(&mut store);
        store
            .responses
            .get(response_id)
            .map(|entry| entry.body.clone())
    }

    async fn delete(&self, response_id: &str) -> bool {
        let mut store = self.store.write();
        Self::purge(&mut store);
        store.links.remove(response_id);
        store.responses.remove(response_id).is_some()
    }

    async fn list(&self, limit: usize) -> ResponseList {
        let limit = limit.min(MAX_LIST_LIMIT);
        let mut store = self.store.write();
        Self::purge(&mut store);

        let mut entries: Vec<(&String, &StoredResponse)> = store.responses.iter().collect();
        entries.sort_by(|a, b| {
            (b.1.created_at_unix, b.1.seq).cmp(&(a.1.created_at_unix, a.1.seq))
        });

        let total = entries.len();
        let page: Vec<(&String, &StoredResponse)> = entries.into_iter().take(limit).collect();
        ResponseList {
            has_more: total > page.len(),
            first_id: page.first().map(|(id, _)| (*id).clone()),
            last_id: page.last().map(|(id, _)| (*id).clone()),
            data: page.into_iter().map(|(_, entry)| entry.body.clone()).collect(),
        }
    }

    async fn set_conversation_link(&self, response_id: &str, conversation_id: &str) {
        let mut store = self.store.write();
        Self::purge(&mut store);
        store.links.insert(
            response_id.to_string(),
            ConversationLink {
                conversation_id: conversation_id.to_string(),
                expires_at: self.expiry(),
            },
        );
    }

    async fn get_conversation_link(&self, response_id: &str) -> Option<String> {
        let mut store = self.store.write();
        Self::purge(&mut store);
        store
            .links
            .get(response_id)
            .map(|link| link.conversation_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(id: &str, created_at: i64) -> Value {
        json!({"id": id, "object": "response", "created_at": created_at})
    }

    #[test]
    fn test_clamp_list_limit() {
        assert_eq!(clamp_list_limit(None), 20);
        assert_eq!(clamp_list_limit(Some("0")), 20);
        assert_eq!(clamp_list_limit(Some("-5")), 20);
        assert_eq!(clamp_list_limit(Some("NaN")), 20);
        assert_eq!(clamp_list_limit(Some("7")), 7);
        assert_eq!(clamp_list_limit(Some("250")), 100);
    }

    #[tokio::test]
    async fn test_set_get_returns_deep_clone() {
        let store = MemoryResponseStorage::new(60);
        let original = body("resp_1", 100);
        store.set("resp_1", &original, Some("conv-1")).await;

        let mut fetched = store.get("resp_1").await.unwrap();
        assert_eq!(fetched, original);
        // Mutating the fetched copy must not affect later reads
        fetched["id"] = json!("tampered");
        assert_eq!(store.get("resp_1").await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_delete_reports_absence_on_repeat() {
        let store = MemoryResponseStorage::new(60);
        store.set("resp_1", &body("resp_1", 100), None).await;
        assert!(store.delete("resp_1").await);
        assert!(!store.delete("resp_1").await);
        assert_eq!(store.get("resp_1").await, None);
    }

    #[tokio::test]
    async fn test_list_orders_most_recent_first() {
        let store = MemoryResponseStorage::new(60);
        store.set("resp_a", &body("resp_a", 100), None).await;
        store.set("resp_b", &body("resp_b", 300), None).await;
        store.set("resp_c", &body("resp_c", 200), None).await;

        let list = store.list(2).await;
        assert_eq!(list.data.len(), 2);
        assert_eq!(list.data[0]["id"], "resp_b");
        assert_eq!(list.data[1]["id"], "resp_c");
        assert!(list.has_more);
        assert_eq!(list.first_id.as_deref(), Some("resp_b"));
        assert_eq!(list.last_id.as_deref(), Some("resp_c"));
    }

    #[tokio::test]
    async fn test_list_breaks_timestamp_ties_by_insertion() {
        let store = MemoryResponseStorage::new(60);
        store.set("resp_a", &body("resp_a", 100), None).await;
        store.set("resp_b", &body("resp_b", 100), None).await;

        let list = store.list(10).await;
        assert_eq!(list.data[0]["id"], "resp_b");
        assert_eq!(list.data[1]["id"], "resp_a");
        assert!(!list.has_more);
    }

    #[tokio::test]
    async fn test_conversation_links() {
        let store = MemoryResponseStorage::new(60);
        store.set("resp_1", &body("resp_1", 100), Some("conv_x")).await;
        assert_eq!(
            store.get_conversation_link("resp_1").await.as_deref(),
            Some("conv_x")
        );

        store.set_conversation_link("resp_2", "conv_y").await;
        assert_eq!(
            store.get_conversation_link("resp_2").await.as_deref(),
            Some("conv_y")
        );
        assert_eq!(store.get_conversation_link("resp_9").await, None);
    }

    #[tokio::test]
    async fn test_expired_responses_are_not_returned() {
        let store = MemoryResponseStorage::new(60);
        store.set("resp_1", &body("resp_1", 100), Some("conv_x")).await;
        {
            let mut inner = store.store.write();
            inner.responses.get_mut("resp_1").unwrap().expires_at =
                Some(Utc::now() - Duration::seconds(1));
            inner.links.get_mut("resp_1").unwrap().expires_at =
                Some(Utc::now() - Duration::seconds(1));
        }
        assert_eq!(store.get("resp_1").await, None);
        assert_eq!(store.get_conversation_link("resp_1").await, None);
        assert!(store.list(10).await.data.is_empty());
    }
}
