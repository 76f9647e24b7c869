use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::{Message, UserId};

/// Append-only log of direct messages.
///
/// Implementations must return `history` in append order. The in-memory store
/// below is the only one shipped; the trait is the seam for a persistent one.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, from: UserId, to: UserId, text: String) -> Message;

    async fn history(&self, a: &UserId, b: &UserId) -> Vec<Message>;
}

/// Unordered pair key: `{a, b}` and `{b, a}` name the same conversation.
fn conversation_key(a: &UserId, b: &UserId) -> (UserId, UserId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Default)]
struct Log {
    next_id: u64,
    conversations: HashMap<(UserId, UserId), VecDeque<Message>>,
}

pub struct InMemoryMessageStore {
    log: RwLock<Log>,
    per_conversation_limit: Option<usize>,
}

impl InMemoryMessageStore {
    pub fn new(per_conversation_limit: Option<usize>) -> Self {
        InMemoryMessageStore {
            log: RwLock::new(Log::default()),
            per_conversation_limit,
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, from: UserId, to: UserId, text: String) -> Message {
        let mut log = self.log.write().await;
        log.next_id += 1;

        let message = Message {
            id: log.next_id,
            from,
            to,
            text,
            timestamp: Utc::now(),
        };

        let key = conversation_key(&message.from, &message.to);
        let conversation = log.conversations.entry(key).or_default();
        conversation.push_back(message.clone());
        if let Some(limit) = self.per_conversation_limit {
            while conversation.len() > limit {
                conversation.pop_front();
            }
        }

        message
    }

    async fn history(&self, a: &UserId, b: &UserId) -> Vec<Message> {
        let log = self.log.read().await;
        log.conversations
            .get(&conversation_key(a, b))
            .map(|conversation| conversation.iter().cloned().collect())
            .unwrap_or_default()
    }
}
