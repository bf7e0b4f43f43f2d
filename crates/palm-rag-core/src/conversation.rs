//! Conversation persistence.
//!
//! A conversation is an ID plus an ordered list of messages. Saving
//! replaces the whole list (last write wins); there is no merge of
//! concurrent turns on the same conversation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::ChatMessage;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Messages of a conversation, or `None` if it does not exist.
    async fn load(&self, conversation_id: &str) -> Result<Option<Vec<ChatMessage>>>;

    /// Replace the stored messages of a conversation, creating it if needed.
    async fn save(&self, conversation_id: &str, messages: &[ChatMessage]) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<Vec<ChatMessage>>> {
        let conversations = self
            .conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(conversations.get(conversation_id).cloned())
    }

    async fn save(&self, conversation_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        conversations.insert(conversation_id.to_string(), messages.to_vec());
        Ok(())
    }
}
