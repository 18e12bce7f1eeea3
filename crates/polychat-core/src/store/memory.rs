use super::chat_store::ChatStore;
use crate::conversation::model::{Conversation, Message};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Tables {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    next_conversation_id: i64,
    next_message_id: i64,
}

impl Tables {
    /// Fresh ids only, in input order.
    fn push_messages(&mut self, messages: &[Message], conversation_id: Option<i64>) -> Vec<i64> {
        let mut ids = Vec::with_capacity(messages.len());
        for m in messages {
            self.next_message_id += 1;
            let id = self.next_message_id;
            self.messages.push(Message {
                id,
                conversation_id: conversation_id.unwrap_or(m.conversation_id),
                ..m.clone()
            });
            ids.push(id);
        }
        ids
    }
}

/// Process-local store. Counts each message write so callers can check how
/// much work a save actually did.
#[derive(Default)]
pub struct InMemoryChatStore {
    tables: RwLock<Tables>,
    inserted: AtomicUsize,
    updated: AtomicUsize,
    deleted: AtomicUsize,
}

/// Message writes performed since the store was created or last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpCounts {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op_counts(&self) -> OpCounts {
        OpCounts {
            inserted: self.inserted.load(Ordering::SeqCst),
            updated: self.updated.load(Ordering::SeqCst),
            deleted: self.deleted.load(Ordering::SeqCst),
        }
    }

    pub fn reset_counts(&self) {
        self.inserted.store(0, Ordering::SeqCst);
        self.updated.store(0, Ordering::SeqCst);
        self.deleted.store(0, Ordering::SeqCst);
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|e| StoreError::Lock(e.to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|e| StoreError::Lock(e.to_string()))
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn list_conversations(&self) -> StoreResult<Vec<Conversation>> {
        let mut all = self.read()?.conversations.clone();
        all.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(all)
    }

    async fn load_messages(&self, conversation_id: i64) -> StoreResult<Vec<Message>> {
        let mut found: Vec<Message> = self
            .read()?
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.created_at, m.id));
        Ok(found)
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<i64> {
        let mut tables = self.write()?;
        tables.next_conversation_id += 1;
        let id = tables.next_conversation_id;
        tables.conversations.push(Conversation {
            id,
            ..conversation.clone()
        });
        Ok(id)
    }

    async fn update_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let mut tables = self.write()?;
        if let Some(row) = tables.conversations.iter_mut().find(|c| c.id == conversation.id) {
            *row = conversation.clone();
        }
        Ok(())
    }

    async fn insert_messages(&self, messages: &[Message]) -> StoreResult<Vec<i64>> {
        let mut tables = self.write()?;
        let ids = tables.push_messages(messages, None);
        self.inserted.fetch_add(ids.len(), Ordering::SeqCst);
        Ok(ids)
    }

    async fn create_conversation(
        &self,
        conversation: &Conversation,
        messages: &[Message],
    ) -> StoreResult<(i64, Vec<i64>)> {
        let mut tables = self.write()?;
        tables.next_conversation_id += 1;
        let id = tables.next_conversation_id;
        tables.conversations.push(Conversation {
            id,
            ..conversation.clone()
        });
        let ids = tables.push_messages(messages, Some(id));
        self.inserted.fetch_add(ids.len(), Ordering::SeqCst);
        Ok((id, ids))
    }

    async fn update_messages(&self, messages: &[Message]) -> StoreResult<()> {
        let mut tables = self.write()?;
        for m in messages {
            if let Some(row) = tables.messages.iter_mut().find(|r| r.id == m.id) {
                *row = m.clone();
            }
        }
        self.updated.fetch_add(messages.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn delete_messages(&self, messages: &[Message]) -> StoreResult<()> {
        let mut tables = self.write()?;
        tables
            .messages
            .retain(|row| !messages.iter().any(|m| m.id == row.id));
        self.deleted.fetch_add(messages.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn delete_conversations(&self, conversations: &[Conversation]) -> StoreResult<()> {
        let mut tables = self.write()?;
        let doomed = |id: i64| conversations.iter().any(|c| c.id == id);
        tables.conversations.retain(|c| !doomed(c.id));
        tables.messages.retain(|m| !doomed(m.conversation_id));
        Ok(())
    }
}
