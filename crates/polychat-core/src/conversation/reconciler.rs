use super::model::{default_title, flatten_title, Conversation, Message};
use crate::error::StoreResult;
use crate::store::ChatStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Message writes needed to bring a persisted conversation in line with an
/// edited in-memory copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub delete: Vec<Message>,
    pub update: Vec<Message>,
    pub insert: Vec<Message>,
}

impl SyncPlan {
    /// Partition by message id. A message whose id matches a persisted one is
    /// an update when any field differs; unmatched ids (including 0) insert.
    pub fn compute(persisted: &[Message], incoming: &[Message]) -> Self {
        let by_id: HashMap<i64, &Message> = persisted.iter().map(|m| (m.id, m)).collect();
        let incoming_ids: HashSet<i64> = incoming.iter().map(|m| m.id).collect();

        let delete = persisted
            .iter()
            .filter(|m| !incoming_ids.contains(&m.id))
            .cloned()
            .collect();

        let mut update = Vec::new();
        let mut insert = Vec::new();
        for m in incoming {
            match by_id.get(&m.id) {
                Some(old) if m.id != 0 => {
                    if *old != m {
                        update.push(m.clone());
                    }
                }
                _ => insert.push(m.clone()),
            }
        }

        Self {
            delete,
            update,
            insert,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.update.is_empty() && self.insert.is_empty()
    }
}

/// Persists conversations, keeping the store consistent with what the user
/// currently sees.
#[derive(Clone)]
pub struct ChatReconciler {
    store: Arc<dyn ChatStore>,
}

impl ChatReconciler {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Save `messages` as the full content of `conversation`.
    ///
    /// A conversation that was never persisted is created and titled from its
    /// earliest user message. Otherwise only the changed messages are written.
    /// Every message in `messages` comes back owned by the conversation, and
    /// inserted ones carry their new ids, so saving the same slice again is a
    /// no-op.
    pub async fn save(
        &self,
        conversation: &Conversation,
        messages: &mut [Message],
    ) -> StoreResult<Conversation> {
        if !conversation.is_persisted() {
            return self.create(conversation, messages).await;
        }

        for m in messages.iter_mut() {
            m.conversation_id = conversation.id;
        }
        let persisted = self.store.load_messages(conversation.id).await?;
        let plan = SyncPlan::compute(&persisted, messages);
        debug!(
            "conversation {}: delete={} update={} insert={}",
            conversation.id,
            plan.delete.len(),
            plan.update.len(),
            plan.insert.len()
        );
        let inserted = self.store.apply_sync(conversation, &plan).await?;

        // Same selection and order as `plan.insert`.
        let known: HashSet<i64> = persisted.iter().map(|m| m.id).collect();
        let fresh = messages
            .iter_mut()
            .filter(|m| m.id == 0 || !known.contains(&m.id));
        for (m, id) in fresh.zip(inserted) {
            m.id = id;
        }
        Ok(conversation.clone())
    }

    async fn create(
        &self,
        conversation: &Conversation,
        messages: &mut [Message],
    ) -> StoreResult<Conversation> {
        let mut created = conversation.clone();
        let title = default_title(messages).or_else(|| {
            messages
                .iter()
                .min_by_key(|m| (m.created_at, m.id))
                .map(|m| flatten_title(&m.content))
        });
        if let Some(title) = title {
            created.title = title;
        }

        let (id, ids) = self.store.create_conversation(&created, messages).await?;
        created.id = id;
        for (m, id) in messages.iter_mut().zip(ids) {
            m.id = id;
            m.conversation_id = created.id;
        }
        info!("Created conversation {} ({} messages)", created.id, messages.len());
        Ok(created)
    }

    pub async fn rename(&self, conversation: &Conversation, title: &str) -> StoreResult<Conversation> {
        let renamed = Conversation {
            title: flatten_title(title),
            ..conversation.clone()
        };
        self.store.update_conversation(&renamed).await?;
        Ok(renamed)
    }

    pub async fn list_conversations(&self) -> StoreResult<Vec<Conversation>> {
        self.store.list_conversations().await
    }

    pub async fn load_messages(&self, conversation_id: i64) -> StoreResult<Vec<Message>> {
        self.store.load_messages(conversation_id).await
    }

    pub async fn delete_conversations(&self, conversations: &[Conversation]) -> StoreResult<()> {
        info!("Deleting {} conversation(s)", conversations.len());
        self.store.delete_conversations(conversations).await
    }
}
