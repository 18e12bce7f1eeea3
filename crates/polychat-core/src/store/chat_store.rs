use crate::conversation::model::{Conversation, Message};
use crate::conversation::reconciler::SyncPlan;
use crate::error::StoreResult;
use async_trait::async_trait;

/// Persistence for conversations and their messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Newest first.
    async fn list_conversations(&self) -> StoreResult<Vec<Conversation>>;
    /// Ordered by creation time.
    async fn load_messages(&self, conversation_id: i64) -> StoreResult<Vec<Message>>;
    /// Returns the assigned id.
    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<i64>;
    async fn update_conversation(&self, conversation: &Conversation) -> StoreResult<()>;
    /// Every message is stored as a new row, whatever its current `id`.
    /// Returns the assigned ids in input order.
    async fn insert_messages(&self, messages: &[Message]) -> StoreResult<Vec<i64>>;
    async fn update_messages(&self, messages: &[Message]) -> StoreResult<()>;
    async fn delete_messages(&self, messages: &[Message]) -> StoreResult<()>;
    /// Removes the conversations and every message they own.
    async fn delete_conversations(&self, conversations: &[Conversation]) -> StoreResult<()>;

    /// Store a new conversation together with its first messages. Returns
    /// the conversation id and the message ids in input order.
    ///
    /// Stores that support transactions should override this so a failure
    /// never leaves an empty conversation behind.
    async fn create_conversation(
        &self,
        conversation: &Conversation,
        messages: &[Message],
    ) -> StoreResult<(i64, Vec<i64>)> {
        let id = self.insert_conversation(conversation).await?;
        let owned: Vec<Message> = messages
            .iter()
            .map(|m| Message {
                conversation_id: id,
                ..m.clone()
            })
            .collect();
        let ids = self.insert_messages(&owned).await?;
        Ok((id, ids))
    }

    /// Apply a reconciliation plan, returning the ids given to `plan.insert`
    /// in order. Stores that support transactions should override this so
    /// readers never observe a half-applied plan.
    async fn apply_sync(
        &self,
        conversation: &Conversation,
        plan: &SyncPlan,
    ) -> StoreResult<Vec<i64>> {
        self.update_conversation(conversation).await?;
        self.delete_messages(&plan.delete).await?;
        self.update_messages(&plan.update).await?;
        self.insert_messages(&plan.insert).await
    }
}
