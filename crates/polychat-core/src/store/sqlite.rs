use super::chat_store::ChatStore;
use crate::conversation::model::{Conversation, Message, Origin};
use crate::conversation::reconciler::SyncPlan;
use crate::error::StoreResult;
use crate::providers::provider::ProviderKind;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;

// ── Schema ────────────────────────────────────────────────────────────────────

const MIGRATE: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    title             TEXT    NOT NULL,
    created_at        INTEGER NOT NULL,
    enabled_providers TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    provider        TEXT,
    content         TEXT    NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
"#;

// ── SqliteChatStore ───────────────────────────────────────────────────────────

pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let options = SqliteConnectOptions::from_str(&url)?.foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::query(MIGRATE).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn row_to_conversation(r: SqliteRow) -> StoreResult<Conversation> {
        let providers: String = r.try_get("enabled_providers")?;
        let enabled_providers: Vec<ProviderKind> = serde_json::from_str(&providers)?;
        Ok(Conversation {
            id: r.try_get("id")?,
            title: r.try_get("title")?,
            created_at: r.try_get("created_at")?,
            enabled_providers,
        })
    }

    fn row_to_message(r: SqliteRow) -> StoreResult<Message> {
        let provider: Option<String> = r.try_get("provider")?;
        Ok(Message {
            id: r.try_get("id")?,
            conversation_id: r.try_get("conversation_id")?,
            origin: Origin::from_column(provider.as_deref())?,
            content: r.try_get("content")?,
            created_at: r.try_get("created_at")?,
        })
    }
}

// Statement helpers shared by pooled calls and transactions.

async fn write_conversation(conn: &mut SqliteConnection, c: &Conversation) -> StoreResult<()> {
    sqlx::query(
        "UPDATE conversations SET title = ?, created_at = ?, enabled_providers = ? WHERE id = ?",
    )
    .bind(&c.title)
    .bind(c.created_at)
    .bind(serde_json::to_string(&c.enabled_providers)?)
    .bind(c.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_conversation(conn: &mut SqliteConnection, c: &Conversation) -> StoreResult<i64> {
    let result = sqlx::query(
        "INSERT INTO conversations (title, created_at, enabled_providers) VALUES (?, ?, ?)",
    )
    .bind(&c.title)
    .bind(c.created_at)
    .bind(serde_json::to_string(&c.enabled_providers)?)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Always a fresh row; an incoming id may belong to another conversation.
async fn insert_message(conn: &mut SqliteConnection, m: &Message) -> StoreResult<i64> {
    let result = sqlx::query(
        "INSERT INTO messages (conversation_id, provider, content, created_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(m.conversation_id)
    .bind(m.origin.as_column())
    .bind(&m.content)
    .bind(m.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn update_message(conn: &mut SqliteConnection, m: &Message) -> StoreResult<()> {
    sqlx::query(
        "UPDATE messages SET conversation_id = ?, provider = ?, content = ?, created_at = ? \
         WHERE id = ?",
    )
    .bind(m.conversation_id)
    .bind(m.origin.as_column())
    .bind(&m.content)
    .bind(m.created_at)
    .bind(m.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_message(conn: &mut SqliteConnection, id: i64) -> StoreResult<()> {
    sqlx::query("DELETE FROM messages WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn list_conversations(&self) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, enabled_providers FROM conversations \
             ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_conversation).collect()
    }

    async fn load_messages(&self, conversation_id: i64) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, provider, content, created_at FROM messages \
             WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_conversation(&mut conn, conversation).await
    }

    async fn update_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_conversation(&mut conn, conversation).await
    }

    async fn insert_messages(&self, messages: &[Message]) -> StoreResult<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(messages.len());
        for m in messages {
            ids.push(insert_message(&mut tx, m).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn update_messages(&self, messages: &[Message]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for m in messages {
            update_message(&mut tx, m).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_messages(&self, messages: &[Message]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for m in messages {
            delete_message(&mut tx, m.id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_conversations(&self, conversations: &[Conversation]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for c in conversations {
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(c.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(c.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_conversation(
        &self,
        conversation: &Conversation,
        messages: &[Message],
    ) -> StoreResult<(i64, Vec<i64>)> {
        let mut tx = self.pool.begin().await?;
        let id = insert_conversation(&mut tx, conversation).await?;
        let mut ids = Vec::with_capacity(messages.len());
        for m in messages {
            let owned = Message {
                conversation_id: id,
                ..m.clone()
            };
            ids.push(insert_message(&mut tx, &owned).await?);
        }
        tx.commit().await?;
        Ok((id, ids))
    }

    async fn apply_sync(
        &self,
        conversation: &Conversation,
        plan: &SyncPlan,
    ) -> StoreResult<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        write_conversation(&mut tx, conversation).await?;
        for m in &plan.delete {
            delete_message(&mut tx, m.id).await?;
        }
        for m in &plan.update {
            update_message(&mut tx, m).await?;
        }
        let mut ids = Vec::with_capacity(plan.insert.len());
        for m in &plan.insert {
            ids.push(insert_message(&mut tx, m).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
