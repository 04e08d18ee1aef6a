use std::sync::Arc;

use conductor_core::error::{ConductorError, InfraError};
use conductor_core::run::RunId;
use conductor_core::thread::{MessageRole, ThreadMessage};
use sqlx::prelude::FromRow;
use sqlx::SqlitePool;

use crate::db::db_err;
use crate::run_store::parse_ts;

/// Append-only transcript storage, one thread per run.
#[derive(Clone)]
pub struct ThreadStore {
    pool: Arc<SqlitePool>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    message_id: String,
    role: String,
    content: String,
    token_estimate: i64,
    created_at: String,
}

impl ThreadStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub async fn append(&self, run_id: RunId, msg: &ThreadMessage) -> Result<(), ConductorError> {
        sqlx::query(
            r#"
            INSERT INTO run_messages (run_id, message_id, role, content, token_estimate, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(msg.id.to_string())
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(msg.token_estimate as i64)
        .bind(msg.created_at.to_rfc3339())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Full transcript in insertion order.
    pub async fn messages(&self, run_id: RunId) -> Result<Vec<ThreadMessage>, ConductorError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, role, content, token_estimate, created_at
             FROM run_messages WHERE run_id = ? ORDER BY id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(parse_message_row).collect()
    }
}

fn parse_message_row(row: MessageRow) -> Result<ThreadMessage, ConductorError> {
    let infra = |msg: String| ConductorError::Infra(InfraError::Database(msg));
    Ok(ThreadMessage {
        id: row
            .message_id
            .parse()
            .map_err(|e: uuid::Error| infra(e.to_string()))?,
        role: MessageRole::parse(&row.role)
            .ok_or_else(|| infra(format!("unknown message role '{}'", row.role)))?,
        content: row.content,
        token_estimate: row.token_estimate as u32,
        created_at: parse_ts(&row.created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::db::in_memory_pool;

    #[tokio::test]
    async fn transcript_preserves_order_and_roles() {
        let store = ThreadStore::new(in_memory_pool().await.expect("pool"));
        let run_id = RunId::new_v4();

        store
            .append(run_id, &ThreadMessage::system("you are an agent"))
            .await
            .expect("append");
        store
            .append(run_id, &ThreadMessage::user("summarize the report"))
            .await
            .expect("append");
        store
            .append(
                run_id,
                &ThreadMessage::tool_result("search", &serde_json::json!({"hits": 3})),
            )
            .await
            .expect("append");

        let messages = store.messages(run_id).await.expect("messages");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[1].role, MessageRole::User);
        assert_eq!(messages[2].role, MessageRole::Tool);
        assert!(messages[2].content.starts_with("[search]"));

        // Other runs see nothing.
        assert!(store
            .messages(RunId::new_v4())
            .await
            .expect("messages")
            .is_empty());
    }
}
